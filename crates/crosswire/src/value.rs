//! The dynamic value graph carried by calls, results and stream chunks.
//!
//! `Value` is an owned tree: reference cycles are unrepresentable, which is
//! what lets the codec and transfer engine get away with a depth limit
//! instead of full cycle detection.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::callback::RemoteCallback;

/// A value in an argument or result graph.
#[derive(Clone)]
pub enum Value {
    Null,
    /// Distinct from `Null`; representable in rich mode only.
    Undefined,
    Bool(bool),
    /// IEEE 754 double, matching compact-mode JSON numbers.
    Number(f64),
    /// Wide integers beyond the double-precision safe range.
    BigInt(i128),
    String(String),
    Bytes(Vec<u8>),
    /// UTC instant with millisecond precision.
    Date(DateTime<Utc>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Set(Vec<Value>),
    /// Ordered key/value pairs; keys need not be strings.
    Map(Vec<(Value, Value)>),
    /// A callable argument: a local callback or a proxy for a remote one.
    Callable(Callable),
    /// A byte buffer marked for zero-copy handoff.
    Transfer(TransferCell),
}

impl Value {
    /// Wrap bytes in a transfer cell so capable transports move them
    /// out-of-band instead of copying.
    pub fn transferable(bytes: Vec<u8>) -> Self {
        Value::Transfer(TransferCell::new(bytes))
    }

    /// A local fire-and-forget callback argument.
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        Value::Callable(Callable::Local(LocalCallback::new(f)))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            Value::Callable(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Undefined => write!(f, "Undefined"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Number(v) => write!(f, "Number({v})"),
            Value::BigInt(v) => write!(f, "BigInt({v})"),
            Value::String(v) => write!(f, "String({v:?})"),
            Value::Bytes(v) => write!(f, "Bytes(len={})", v.len()),
            Value::Date(v) => write!(f, "Date({v})"),
            Value::Array(v) => f.debug_tuple("Array").field(v).finish(),
            Value::Object(v) => f.debug_tuple("Object").field(v).finish(),
            Value::Set(v) => f.debug_tuple("Set").field(v).finish(),
            Value::Map(v) => f.debug_tuple("Map").field(v).finish(),
            Value::Callable(c) => write!(f, "{c:?}"),
            Value::Transfer(cell) => write!(f, "Transfer(len={})", cell.byte_length()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Callable(a), Value::Callable(b)) => a == b,
            (Value::Transfer(a), Value::Transfer(b)) => {
                a.same_cell(b) || a.with_bytes(|x| b.with_bytes(|y| x == y))
            }
            _ => false,
        }
    }
}

/// A callable value position: either a callback owned by this side or a
/// synthesized proxy for one owned by the peer.
#[derive(Clone)]
pub enum Callable {
    Local(LocalCallback),
    Remote(RemoteCallback),
}

impl Callable {
    /// Invoke with arguments. Local callbacks run inline; remote proxies
    /// send a `callback` envelope over their channel. Return values are
    /// discarded by the protocol either way.
    pub async fn invoke(&self, args: Vec<Value>) -> Result<(), crate::error::RpcError> {
        match self {
            Callable::Local(cb) => {
                cb.invoke(args);
                Ok(())
            }
            Callable::Remote(rc) => rc.invoke(args).await,
        }
    }
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Callable::Local(_) => write!(f, "Callable::Local"),
            Callable::Remote(rc) => write!(f, "Callable::Remote({})", rc.id()),
        }
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Callable::Local(a), Callable::Local(b)) => a.key() == b.key(),
            (Callable::Remote(a), Callable::Remote(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

/// A local fire-and-forget callback. Return values of callbacks are
/// discarded by the protocol, so the closure returns nothing.
#[derive(Clone)]
pub struct LocalCallback {
    inner: Arc<dyn Fn(Vec<Value>) + Send + Sync>,
}

impl LocalCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    pub fn invoke(&self, args: Vec<Value>) {
        (self.inner)(args)
    }

    /// Identity key used for registry deduplication: the same cell sent
    /// twice reuses its callback id.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

/// A shared byte cell marked for zero-copy transfer.
///
/// When a transfer-capable transport ships the cell, the bytes are *taken*:
/// the sender's cell is left empty, matching the zero-copy contract.
#[derive(Clone)]
pub struct TransferCell {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl TransferCell {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Move the bytes out, leaving the cell empty.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn byte_length(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Copy the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Whether two values share the same underlying cell.
    pub fn same_cell(&self, other: &TransferCell) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_cell_take_leaves_empty() {
        let cell = TransferCell::new(vec![1, 2, 3]);
        assert_eq!(cell.byte_length(), 3);
        assert_eq!(cell.take(), vec![1, 2, 3]);
        assert!(cell.is_empty());
    }

    #[test]
    fn local_callback_identity_is_stable_across_clones() {
        let cb = LocalCallback::new(|_| {});
        let other = LocalCallback::new(|_| {});
        assert_eq!(cb.key(), cb.clone().key());
        assert_ne!(cb.key(), other.key());
    }

    #[test]
    fn value_equality_covers_containers() {
        let a = Value::Array(vec![Value::from(1i64), Value::from("x")]);
        let b = Value::Array(vec![Value::from(1i64), Value::from("x")]);
        assert_eq!(a, b);
        assert_ne!(a, Value::Null);
        assert_ne!(Value::Null, Value::Undefined);
    }
}
