//! The exposed API tree and path resolution.
//!
//! A tree of nested namespaces whose leaves are methods, constructors, or
//! plain values. Resolution navigates dot-separated segments left to right;
//! a missing segment is `NotFound`, a terminal of the wrong shape is a
//! `TypeError`. Remote `set` assigns value leaves in place; re-exposure
//! swaps the whole tree.

use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::RpcError;
use crate::value::Value;

/// A lazy asynchronous sequence produced by a streaming handler.
pub type ValueStream =
    Pin<Box<dyn futures_core::Stream<Item = Result<Value, RpcError>> + Send>>;

/// What a handler produced: a plain value, or a lazy sequence that turns
/// the exchange into a stream.
pub enum Outcome {
    Value(Value),
    Stream(ValueStream),
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Value(value)
    }
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Outcome::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Outcome, RpcError>> + Send>>;

/// A callable leaf of the exposed tree.
pub trait Method: Send + Sync {
    fn invoke(&self, args: Vec<Value>) -> MethodFuture;
}

struct FnMethod<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> Method for FnMethod<F, Fut>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome, RpcError>> + Send + 'static,
{
    fn invoke(&self, args: Vec<Value>) -> MethodFuture {
        Box::pin((self.f)(args))
    }
}

/// One node of the exposed tree.
#[derive(Clone)]
pub enum ApiNode {
    Value(Value),
    Method(Arc<dyn Method>),
    Constructor(Arc<dyn Method>),
    Namespace(BTreeMap<String, ApiNode>),
}

impl std::fmt::Debug for ApiNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiNode::Value(v) => f.debug_tuple("Value").field(v).finish(),
            ApiNode::Method(_) => f.write_str("Method(..)"),
            ApiNode::Constructor(_) => f.write_str("Constructor(..)"),
            ApiNode::Namespace(map) => f.debug_tuple("Namespace").field(map).finish(),
        }
    }
}

/// Builder and resolver for the exposed API.
#[derive(Debug, Clone, Default)]
pub struct ApiTree {
    root: BTreeMap<String, ApiNode>,
}

impl ApiTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// A method returning a plain value.
    pub fn method<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let wrapped = move |args: Vec<Value>| {
            let fut = f(args);
            async move { fut.await.map(Outcome::Value) }
        };
        self.root.insert(
            name.to_string(),
            ApiNode::Method(Arc::new(FnMethod {
                f: wrapped,
                _marker: PhantomData,
            })),
        );
        self
    }

    /// A method producing a lazy asynchronous sequence.
    pub fn streaming<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ValueStream, RpcError>> + Send + 'static,
    {
        let wrapped = move |args: Vec<Value>| {
            let fut = f(args);
            async move { fut.await.map(Outcome::Stream) }
        };
        self.root.insert(
            name.to_string(),
            ApiNode::Method(Arc::new(FnMethod {
                f: wrapped,
                _marker: PhantomData,
            })),
        );
        self
    }

    /// A constructor: invoked by the `construct` kind, returning the built
    /// instance as a value.
    pub fn constructor<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let wrapped = move |args: Vec<Value>| {
            let fut = f(args);
            async move { fut.await.map(Outcome::Value) }
        };
        self.root.insert(
            name.to_string(),
            ApiNode::Constructor(Arc::new(FnMethod {
                f: wrapped,
                _marker: PhantomData,
            })),
        );
        self
    }

    /// A plain value leaf, readable via `get` and writable via `set`.
    pub fn value(mut self, name: &str, value: Value) -> Self {
        self.root.insert(name.to_string(), ApiNode::Value(value));
        self
    }

    /// A nested namespace.
    pub fn nested(mut self, name: &str, tree: ApiTree) -> Self {
        self.root
            .insert(name.to_string(), ApiNode::Namespace(tree.root));
        self
    }

    fn walk(&self, segments: &[&str]) -> Result<&ApiNode, RpcError> {
        let (first, rest) = segments
            .split_first()
            .ok_or_else(|| RpcError::NotFound("empty path".into()))?;
        let mut node = self
            .root
            .get(*first)
            .ok_or_else(|| RpcError::NotFound(segments.join(".")))?;
        for segment in rest {
            match node {
                ApiNode::Namespace(children) => {
                    node = children
                        .get(*segment)
                        .ok_or_else(|| RpcError::NotFound(segments.join(".")))?;
                }
                _ => return Err(RpcError::NotFound(segments.join("."))),
            }
        }
        Ok(node)
    }

    /// Resolve a dotted method path to its callable.
    pub fn resolve_method(&self, path: &str) -> Result<Arc<dyn Method>, RpcError> {
        let segments: Vec<&str> = path.split('.').collect();
        match self.walk(&segments)? {
            ApiNode::Method(m) => Ok(m.clone()),
            _ => Err(RpcError::Type(format!("{path} is not callable"))),
        }
    }

    /// Resolve a dotted path to a constructor.
    pub fn resolve_constructor(&self, path: &str) -> Result<Arc<dyn Method>, RpcError> {
        let segments: Vec<&str> = path.split('.').collect();
        match self.walk(&segments)? {
            ApiNode::Constructor(c) => Ok(c.clone()),
            _ => Err(RpcError::Type(format!("{path} is not constructible"))),
        }
    }

    /// Read a value leaf (the `get` kind).
    pub fn read(&self, path: &[String]) -> Result<Value, RpcError> {
        let segments: Vec<&str> = path.iter().map(String::as_str).collect();
        match self.walk(&segments)? {
            ApiNode::Value(v) => Ok(v.clone()),
            _ => Err(RpcError::Type(format!(
                "{} is not a readable value",
                segments.join(".")
            ))),
        }
    }

    /// Assign a value leaf (the `set` kind). The parent namespace must
    /// exist; the leaf itself is created or overwritten.
    pub fn write(&mut self, path: &[String], value: Value) -> Result<(), RpcError> {
        let (leaf, parents) = path
            .split_last()
            .ok_or_else(|| RpcError::Type("cannot assign the tree root".into()))?;
        let mut children = &mut self.root;
        for segment in parents {
            match children.get_mut(segment) {
                Some(ApiNode::Namespace(inner)) => children = inner,
                Some(_) => {
                    return Err(RpcError::Type(format!("{segment} is not a namespace")))
                }
                None => return Err(RpcError::NotFound(path.join("."))),
            }
        }
        children.insert(leaf.clone(), ApiNode::Value(value));
        Ok(())
    }
}
