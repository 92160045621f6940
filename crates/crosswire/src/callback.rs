//! Callback registry: stable ids for local callables, proxy callables for
//! remote ids.
//!
//! A callable exposed to the peer is represented by a stable identifier;
//! registering the same cell twice reuses its id. Registrations persist
//! until the channel is destroyed.

use std::collections::HashMap;
use std::sync::Weak;

use parking_lot::Mutex;

use crate::channel::ChannelCore;
use crate::envelope::{callback_id, CALLBACK_PREFIX};
use crate::error::RpcError;
use crate::value::{Callable, LocalCallback, Value};

#[derive(Default)]
struct Tables {
    by_id: HashMap<String, LocalCallback>,
    ids_by_key: HashMap<usize, String>,
}

#[derive(Default)]
pub struct CallbackRegistry {
    tables: Mutex<Tables>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local callable, reusing the id of a previously registered
    /// identical cell.
    pub fn register(&self, callback: &LocalCallback) -> String {
        let mut tables = self.tables.lock();
        if let Some(id) = tables.ids_by_key.get(&callback.key()) {
            return id.clone();
        }
        let id = callback_id();
        tables.ids_by_key.insert(callback.key(), id.clone());
        tables.by_id.insert(id.clone(), callback.clone());
        id
    }

    pub fn lookup(&self, id: &str) -> Option<LocalCallback> {
        self.tables.lock().by_id.get(id).cloned()
    }

    pub fn clear(&self) {
        let mut tables = self.tables.lock();
        tables.by_id.clear();
        tables.ids_by_key.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Proxy for a callable owned by the peer. Invoking it sends a `callback`
/// envelope whose method is the identifier; return values are discarded by
/// the protocol. Invocation after destroy fails with `ChannelDestroyed`.
#[derive(Clone)]
pub struct RemoteCallback {
    id: String,
    core: Weak<ChannelCore>,
}

impl RemoteCallback {
    pub(crate) fn new(id: String, core: Weak<ChannelCore>) -> Self {
        Self { id, core }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn invoke(&self, args: Vec<Value>) -> Result<(), RpcError> {
        let core = self.core.upgrade().ok_or(RpcError::ChannelDestroyed)?;
        core.send_callback(&self.id, args).await
    }
}

/// Outbound pass: swap local callables for sentinel strings, collecting the
/// ids declared by this payload.
pub fn extract_callbacks(
    registry: &CallbackRegistry,
    value: Value,
    ids: &mut Vec<String>,
) -> Value {
    match value {
        Value::Callable(Callable::Local(cb)) => {
            let id = registry.register(&cb);
            if !ids.contains(&id) {
                ids.push(id.clone());
            }
            Value::String(format!("{CALLBACK_PREFIX}{id}"))
        }
        Value::Callable(Callable::Remote(rc)) => {
            // A proxy travelling back toward its owner: its id resolves in
            // the owner's local registry on receipt.
            let id = rc.id().to_string();
            if !ids.contains(&id) {
                ids.push(id.clone());
            }
            Value::String(format!("{CALLBACK_PREFIX}{id}"))
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| extract_callbacks(registry, item, ids))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, extract_callbacks(registry, item, ids)))
                .collect(),
        ),
        Value::Set(items) => Value::Set(
            items
                .into_iter()
                .map(|item| extract_callbacks(registry, item, ids))
                .collect(),
        ),
        Value::Map(pairs) => Value::Map(
            pairs
                .into_iter()
                .map(|(key, item)| {
                    (
                        extract_callbacks(registry, key, ids),
                        extract_callbacks(registry, item, ids),
                    )
                })
                .collect(),
        ),
        leaf => leaf,
    }
}

/// Inbound pass: bind the sentinels declared in `callbackIds`. An id found
/// in the local registry binds back to the original callable; anything else
/// becomes a remote proxy.
pub fn bind_callbacks(
    registry: &CallbackRegistry,
    core: &Weak<ChannelCore>,
    value: Value,
    declared: &[String],
) -> Value {
    match value {
        Value::String(s) => match s.strip_prefix(CALLBACK_PREFIX) {
            Some(id) if declared.iter().any(|d| d == id) => match registry.lookup(id) {
                Some(local) => Value::Callable(Callable::Local(local)),
                None => Value::Callable(Callable::Remote(RemoteCallback::new(
                    id.to_string(),
                    core.clone(),
                ))),
            },
            _ => Value::String(s),
        },
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| bind_callbacks(registry, core, item, declared))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, bind_callbacks(registry, core, item, declared)))
                .collect(),
        ),
        Value::Set(items) => Value::Set(
            items
                .into_iter()
                .map(|item| bind_callbacks(registry, core, item, declared))
                .collect(),
        ),
        Value::Map(pairs) => Value::Map(
            pairs
                .into_iter()
                .map(|(key, item)| {
                    (
                        bind_callbacks(registry, core, key, declared),
                        bind_callbacks(registry, core, item, declared),
                    )
                })
                .collect(),
        ),
        leaf => leaf,
    }
}
