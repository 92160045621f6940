//! Path-accumulating proxy over the remote API.
//!
//! Accessing a segment only extends the path; network traffic happens on
//! the terminal acts: call, get, set, construct.

use std::sync::Arc;

use crate::channel::ChannelCore;
use crate::error::RpcError;
use crate::pending::Completion;
use crate::stream::RpcStream;
use crate::value::Value;

/// The local surface of the peer's API.
#[derive(Clone)]
pub struct RemoteProxy {
    core: Arc<ChannelCore>,
    path: Vec<String>,
}

impl RemoteProxy {
    pub(crate) fn root(core: Arc<ChannelCore>) -> Self {
        Self {
            core,
            path: Vec::new(),
        }
    }

    /// Child proxy for one more path segment. No network traffic.
    pub fn field(&self, segment: &str) -> RemoteProxy {
        let mut path = self.path.clone();
        path.push(segment.to_string());
        RemoteProxy {
            core: self.core.clone(),
            path,
        }
    }

    fn method_path(&self) -> String {
        self.path.join(".")
    }

    /// Invoke the accumulated path as a method. Resolves to either a plain
    /// value or, when the peer opened a stream, a transparently synthesized
    /// [`RpcStream`].
    pub async fn call(&self, args: Vec<Value>) -> Result<Completion, RpcError> {
        self.core.call(&self.method_path(), args).await
    }

    /// Invoke and expect a plain value; a stream result is a type error.
    pub async fn call_value(&self, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call(args).await?.into_value()
    }

    /// Invoke and expect a stream; a plain value is a type error.
    pub async fn call_stream(&self, args: Vec<Value>) -> Result<RpcStream, RpcError> {
        self.call(args).await?.into_stream()
    }

    /// Read the accumulated path as a property.
    pub async fn get(&self) -> Result<Value, RpcError> {
        self.core.get(&self.path).await
    }

    /// Assign the accumulated path as a property.
    pub async fn set(&self, value: Value) -> Result<(), RpcError> {
        self.core.set(&self.path, value).await
    }

    /// Invoke the accumulated path as a constructor.
    pub async fn construct(&self, args: Vec<Value>) -> Result<Value, RpcError> {
        self.core.construct(&self.method_path(), args).await
    }
}

impl std::fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("path", &self.method_path())
            .finish_non_exhaustive()
    }
}
