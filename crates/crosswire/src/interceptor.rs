//! Interceptor chain: middleware composed in onion order around handler
//! invocation.
//!
//! Outermost layer first; the innermost layer is the handler itself. A
//! layer may short-circuit by not calling `next`, fail the call by
//! returning an error, or transform the result on the way out. The chain
//! wraps the handler invocation only, never per-chunk stream delivery.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::api::{Method, MethodFuture};
use crate::envelope::Kind;
use crate::value::Value;

/// Per-connection mutable state shared by every interceptor on a channel.
pub type StateBag = Arc<Mutex<BTreeMap<String, Value>>>;

/// What a layer sees: the resolved method name, the reconstructed argument
/// list, the originating envelope's metadata, and the connection state bag.
pub struct InvocationContext {
    pub method: String,
    pub args: Vec<Value>,
    pub request_id: String,
    pub kind: Kind,
    pub state: StateBag,
}

/// One middleware layer.
pub trait Interceptor: Send + Sync {
    fn call(&self, ctx: InvocationContext, next: Next) -> MethodFuture;
}

/// Handle to the rest of the chain. Calling [`Next::run`] invokes the next
/// layer inward; the innermost run invokes the handler with `ctx.args`.
pub struct Next {
    chain: Arc<Vec<Arc<dyn Interceptor>>>,
    index: usize,
    handler: Arc<dyn Method>,
}

impl Next {
    pub fn run(self, ctx: InvocationContext) -> MethodFuture {
        match self.chain.get(self.index).cloned() {
            Some(layer) => {
                let next = Next {
                    chain: self.chain,
                    index: self.index + 1,
                    handler: self.handler,
                };
                layer.call(ctx, next)
            }
            None => self.handler.invoke(ctx.args),
        }
    }
}

/// Run the full chain around a handler, outermost layer first.
pub fn run_chain(
    chain: Arc<Vec<Arc<dyn Interceptor>>>,
    handler: Arc<dyn Method>,
    ctx: InvocationContext,
) -> MethodFuture {
    Next {
        chain,
        index: 0,
        handler,
    }
    .run(ctx)
}
