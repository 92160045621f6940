#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod api;
mod callback;
mod channel;
mod codec;
mod dispatch;
mod envelope;
mod error;
mod interceptor;
mod observe;
mod pending;
mod proxy;
mod stream;
mod transfer;
mod transport;
mod value;

pub use api::{ApiTree, Method, MethodFuture, Outcome, ValueStream};
pub use callback::{CallbackRegistry, RemoteCallback};
pub use channel::{ChannelBuilder, ChannelState, RpcChannel};
pub use codec::{CodecMode, FrameBuffer, MAX_DEPTH};
pub use envelope::{
    callback_id, is_stream_marker, request_id, Envelope, Kind, SlotDescriptor, CALLBACK_PREFIX,
    DESTROY_SENTINEL, STREAM_MARKER_KEY, TRANSFER_PREFIX,
};
pub use error::{ErrorRecord, RpcError, TransportError};
pub use interceptor::{Interceptor, InvocationContext, Next, StateBag};
pub use observe::{tracing_sink, Diagnostic, DiagnosticSink};
pub use pending::{Completion, PendingTable};
pub use proxy::RemoteProxy;
pub use stream::{RpcStream, StreamManager, StreamState, STREAM_BUFFER};
pub use transfer::{TransferEngine, TransferHandler, TransferOutcome, BUFFER_TAG};
pub use transport::{
    Capabilities, MemTransport, Message, StreamTransport, TransferHandle, Transport,
};
pub use value::{Callable, LocalCallback, TransferCell, Value};

// Re-export stream helpers for handler implementations.
pub use async_stream::{stream, try_stream};
pub use futures_util::StreamExt;

// Re-export chrono so date values can be built without a separate
// dependency.
pub use chrono;
