//! The duplex endpoint contract and the two reference adapters.
//!
//! The core assumes an ordered, message-preserving, best-effort reliable
//! channel: no duplication, no reordering. Adapters that cannot guarantee
//! this must compensate below this interface. Event-driven adapters bridge
//! their callbacks into the pull-based [`Transport::read`] with a queue.

use async_trait::async_trait;

use crate::error::TransportError;

/// What an endpoint can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// When false the payload must be a UTF-8 string; when true the payload
    /// may be a structured value plus out-of-band resource handles.
    pub structured_clone: bool,
    /// Whether the endpoint can move resource handles out-of-band.
    pub transfer: bool,
}

/// An opaque resource handed to the transport out-of-band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferHandle {
    Buffer(Vec<u8>),
}

impl TransferHandle {
    pub fn byte_length(&self) -> usize {
        match self {
            TransferHandle::Buffer(bytes) => bytes.len(),
        }
    }
}

/// One logical message as the transport sees it.
#[derive(Debug)]
pub enum Message {
    /// UTF-8 payload, one envelope per message (string-mode transports
    /// frame with a trailing line feed on the wire).
    Text(String),
    /// Structured payload plus out-of-band handles.
    Structured(serde_json::Value, Vec<TransferHandle>),
}

/// Minimal duplex endpoint: deliver/accept one logical message at a time.
#[async_trait]
pub trait Transport: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Next logical message; `None` when the far end has closed. May
    /// suspend indefinitely pending arrival.
    async fn read(&self) -> Result<Option<Message>, TransportError>;

    /// Hand off one logical message. Ordering relative to previous writes
    /// is preserved; each write is atomic per message.
    async fn write(&self, message: Message) -> Result<(), TransportError>;

    /// Resource release hook.
    async fn close(&self) {}
}

pub mod mem;
pub mod stream;

pub use mem::MemTransport;
pub use stream::StreamTransport;
