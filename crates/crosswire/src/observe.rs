//! Diagnostic sink for conditions not attributable to a pending entry.
//!
//! These are non-fatal by contract: a malformed frame or an orphan response
//! never tears the channel down. The default sink forwards to `tracing`.

use std::sync::Arc;

use crate::envelope::Kind;

/// A non-fatal condition observed by the codec or dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// A text frame that does not begin with the envelope start character.
    NonEnvelopeFrame(String),
    /// A frame that looked like an envelope but failed to decode.
    DecodeFailure(String),
    /// A message whose kind is not recognized.
    UnknownKind { id: String },
    /// A response with no matching pending entry.
    OrphanResponse { id: String },
    /// An inbound request whose id is already being served.
    DuplicateRequest { id: String },
    /// A stream message for an id with no active stream.
    OrphanStream { id: String, kind: Kind },
    /// A callback invocation naming an unregistered id.
    UnknownCallback { id: String },
    /// A best-effort write that failed.
    WriteFailure(String),
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::NonEnvelopeFrame(frame) => {
                write!(f, "non-envelope frame: {frame:?}")
            }
            Diagnostic::DecodeFailure(msg) => write!(f, "decode failure: {msg}"),
            Diagnostic::UnknownKind { id } => write!(f, "unknown message kind (id {id})"),
            Diagnostic::OrphanResponse { id } => write!(f, "orphan response (id {id})"),
            Diagnostic::DuplicateRequest { id } => write!(f, "duplicate request id {id}"),
            Diagnostic::OrphanStream { id, kind } => {
                write!(f, "{kind} for inactive stream {id}")
            }
            Diagnostic::UnknownCallback { id } => write!(f, "unknown callback id {id}"),
            Diagnostic::WriteFailure(msg) => write!(f, "write failure: {msg}"),
        }
    }
}

/// Receives diagnostics from a channel.
pub type DiagnosticSink = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

/// The default sink: log at warn level.
pub fn tracing_sink() -> DiagnosticSink {
    Arc::new(|diag| tracing::warn!(%diag, "channel diagnostic"))
}
