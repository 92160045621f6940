//! Error types for the RPC core and the wire error record.
//!
//! Errors raised by a handler cross the wire as an [`ErrorRecord`]: name,
//! message, optional stack and cause chain, plus arbitrary extra properties
//! preserved verbatim. On receipt, records whose name matches a built-in
//! kind map back to that kind; everything else surfaces as
//! [`RpcError::Handler`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by channel operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// A value could not be represented in the selected payload mode.
    #[error("encode error: {0}")]
    Encode(String),

    /// Malformed wire input.
    #[error("decode error: {0}")]
    Decode(String),

    /// A method path did not resolve through the exposed tree.
    #[error("not found: {0}")]
    NotFound(String),

    /// The terminal of a path is not callable/constructible/addressable
    /// as the operation requires.
    #[error("type error: {0}")]
    Type(String),

    /// Transfer slot handling failed (depth exceeded, unknown slot tag,
    /// or a slot index out of range).
    #[error("transfer error: {0}")]
    Transfer(String),

    /// The remote handler raised; carries the reconstructed error record.
    #[error("handler error: {}: {}", .0.name, .0.message)]
    Handler(ErrorRecord),

    /// A stream producer raised; surfaced on consumer iteration.
    #[error("stream error: {}: {}", .0.name, .0.message)]
    Stream(ErrorRecord),

    /// The channel was destroyed before or during the operation.
    #[error("channel destroyed")]
    ChannelDestroyed,

    /// Message with an unknown kind, missing required field, or duplicate
    /// request id.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying endpoint failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl RpcError {
    /// Serialize into the wire error record.
    pub fn to_record(&self) -> ErrorRecord {
        match self {
            RpcError::Handler(rec) | RpcError::Stream(rec) => rec.clone(),
            RpcError::Encode(msg) => ErrorRecord::new("EncodeError", msg),
            RpcError::Decode(msg) => ErrorRecord::new("DecodeError", msg),
            RpcError::NotFound(msg) => ErrorRecord::new("NotFound", msg),
            RpcError::Type(msg) => ErrorRecord::new("TypeError", msg),
            RpcError::Transfer(msg) => ErrorRecord::new("TransferError", msg),
            RpcError::ChannelDestroyed => {
                ErrorRecord::new("ChannelDestroyed", "channel destroyed")
            }
            RpcError::Protocol(msg) => ErrorRecord::new("ProtocolError", msg),
            RpcError::Transport(err) => ErrorRecord::new("TransportError", &err.to_string()),
        }
    }
}

/// Errors raised by a duplex endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint is closed.
    #[error("transport closed")]
    Closed,

    /// The endpoint cannot carry this message shape (e.g. a structured
    /// message handed to a text-only transport).
    #[error("unsupported message: {0}")]
    Unsupported(&'static str),

    /// An underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The wire form of a serialized error.
///
/// Extra own properties of the original error ride in `properties` and are
/// flattened into the JSON object, so `{"name": "E", "message": "m",
/// "code": 404}` round-trips with `code` intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorRecord>>,
    #[serde(flatten)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl ErrorRecord {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
            stack: None,
            cause: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_stack(mut self, stack: &str) -> Self {
        self.stack = Some(stack.to_string());
        self
    }

    pub fn with_cause(mut self, cause: ErrorRecord) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_property(mut self, key: &str, value: serde_json::Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    /// Map back to an `RpcError`, recovering built-in kinds by name.
    pub fn into_rpc_error(self) -> RpcError {
        match self.name.as_str() {
            "EncodeError" => RpcError::Encode(self.message),
            "DecodeError" => RpcError::Decode(self.message),
            "NotFound" => RpcError::NotFound(self.message),
            "TypeError" => RpcError::Type(self.message),
            "TransferError" => RpcError::Transfer(self.message),
            "ChannelDestroyed" => RpcError::ChannelDestroyed,
            "ProtocolError" => RpcError::Protocol(self.message),
            _ => RpcError::Handler(self),
        }
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip_preserves_extra_properties() {
        let rec = ErrorRecord::new("CustomError", "nope")
            .with_property("code", serde_json::json!(404))
            .with_cause(ErrorRecord::new("Inner", "root cause"));

        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["name"], "CustomError");
        assert_eq!(json["code"], 404);
        assert_eq!(json["cause"]["name"], "Inner");

        let back: ErrorRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn builtin_names_map_back_to_their_kind() {
        let err = ErrorRecord::new("NotFound", "math.add").into_rpc_error();
        assert!(matches!(err, RpcError::NotFound(_)));

        let err = ErrorRecord::new("ChannelDestroyed", "x").into_rpc_error();
        assert!(matches!(err, RpcError::ChannelDestroyed));

        let err = ErrorRecord::new("SomethingElse", "x").into_rpc_error();
        assert!(matches!(err, RpcError::Handler(_)));
    }

    #[test]
    fn to_record_carries_kind_name() {
        let rec = RpcError::NotFound("a.b".into()).to_record();
        assert_eq!(rec.name, "NotFound");
        assert_eq!(rec.message, "a.b");
    }
}
