//! The wire envelope: the logical framed unit exchanged between endpoints.

use serde::{Deserialize, Serialize};

/// Prefix of the string sentinel standing in for a callable argument.
pub const CALLBACK_PREFIX: &str = "__callback__";

/// Prefix of the string sentinel standing in for a transfer slot.
pub const TRANSFER_PREFIX: &str = "__transfer__";

/// Bare string recognized by adapters for graceful shutdown. Sent without
/// envelope wrapping.
pub const DESTROY_SENTINEL: &str = "__DESTROY__";

/// Key marking a response result as a stream-opened marker.
pub const STREAM_MARKER_KEY: &str = "__stream__";

/// Envelope kind; determines dispatch.
///
/// The first six are one-shot; the stream kinds belong to an active stream
/// whose `id` equals the originating request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    Request,
    Response,
    Callback,
    Get,
    Set,
    Construct,
    StreamChunk,
    StreamEnd,
    StreamError,
    StreamCancel,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Request => "request",
            Kind::Response => "response",
            Kind::Callback => "callback",
            Kind::Get => "get",
            Kind::Set => "set",
            Kind::Construct => "construct",
            Kind::StreamChunk => "stream-chunk",
            Kind::StreamEnd => "stream-end",
            Kind::StreamError => "stream-error",
            Kind::StreamCancel => "stream-cancel",
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            Kind::StreamChunk | Kind::StreamEnd | Kind::StreamError | Kind::StreamCancel
        )
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor for one transfer slot: which handler produced it and the
/// metadata that handler needs to restore the value. Slot `i` corresponds
/// to out-of-band handle `i`; indices densely number `[0, N)` within one
/// envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotDescriptor {
    pub handler: String,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// One logical wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Request identifier: opaque, unique per originator, four hex groups
    /// separated by dashes.
    pub id: String,
    /// Dot-joined method path; empty for non-invocation kinds.
    #[serde(default)]
    pub method: String,
    /// Arguments payload; shape depends on `type`.
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(rename = "type")]
    pub kind: Kind,
    /// Callback identifiers declared in this payload.
    #[serde(rename = "callbackIds", default, skip_serializing_if = "Option::is_none")]
    pub callback_ids: Option<Vec<String>>,
    /// Encoding tag naming the payload mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Property path for the property kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<String>>,
    /// Property value for the set kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Transfer slot descriptors when zero-copy handles accompany the
    /// message.
    #[serde(rename = "transferSlots", default, skip_serializing_if = "Option::is_none")]
    pub transfer_slots: Option<Vec<SlotDescriptor>>,
}

impl Envelope {
    pub fn new(id: String, kind: Kind) -> Self {
        Self {
            id,
            method: String::new(),
            args: serde_json::Value::Null,
            kind,
            callback_ids: None,
            version: None,
            path: None,
            value: None,
            transfer_slots: None,
        }
    }

    /// Success response: `args = {"result": value}`.
    pub fn response_ok(id: &str, result: serde_json::Value) -> Self {
        let mut env = Envelope::new(id.to_string(), Kind::Response);
        env.args = serde_json::json!({ "result": result });
        env
    }

    /// Error response: `args = {"error": record}`.
    pub fn response_err(id: &str, record: serde_json::Value) -> Self {
        let mut env = Envelope::new(id.to_string(), Kind::Response);
        env.args = serde_json::json!({ "error": record });
        env
    }

    /// The response marker that opens a stream keyed by the same id.
    pub fn stream_marker(id: &str) -> Self {
        Envelope::response_ok(id, serde_json::json!({ STREAM_MARKER_KEY: true }))
    }
}

/// Does this decoded result value mark a stream being opened?
pub fn is_stream_marker(result: &serde_json::Value) -> bool {
    result
        .get(STREAM_MARKER_KEY)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Generate a request id: four hex groups separated by dashes, unique per
/// originator.
pub fn request_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!(
        "{:08x}-{:08x}-{:08x}-{:08x}",
        rng.gen::<u32>(),
        rng.gen::<u32>(),
        rng.gen::<u32>(),
        rng.gen::<u32>()
    )
}

/// Callback ids share the request id format.
pub fn callback_id() -> String {
    request_id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_names_are_kebab_case() {
        let json = serde_json::to_value(Kind::StreamChunk).unwrap();
        assert_eq!(json, "stream-chunk");
        let kind: Kind = serde_json::from_value(serde_json::json!("stream-cancel")).unwrap();
        assert_eq!(kind, Kind::StreamCancel);
    }

    #[test]
    fn envelope_uses_exact_wire_field_names() {
        let mut env = Envelope::new("a-b-c-d".into(), Kind::Request);
        env.method = "math.add".into();
        env.args = serde_json::json!([2, 3]);
        env.callback_ids = Some(vec!["cb-1".into()]);
        env.version = Some("compact".into());
        env.transfer_slots = Some(vec![SlotDescriptor {
            handler: "buffer".into(),
            meta: serde_json::json!({ "byteLength": 4 }),
        }]);

        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["id"], "a-b-c-d");
        assert_eq!(json["type"], "request");
        assert_eq!(json["method"], "math.add");
        assert_eq!(json["callbackIds"][0], "cb-1");
        assert_eq!(json["transferSlots"][0]["handler"], "buffer");
        assert!(json.get("path").is_none());
        assert!(json.get("value").is_none());
    }

    #[test]
    fn optional_fields_default_on_decode() {
        let env: Envelope =
            serde_json::from_value(serde_json::json!({ "id": "x", "type": "get" })).unwrap();
        assert_eq!(env.kind, Kind::Get);
        assert!(env.method.is_empty());
        assert!(env.args.is_null());
        assert!(env.path.is_none());
    }

    #[test]
    fn request_id_shape() {
        let id = request_id();
        let groups: Vec<&str> = id.split('-').collect();
        assert_eq!(groups.len(), 4);
        for g in groups {
            assert_eq!(g.len(), 8);
            assert!(g.chars().all(|c| c.is_ascii_hexdigit()));
        }
        assert_ne!(request_id(), request_id());
    }

    #[test]
    fn stream_marker_detection() {
        let env = Envelope::stream_marker("id-1");
        assert!(is_stream_marker(&env.args["result"]));
        assert!(!is_stream_marker(&serde_json::json!({ "x": 1 })));
        assert!(!is_stream_marker(&serde_json::json!(42)));
    }
}
