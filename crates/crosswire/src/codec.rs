//! Wire codec: compact and rich payload modes, envelope text framing.
//!
//! Compact mode is standard JSON: booleans, finite doubles, strings, nulls,
//! arrays, string-keyed objects. Rich mode additionally preserves dates,
//! wide integers, byte arrays, sets, ordered mappings and undefined through
//! tagged objects of the shape `{"$tag": <kind>, "value": ...}`. A plain
//! object that happens to contain a `$tag` key is escaped as
//! `{"$tag": "object", "value": {...}}` so it survives the round trip.
//!
//! Which decoder runs is chosen per message from the envelope's `version`
//! field; anything that does not name the rich mode falls back to compact.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::envelope::Envelope;
use crate::error::RpcError;
use crate::value::Value;

/// Recursion limit for value graphs. `Value` is an owned tree so cycles
/// cannot occur; the limit bounds stack use on pathological nesting.
pub const MAX_DEPTH: usize = 64;

const TAG_KEY: &str = "$tag";

/// Payload mode, selectable per channel and tagged per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecMode {
    Compact,
    #[default]
    Rich,
}

impl CodecMode {
    /// The `version` tag written into envelopes.
    pub fn tag(&self) -> &'static str {
        match self {
            CodecMode::Compact => "compact",
            CodecMode::Rich => "rich",
        }
    }

    /// Pick the decoder from an envelope's `version` field. Unknown or
    /// absent tags fall back to compact.
    pub fn from_version(version: Option<&str>) -> Self {
        match version {
            Some("rich") => CodecMode::Rich,
            _ => CodecMode::Compact,
        }
    }
}

/// Encode a value graph in the given mode.
pub fn encode_value(mode: CodecMode, value: &Value) -> Result<serde_json::Value, RpcError> {
    encode_at(mode, value, 0)
}

/// Decode a payload in the given mode. Never yields `Callable` or
/// `Transfer` variants; sentinel strings are bound by later passes.
pub fn decode_value(mode: CodecMode, json: &serde_json::Value) -> Result<Value, RpcError> {
    decode_at(mode, json, 0)
}

fn encode_at(mode: CodecMode, value: &Value, depth: usize) -> Result<serde_json::Value, RpcError> {
    if depth > MAX_DEPTH {
        return Err(RpcError::Encode(format!(
            "value graph exceeds depth limit of {MAX_DEPTH}"
        )));
    }
    let rich = mode == CodecMode::Rich;
    match value {
        Value::Null => Ok(serde_json::Value::Null),
        Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .ok_or_else(|| RpcError::Encode(format!("non-finite number {n}"))),
        Value::String(s) => Ok(serde_json::Value::String(s.clone())),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(encode_at(mode, item, depth + 1)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), encode_at(mode, item, depth + 1)?);
            }
            if rich && map.contains_key(TAG_KEY) {
                Ok(tagged("object", serde_json::Value::Object(out)))
            } else {
                Ok(serde_json::Value::Object(out))
            }
        }
        Value::Undefined if rich => Ok(serde_json::json!({ TAG_KEY: "undefined" })),
        Value::Date(dt) if rich => Ok(tagged(
            "date",
            serde_json::Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
        )),
        Value::BigInt(n) if rich => Ok(tagged("bigint", serde_json::Value::String(n.to_string()))),
        Value::Bytes(bytes) if rich => Ok(tagged(
            "bytes",
            serde_json::Value::String(BASE64.encode(bytes)),
        )),
        Value::Transfer(cell) if rich => {
            // Inline copy: the compact path of the transfer engine left the
            // cell in the graph, so the payload carries the bytes by value.
            Ok(tagged(
                "bytes",
                serde_json::Value::String(cell.with_bytes(|b| BASE64.encode(b))),
            ))
        }
        Value::Set(items) if rich => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(encode_at(mode, item, depth + 1)?);
            }
            Ok(tagged("set", serde_json::Value::Array(out)))
        }
        Value::Map(pairs) if rich => {
            let mut out = Vec::with_capacity(pairs.len());
            for (key, item) in pairs {
                out.push(serde_json::Value::Array(vec![
                    encode_at(mode, key, depth + 1)?,
                    encode_at(mode, item, depth + 1)?,
                ]));
            }
            Ok(tagged("map", serde_json::Value::Array(out)))
        }
        Value::Callable(_) => Err(RpcError::Encode(
            "callable reached the codec without callback registration".into(),
        )),
        other => Err(RpcError::Encode(format!(
            "{} not representable in compact mode",
            variant_name(other)
        ))),
    }
}

fn decode_at(mode: CodecMode, json: &serde_json::Value, depth: usize) -> Result<Value, RpcError> {
    if depth > MAX_DEPTH {
        return Err(RpcError::Decode(format!(
            "payload exceeds depth limit of {MAX_DEPTH}"
        )));
    }
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(Value::Number)
            .ok_or_else(|| RpcError::Decode(format!("unrepresentable number {n}"))),
        serde_json::Value::String(s) => Ok(Value::String(s.clone())),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(decode_at(mode, item, depth + 1)?);
            }
            Ok(Value::Array(out))
        }
        serde_json::Value::Object(map) => {
            if mode == CodecMode::Rich {
                if let Some(tag) = map.get(TAG_KEY).and_then(|t| t.as_str()) {
                    return decode_tagged(tag, map.get("value"), depth);
                }
            }
            let mut out = BTreeMap::new();
            for (key, item) in map {
                out.insert(key.clone(), decode_at(mode, item, depth + 1)?);
            }
            Ok(Value::Object(out))
        }
    }
}

fn decode_tagged(
    tag: &str,
    payload: Option<&serde_json::Value>,
    depth: usize,
) -> Result<Value, RpcError> {
    match tag {
        "undefined" => Ok(Value::Undefined),
        "date" => {
            let text = expect_str(tag, payload)?;
            let dt = DateTime::parse_from_rfc3339(text)
                .map_err(|e| RpcError::Decode(format!("bad date {text:?}: {e}")))?;
            Ok(Value::Date(dt.with_timezone(&Utc)))
        }
        "bigint" => {
            let text = expect_str(tag, payload)?;
            let n = text
                .parse::<i128>()
                .map_err(|e| RpcError::Decode(format!("bad bigint {text:?}: {e}")))?;
            Ok(Value::BigInt(n))
        }
        "bytes" => {
            let text = expect_str(tag, payload)?;
            let bytes = BASE64
                .decode(text)
                .map_err(|e| RpcError::Decode(format!("bad base64 payload: {e}")))?;
            Ok(Value::Bytes(bytes))
        }
        "set" => {
            let items = expect_array(tag, payload)?;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(decode_at(CodecMode::Rich, item, depth + 1)?);
            }
            Ok(Value::Set(out))
        }
        "map" => {
            let items = expect_array(tag, payload)?;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let pair = item
                    .as_array()
                    .filter(|p| p.len() == 2)
                    .ok_or_else(|| RpcError::Decode("map entry is not a pair".into()))?;
                out.push((
                    decode_at(CodecMode::Rich, &pair[0], depth + 1)?,
                    decode_at(CodecMode::Rich, &pair[1], depth + 1)?,
                ));
            }
            Ok(Value::Map(out))
        }
        "object" => {
            let map = payload
                .and_then(|p| p.as_object())
                .ok_or_else(|| RpcError::Decode("escaped object without payload".into()))?;
            let mut out = BTreeMap::new();
            for (key, item) in map {
                out.insert(key.clone(), decode_at(CodecMode::Rich, item, depth + 1)?);
            }
            Ok(Value::Object(out))
        }
        other => Err(RpcError::Decode(format!("unknown rich tag {other:?}"))),
    }
}

fn tagged(tag: &str, value: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ TAG_KEY: tag, "value": value })
}

fn expect_str<'a>(
    tag: &str,
    payload: Option<&'a serde_json::Value>,
) -> Result<&'a str, RpcError> {
    payload
        .and_then(|p| p.as_str())
        .ok_or_else(|| RpcError::Decode(format!("{tag} tag without string payload")))
}

fn expect_array<'a>(
    tag: &str,
    payload: Option<&'a serde_json::Value>,
) -> Result<&'a Vec<serde_json::Value>, RpcError> {
    payload
        .and_then(|p| p.as_array())
        .ok_or_else(|| RpcError::Decode(format!("{tag} tag without array payload")))
}

fn variant_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Undefined => "undefined",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::BigInt(_) => "bigint",
        Value::String(_) => "string",
        Value::Bytes(_) => "bytes",
        Value::Date(_) => "date",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Set(_) => "set",
        Value::Map(_) => "map",
        Value::Callable(_) => "callable",
        Value::Transfer(_) => "transfer buffer",
    }
}

/// Serialize an envelope for a text-mode transport (one line per frame).
pub fn encode_envelope_text(env: &Envelope) -> Result<String, RpcError> {
    serde_json::to_string(env).map_err(|e| RpcError::Encode(e.to_string()))
}

/// Parse a text frame into an envelope.
pub fn decode_envelope_text(frame: &str) -> Result<Envelope, RpcError> {
    serde_json::from_str(frame).map_err(|e| RpcError::Decode(e.to_string()))
}

/// Parse a structured message into an envelope.
pub fn decode_envelope_json(json: serde_json::Value) -> Result<Envelope, RpcError> {
    serde_json::from_value(json).map_err(|e| RpcError::Decode(e.to_string()))
}

/// Reassembles line-feed-delimited frames from a byte stream, buffering
/// partial input and yielding complete frames only.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The next complete frame, without its delimiter; `None` until a
    /// delimiter arrives.
    pub fn next_frame(&mut self) -> Result<Option<String>, RpcError> {
        let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let mut frame = self.buf.split_to(pos + 1);
        frame.truncate(pos);
        if frame.last() == Some(&b'\r') {
            frame.truncate(frame.len() - 1);
        }
        String::from_utf8(frame.to_vec())
            .map(Some)
            .map_err(|e| RpcError::Decode(format!("frame is not UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn roundtrip(mode: CodecMode, value: Value) -> Value {
        let json = encode_value(mode, &value).unwrap();
        decode_value(mode, &json).unwrap()
    }

    #[test]
    fn compact_roundtrips_json_values() {
        let value = Value::Object(BTreeMap::from([
            ("flag".to_string(), Value::Bool(true)),
            ("n".to_string(), Value::Number(1.5)),
            (
                "items".to_string(),
                Value::Array(vec![Value::Null, Value::from("x")]),
            ),
        ]));
        assert_eq!(roundtrip(CodecMode::Compact, value.clone()), value);
    }

    #[test]
    fn compact_rejects_extended_scalars() {
        for value in [
            Value::Undefined,
            Value::BigInt(1 << 70),
            Value::Bytes(vec![1]),
            Value::Date(Utc::now()),
            Value::Set(vec![]),
            Value::Map(vec![]),
        ] {
            assert!(matches!(
                encode_value(CodecMode::Compact, &value),
                Err(RpcError::Encode(_))
            ));
        }
    }

    #[test]
    fn rich_roundtrips_extended_scalars() {
        let date = Utc.timestamp_millis_opt(1_722_470_400_123).unwrap();
        let value = Value::Array(vec![
            Value::Undefined,
            Value::Date(date),
            Value::BigInt(170_141_183_460_469_231_731_687_303_715_884_105_727),
            Value::Bytes(vec![0, 1, 2, 255]),
            Value::Set(vec![Value::from(1i64), Value::from(2i64)]),
            Value::Map(vec![(Value::from("k"), Value::from(9i64))]),
        ]);
        assert_eq!(roundtrip(CodecMode::Rich, value.clone()), value);
    }

    #[test]
    fn rich_escapes_objects_with_tag_key() {
        let value = Value::Object(BTreeMap::from([
            ("$tag".to_string(), Value::from("user data")),
            ("x".to_string(), Value::from(1i64)),
        ]));
        let json = encode_value(CodecMode::Rich, &value).unwrap();
        assert_eq!(json["$tag"], "object");
        assert_eq!(roundtrip(CodecMode::Rich, value.clone()), value);
    }

    #[test]
    fn rich_decoder_falls_back_on_plain_objects() {
        let json = serde_json::json!({ "a": 1, "b": [true, null] });
        let decoded = decode_value(CodecMode::Rich, &json).unwrap();
        let map = decoded.as_object().unwrap();
        assert_eq!(map["a"], Value::Number(1.0));
    }

    #[test]
    fn non_finite_numbers_fail_encoding() {
        assert!(matches!(
            encode_value(CodecMode::Compact, &Value::Number(f64::NAN)),
            Err(RpcError::Encode(_))
        ));
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut value = Value::Null;
        for _ in 0..(MAX_DEPTH + 2) {
            value = Value::Array(vec![value]);
        }
        assert!(matches!(
            encode_value(CodecMode::Rich, &value),
            Err(RpcError::Encode(_))
        ));
    }

    #[test]
    fn version_selects_decoder() {
        assert_eq!(CodecMode::from_version(Some("rich")), CodecMode::Rich);
        assert_eq!(CodecMode::from_version(Some("compact")), CodecMode::Compact);
        assert_eq!(CodecMode::from_version(Some("v3")), CodecMode::Compact);
        assert_eq!(CodecMode::from_version(None), CodecMode::Compact);
    }

    #[test]
    fn frame_buffer_segments_partial_input() {
        let mut frames = FrameBuffer::new();
        frames.push(b"{\"id\":");
        assert!(frames.next_frame().unwrap().is_none());
        frames.push(b"\"a\"}\n{\"id\":\"b\"}\n{\"par");
        assert_eq!(frames.next_frame().unwrap().unwrap(), "{\"id\":\"a\"}");
        assert_eq!(frames.next_frame().unwrap().unwrap(), "{\"id\":\"b\"}");
        assert!(frames.next_frame().unwrap().is_none());
        assert!(!frames.is_empty());
    }

    #[test]
    fn frame_buffer_strips_carriage_return() {
        let mut frames = FrameBuffer::new();
        frames.push(b"{}\r\n");
        assert_eq!(frames.next_frame().unwrap().unwrap(), "{}");
    }
}
