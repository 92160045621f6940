//! Transfer engine: zero-copy handoff of opaque resources.
//!
//! On the wire a transferable value is replaced by the sentinel
//! `__transfer__<index>`; the slot descriptor rides in the envelope's
//! `transferSlots` and the resource itself travels out-of-band as handle
//! `<index>`. Slot indices densely number `[0, N)` within one envelope.

use std::sync::Arc;

use crate::codec::MAX_DEPTH;
use crate::envelope::{SlotDescriptor, TRANSFER_PREFIX};
use crate::error::RpcError;
use crate::transport::TransferHandle;
use crate::value::{TransferCell, Value};

/// Slot tag of the built-in byte-buffer handler.
pub const BUFFER_TAG: &str = "buffer";

/// User-registered transfer handler for values beyond the built-in buffer
/// type. `dismantle` produces the slot metadata and the out-of-band handle;
/// `restore` inverts it on the receiving side.
pub trait TransferHandler: Send + Sync {
    fn tag(&self) -> &'static str;

    fn claims(&self, value: &Value) -> bool;

    fn dismantle(&self, value: Value) -> Result<(serde_json::Value, TransferHandle), RpcError>;

    fn restore(&self, meta: &serde_json::Value, handle: TransferHandle)
        -> Result<Value, RpcError>;
}

/// Result of walking an argument graph on the sending side.
pub struct TransferOutcome {
    pub value: Value,
    pub slots: Vec<SlotDescriptor>,
    pub handles: Vec<TransferHandle>,
}

/// Walks argument and result graphs, swapping transferables for slot
/// sentinels on the way out and restoring them on the way in.
pub struct TransferEngine {
    handlers: Vec<Arc<dyn TransferHandler>>,
}

impl TransferEngine {
    pub fn new(handlers: Vec<Arc<dyn TransferHandler>>) -> Self {
        Self { handlers }
    }

    /// Sending side. With `transfer_enabled` false this is the compact
    /// path: the graph is returned unchanged with empty slot and handle
    /// lists (the codec then carries buffer cells by value).
    pub fn extract(
        &self,
        value: Value,
        transfer_enabled: bool,
    ) -> Result<TransferOutcome, RpcError> {
        let mut slots = Vec::new();
        let mut handles = Vec::new();
        let value = if transfer_enabled {
            self.extract_at(value, &mut slots, &mut handles, 0)?
        } else {
            value
        };
        Ok(TransferOutcome {
            value,
            slots,
            handles,
        })
    }

    fn extract_at(
        &self,
        value: Value,
        slots: &mut Vec<SlotDescriptor>,
        handles: &mut Vec<TransferHandle>,
        depth: usize,
    ) -> Result<Value, RpcError> {
        if depth > MAX_DEPTH {
            return Err(RpcError::Transfer(format!(
                "value graph exceeds depth limit of {MAX_DEPTH}"
            )));
        }
        if let Value::Transfer(cell) = &value {
            let bytes = cell.take();
            let index = slots.len();
            slots.push(SlotDescriptor {
                handler: BUFFER_TAG.to_string(),
                meta: serde_json::json!({ "byteLength": bytes.len() }),
            });
            handles.push(TransferHandle::Buffer(bytes));
            return Ok(Value::String(format!("{TRANSFER_PREFIX}{index}")));
        }
        if let Some(handler) = self.handlers.iter().find(|h| h.claims(&value)) {
            let index = slots.len();
            let (meta, handle) = handler.dismantle(value)?;
            slots.push(SlotDescriptor {
                handler: handler.tag().to_string(),
                meta,
            });
            handles.push(handle);
            return Ok(Value::String(format!("{TRANSFER_PREFIX}{index}")));
        }
        match value {
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.extract_at(item, slots, handles, depth + 1)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = std::collections::BTreeMap::new();
                for (key, item) in map {
                    out.insert(key, self.extract_at(item, slots, handles, depth + 1)?);
                }
                Ok(Value::Object(out))
            }
            Value::Set(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.extract_at(item, slots, handles, depth + 1)?);
                }
                Ok(Value::Set(out))
            }
            Value::Map(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (key, item) in pairs {
                    out.push((
                        self.extract_at(key, slots, handles, depth + 1)?,
                        self.extract_at(item, slots, handles, depth + 1)?,
                    ));
                }
                Ok(Value::Map(out))
            }
            leaf => Ok(leaf),
        }
    }

    /// Receiving side: replace each slot sentinel by the handle at its
    /// index, then hand the graph to callback binding and dispatch.
    pub fn restore(
        &self,
        value: Value,
        slots: &[SlotDescriptor],
        handles: Vec<TransferHandle>,
    ) -> Result<Value, RpcError> {
        if slots.is_empty() && handles.is_empty() {
            return Ok(value);
        }
        if slots.len() != handles.len() {
            return Err(RpcError::Transfer(format!(
                "{} slots but {} handles",
                slots.len(),
                handles.len()
            )));
        }
        let mut handles: Vec<Option<TransferHandle>> = handles.into_iter().map(Some).collect();
        self.restore_at(value, slots, &mut handles, 0)
    }

    fn restore_at(
        &self,
        value: Value,
        slots: &[SlotDescriptor],
        handles: &mut [Option<TransferHandle>],
        depth: usize,
    ) -> Result<Value, RpcError> {
        if depth > MAX_DEPTH {
            return Err(RpcError::Transfer(format!(
                "payload exceeds depth limit of {MAX_DEPTH}"
            )));
        }
        match value {
            Value::String(s) => match parse_sentinel(&s) {
                Some(index) => {
                    let slot = slots.get(index).ok_or_else(|| {
                        RpcError::Transfer(format!("slot index {index} out of range"))
                    })?;
                    let handle = handles
                        .get_mut(index)
                        .and_then(Option::take)
                        .ok_or_else(|| {
                            RpcError::Transfer(format!("slot {index} referenced twice"))
                        })?;
                    self.restore_slot(slot, handle)
                }
                None => Ok(Value::String(s)),
            },
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.restore_at(item, slots, handles, depth + 1)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = std::collections::BTreeMap::new();
                for (key, item) in map {
                    out.insert(key, self.restore_at(item, slots, handles, depth + 1)?);
                }
                Ok(Value::Object(out))
            }
            Value::Set(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.restore_at(item, slots, handles, depth + 1)?);
                }
                Ok(Value::Set(out))
            }
            Value::Map(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (key, item) in pairs {
                    out.push((
                        self.restore_at(key, slots, handles, depth + 1)?,
                        self.restore_at(item, slots, handles, depth + 1)?,
                    ));
                }
                Ok(Value::Map(out))
            }
            leaf => Ok(leaf),
        }
    }

    fn restore_slot(
        &self,
        slot: &SlotDescriptor,
        handle: TransferHandle,
    ) -> Result<Value, RpcError> {
        if slot.handler == BUFFER_TAG {
            let TransferHandle::Buffer(bytes) = handle;
            return Ok(Value::Transfer(TransferCell::new(bytes)));
        }
        let handler = self
            .handlers
            .iter()
            .find(|h| h.tag() == slot.handler)
            .ok_or_else(|| RpcError::Transfer(format!("unknown slot type {:?}", slot.handler)))?;
        handler.restore(&slot.meta, handle)
    }
}

fn parse_sentinel(s: &str) -> Option<usize> {
    s.strip_prefix(TRANSFER_PREFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> TransferEngine {
        TransferEngine::new(Vec::new())
    }

    #[test]
    fn compact_path_leaves_graph_unchanged() {
        let cell = TransferCell::new(vec![1, 2, 3]);
        let value = Value::Array(vec![Value::Transfer(cell.clone()), Value::from(1i64)]);
        let outcome = engine().extract(value, false).unwrap();
        assert!(outcome.slots.is_empty());
        assert!(outcome.handles.is_empty());
        assert_eq!(cell.byte_length(), 3);
    }

    #[test]
    fn transfer_path_takes_bytes_and_numbers_slots_densely() {
        let first = TransferCell::new(vec![1; 8]);
        let second = TransferCell::new(vec![2; 16]);
        let value = Value::Object(std::collections::BTreeMap::from([
            ("a".to_string(), Value::Transfer(first.clone())),
            (
                "b".to_string(),
                Value::Array(vec![Value::Transfer(second.clone())]),
            ),
        ]));

        let outcome = engine().extract(value, true).unwrap();
        assert_eq!(outcome.slots.len(), 2);
        assert_eq!(outcome.handles.len(), 2);
        assert!(first.is_empty());
        assert!(second.is_empty());

        let map = outcome.value.as_object().unwrap();
        assert_eq!(map["a"], Value::String("__transfer__0".into()));
        let inner = map["b"].as_array().unwrap();
        assert_eq!(inner[0], Value::String("__transfer__1".into()));
        assert_eq!(outcome.slots[0].meta["byteLength"], 8);
        assert_eq!(outcome.slots[1].meta["byteLength"], 16);
    }

    #[test]
    fn restore_inverts_extract() {
        let cell = TransferCell::new(vec![9; 4]);
        let value = Value::Array(vec![Value::Transfer(cell), Value::from("plain")]);
        let outcome = engine().extract(value, true).unwrap();
        let restored = engine()
            .restore(outcome.value, &outcome.slots, outcome.handles)
            .unwrap();
        let items = restored.as_array().unwrap();
        match &items[0] {
            Value::Transfer(cell) => assert_eq!(cell.byte_length(), 4),
            other => panic!("expected transfer cell, got {other:?}"),
        }
        assert_eq!(items[1], Value::from("plain"));
    }

    #[test]
    fn unknown_slot_type_is_rejected() {
        let slots = [SlotDescriptor {
            handler: "mystery".into(),
            meta: serde_json::Value::Null,
        }];
        let err = engine()
            .restore(
                Value::String("__transfer__0".into()),
                &slots,
                vec![TransferHandle::Buffer(Vec::new())],
            )
            .unwrap_err();
        assert!(matches!(err, RpcError::Transfer(_)));
    }

    #[test]
    fn out_of_range_slot_index_is_rejected() {
        let slots = [SlotDescriptor {
            handler: BUFFER_TAG.into(),
            meta: serde_json::Value::Null,
        }];
        let err = engine()
            .restore(
                Value::String("__transfer__7".into()),
                &slots,
                vec![TransferHandle::Buffer(Vec::new())],
            )
            .unwrap_err();
        assert!(matches!(err, RpcError::Transfer(_)));
    }

    #[test]
    fn plain_strings_survive_when_no_slots_present() {
        let restored = engine()
            .restore(Value::String("__transfer__0".into()), &[], Vec::new())
            .unwrap();
        assert_eq!(restored, Value::String("__transfer__0".into()));
    }
}
