//! Pending table: correlates outgoing request ids with completion sinks.
//!
//! Entries are inserted at outbound send and removed at the first matching
//! response. Requests that turn out to be streams are promoted: the entry
//! stays in `Streaming` state until the stream reaches a terminal state.
//! Destroy drains every entry with `ChannelDestroyed`. The sink is a
//! oneshot sender, so concurrent completion and drain cannot
//! double-dispatch.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::RpcError;
use crate::stream::RpcStream;
use crate::value::Value;

/// What an outbound request resolved to.
#[derive(Debug)]
pub enum Completion {
    Value(Value),
    /// The response carried the stream-opened marker; the lazy sequence is
    /// synthesized transparently.
    Stream(RpcStream),
}

impl Completion {
    /// Unwrap a plain value; a stream here is a type error.
    pub fn into_value(self) -> Result<Value, RpcError> {
        match self {
            Completion::Value(v) => Ok(v),
            Completion::Stream(_) => Err(RpcError::Type(
                "call resolved to a stream; iterate it instead".into(),
            )),
        }
    }

    /// Unwrap a stream; a plain value here is a type error.
    pub fn into_stream(self) -> Result<RpcStream, RpcError> {
        match self {
            Completion::Stream(s) => Ok(s),
            Completion::Value(_) => {
                Err(RpcError::Type("call resolved to a plain value, not a stream".into()))
            }
        }
    }
}

type Sink = oneshot::Sender<Result<Completion, RpcError>>;

enum Entry {
    Waiting { sink: Sink, since: Instant },
    Streaming { since: Instant },
}

#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, Entry>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an entry for a fresh outbound request id.
    pub fn insert(
        &self,
        id: &str,
    ) -> Result<oneshot::Receiver<Result<Completion, RpcError>>, RpcError> {
        let (sink, rx) = oneshot::channel();
        let mut entries = self.entries.lock();
        if entries.contains_key(id) {
            return Err(RpcError::Protocol(format!("duplicate request id {id}")));
        }
        entries.insert(
            id.to_string(),
            Entry::Waiting {
                sink,
                since: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Deliver the terminal outcome for a waiting request. Returns false if
    /// no waiting entry exists (late or duplicate response).
    pub fn complete(&self, id: &str, outcome: Result<Completion, RpcError>) -> bool {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.get(id) {
                Some(Entry::Waiting { .. }) => entries.remove(id),
                _ => None,
            }
        };
        match entry {
            Some(Entry::Waiting { sink, .. }) => sink.send(outcome).is_ok(),
            _ => false,
        }
    }

    /// Transition a waiting entry into streaming state, handing back the
    /// sink so the caller can deliver the synthesized stream. The entry
    /// itself stays until [`PendingTable::settle`].
    pub fn promote(&self, id: &str) -> Option<Sink> {
        let mut entries = self.entries.lock();
        match entries.remove(id) {
            Some(Entry::Waiting { sink, since }) => {
                entries.insert(id.to_string(), Entry::Streaming { since });
                Some(sink)
            }
            Some(other) => {
                entries.insert(id.to_string(), other);
                None
            }
            None => None,
        }
    }

    /// Remove a streaming entry once its stream reached a terminal state.
    pub fn settle(&self, id: &str) {
        let mut entries = self.entries.lock();
        if matches!(entries.get(id), Some(Entry::Streaming { .. })) {
            entries.remove(id);
        }
    }

    /// Drop an entry without dispatching (failed send).
    pub fn forget(&self, id: &str) {
        self.entries.lock().remove(id);
    }

    /// Fail every outstanding request with `ChannelDestroyed` and clear the
    /// table.
    pub fn drain(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        let mut waiting = 0usize;
        for (id, entry) in entries {
            match entry {
                Entry::Waiting { sink, since } => {
                    waiting += 1;
                    tracing::debug!(
                        id,
                        age_ms = since.elapsed().as_millis() as u64,
                        "draining pending request"
                    );
                    let _ = sink.send(Err(RpcError::ChannelDestroyed));
                }
                Entry::Streaming { since } => {
                    tracing::debug!(
                        id,
                        age_ms = since.elapsed().as_millis() as u64,
                        "dropping streaming entry"
                    );
                }
            }
        }
        if waiting > 0 {
            tracing::debug!(count = waiting, "pending requests rejected at destroy");
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_delivers_once() {
        let table = PendingTable::new();
        let rx = table.insert("r1").unwrap();
        assert!(table.complete("r1", Ok(Completion::Value(Value::from(5i64)))));
        assert!(!table.complete("r1", Ok(Completion::Value(Value::Null))));
        let value = rx.await.unwrap().unwrap().into_value().unwrap();
        assert_eq!(value, Value::from(5i64));
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let table = PendingTable::new();
        let _rx = table.insert("r1").unwrap();
        assert!(matches!(table.insert("r1"), Err(RpcError::Protocol(_))));
    }

    #[tokio::test]
    async fn drain_rejects_with_channel_destroyed() {
        let table = PendingTable::new();
        let rx = table.insert("r1").unwrap();
        table.drain();
        assert!(matches!(rx.await.unwrap(), Err(RpcError::ChannelDestroyed)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn promoted_entries_stay_until_settled() {
        let table = PendingTable::new();
        let _rx = table.insert("s1").unwrap();
        let sink = table.promote("s1").unwrap();
        drop(sink);
        assert!(table.contains("s1"), "streaming entry remains");
        assert!(
            !table.complete("s1", Ok(Completion::Value(Value::Null))),
            "a stream id never coexists with a pending non-stream response"
        );
        table.settle("s1");
        assert!(!table.contains("s1"));
    }
}
