//! Stream manager: producer and consumer state for active streamed
//! sequences.
//!
//! A stream is opened by a response carrying the stream marker and closed
//! by end/error/cancel. Chunks of one stream are delivered in producer
//! order; distinct streams interleave freely. The consumer queue is
//! bounded; transport-level backpressure applies above it.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::channel::Control;
use crate::error::RpcError;
use crate::value::Value;

/// Consumer-side delivery queue depth.
pub const STREAM_BUFFER: usize = 16;

/// Lifecycle of one stream record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Ending,
    Cancelled,
    Errored,
    Closed,
}

struct ProducerRecord {
    cancel: Option<oneshot::Sender<()>>,
    state: StreamState,
}

struct ConsumerRecord {
    tx: mpsc::Sender<Result<Value, RpcError>>,
    state: StreamState,
}

/// Where an inbound chunk should go.
pub(crate) enum ChunkRoute {
    Deliver(mpsc::Sender<Result<Value, RpcError>>),
    /// Stream was cancelled locally; late chunks are discarded silently.
    Discard,
    /// No record for this id.
    Unknown,
}

/// Tracks both roles for every active stream on a channel. The producer and
/// consumer maps have separate locks; neither is ever held across an await
/// or together with the other.
#[derive(Default)]
pub struct StreamManager {
    producers: Mutex<HashMap<String, ProducerRecord>>,
    consumers: Mutex<HashMap<String, ConsumerRecord>>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer side: track a stream being produced for the peer; the
    /// returned receiver fires when the consumer cancels.
    pub(crate) fn register_producer(&self, id: &str) -> oneshot::Receiver<()> {
        let (cancel, cancel_rx) = oneshot::channel();
        self.producers.lock().insert(
            id.to_string(),
            ProducerRecord {
                cancel: Some(cancel),
                state: StreamState::Open,
            },
        );
        cancel_rx
    }

    /// A `stream-cancel` arrived for a stream we produce.
    pub(crate) fn cancel_producer(&self, id: &str) -> bool {
        let mut producers = self.producers.lock();
        match producers.get_mut(id) {
            Some(record) => {
                record.state = StreamState::Cancelled;
                if let Some(cancel) = record.cancel.take() {
                    let _ = cancel.send(());
                }
                true
            }
            None => false,
        }
    }

    /// The producer loop finished in the given terminal state.
    pub(crate) fn finish_producer(&self, id: &str, state: StreamState) {
        if self.producers.lock().remove(id).is_some() {
            tracing::trace!(id, ?state, "producer stream finished");
        }
    }

    /// Consumer side: open the delivery queue for a stream the peer is
    /// producing.
    pub(crate) fn register_consumer(&self, id: &str) -> mpsc::Receiver<Result<Value, RpcError>> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.consumers.lock().insert(
            id.to_string(),
            ConsumerRecord {
                tx,
                state: StreamState::Open,
            },
        );
        rx
    }

    pub(crate) fn chunk_route(&self, id: &str) -> ChunkRoute {
        let consumers = self.consumers.lock();
        match consumers.get(id) {
            Some(record) if record.state == StreamState::Cancelled => ChunkRoute::Discard,
            Some(record) => ChunkRoute::Deliver(record.tx.clone()),
            None => ChunkRoute::Unknown,
        }
    }

    /// Iteration was abandoned locally; later chunks are discarded until
    /// the producer's closing `stream-end` removes the record.
    pub(crate) fn mark_consumer_cancelled(&self, id: &str) {
        if let Some(record) = self.consumers.lock().get_mut(id) {
            record.state = StreamState::Cancelled;
        }
    }

    /// Terminal message for a consumed stream: `stream-end` carries no
    /// error, `stream-error` delivers one before the queue closes.
    pub(crate) async fn finish_consumer(&self, id: &str, error: Option<RpcError>) -> bool {
        let record = self.consumers.lock().remove(id);
        match record {
            Some(record) => {
                if let Some(err) = error {
                    if record.state != StreamState::Cancelled {
                        let _ = record.tx.send(Err(err)).await;
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Destroy-time teardown: cancel every producer, fail every consumer.
    pub(crate) fn shutdown(&self) {
        let producers = std::mem::take(&mut *self.producers.lock());
        for (_, mut record) in producers {
            if let Some(cancel) = record.cancel.take() {
                let _ = cancel.send(());
            }
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for (_, record) in consumers {
            let _ = record.tx.try_send(Err(RpcError::ChannelDestroyed));
        }
    }

    pub fn producer_count(&self) -> usize {
        self.producers.lock().len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    pub fn producer_state(&self, id: &str) -> Option<StreamState> {
        self.producers.lock().get(id).map(|r| r.state)
    }

    pub fn consumer_state(&self, id: &str) -> Option<StreamState> {
        self.consumers.lock().get(id).map(|r| r.state)
    }
}

/// The lazy sequence handed to a caller whose request opened a stream.
///
/// Yields decoded chunk values until `stream-end` (clean termination) or
/// `stream-error` (the reconstructed error, then termination). Dropping the
/// stream before natural termination sends exactly one `stream-cancel`.
pub struct RpcStream {
    id: String,
    rx: mpsc::Receiver<Result<Value, RpcError>>,
    ctl: mpsc::UnboundedSender<Control>,
    finished: bool,
    cancel_sent: bool,
}

impl RpcStream {
    pub(crate) fn new(
        id: String,
        rx: mpsc::Receiver<Result<Value, RpcError>>,
        ctl: mpsc::UnboundedSender<Control>,
    ) -> Self {
        Self {
            id,
            rx,
            ctl,
            finished: false,
            cancel_sent: false,
        }
    }

    /// The stream id (equals the originating request id).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Abandon iteration. Idempotent with drop: at most one
    /// `stream-cancel` ever leaves this side.
    pub fn cancel(mut self) {
        self.send_cancel();
    }

    fn send_cancel(&mut self) {
        if self.finished || self.cancel_sent {
            return;
        }
        self.cancel_sent = true;
        let _ = self.ctl.send(Control::CancelStream(self.id.clone()));
    }
}

impl futures_core::Stream for RpcStream {
    type Item = Result<Value, RpcError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(Err(err))) => {
                this.finished = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RpcStream {
    fn drop(&mut self) {
        self.send_cancel();
    }
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcStream")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
