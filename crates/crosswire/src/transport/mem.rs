//! In-process transport pair over bounded channels.
//!
//! Structured-clone and transfer capable: messages cross as structured
//! values and handles move without copying.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::TransportError;

use super::{Capabilities, Message, Transport};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

struct MemInner {
    tx: parking_lot::Mutex<Option<mpsc::Sender<Message>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    closed: AtomicBool,
}

impl MemTransport {
    /// Two connected endpoints; what one writes the other reads.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let a = Self {
            inner: Arc::new(MemInner {
                tx: parking_lot::Mutex::new(Some(tx_b)),
                rx: tokio::sync::Mutex::new(rx_a),
                closed: AtomicBool::new(false),
            }),
        };
        let b = Self {
            inner: Arc::new(MemInner {
                tx: parking_lot::Mutex::new(Some(tx_a)),
                rx: tokio::sync::Mutex::new(rx_b),
                closed: AtomicBool::new(false),
            }),
        };
        (a, b)
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MemTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTransport").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Transport for MemTransport {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            structured_clone: true,
            transfer: true,
        }
    }

    async fn read(&self) -> Result<Option<Message>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inner.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn write(&self, message: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let tx = self
            .inner
            .tx
            .lock()
            .clone()
            .ok_or(TransportError::Closed)?;
        tx.send(message).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        // Dropping the sender lets the peer's read() observe the close.
        self.inner.tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let (a, b) = MemTransport::pair();
        a.write(Message::Text("one".into())).await.unwrap();
        a.write(Message::Text("two".into())).await.unwrap();

        match b.read().await.unwrap() {
            Some(Message::Text(s)) => assert_eq!(s, "one"),
            other => panic!("unexpected message: {other:?}"),
        }
        match b.read().await.unwrap() {
            Some(Message::Text(s)) => assert_eq!(s, "two"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_is_observed_by_peer() {
        let (a, b) = MemTransport::pair();
        a.close().await;
        assert!(matches!(b.read().await, Ok(None)));
        assert!(matches!(
            a.write(Message::Text("x".into())).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn handles_cross_without_copying() {
        let (a, b) = MemTransport::pair();
        let handles = vec![super::super::TransferHandle::Buffer(vec![7u8; 32])];
        a.write(Message::Structured(serde_json::json!({"k": 1}), handles))
            .await
            .unwrap();
        match b.read().await.unwrap() {
            Some(Message::Structured(v, handles)) => {
                assert_eq!(v["k"], 1);
                assert_eq!(handles.len(), 1);
                assert_eq!(handles[0].byte_length(), 32);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
