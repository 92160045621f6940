//! Byte-stream transport with line-feed framing.
//!
//! Wraps any `AsyncRead + AsyncWrite` duplex (TCP, stdio via
//! [`StreamTransport::from_split`], an in-process duplex via
//! [`StreamTransport::pair`]). String mode only: no structured clone, no
//! transfer handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::codec::FrameBuffer;
use crate::error::TransportError;

use super::{Capabilities, Message, Transport};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

struct ReadHalf {
    reader: Box<dyn AsyncRead + Unpin + Send>,
    frames: FrameBuffer,
}

struct StreamInner {
    read: AsyncMutex<ReadHalf>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send>>,
    closed: AtomicBool,
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_split(reader, writer)
    }

    /// Build from separate read and write handles (stdin/stdout, split
    /// sockets).
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            inner: Arc::new(StreamInner {
                read: AsyncMutex::new(ReadHalf {
                    reader: Box::new(reader),
                    frames: FrameBuffer::new(),
                }),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Two endpoints joined by an in-process duplex pipe.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Self::new(a), Self::new(b))
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Transport for StreamTransport {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            structured_clone: false,
            transfer: false,
        }
    }

    async fn read(&self) -> Result<Option<Message>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut half = self.inner.read.lock().await;
        loop {
            match half.frames.next_frame() {
                Ok(Some(frame)) => {
                    if frame.is_empty() {
                        continue;
                    }
                    return Ok(Some(Message::Text(frame)));
                }
                Ok(None) => {}
                Err(err) => {
                    return Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        err.to_string(),
                    )))
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = half.reader.read(&mut chunk).await?;
            if n == 0 {
                if !half.frames.is_empty() {
                    tracing::warn!("discarding unterminated trailing frame at stream close");
                }
                return Ok(None);
            }
            half.frames.push(&chunk[..n]);
        }
    }

    async fn write(&self, message: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let text = match message {
            Message::Text(text) => text,
            Message::Structured(..) => {
                return Err(TransportError::Unsupported(
                    "structured messages require a structured-clone transport",
                ))
            }
        };
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(text.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}
