//! Channel plumbing between a blocking archive producer and an async consumer.
//!
//! The producer writes through [`ChannelWriter`] (a plain `io::Write`),
//! the consumer pulls chunks from [`ArchiveStream`]. The channel is
//! bounded, so the producer never runs far ahead of the upload.

use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream};
use std::io::{self, Write};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Channel size for producer -> consumer (chunks in flight)
pub const ARCHIVE_CHANNEL_SIZE: usize = 16;

/// Chunk size handed to the consumer
pub const ARCHIVE_CHUNK_SIZE: usize = 256 * 1024; // 256KB

/// Byte stream accepted by blob backends
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

type ChunkSender = mpsc::Sender<io::Result<Bytes>>;

/// Create a bounded producer/consumer pair
pub fn archive_channel() -> (ChannelWriter, ArchiveStream) {
    let (tx, rx) = mpsc::channel(ARCHIVE_CHANNEL_SIZE);
    (
        ChannelWriter {
            tx,
            buf: BytesMut::with_capacity(ARCHIVE_CHUNK_SIZE),
        },
        ArchiveStream { rx, poisoned: None },
    )
}

// =============================================================================
// Producer side
// =============================================================================

/// Blocking writer that forwards fixed-size chunks to an [`ArchiveStream`].
///
/// Must only be used from a blocking context (`spawn_blocking` or a plain
/// thread). Writes fail with `BrokenPipe` once the consumer is gone.
#[derive(Debug)]
pub struct ChannelWriter {
    tx: ChunkSender,
    buf: BytesMut,
}

impl ChannelWriter {
    /// A handle that can poison the stream after the writer is consumed.
    pub fn poisoner(&self) -> Poisoner {
        Poisoner {
            tx: self.tx.clone(),
        }
    }

    fn send(&self, chunk: Bytes) -> io::Result<()> {
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer closed"))
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.send(chunk)
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= ARCHIVE_CHUNK_SIZE {
            let chunk = self.buf.split_to(ARCHIVE_CHUNK_SIZE).freeze();
            self.send(chunk)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

/// Sends a terminal error into the stream.
#[derive(Debug)]
pub struct Poisoner {
    tx: ChunkSender,
}

impl Poisoner {
    pub fn poison(self, err: io::Error) {
        // Consumer may already be gone, nothing left to notify then
        let _ = self.tx.blocking_send(Err(err));
    }
}

// =============================================================================
// Consumer side
// =============================================================================

/// Lazily produced archive bytes.
///
/// Once an error has been yielded the stream is poisoned: every later poll
/// yields the same error again. Dropping the stream stops the producer at
/// its next write.
#[derive(Debug)]
pub struct ArchiveStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    poisoned: Option<(io::ErrorKind, String)>,
}

impl ArchiveStream {
    pub fn boxed(self) -> ByteStream {
        Box::pin(self)
    }
}

impl Stream for ArchiveStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some((kind, msg)) = &this.poisoned {
            return Poll::Ready(Some(Err(io::Error::new(*kind, msg.clone()))));
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Err(err))) => {
                this.poisoned = Some((err.kind(), err.to_string()));
                Poll::Ready(Some(Err(err)))
            }
            other => other,
        }
    }
}
