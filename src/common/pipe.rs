//! In-process chunk pipe backing a Link
//!
//! A pipe carries `Bytes` chunks from a writer half to a reader half.
//! Unlike a raw duplex stream it supports:
//! - chunk-granular reads with a deadline (what lets the cached reader
//!   peek at a connection without committing to a full read),
//! - interruption: pending and future reads fail, the writer observes a
//!   closed channel,
//! - teardown propagation on drop of either half.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Number of in-flight chunks a pipe buffers before applying backpressure.
const PIPE_CHUNKS: usize = 32;

struct PipeState {
    interrupted: AtomicBool,
}

/// Create a connected (reader, writer) pipe pair.
pub fn pipe() -> (PipeReader, PipeWriter) {
    let (tx, rx) = mpsc::channel::<Bytes>(PIPE_CHUNKS);
    let state = Arc::new(PipeState {
        interrupted: AtomicBool::new(false),
    });
    (
        PipeReader {
            rx,
            pending: Bytes::new(),
            state: Arc::clone(&state),
        },
        PipeWriter {
            tx: PollSender::new(tx),
            state,
        },
    )
}

fn interrupted_err() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "pipe interrupted")
}

/// Read half of a pipe
pub struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    /// Remainder of a chunk that did not fit the caller's buffer.
    pending: Bytes,
    state: Arc<PipeState>,
}

impl PipeReader {
    /// Receive the next chunk; `None` means the writer shut down.
    pub async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.state.interrupted.load(Ordering::SeqCst) {
            return Err(interrupted_err());
        }
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        Ok(self.rx.recv().await)
    }

    /// Like [`read_chunk`](Self::read_chunk) but gives up after `timeout`,
    /// returning `Ok(None)` when no chunk arrived in time.
    pub async fn read_chunk_timeout(&mut self, timeout: Duration) -> io::Result<Option<Bytes>> {
        match tokio::time::timeout(timeout, self.read_chunk()).await {
            Ok(res) => res,
            Err(_) => Ok(None),
        }
    }

    /// Interrupt the pipe: subsequent reads fail, the writer sees a
    /// closed channel, buffered chunks are discarded.
    pub fn interrupt(&mut self) {
        self.state.interrupted.store(true, Ordering::SeqCst);
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        self.pending = Bytes::new();
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.state.interrupted.load(Ordering::SeqCst) {
            return Poll::Ready(Err(interrupted_err()));
        }
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                let chunk = self.pending.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.pending = chunk,
                // Writer gone: EOF
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.rx.close();
    }
}

/// Write half of a pipe
pub struct PipeWriter {
    tx: PollSender<Bytes>,
    state: Arc<PipeState>,
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.state.interrupted.load(Ordering::SeqCst) {
            return Poll::Ready(Err(interrupted_err()));
        }
        match self.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let chunk = Bytes::copy_from_slice(buf);
                match self.tx.send_item(chunk) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
                }
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}
