//! CachedReader - peek at a pipe without consuming it
//!
//! The sniffer needs the first bytes of the outbound-bound stream while
//! the outbound handler must still see every byte. CachedReader sits in
//! between: `cache` performs bounded-time reads that accumulate into an
//! internal buffer and exposes a copy to the caller; once sniffing is
//! done, normal reads drain the buffer before touching the pipe again.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, ReadBuf};

use super::pipe::PipeReader;

/// Upper bound on the bytes handed to the sniffer per attempt.
pub const SCRATCH_SIZE: usize = 2048;

/// How long one `cache` call may wait for the pipe to produce a chunk.
const CACHE_READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct CachedReader {
    inner: PipeReader,
    cache: BytesMut,
}

impl CachedReader {
    pub fn new(inner: PipeReader) -> Self {
        Self {
            inner,
            cache: BytesMut::new(),
        }
    }

    /// One bounded-time read from the pipe. Whatever arrives is appended
    /// to the internal cache; the cache's current contents (capped at
    /// [`SCRATCH_SIZE`]) are then copied into `scratch` without being
    /// consumed. Safe to call repeatedly.
    pub async fn cache(&mut self, scratch: &mut BytesMut) {
        if let Ok(Some(chunk)) = self.inner.read_chunk_timeout(CACHE_READ_TIMEOUT).await {
            self.cache.extend_from_slice(&chunk);
        }
        scratch.clear();
        let n = self.cache.len().min(SCRATCH_SIZE);
        scratch.extend_from_slice(&self.cache[..n]);
    }

    /// Release cached bytes and interrupt the underlying pipe.
    pub fn interrupt(&mut self) {
        self.cache.clear();
        self.inner.interrupt();
    }
}

impl AsyncRead for CachedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.cache.is_empty() {
            let n = self.cache.len().min(buf.remaining());
            let chunk = self.cache.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::pipe::pipe;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn cache_then_read_sees_every_byte_once() {
        let (reader, mut writer) = pipe();
        let mut cached = CachedReader::new(reader);

        writer.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let mut scratch = BytesMut::new();
        cached.cache(&mut scratch).await;
        assert_eq!(&scratch[..], b"GET / HTTP/1.1\r\n");

        // A second peek returns the same bytes, still unconsumed.
        cached.cache(&mut scratch).await;
        assert_eq!(&scratch[..], b"GET / HTTP/1.1\r\n");

        writer.write_all(b"Host: example.com\r\n\r\n").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut out = Vec::new();
        cached.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
    }

    #[tokio::test]
    async fn cache_times_out_on_idle_pipe() {
        let (reader, _writer) = pipe();
        let mut cached = CachedReader::new(reader);

        let mut scratch = BytesMut::new();
        cached.cache(&mut scratch).await;
        assert!(scratch.is_empty());
    }
}
