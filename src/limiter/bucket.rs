//! Token bucket and pacing writer
//!
//! Tokens are bytes. A bucket refills at `rate` tokens/sec up to `burst`
//! and is shared by both link writers of a connection, so uplink and
//! downlink draw from one allowance.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::time::{sleep, Instant, Sleep};

pub struct TokenBucket {
    rate: u64,
    burst: u64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refreshed: Instant,
}

impl TokenBucket {
    /// `rate` must be nonzero; a user without a limit gets no bucket at all.
    pub fn new(rate: u64, burst: u64) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                refreshed: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn burst(&self) -> u64 {
        self.burst
    }

    /// Take `n` tokens if available, otherwise report how long until
    /// they will be.
    pub fn try_take(&self, n: u64) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.refreshed).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate as f64).min(self.burst as f64);
        state.refreshed = now;
        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            Ok(())
        } else {
            let missing = n as f64 - state.tokens;
            // Floor of 1ms so a rounded-down wait can never spin.
            let wait = Duration::from_secs_f64(missing / self.rate as f64);
            Err(wait.max(Duration::from_millis(1)))
        }
    }

    /// Return tokens paid for bytes that were never written.
    fn refund(&self, n: u64) {
        let mut state = self.state.lock();
        state.tokens = (state.tokens + n as f64).min(self.burst as f64);
    }
}

/// AsyncWrite wrapper that blocks each chunk until the shared bucket
/// holds enough tokens. At most `burst` bytes are admitted per write so
/// `write_all` callers are paced instead of stalled; bytes are delivered
/// in submission order with no loss.
pub struct RateWriter<W> {
    inner: W,
    bucket: Arc<TokenBucket>,
    delay: Option<Pin<Box<Sleep>>>,
    /// Bytes already paid for but not yet accepted by the inner writer.
    paid: usize,
}

impl<W> RateWriter<W> {
    pub fn new(inner: W, bucket: Arc<TokenBucket>) -> Self {
        Self {
            inner,
            bucket,
            delay: None,
            paid: 0,
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for RateWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        loop {
            if let Some(delay) = this.delay.as_mut() {
                match delay.as_mut().poll(cx) {
                    Poll::Ready(()) => this.delay = None,
                    Poll::Pending => return Poll::Pending,
                }
            }
            if this.paid == 0 {
                let want = buf.len().min(this.bucket.burst().max(1) as usize);
                match this.bucket.try_take(want as u64) {
                    Ok(()) => this.paid = want,
                    Err(wait) => {
                        this.delay = Some(Box::pin(sleep(wait)));
                        continue;
                    }
                }
            }
            let n = this.paid.min(buf.len());
            return match Pin::new(&mut this.inner).poll_write(cx, &buf[..n]) {
                Poll::Ready(Ok(written)) => {
                    if written < this.paid {
                        this.bucket.refund((this.paid - written) as u64);
                    }
                    this.paid = 0;
                    Poll::Ready(Ok(written))
                }
                other => other,
            };
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn pacing_holds_rate_within_burst() {
        let bucket = Arc::new(TokenBucket::new(10_000, 10_000));
        let mut writer = RateWriter::new(tokio::io::sink(), bucket);

        let started = Instant::now();
        let payload = vec![0u8; 100_000];
        writer.write_all(&payload).await.unwrap();
        let elapsed = started.elapsed();

        // 10k burst free, the remaining 90k at 10k/s.
        assert!(elapsed >= Duration::from_secs(9), "too fast: {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(11), "too slow: {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn bytes_arrive_in_order_without_loss() {
        let (tx, mut rx) = tokio::io::duplex(1 << 20);
        let bucket = Arc::new(TokenBucket::new(4_096, 1_024));
        let mut writer = RateWriter::new(tx, bucket);

        let payload: Vec<u8> = (0u32..20_000).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            rx.read_to_end(&mut out).await.unwrap();
            out
        });

        writer.write_all(&payload).await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        assert_eq!(reader.await.unwrap(), expected);
    }

    #[test]
    fn bucket_reports_wait_when_empty() {
        let bucket = TokenBucket::new(1_000, 1_000);
        assert!(bucket.try_take(1_000).is_ok());
        let wait = bucket.try_take(500).unwrap_err();
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(500));
    }
}
