//! Named traffic counters
//!
//! The controller reads user traffic through counters named
//! `user>>>{email}>>>traffic>>>uplink` / `...>>>downlink`. The format is
//! read by external dashboards and must not change.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::RwLock;
use tokio::io::AsyncWrite;

pub fn uplink_counter_name(email: &str) -> String {
    format!("user>>>{}>>>traffic>>>uplink", email)
}

pub fn downlink_counter_name(email: &str) -> String {
    format!("user>>>{}>>>traffic>>>downlink", email)
}

/// One atomic counter with read-and-reset semantics.
#[derive(Default)]
pub struct StatCounter {
    value: AtomicI64,
}

impl StatCounter {
    pub fn add(&self, n: i64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Return the current value and reset it to zero.
    pub fn take(&self) -> i64 {
        self.value.swap(0, Ordering::Relaxed)
    }
}

pub trait StatsManager: Send + Sync {
    fn get_or_register(&self, name: &str) -> Arc<StatCounter>;
    fn get(&self, name: &str) -> Option<Arc<StatCounter>>;
}

/// In-memory counter registry.
pub struct StatsRegistry {
    counters: RwLock<HashMap<String, Arc<StatCounter>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsManager for StatsRegistry {
    fn get_or_register(&self, name: &str) -> Arc<StatCounter> {
        if let Some(counter) = self.counters.read().get(name) {
            return Arc::clone(counter);
        }
        Arc::clone(
            self.counters
                .write()
                .entry(name.to_string())
                .or_default(),
        )
    }

    fn get(&self, name: &str) -> Option<Arc<StatCounter>> {
        self.counters.read().get(name).cloned()
    }
}

/// AsyncWrite wrapper feeding written byte counts into a counter.
pub struct StatWriter<W> {
    inner: W,
    counter: Arc<StatCounter>,
}

impl<W> StatWriter<W> {
    pub fn new(inner: W, counter: Arc<StatCounter>) -> Self {
        Self { inner, counter }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for StatWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.counter.add(n as i64);
                Poll::Ready(Ok(n))
            }
            other => other,
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
    use tokio::io::AsyncWriteExt;

    #[test]
    fn counter_names_match_dashboard_format() {
        assert_eq!(
            uplink_counter_name("u@x"),
            "user>>>u@x>>>traffic>>>uplink"
        );
        assert_eq!(
            downlink_counter_name("u@x"),
            "user>>>u@x>>>traffic>>>downlink"
        );
    }

    #[test]
    fn take_reads_and_resets() {
        let registry = StatsRegistry::new();
        let counter = registry.get_or_register("user>>>u@x>>>traffic>>>uplink");
        counter.add(42);
        counter.add(8);

        // Same name resolves to the same counter.
        let again = registry.get_or_register("user>>>u@x>>>traffic>>>uplink");
        assert_eq!(again.take(), 50);
        assert_eq!(counter.value(), 0);
    }

    #[tokio::test]
    async fn stat_writer_counts_written_bytes() {
        let counter = Arc::new(StatCounter::default());
        let mut writer = StatWriter::new(tokio::io::sink(), Arc::clone(&counter));
        writer.write_all(b"0123456789").await.unwrap();
        assert_eq!(counter.value(), 10);
    }
}
