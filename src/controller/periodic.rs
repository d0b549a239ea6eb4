//! Periodic task supervisor
//!
//! Runs a tick immediately and then once per interval. Ticks are
//! serialized by construction: the next sleep only starts after the
//! current tick returns, so a slow reconciliation never overlaps
//! itself. A failing tick is logged and the loop continues.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::metrics::CONTROLLER_TICK_FAILURES;
use crate::error::Result;

pub struct Periodic {
    name: &'static str,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Periodic {
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }
                if let Err(e) = tick().await {
                    CONTROLLER_TICK_FAILURES.with_label_values(&[name]).inc();
                    warn!(task = name, "tick failed: {}", e);
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!(task = name, "periodic stopped");
        });
        Self {
            name,
            shutdown,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the loop and wait for an in-flight tick to finish.
    pub async fn close(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn ticks_run_immediately_and_per_interval() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        let periodic = Periodic::spawn("test", Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        periodic.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_ticks_keep_the_loop_alive() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        let periodic = Periodic::spawn("test", Duration::from_secs(5), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(crate::error::Error::Api("panel down".to_string()))
            }
        });

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(count.load(Ordering::SeqCst) >= 3);

        periodic.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_ticks_do_not_overlap() {
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (running_c, peak_c) = (Arc::clone(&running), Arc::clone(&peak));
        let periodic = Periodic::spawn("test", Duration::from_secs(1), move || {
            let running = Arc::clone(&running_c);
            let peak = Arc::clone(&peak_c);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                // A tick three times longer than the interval.
                tokio::time::sleep(Duration::from_secs(3)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_secs(20)).await;
        periodic.close().await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
