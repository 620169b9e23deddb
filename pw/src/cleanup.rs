//! Cleanup scheduler interface
//!
//! Retention management itself lives outside the engine; the engine only
//! offers the timer-driven hook an external manager plugs into.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancelToken;

/// Hook invoked on a timer so external retention managers can run
#[async_trait]
pub trait CleanupScheduler: Send + Sync {
    /// One retention pass; errors are logged, never propagated
    async fn tick(&self) -> eyre::Result<()>;
}

/// Drive a cleanup implementation at a fixed interval until cancelled
pub fn spawn_cleanup_timer(
    scheduler: Arc<dyn CleanupScheduler>,
    interval: Duration,
    cancel: CancelToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(?interval, "cleanup timer started");
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick is skipped; cleanup runs after one full
        // interval
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = scheduler.tick().await {
                        warn!(error = %e, "cleanup tick failed");
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("cleanup timer stopped");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCleanup {
        ticks: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CleanupScheduler for CountingCleanup {
        async fn tick(&self) -> eyre::Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(eyre::eyre!("disk on fire"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_drives_ticks() {
        let cleanup = Arc::new(CountingCleanup {
            ticks: AtomicUsize::new(0),
            fail: false,
        });
        let (handle, token) = crate::cancel::cancel_pair();
        let task = spawn_cleanup_timer(cleanup.clone(), Duration::from_secs(60), token);

        tokio::time::sleep(Duration::from_secs(185)).await;
        handle.cancel();
        task.await.unwrap();

        assert_eq!(cleanup.ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_errors_do_not_stop_timer() {
        let cleanup = Arc::new(CountingCleanup {
            ticks: AtomicUsize::new(0),
            fail: true,
        });
        let (handle, token) = crate::cancel::cancel_pair();
        let task = spawn_cleanup_timer(cleanup.clone(), Duration::from_secs(60), token);

        tokio::time::sleep(Duration::from_secs(125)).await;
        handle.cancel();
        task.await.unwrap();

        assert!(cleanup.ticks.load(Ordering::SeqCst) >= 2);
    }
}
