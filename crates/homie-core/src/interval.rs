//! Supervised periodic task.
//!
//! Ticks never overlap (the loop awaits each tick before arming the next),
//! missed ticks are skipped rather than replayed, and a failing tick logs a
//! warning without killing the loop. The last-completion timestamp doubles as
//! a liveness probe for the health endpoint.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

pub struct IntervalLoop {
    name: String,
    /// Epoch millis of the last successful tick completion; 0 = never.
    last_completed_ms: Arc<AtomicI64>,
    handle: JoinHandle<()>,
}

impl IntervalLoop {
    /// Spawn the loop. `tick` runs once per `period`; a tick that returns an
    /// error is logged and suppressed.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        period: Duration,
        cancel: CancellationToken,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let name = name.into();
        let last_completed_ms = Arc::new(AtomicI64::new(0));

        let loop_name = name.clone();
        let last = Arc::clone(&last_completed_ms);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(name = %loop_name, period_ms = period.as_millis() as u64, "interval loop started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(name = %loop_name, "interval loop stopped");
                        return;
                    }
                    _ = interval.tick() => {}
                }

                match tick().await {
                    Ok(()) => {
                        last.store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
                        debug!(name = %loop_name, "tick completed");
                    }
                    Err(e) => {
                        warn!(name = %loop_name, error = %e, "tick failed; loop continues");
                    }
                }
            }
        });

        Self {
            name,
            last_completed_ms,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Epoch millis of the last successful completion, if any.
    pub fn last_completed_at_ms(&self) -> Option<i64> {
        match self.last_completed_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Seconds since the last successful completion, if any.
    pub fn seconds_since_completion(&self) -> Option<i64> {
        self.last_completed_at_ms()
            .map(|ms| (chrono::Utc::now().timestamp_millis() - ms) / 1000)
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HomieError;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn ticks_run_and_record_completion() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let cancel = CancellationToken::new();
        let il = IntervalLoop::spawn(
            "test",
            Duration::from_millis(10),
            cancel.clone(),
            move || {
                let c = Arc::clone(&count2);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        assert!(count.load(Ordering::SeqCst) >= 2);
        assert!(il.last_completed_at_ms().is_some());
    }

    #[tokio::test]
    async fn failing_tick_does_not_kill_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let cancel = CancellationToken::new();
        let _il = IntervalLoop::spawn(
            "flaky",
            Duration::from_millis(10),
            cancel.clone(),
            move || {
                let c = Arc::clone(&count2);
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n % 2 == 0 {
                        Err(HomieError::Internal("boom".into()))
                    } else {
                        Ok(())
                    }
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        cancel.cancel();
        assert!(count.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn slow_ticks_do_not_overlap() {
        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));
        let (r, o) = (Arc::clone(&running), Arc::clone(&overlapped));
        let cancel = CancellationToken::new();
        let _il = IntervalLoop::spawn(
            "slow",
            Duration::from_millis(5),
            cancel.clone(),
            move || {
                let r = Arc::clone(&r);
                let o = Arc::clone(&o);
                async move {
                    if r.fetch_add(1, Ordering::SeqCst) > 0 {
                        o.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    r.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }
}
