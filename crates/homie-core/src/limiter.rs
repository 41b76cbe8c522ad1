use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{HomieError, Result};

/// Upper bound for a single sleep slice while waiting on tokens. Keeps
/// `take` responsive to cancellation even when the deficit is large.
const MAX_SLEEP: Duration = Duration::from_millis(250);

/// Leaky-bucket rate limiter. Refill is computed lazily on each `take`.
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Block until `cost` tokens are available, sleeping in bounded slices so
    /// cancellation is observed promptly. A cost above capacity is clamped -
    /// it could otherwise never be satisfied.
    pub async fn take(&self, cost: f64, cancel: &CancellationToken) -> Result<()> {
        let cost = cost.min(self.capacity);
        loop {
            if cancel.is_cancelled() {
                return Err(HomieError::Cancelled);
            }

            let deficit_wait = {
                let mut s = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(s.last_refill).as_secs_f64();
                s.tokens = (s.tokens + elapsed * self.refill_per_second).min(self.capacity);
                s.last_refill = now;

                if s.tokens >= cost {
                    s.tokens -= cost;
                    return Ok(());
                }

                if self.refill_per_second <= 0.0 {
                    MAX_SLEEP
                } else {
                    Duration::from_secs_f64((cost - s.tokens) / self.refill_per_second)
                }
            };

            let slice = deficit_wait.min(MAX_SLEEP);
            tokio::select! {
                _ = cancel.cancelled() => return Err(HomieError::Cancelled),
                _ = tokio::time::sleep(slice) => {}
            }
        }
    }

    /// Non-blocking variant: take the tokens if available right now.
    pub fn try_take(&self, cost: f64) -> bool {
        let cost = cost.min(self.capacity);
        let mut s = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(s.last_refill).as_secs_f64();
        s.tokens = (s.tokens + elapsed * self.refill_per_second).min(self.capacity);
        s.last_refill = now;
        if s.tokens >= cost {
            s.tokens -= cost;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn take_succeeds_within_capacity() {
        let bucket = TokenBucket::new(3.0, 1.0);
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            bucket.take(1.0, &cancel).await.unwrap();
        }
        assert!(!bucket.try_take(1.0));
    }

    #[tokio::test]
    async fn take_blocks_until_refill() {
        let bucket = TokenBucket::new(1.0, 20.0);
        let cancel = CancellationToken::new();
        bucket.take(1.0, &cancel).await.unwrap();

        let start = Instant::now();
        bucket.take(1.0, &cancel).await.unwrap();
        // Refill of 20/s means ~50ms for one token.
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn cancellation_interrupts_take() {
        let bucket = TokenBucket::new(1.0, 0.001);
        let cancel = CancellationToken::new();
        bucket.take(1.0, &cancel).await.unwrap();

        let c2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c2.cancel();
        });

        let err = bucket.take(1.0, &cancel).await.unwrap_err();
        assert!(matches!(err, HomieError::Cancelled));
    }

    #[tokio::test]
    async fn oversized_cost_is_clamped() {
        let bucket = TokenBucket::new(2.0, 100.0);
        let cancel = CancellationToken::new();
        // Would never complete without clamping.
        bucket.take(50.0, &cancel).await.unwrap();
    }
}
