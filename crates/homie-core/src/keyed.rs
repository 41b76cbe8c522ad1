//! Keyed mutual exclusion and keyed rate limiting.
//!
//! `PerKeyLock` serializes work per key while distinct keys run in parallel;
//! `PerKeyRateLimiter` keeps one `TokenBucket` per key and evicts idle keys
//! so long-running deployments don't accumulate dead entries.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{HomieError, Result};
use crate::limiter::TokenBucket;

tokio::task_local! {
    /// Keys currently held by this task: nested acquire on a held key is a
    /// guaranteed deadlock with a fair mutex, so it fails fast instead.
    static HELD_KEYS: RefCell<HashSet<String>>;
}

/// Keyed mutual exclusion with FIFO wait order per key (tokio's `Mutex` is
/// fair). Not reentrant: acquiring a key already held by the same task
/// returns `DeadlockDetected`.
pub struct PerKeyLock<K: Eq + Hash> {
    locks: DashMap<K, Arc<tokio::sync::Mutex<()>>>,
}

impl<K> PerKeyLock<K>
where
    K: Eq + Hash + Clone + ToString,
{
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Run `fut` while holding the lock for `key`.
    pub async fn run_exclusive<F, Fut, T>(&self, key: K, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let tag = key.to_string();

        let already_held = HELD_KEYS
            .try_with(|held| held.borrow().contains(&tag))
            .unwrap_or(false);
        if already_held {
            return Err(HomieError::DeadlockDetected { key: tag });
        }

        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let guard = lock.lock().await;

        let result = if HELD_KEYS.try_with(|_| ()).is_ok() {
            HELD_KEYS.with(|held| held.borrow_mut().insert(tag.clone()));
            let out = f().await;
            HELD_KEYS.with(|held| held.borrow_mut().remove(&tag));
            out
        } else {
            let mut set = HashSet::new();
            set.insert(tag.clone());
            HELD_KEYS.scope(RefCell::new(set), f()).await
        };

        drop(guard);

        // Drop the map entry when nobody else holds a clone (map + ours = 2).
        // A concurrent waiter has already cloned the Arc and keeps the count
        // above 2, so an in-use mutex is never replaced.
        self.locks
            .remove_if(&key, |_, v| Arc::strong_count(v) <= 2);

        Ok(result)
    }

    /// Number of keys with a live lock entry (test/diagnostic hook).
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone + ToString> Default for PerKeyLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-key token buckets with idle-key eviction.
///
/// Eviction runs opportunistically inside `take`: either every
/// `sweep_interval` calls or when `stale_after` has elapsed since the last
/// sweep, whichever fires first. The time-based trigger matters for
/// low-traffic deployments where the call counter alone would never fire.
pub struct PerKeyRateLimiter<K: Eq + Hash> {
    capacity: f64,
    refill_per_second: f64,
    stale_after: Duration,
    sweep_interval: u64,
    inner: Mutex<LimiterInner<K>>,
}

struct LimiterInner<K> {
    entries: HashMap<K, LimiterEntry>,
    calls_since_sweep: u64,
    last_sweep: Instant,
}

struct LimiterEntry {
    bucket: Arc<TokenBucket>,
    last_access: Instant,
}

impl<K> PerKeyRateLimiter<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(
        capacity: f64,
        refill_per_second: f64,
        stale_after: Duration,
        sweep_interval: u64,
    ) -> Self {
        Self {
            capacity,
            refill_per_second,
            stale_after,
            sweep_interval,
            inner: Mutex::new(LimiterInner {
                entries: HashMap::new(),
                calls_since_sweep: 0,
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Take `cost` tokens from `key`'s bucket, creating it on first use.
    pub async fn take(&self, key: &K, cost: f64, cancel: &CancellationToken) -> Result<()> {
        let bucket = {
            let mut inner = self.inner.lock().unwrap();
            let now = Instant::now();

            inner.calls_since_sweep += 1;
            let due_by_calls =
                self.sweep_interval > 0 && inner.calls_since_sweep >= self.sweep_interval;
            let due_by_time = now.duration_since(inner.last_sweep) >= self.stale_after;
            if due_by_calls || due_by_time {
                let before = inner.entries.len();
                let stale_after = self.stale_after;
                inner
                    .entries
                    .retain(|_, e| now.duration_since(e.last_access) < stale_after);
                let evicted = before - inner.entries.len();
                if evicted > 0 {
                    debug!(evicted, remaining = inner.entries.len(), "limiter sweep");
                }
                inner.calls_since_sweep = 0;
                inner.last_sweep = now;
            }

            let capacity = self.capacity;
            let refill = self.refill_per_second;
            let entry = inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| LimiterEntry {
                    bucket: Arc::new(TokenBucket::new(capacity, refill)),
                    last_access: now,
                });
            entry.last_access = now;
            Arc::clone(&entry.bucket)
        };

        bucket.take(cost, cancel).await
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
