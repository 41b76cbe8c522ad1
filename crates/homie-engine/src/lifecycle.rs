//! Process lifecycle: shutdown flag and turn liveness, shared between the
//! engine and the health endpoint.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Instant;

pub struct Lifecycle {
    started_at: Instant,
    shutting_down: AtomicBool,
    last_successful_turn_ms: AtomicI64,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            shutting_down: AtomicBool::new(false),
            last_successful_turn_ms: AtomicI64::new(0),
        }
    }

    pub fn uptime_sec(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    pub fn record_successful_turn(&self) {
        self.last_successful_turn_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_successful_turn_ms(&self) -> Option<i64> {
        match self.last_successful_turn_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn last_turn_ago_sec(&self) -> Option<i64> {
        self.last_successful_turn_ms()
            .map(|ms| (chrono::Utc::now().timestamp_millis() - ms) / 1000)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
