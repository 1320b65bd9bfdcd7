//! Per-block execution counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct BlockMetrics {
    retries: AtomicU64,
    merge_failures: AtomicU64,
    exec_time: AtomicU64,
}

impl BlockMetrics {
    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_merge_failures(&self) {
        self.merge_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn merge_failures(&self) -> u64 {
        self.merge_failures.load(Ordering::Relaxed)
    }

    pub fn set_exec_time(&self, elapsed: Duration) {
        self.exec_time
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn exec_time(&self) -> Duration {
        Duration::from_micros(self.exec_time.load(Ordering::Relaxed))
    }
}
