use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Metrics {
    sync_cycles: AtomicU64,
    sync_updates: AtomicU64,
    sync_noops: AtomicU64,
    sync_failures: AtomicU64,
    write_failures: AtomicU64,
    files_served: AtomicU64,
    not_found: AtomicU64,
    triggers_rejected: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub sync_cycles: u64,
    pub sync_updates: u64,
    pub sync_noops: u64,
    pub sync_failures: u64,
    pub write_failures: u64,
    pub files_served: u64,
    pub not_found: u64,
    pub triggers_rejected: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_sync_cycle(&self) {
        self.sync_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sync_update(&self) {
        self.sync_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sync_noop(&self) {
        self.sync_noops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sync_failure(&self) {
        self.sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_write_failures(&self, count: u64) {
        self.write_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_file_served(&self) {
        self.files_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_trigger_rejected(&self) {
        self.triggers_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sync_cycles: self.sync_cycles.load(Ordering::Relaxed),
            sync_updates: self.sync_updates.load(Ordering::Relaxed),
            sync_noops: self.sync_noops.load(Ordering::Relaxed),
            sync_failures: self.sync_failures.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            files_served: self.files_served.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            triggers_rejected: self.triggers_rejected.load(Ordering::Relaxed),
        }
    }
}

pub fn spawn_metrics_logger(metrics: Arc<Metrics>, interval: Duration) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        let s = metrics.snapshot();
        tracing::info!(
            sync_cycles = s.sync_cycles,
            sync_updates = s.sync_updates,
            sync_noops = s.sync_noops,
            sync_failures = s.sync_failures,
            write_failures = s.write_failures,
            files_served = s.files_served,
            not_found = s.not_found,
            triggers_rejected = s.triggers_rejected,
            "metrics"
        );
    });
}
