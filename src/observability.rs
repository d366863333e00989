//! Observability: tracing bootstrap and storage counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Counters recorded by the storage engine
#[derive(Debug, Default)]
pub struct StorageMetrics {
    entries_added: AtomicU64,
    entries_read: AtomicU64,
    checkpoints_completed: AtomicU64,
    checkpoints_failed: AtomicU64,
    gc_runs: AtomicU64,
    bytes_reclaimed: AtomicU64,
    journal_failures: AtomicU64,
}

impl StorageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_added(&self) {
        self.entries_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entry_read(&self) {
        self.entries_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn checkpoint_completed(&self) {
        self.checkpoints_completed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "checkpoints_completed", "Metric incremented");
    }

    pub fn checkpoint_failed(&self) {
        self.checkpoints_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "checkpoints_failed", "Metric incremented");
    }

    pub fn gc_completed(&self, bytes_reclaimed: u64) {
        self.gc_runs.fetch_add(1, Ordering::Relaxed);
        self.bytes_reclaimed
            .fetch_add(bytes_reclaimed, Ordering::Relaxed);
        tracing::debug!(counter = "gc_runs", bytes_reclaimed, "Metric incremented");
    }

    pub fn journal_failed(&self) {
        self.journal_failures.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "journal_failures", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entries_added: self.entries_added.load(Ordering::Relaxed),
            entries_read: self.entries_read.load(Ordering::Relaxed),
            checkpoints_completed: self.checkpoints_completed.load(Ordering::Relaxed),
            checkpoints_failed: self.checkpoints_failed.load(Ordering::Relaxed),
            gc_runs: self.gc_runs.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
            journal_failures: self.journal_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub entries_added: u64,
    pub entries_read: u64,
    pub checkpoints_completed: u64,
    pub checkpoints_failed: u64,
    pub gc_runs: u64,
    pub bytes_reclaimed: u64,
    pub journal_failures: u64,
}
