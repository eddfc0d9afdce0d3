//! Export metrics hooks

use std::sync::atomic::{AtomicU64, Ordering};

/// Receives export measurements when `enable_metrics` is set
pub trait MetricsRecorder: Send + Sync {
    fn record_export_duration_ms(&self, duration_ms: u64, success: bool);

    fn increment_exported_rows(&self, rows: u64);
}

/// Recorder that drops every measurement
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn record_export_duration_ms(&self, _duration_ms: u64, _success: bool) {}

    fn increment_exported_rows(&self, _rows: u64) {}
}

/// Process-local counters
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    exports_succeeded: AtomicU64,
    exports_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    exported_rows: AtomicU64,
}

/// Point-in-time copy of [`InMemoryMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub exports_succeeded: u64,
    pub exports_failed: u64,
    pub total_duration_ms: u64,
    pub exported_rows: u64,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            exports_succeeded: self.exports_succeeded.load(Ordering::Relaxed),
            exports_failed: self.exports_failed.load(Ordering::Relaxed),
            total_duration_ms: self.total_duration_ms.load(Ordering::Relaxed),
            exported_rows: self.exported_rows.load(Ordering::Relaxed),
        }
    }
}

impl MetricsRecorder for InMemoryMetrics {
    fn record_export_duration_ms(&self, duration_ms: u64, success: bool) {
        self.total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        let counter = if success {
            &self.exports_succeeded
        } else {
            &self.exports_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn increment_exported_rows(&self, rows: u64) {
        self.exported_rows.fetch_add(rows, Ordering::Relaxed);
    }
}
