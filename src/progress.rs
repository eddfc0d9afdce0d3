//! Export progress events
//!
//! Listeners are called synchronously on the thread running the export, so they must be
//! cheap or hand work off themselves.

/// Phase of an export run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExportPhase {
    Starting,
    FlushedBatch,
    WritingWorkbook,
    Completed,
    Cancelled,
    Failed,
}

impl ExportPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExportPhase::Completed | ExportPhase::Cancelled | ExportPhase::Failed
        )
    }
}

/// Progress snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExportProgress {
    pub phase: ExportPhase,
    pub rows_written: u64,
    pub batches_flushed: u64,
}

impl ExportProgress {
    pub fn new(phase: ExportPhase, rows_written: u64, batches_flushed: u64) -> Self {
        ExportProgress {
            phase,
            rows_written,
            batches_flushed,
        }
    }
}

/// Receives progress events
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, progress: &ExportProgress);
}

impl<F> ProgressListener for F
where
    F: Fn(&ExportProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &ExportProgress) {
        self(progress)
    }
}

/// Listener that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressListener;

impl ProgressListener for NoopProgressListener {
    fn on_progress(&self, _progress: &ExportProgress) {}
}
