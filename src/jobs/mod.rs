//! Export job records and their stores
//!
//! A job moves forward only: `Ready -> Processing -> {Completed | Cancelled | Failed}`, or
//! straight from `Ready` to a terminal status. Stores ignore backward and
//! terminal-to-terminal moves so that a late writer can never resurrect a finished job.

mod kv;
mod memory;

pub use kv::{HashStore, KeyValueJobStore, MemoryHashStore, DEFAULT_KEY_PREFIX};
pub use memory::{InMemoryJobStore, DEFAULT_MAX_JOBS, DEFAULT_RETENTION};

use crate::error::{ExportError, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an export job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum JobStatus {
    Ready,
    Processing,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Ready => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Ready => "READY",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "READY" => Ok(JobStatus::Ready),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(ExportError::invalid_value(
                "status",
                "Unknown job status",
                other,
            )),
        }
    }
}

/// Outcome of checking a status change against the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Apply,
    /// Same status again
    Unchanged,
    /// Backward or terminal-to-terminal move
    Rejected,
}

/// Check whether a job may move from `from` to `to`
pub fn check_transition(from: JobStatus, to: JobStatus) -> Transition {
    if from == to {
        Transition::Unchanged
    } else if to.rank() > from.rank() {
        Transition::Apply
    } else {
        Transition::Rejected
    }
}

/// Snapshot of an export job
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExportJob {
    pub job_id: String,
    pub status: JobStatus,
    pub result_locator: Option<String>,
    pub error_message: Option<String>,
    pub rows_written: u64,
    pub batches_flushed: u64,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExportJob {
    /// New job in `Ready`
    pub fn new(job_id: impl Into<String>) -> Self {
        ExportJob {
            job_id: job_id.into(),
            status: JobStatus::Ready,
            result_locator: None,
            error_message: None,
            rows_written: 0,
            batches_flushed: 0,
            cancel_requested: false,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Apply a status change if the lifecycle allows it; returns whether the job changed
    pub fn apply_status(
        &mut self,
        status: JobStatus,
        result_locator: Option<String>,
        error_message: Option<String>,
    ) -> bool {
        match check_transition(self.status, status) {
            Transition::Apply => {
                self.status = status;
                if result_locator.is_some() {
                    self.result_locator = result_locator;
                }
                if error_message.is_some() {
                    self.error_message = error_message;
                }
                if status.is_terminal() {
                    self.completed_at = Some(Utc::now());
                }
                true
            }
            Transition::Unchanged => false,
            Transition::Rejected => {
                log::warn!(
                    "Ignoring status change {} -> {} for job {}",
                    self.status,
                    status,
                    self.job_id
                );
                false
            }
        }
    }
}

/// Persistence for export jobs
///
/// Unknown job ids are ignored by the update methods and reported as absent by reads.
pub trait JobStore: Send + Sync {
    /// Create a `Ready` job and return its id
    fn create_job(&self) -> Result<String>;

    fn get_job(&self, job_id: &str) -> Result<Option<ExportJob>>;

    fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        result_locator: Option<String>,
        error_message: Option<String>,
    ) -> Result<()>;

    fn update_progress(&self, job_id: &str, rows_written: u64, batches_flushed: u64)
        -> Result<()>;

    fn request_cancel(&self, job_id: &str) -> Result<()>;

    fn is_cancel_requested(&self, job_id: &str) -> Result<bool>;
}

pub(crate) fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
