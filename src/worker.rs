//! Runs one export job end to end
//!
//! [`ExportWorker::process`] moves a job through its lifecycle: it checks for an early
//! cancel, exports into a private temp file while mirroring progress into the
//! [`JobStore`], uploads the result through a [`FileStorage`] and records the outcome.

use crate::cancel::CancellationSource;
use crate::config::ExportConfig;
use crate::datasource::{Filter, StreamingDataSource};
use crate::error::{ExportError, Result};
use crate::exporter::{safe_sheet_name, ExportEngine, ExportOptions};
use crate::jobs::{JobStatus, JobStore};
use crate::progress::{ExportPhase, ExportProgress, ProgressListener};
use crate::schema::SheetSchema;
use crate::storage::{FileStorage, XLSX_CONTENT_TYPE};
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Terminal outcome of a job, published after the store was updated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub result_locator: Option<String>,
    pub error_message: Option<String>,
}

impl JobEvent {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// Receives [`JobEvent`]s
pub trait JobListener: Send + Sync {
    fn on_job_finished(&self, event: &JobEvent);
}

impl<F> JobListener for F
where
    F: Fn(&JobEvent) + Send + Sync,
{
    fn on_job_finished(&self, event: &JobEvent) {
        self(event)
    }
}

/// Mirrors engine progress into the job store and turns store-side cancel requests into
/// local cancellation
pub struct JobProgressBridge {
    store: Arc<dyn JobStore>,
    job_id: String,
    cancellation: Arc<CancellationSource>,
    rows_written: AtomicU64,
    batches_flushed: AtomicU64,
}

impl JobProgressBridge {
    pub fn new(
        store: Arc<dyn JobStore>,
        job_id: impl Into<String>,
        cancellation: Arc<CancellationSource>,
    ) -> Self {
        JobProgressBridge {
            store,
            job_id: job_id.into(),
            cancellation,
            rows_written: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
        }
    }

    /// Last counts seen as (rows written, batches flushed)
    pub fn last_counts(&self) -> (u64, u64) {
        (
            self.rows_written.load(Ordering::Acquire),
            self.batches_flushed.load(Ordering::Acquire),
        )
    }

    fn poll_cancel(&self) {
        match self.store.is_cancel_requested(&self.job_id) {
            Ok(true) if !self.cancellation.is_cancelled() => {
                log::info!("Cancel requested for job {}", self.job_id);
                self.cancellation.cancel();
            }
            Ok(_) => {}
            Err(e) => log::warn!("Cannot read cancel flag of job {}: {}", self.job_id, e),
        }
    }
}

impl ProgressListener for JobProgressBridge {
    fn on_progress(&self, progress: &ExportProgress) {
        if progress.phase == ExportPhase::Starting {
            return;
        }
        self.rows_written
            .store(progress.rows_written, Ordering::Release);
        self.batches_flushed
            .store(progress.batches_flushed, Ordering::Release);
        if let Err(e) = self.store.update_progress(
            &self.job_id,
            progress.rows_written,
            progress.batches_flushed,
        ) {
            log::warn!("Cannot record progress of job {}: {}", self.job_id, e);
        }

        if matches!(
            progress.phase,
            ExportPhase::FlushedBatch | ExportPhase::WritingWorkbook
        ) {
            self.poll_cancel();
        }
    }
}

/// Executes export jobs against a store and a file storage
pub struct ExportWorker {
    store: Arc<dyn JobStore>,
    storage: Arc<dyn FileStorage>,
    engine: ExportEngine,
    config: ExportConfig,
    listener: Option<Arc<dyn JobListener>>,
    temp_dir: Option<PathBuf>,
}

impl ExportWorker {
    pub fn new(store: Arc<dyn JobStore>, storage: Arc<dyn FileStorage>) -> Self {
        ExportWorker {
            store,
            storage,
            engine: ExportEngine::new(),
            config: ExportConfig::default(),
            listener: None,
            temp_dir: None,
        }
    }

    pub fn with_engine(mut self, engine: ExportEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_config(mut self, config: ExportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_listener<L>(mut self, listener: L) -> Self
    where
        L: JobListener + 'static,
    {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Directory for temp workbooks instead of the system temp dir
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Run job `job_id` and return its terminal status
    ///
    /// Export failures are recorded on the job rather than returned; `Err` means the job
    /// store itself could not be updated.
    pub fn process<T, S, D>(
        &self,
        job_id: &str,
        schema: &S,
        source: &mut D,
        filter: Option<&Filter>,
    ) -> Result<JobStatus>
    where
        S: SheetSchema<T> + ?Sized,
        D: StreamingDataSource<T> + ?Sized,
    {
        // the engine closes the source once it runs; until then it is closed here
        let cancel_requested = match self.store.is_cancel_requested(job_id) {
            Ok(requested) => requested,
            Err(e) => {
                source.close();
                return Err(e);
            }
        };
        if cancel_requested {
            log::info!("Job {} cancelled before start", job_id);
            source.close();
            self.store
                .update_status(job_id, JobStatus::Cancelled, None, None)?;
            self.publish(job_id, JobStatus::Cancelled, None, None);
            return Ok(JobStatus::Cancelled);
        }
        if let Err(e) = self
            .store
            .update_status(job_id, JobStatus::Processing, None, None)
        {
            source.close();
            return Err(e);
        }
        log::info!("Processing export job {}", job_id);

        let cancellation = Arc::new(CancellationSource::new());
        let bridge = Arc::new(JobProgressBridge::new(
            Arc::clone(&self.store),
            job_id,
            Arc::clone(&cancellation),
        ));
        let options = ExportOptions {
            cancellation_token: cancellation.token(),
            progress_listener: bridge.clone(),
        };

        match self.export_and_upload(job_id, schema, source, filter, &options) {
            Ok(locator) => {
                log::info!("Job {} completed: {}", job_id, locator);
                self.store.update_status(
                    job_id,
                    JobStatus::Completed,
                    Some(locator.clone()),
                    None,
                )?;
                self.publish(job_id, JobStatus::Completed, Some(locator), None);
                Ok(JobStatus::Completed)
            }
            Err(ExportError::Cancelled) => {
                log::info!("Job {} cancelled", job_id);
                self.store
                    .update_status(job_id, JobStatus::Cancelled, None, None)?;
                self.publish(job_id, JobStatus::Cancelled, None, None);
                Ok(JobStatus::Cancelled)
            }
            Err(e) => {
                let message = e.to_string();
                log::error!("Job {} failed: {}", job_id, message);
                let (rows, batches) = bridge.last_counts();
                bridge.on_progress(&ExportProgress::new(ExportPhase::Failed, rows, batches));
                self.store.update_status(
                    job_id,
                    JobStatus::Failed,
                    None,
                    Some(message.clone()),
                )?;
                self.publish(job_id, JobStatus::Failed, None, Some(message));
                Ok(JobStatus::Failed)
            }
        }
    }

    /// Record a failure that happened outside [`process`](Self::process), such as a panic
    pub fn fail_job(&self, job_id: &str, message: &str) -> Result<()> {
        log::error!("Job {} failed: {}", job_id, message);
        self.store
            .update_status(job_id, JobStatus::Failed, None, Some(message.to_string()))?;
        self.publish(job_id, JobStatus::Failed, None, Some(message.to_string()));
        Ok(())
    }

    fn export_and_upload<T, S, D>(
        &self,
        job_id: &str,
        schema: &S,
        source: &mut D,
        filter: Option<&Filter>,
        options: &ExportOptions,
    ) -> Result<String>
    where
        S: SheetSchema<T> + ?Sized,
        D: StreamingDataSource<T> + ?Sized,
    {
        let prefix = format!("sheetstream-{job_id}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).suffix(".xlsx");
        let mut temp = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        let result = self.write_and_upload(
            job_id,
            schema,
            source,
            filter,
            options,
            temp.as_file_mut(),
        );

        let path = temp.path().to_path_buf();
        if let Err(e) = temp.close() {
            log::warn!(
                "{}",
                ExportError::ResourceCleanup {
                    resource: path.display().to_string(),
                    message: e.to_string(),
                }
            );
        }
        result
    }

    fn write_and_upload<T, S, D>(
        &self,
        job_id: &str,
        schema: &S,
        source: &mut D,
        filter: Option<&Filter>,
        options: &ExportOptions,
        file: &mut File,
    ) -> Result<String>
    where
        S: SheetSchema<T> + ?Sized,
        D: StreamingDataSource<T> + ?Sized,
    {
        match filter {
            Some(filter) => self.engine.export_filtered(
                schema,
                source,
                filter,
                &mut *file,
                &self.config,
                options,
            )?,
            None => self
                .engine
                .export(schema, source, &mut *file, &self.config, options)?,
        };

        let length = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        let file_name = format!("{}-{}.xlsx", safe_sheet_name(schema.sheet_name()), job_id);
        self.storage
            .save(&file_name, file, XLSX_CONTENT_TYPE, length)
    }

    fn publish(
        &self,
        job_id: &str,
        status: JobStatus,
        result_locator: Option<String>,
        error_message: Option<String>,
    ) {
        if let Some(listener) = &self.listener {
            listener.on_job_finished(&JobEvent {
                job_id: job_id.to_string(),
                status,
                result_locator,
                error_message,
            });
        }
    }
}
