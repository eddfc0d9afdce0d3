//! Asynchronous export entry point
//!
//! [`ExportService`] creates a job and hands the export to a blocking task on the tokio
//! runtime, returning the job id right away. Callers poll [`ExportService::job`] for status
//! and request cancellation through [`ExportService::request_cancel`].
//!
//! ```no_run
//! use sheetstream::jobs::InMemoryJobStore;
//! use sheetstream::service::ExportService;
//! use sheetstream::storage::LocalFileStorage;
//! use sheetstream::worker::ExportWorker;
//! use sheetstream::{IteratorSource, SchemaBuilder};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> sheetstream::Result<()> {
//!     let worker = ExportWorker::new(
//!         Arc::new(InMemoryJobStore::new()),
//!         Arc::new(LocalFileStorage::new("exports")?),
//!     );
//!     let service = ExportService::with_current_runtime(worker)?;
//!
//!     let schema = Arc::new(
//!         SchemaBuilder::<u64>::new("Numbers")
//!             .column("N", 10, |n| (*n).into())
//!             .build(),
//!     );
//!     let job_id = service.start_export(schema, IteratorSource::new("numbers", || 0..1_000u64))?;
//!     println!("{:?}", service.job(&job_id)?);
//!     Ok(())
//! }
//! ```

use crate::datasource::{Filter, StreamingDataSource};
use crate::error::{ExportError, Result};
use crate::jobs::{ExportJob, JobStore};
use crate::schema::SheetSchema;
use crate::worker::ExportWorker;
use std::any::Any;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Starts export jobs in the background
#[derive(Clone)]
pub struct ExportService {
    worker: Arc<ExportWorker>,
    handle: Handle,
}

impl ExportService {
    /// Service dispatching onto the runtime behind `handle`
    pub fn new(worker: ExportWorker, handle: Handle) -> Self {
        ExportService {
            worker: Arc::new(worker),
            handle,
        }
    }

    /// Service bound to the runtime the caller is running on
    pub fn with_current_runtime(worker: ExportWorker) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| {
            ExportError::configuration("runtime", format!("no tokio runtime available: {e}"))
        })?;
        Ok(Self::new(worker, handle))
    }

    fn store(&self) -> &Arc<dyn JobStore> {
        self.worker.store()
    }

    /// Create a job exporting every entity of `source` and start it; returns the job id
    pub fn start_export<T, S, D>(&self, schema: Arc<S>, source: D) -> Result<String>
    where
        T: 'static,
        S: SheetSchema<T> + 'static,
        D: StreamingDataSource<T> + 'static,
    {
        self.dispatch(schema, source, None)
    }

    /// Like [`start_export`](Self::start_export) for the entities matching `filter`
    ///
    /// The filter is validated here so a malformed filter never creates a job.
    pub fn start_export_filtered<T, S, D>(
        &self,
        schema: Arc<S>,
        source: D,
        filter: Filter,
    ) -> Result<String>
    where
        T: 'static,
        S: SheetSchema<T> + 'static,
        D: StreamingDataSource<T> + 'static,
    {
        filter.validate()?;
        self.dispatch(schema, source, Some(filter))
    }

    fn dispatch<T, S, D>(&self, schema: Arc<S>, mut source: D, filter: Option<Filter>) -> Result<String>
    where
        T: 'static,
        S: SheetSchema<T> + 'static,
        D: StreamingDataSource<T> + 'static,
    {
        let job_id = self.store().create_job()?;
        log::info!(
            "Starting export job {} for sheet '{}'",
            job_id,
            schema.sheet_name()
        );

        let worker = Arc::clone(&self.worker);
        let id = job_id.clone();
        let task = self.handle.spawn_blocking(move || {
            if let Err(e) = worker.process(&id, &*schema, &mut source, filter.as_ref()) {
                log::error!("Job store failure while running job {}: {}", id, e);
            }
        });

        let worker = Arc::clone(&self.worker);
        let id = job_id.clone();
        self.handle.spawn(async move {
            let Err(err) = task.await else {
                return;
            };
            let message = if err.is_panic() {
                format!("Export task panicked: {}", panic_message(err.into_panic()))
            } else {
                format!("Export task aborted: {err}")
            };
            if let Err(e) = worker.fail_job(&id, &message) {
                log::error!("Could not mark job {} as failed: {}", id, e);
            }
        });
        Ok(job_id)
    }

    /// Ask a running job to stop at its next flush boundary
    pub fn request_cancel(&self, job_id: &str) -> Result<()> {
        log::info!("Cancel requested for job {}", job_id);
        self.store().request_cancel(job_id)
    }

    pub fn job(&self, job_id: &str) -> Result<Option<ExportJob>> {
        self.store().get_job(job_id)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
