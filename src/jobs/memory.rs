//! Process-local job store with retention and a size bound

use super::{new_job_id, ExportJob, JobStatus, JobStore};
use crate::error::Result;
use indexmap::IndexMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Jobs expire this long after their last write
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on stored jobs
pub const DEFAULT_MAX_JOBS: usize = 10_000;

type RemovalListener = Box<dyn Fn(&ExportJob) + Send + Sync>;

struct Slot {
    job: ExportJob,
    written_at: Instant,
}

/// In-memory [`JobStore`]
///
/// Entries are kept in last-write order; expired entries and the oldest entries beyond
/// `max_jobs` are evicted during every operation. The removal listener sees every evicted
/// job (for example to delete its orphaned result file) and runs outside the store lock.
pub struct InMemoryJobStore {
    jobs: Mutex<IndexMap<String, Slot>>,
    retention: Duration,
    max_jobs: usize,
    on_removal: Option<RemovalListener>,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        InMemoryJobStore {
            jobs: Mutex::new(IndexMap::new()),
            retention: DEFAULT_RETENTION,
            max_jobs: DEFAULT_MAX_JOBS,
            on_removal: None,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs.max(1);
        self
    }

    pub fn with_removal_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&ExportJob) + Send + Sync + 'static,
    {
        self.on_removal = Some(Box::new(listener));
        self
    }

    /// Jobs currently stored
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired jobs now; returns how many were evicted
    pub fn evict_expired(&self) -> usize {
        let evicted = {
            let mut jobs = self.lock();
            self.expire(&mut jobs)
        };
        let count = evicted.len();
        self.notify(evicted);
        count
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, Slot>> {
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn expire(&self, jobs: &mut IndexMap<String, Slot>) -> Vec<ExportJob> {
        let mut evicted = Vec::new();
        while let Some((_, slot)) = jobs.first() {
            if slot.written_at.elapsed() < self.retention {
                break;
            }
            if let Some((_, slot)) = jobs.shift_remove_index(0) {
                evicted.push(slot.job);
            }
        }
        evicted
    }

    fn enforce_capacity(&self, jobs: &mut IndexMap<String, Slot>, evicted: &mut Vec<ExportJob>) {
        while jobs.len() > self.max_jobs {
            match jobs.shift_remove_index(0) {
                Some((_, slot)) => evicted.push(slot.job),
                None => break,
            }
        }
    }

    fn notify(&self, evicted: Vec<ExportJob>) {
        for job in evicted {
            log::debug!("Job {} evicted from the in-memory store", job.job_id);
            if let Some(listener) = &self.on_removal {
                listener(&job);
            }
        }
    }

    /// Run `f` on a live job and re-insert it as the most recent write
    fn modify<F>(&self, job_id: &str, f: F)
    where
        F: FnOnce(&mut ExportJob) -> bool,
    {
        let evicted = {
            let mut jobs = self.lock();
            let mut evicted = self.expire(&mut jobs);
            let changed = match jobs.get_mut(job_id) {
                Some(slot) => f(&mut slot.job),
                None => false,
            };
            if changed {
                if let Some(mut slot) = jobs.shift_remove(job_id) {
                    slot.written_at = Instant::now();
                    jobs.insert(job_id.to_string(), slot);
                }
            }
            self.enforce_capacity(&mut jobs, &mut evicted);
            evicted
        };
        self.notify(evicted);
    }
}

impl JobStore for InMemoryJobStore {
    fn create_job(&self) -> Result<String> {
        let job_id = new_job_id();
        let evicted = {
            let mut jobs = self.lock();
            let mut evicted = self.expire(&mut jobs);
            jobs.insert(
                job_id.clone(),
                Slot {
                    job: ExportJob::new(job_id.clone()),
                    written_at: Instant::now(),
                },
            );
            self.enforce_capacity(&mut jobs, &mut evicted);
            evicted
        };
        self.notify(evicted);
        log::debug!("Created job {}", job_id);
        Ok(job_id)
    }

    fn get_job(&self, job_id: &str) -> Result<Option<ExportJob>> {
        let (job, evicted) = {
            let mut jobs = self.lock();
            let evicted = self.expire(&mut jobs);
            (jobs.get(job_id).map(|slot| slot.job.clone()), evicted)
        };
        self.notify(evicted);
        Ok(job)
    }

    fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        result_locator: Option<String>,
        error_message: Option<String>,
    ) -> Result<()> {
        self.modify(job_id, |job| {
            job.apply_status(status, result_locator, error_message)
        });
        Ok(())
    }

    fn update_progress(&self, job_id: &str, rows_written: u64, batches_flushed: u64) -> Result<()> {
        self.modify(job_id, |job| {
            job.rows_written = rows_written;
            job.batches_flushed = batches_flushed;
            true
        });
        Ok(())
    }

    fn request_cancel(&self, job_id: &str) -> Result<()> {
        self.modify(job_id, |job| {
            job.cancel_requested = true;
            true
        });
        Ok(())
    }

    fn is_cancel_requested(&self, job_id: &str) -> Result<bool> {
        Ok(self
            .get_job(job_id)?
            .is_some_and(|job| job.cancel_requested))
    }
}
