//! Job store over a hash-per-key backend
//!
//! Each job lives in one hash under `key_prefix + job_id` with the fields `jobId`,
//! `status`, `resultUri`, `errorMessage`, `rowsWritten`, `batchesFlushed`,
//! `cancelRequested`, `createdAt` and `completedAt` (RFC 3339). The key's TTL is refreshed
//! on every write so active jobs never expire mid-flight.

use super::{check_transition, new_job_id, ExportJob, JobStatus, JobStore, Transition};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Key prefix used when none is configured
pub const DEFAULT_KEY_PREFIX: &str = "sheetstream:job:";

const FIELD_JOB_ID: &str = "jobId";
const FIELD_STATUS: &str = "status";
const FIELD_RESULT_URI: &str = "resultUri";
const FIELD_ERROR_MESSAGE: &str = "errorMessage";
const FIELD_ROWS_WRITTEN: &str = "rowsWritten";
const FIELD_BATCHES_FLUSHED: &str = "batchesFlushed";
const FIELD_CANCEL_REQUESTED: &str = "cancelRequested";
const FIELD_CREATED_AT: &str = "createdAt";
const FIELD_COMPLETED_AT: &str = "completedAt";

/// Minimal hash-of-strings key-value backend (the shape of a Redis hash)
pub trait HashStore: Send + Sync {
    fn put_all(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    fn put(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.put_all(key, &[(field, value.to_string())])
    }

    /// All fields of `key`; empty when the key does not exist
    fn entries(&self, key: &str) -> Result<HashMap<String, String>>;

    fn get(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.entries(key)?.remove(field))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(!self.entries(key)?.is_empty())
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

struct HashEntry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl HashEntry {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// In-process [`HashStore`] honouring TTLs
#[derive(Default)]
pub struct MemoryHashStore {
    entries: Mutex<HashMap<String, HashEntry>>,
}

impl MemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashEntry>> {
        let mut guard = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.retain(|_, entry| entry.is_live());
        guard
    }
}

impl HashStore for MemoryHashStore {
    fn put_all(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut entries = self.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| HashEntry {
            fields: HashMap::new(),
            expires_at: None,
        });
        for (field, value) in fields {
            entry.fields.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    fn entries(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .lock()
            .get(key)
            .map(|entry| entry.fields.clone())
            .unwrap_or_default())
    }

    fn get(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .get(key)
            .and_then(|entry| entry.fields.get(field).cloned()))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.lock().contains_key(key))
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}

/// [`JobStore`] persisting each job as one hash in a [`HashStore`]
///
/// Status changes read the current status before writing, so two processes racing on
/// the same job rely on the lifecycle rule rather than on backend atomicity.
pub struct KeyValueJobStore<B: HashStore> {
    backend: B,
    key_prefix: String,
    retention: Duration,
}

impl<B: HashStore> KeyValueJobStore<B> {
    pub fn new(backend: B) -> Self {
        KeyValueJobStore {
            backend,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            retention: super::DEFAULT_RETENTION,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn key(&self, job_id: &str) -> String {
        format!("{}{}", self.key_prefix, job_id)
    }

    fn touch(&self, key: &str) -> Result<()> {
        self.backend.expire(key, self.retention)
    }
}

fn parse_time(value: Option<&String>) -> Option<DateTime<Utc>> {
    value
        .filter(|v| !v.is_empty())
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty()).cloned()
}

impl<B: HashStore> JobStore for KeyValueJobStore<B> {
    fn create_job(&self) -> Result<String> {
        let job_id = new_job_id();
        let key = self.key(&job_id);
        self.backend.put_all(
            &key,
            &[
                (FIELD_JOB_ID, job_id.clone()),
                (FIELD_STATUS, JobStatus::Ready.as_str().to_string()),
                (FIELD_ROWS_WRITTEN, "0".to_string()),
                (FIELD_BATCHES_FLUSHED, "0".to_string()),
                (FIELD_CANCEL_REQUESTED, "false".to_string()),
                (FIELD_CREATED_AT, Utc::now().to_rfc3339()),
            ],
        )?;
        self.touch(&key)?;
        log::debug!("Created job {}", job_id);
        Ok(job_id)
    }

    fn get_job(&self, job_id: &str) -> Result<Option<ExportJob>> {
        let entries = self.backend.entries(&self.key(job_id))?;
        if entries.is_empty() {
            return Ok(None);
        }
        let status = match entries.get(FIELD_STATUS).map(|s| s.parse::<JobStatus>()) {
            Some(Ok(status)) => status,
            Some(Err(e)) => {
                log::warn!("Job {} has an unreadable status: {}", job_id, e);
                return Ok(None);
            }
            None => return Ok(None),
        };

        Ok(Some(ExportJob {
            job_id: job_id.to_string(),
            status,
            result_locator: non_blank(entries.get(FIELD_RESULT_URI)),
            error_message: non_blank(entries.get(FIELD_ERROR_MESSAGE)),
            rows_written: entries
                .get(FIELD_ROWS_WRITTEN)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            batches_flushed: entries
                .get(FIELD_BATCHES_FLUSHED)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            cancel_requested: entries
                .get(FIELD_CANCEL_REQUESTED)
                .is_some_and(|v| v == "true"),
            created_at: parse_time(entries.get(FIELD_CREATED_AT)).unwrap_or_else(Utc::now),
            completed_at: parse_time(entries.get(FIELD_COMPLETED_AT)),
        }))
    }

    fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        result_locator: Option<String>,
        error_message: Option<String>,
    ) -> Result<()> {
        let key = self.key(job_id);
        let Some(current) = self.backend.get(&key, FIELD_STATUS)? else {
            return Ok(());
        };
        let current = match current.parse::<JobStatus>() {
            Ok(current) => current,
            Err(e) => {
                log::warn!("Job {} has an unreadable status: {}", job_id, e);
                return Ok(());
            }
        };
        match check_transition(current, status) {
            Transition::Apply => {}
            Transition::Unchanged => return Ok(()),
            Transition::Rejected => {
                log::warn!(
                    "Ignoring status change {} -> {} for job {}",
                    current,
                    status,
                    job_id
                );
                return Ok(());
            }
        }

        let mut fields = vec![(FIELD_STATUS, status.as_str().to_string())];
        if let Some(locator) = result_locator {
            fields.push((FIELD_RESULT_URI, locator));
        }
        if let Some(message) = error_message {
            fields.push((FIELD_ERROR_MESSAGE, message));
        }
        let completed_at = if status.is_terminal() {
            Utc::now().to_rfc3339()
        } else {
            String::new()
        };
        fields.push((FIELD_COMPLETED_AT, completed_at));

        self.backend.put_all(&key, &fields)?;
        self.touch(&key)
    }

    fn update_progress(&self, job_id: &str, rows_written: u64, batches_flushed: u64) -> Result<()> {
        let key = self.key(job_id);
        if !self.backend.exists(&key)? {
            return Ok(());
        }
        self.backend.put_all(
            &key,
            &[
                (FIELD_ROWS_WRITTEN, rows_written.to_string()),
                (FIELD_BATCHES_FLUSHED, batches_flushed.to_string()),
            ],
        )?;
        self.touch(&key)
    }

    fn request_cancel(&self, job_id: &str) -> Result<()> {
        let key = self.key(job_id);
        if !self.backend.exists(&key)? {
            return Ok(());
        }
        self.backend.put(&key, FIELD_CANCEL_REQUESTED, "true")?;
        self.touch(&key)
    }

    fn is_cancel_requested(&self, job_id: &str) -> Result<bool> {
        Ok(self
            .backend
            .get(&self.key(job_id), FIELD_CANCEL_REQUESTED)?
            .is_some_and(|v| v == "true"))
    }
}
