//! Destination for finished workbooks
//!
//! The worker writes each export to a private temp file and hands it to a [`FileStorage`],
//! which returns a locator string recorded on the job.

use crate::error::{ExportError, Result};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// MIME type of `.xlsx` files
pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Readable, rewindable upload content
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

/// Stores finished files and returns a locator for each
pub trait FileStorage: Send + Sync {
    /// Store `content_length` bytes read from `content` under `file_name`
    fn save(
        &self,
        file_name: &str,
        content: &mut dyn ReadSeek,
        content_type: &str,
        content_length: u64,
    ) -> Result<String>;

    /// Remove a previously saved file; unknown locators are not an error
    fn delete(&self, locator: &str) -> Result<()>;
}

fn check_file_name(file_name: &str) -> Result<()> {
    let path = Path::new(file_name);
    let plain = path.components().count() == 1
        && path.file_name().is_some_and(|n| n == file_name);
    if file_name.is_empty() || !plain {
        return Err(ExportError::invalid_value(
            "file_name",
            "File name must not contain path separators",
            file_name,
        ));
    }
    Ok(())
}

/// Saves files into a local directory; the locator is the file path
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    /// Storage rooted at `root`, created if missing
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(LocalFileStorage { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileStorage for LocalFileStorage {
    fn save(
        &self,
        file_name: &str,
        content: &mut dyn ReadSeek,
        _content_type: &str,
        content_length: u64,
    ) -> Result<String> {
        check_file_name(file_name)?;
        let path = self.root.join(file_name);
        let mut file = File::create(&path)?;
        let copied = io::copy(&mut content.take(content_length), &mut file)?;
        file.sync_all()?;
        if copied != content_length {
            return Err(ExportError::Storage(format!(
                "short upload for {file_name}: {copied} of {content_length} bytes"
            )));
        }
        log::debug!("Saved {} ({} bytes)", path.display(), copied);
        Ok(path.to_string_lossy().into_owned())
    }

    fn delete(&self, locator: &str) -> Result<()> {
        let path = Path::new(locator);
        if !path.starts_with(&self.root) {
            return Err(ExportError::invalid_value(
                "locator",
                "Locator is outside the storage root",
                locator,
            ));
        }
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Stored object of [`MemoryFileStorage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Keeps saved files in memory under `memory://<name>` locators
#[derive(Debug, Default)]
pub struct MemoryFileStorage {
    files: Mutex<HashMap<String, StoredFile>>,
}

impl MemoryFileStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, locator: &str) -> Option<StoredFile> {
        self.lock().get(locator).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredFile>> {
        match self.files.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl FileStorage for MemoryFileStorage {
    fn save(
        &self,
        file_name: &str,
        content: &mut dyn ReadSeek,
        content_type: &str,
        content_length: u64,
    ) -> Result<String> {
        check_file_name(file_name)?;
        let mut bytes = Vec::with_capacity(content_length as usize);
        content.take(content_length).read_to_end(&mut bytes)?;
        let locator = format!("memory://{file_name}");
        self.lock().insert(
            locator.clone(),
            StoredFile {
                content_type: content_type.to_string(),
                bytes,
            },
        );
        Ok(locator)
    }

    fn delete(&self, locator: &str) -> Result<()> {
        self.lock().remove(locator);
        Ok(())
    }
}

/// Retries retryable failures of the wrapped storage
///
/// The content is rewound to its starting position before every attempt. Attempt `n`
/// waits `n * backoff` before retrying.
pub struct RetryingFileStorage<S: FileStorage> {
    inner: S,
    max_attempts: u32,
    backoff: Duration,
}

impl<S: FileStorage> RetryingFileStorage<S> {
    pub fn new(inner: S) -> Self {
        RetryingFileStorage {
            inner,
            max_attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: FileStorage> FileStorage for RetryingFileStorage<S> {
    fn save(
        &self,
        file_name: &str,
        content: &mut dyn ReadSeek,
        content_type: &str,
        content_length: u64,
    ) -> Result<String> {
        let start = content.stream_position()?;
        let mut attempt = 1;
        loop {
            content.seek(SeekFrom::Start(start))?;
            match self
                .inner
                .save(file_name, content, content_type, content_length)
            {
                Ok(locator) => return Ok(locator),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    log::warn!(
                        "Saving {} failed (attempt {}/{}): {}",
                        file_name,
                        attempt,
                        self.max_attempts,
                        e
                    );
                    thread::sleep(self.backoff * attempt);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn delete(&self, locator: &str) -> Result<()> {
        self.inner.delete(locator)
    }
}
