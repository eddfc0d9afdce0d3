//! Tracking of resources opened by a data source

use crate::error::{ExportError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type ReleaseFn = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct ResourceState {
    name: String,
    released: AtomicBool,
    on_release: Mutex<Option<ReleaseFn>>,
}

/// Shared handle to one tracked resource
///
/// Clones refer to the same resource; releasing through any clone releases it once.
#[derive(Clone)]
pub struct ResourceHandle {
    state: Arc<ResourceState>,
}

impl ResourceHandle {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn is_released(&self) -> bool {
        self.state.released.load(Ordering::Acquire)
    }

    /// Release the resource; later calls are no-ops
    pub fn release(&self) -> Result<()> {
        if self.state.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let hook = match self.state.on_release.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match hook {
            Some(hook) => hook(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("name", &self.state.name)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Owned set of resources a source has opened and not yet released
#[derive(Debug, Default)]
pub struct OpenResources {
    handles: Vec<ResourceHandle>,
}

impl OpenResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a resource that needs no explicit release action
    pub fn track(&mut self, name: impl Into<String>) -> ResourceHandle {
        self.insert(name.into(), None)
    }

    /// Track a resource released by running `on_release`
    pub fn track_with<F>(&mut self, name: impl Into<String>, on_release: F) -> ResourceHandle
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.insert(name.into(), Some(Box::new(on_release)))
    }

    fn insert(&mut self, name: String, on_release: Option<ReleaseFn>) -> ResourceHandle {
        self.handles.retain(|h| !h.is_released());
        let handle = ResourceHandle {
            state: Arc::new(ResourceState {
                name,
                released: AtomicBool::new(false),
                on_release: Mutex::new(on_release),
            }),
        };
        self.handles.push(handle.clone());
        handle
    }

    /// Number of resources still open
    pub fn open_count(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_released()).count()
    }

    /// Release everything still open. Failures are logged, never returned.
    ///
    /// Returns the number of resources released by this call.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        for handle in self.handles.drain(..) {
            if handle.is_released() {
                continue;
            }
            released += 1;
            if let Err(e) = handle.release() {
                let cleanup = ExportError::ResourceCleanup {
                    resource: handle.name().to_string(),
                    message: e.to_string(),
                };
                log::warn!("{}", cleanup);
            }
        }
        released
    }
}
