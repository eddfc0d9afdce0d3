//! Cooperative cancellation
//!
//! A [`CancellationSource`] owns the flag; [`CancellationToken`]s are cheap read-only views
//! handed to the export engine, which checks them at flush boundaries.
//!
//! ```
//! use sheetstream::cancel::CancellationSource;
//!
//! let source = CancellationSource::new();
//! let token = source.token();
//! assert!(token.throw_if_requested().is_ok());
//!
//! source.cancel();
//! assert!(token.is_requested());
//! assert!(token.throw_if_requested().unwrap_err().is_cancelled());
//! ```

use crate::error::{ExportError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

/// Creates tokens and triggers cancellation
pub struct CancellationSource {
    shared: Arc<Shared>,
}

impl CancellationSource {
    pub fn new() -> Self {
        CancellationSource {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Token observing this source
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            shared: Some(Arc::clone(&self.shared)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation. Only the first call runs the registered callbacks.
    pub fn cancel(&self) {
        if self
            .shared
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let callbacks = match self.shared.callbacks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        log::debug!("Cancellation requested, running {} callback(s)", callbacks.len());
        for (_, callback) in callbacks {
            callback();
        }
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSource")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Read-only view of a cancellation flag
#[derive(Clone, Default)]
pub struct CancellationToken {
    shared: Option<Arc<Shared>>,
}

impl CancellationToken {
    /// Token that is never cancelled
    pub fn none() -> Self {
        CancellationToken { shared: None }
    }

    pub fn is_requested(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| s.cancelled.load(Ordering::Acquire))
    }

    /// `Err(ExportError::Cancelled)` once cancellation was requested
    pub fn throw_if_requested(&self) -> Result<()> {
        if self.is_requested() {
            Err(ExportError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `callback` on cancellation, or right away if already cancelled
    pub fn on_cancel<F>(&self, callback: F) -> CancellationRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(shared) = self.shared.as_ref() else {
            return CancellationRegistration::noop();
        };

        let mut guard = match shared.callbacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // cancel() sets the flag before draining under this lock
        if shared.cancelled.load(Ordering::Acquire) {
            drop(guard);
            callback();
            return CancellationRegistration::noop();
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        guard.push((id, Box::new(callback)));
        CancellationRegistration {
            shared: Arc::downgrade(shared),
            id: Some(id),
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("requested", &self.is_requested())
            .finish()
    }
}

/// Handle returned by [`CancellationToken::on_cancel`]
#[must_use = "call dispose() to remove the callback"]
pub struct CancellationRegistration {
    shared: Weak<Shared>,
    id: Option<u64>,
}

impl CancellationRegistration {
    fn noop() -> Self {
        CancellationRegistration {
            shared: Weak::new(),
            id: None,
        }
    }

    /// Remove the callback if it has not run yet
    pub fn dispose(self) {
        let (Some(id), Some(shared)) = (self.id, self.shared.upgrade()) else {
            return;
        };
        let mut guard = match shared.callbacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.retain(|(cb_id, _)| *cb_id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_cancel_runs_callbacks_once() {
        let source = CancellationSource::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        let _registration = source.token().on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        source.cancel();
        source.cancel();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_after_cancel_runs_immediately() {
        let source = CancellationSource::new();
        source.cancel();

        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        source.token().on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .dispose();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disposed_callback_is_not_run() {
        let source = CancellationSource::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        let registration = source.token().on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        registration.dispose();

        source.cancel();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_none_token_never_cancels() {
        let token = CancellationToken::none();
        assert!(!token.is_requested());
        assert!(token.throw_if_requested().is_ok());
        token.on_cancel(|| panic!("must not run")).dispose();
    }

    #[test]
    fn test_concurrent_registration_and_cancel() {
        for _ in 0..50 {
            let source = Arc::new(CancellationSource::new());
            let counter = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let token = source.token();
                    let counter = Arc::clone(&counter);
                    thread::spawn(move || {
                        for _ in 0..25 {
                            let c = Arc::clone(&counter);
                            let _registration = token.on_cancel(move || {
                                c.fetch_add(1, Ordering::SeqCst);
                            });
                        }
                    })
                })
                .collect();

            let canceller = {
                let source = Arc::clone(&source);
                thread::spawn(move || source.cancel())
            };

            for handle in handles {
                handle.join().unwrap();
            }
            canceller.join().unwrap();

            assert_eq!(counter.load(Ordering::SeqCst), 8 * 25);
        }
    }
}
