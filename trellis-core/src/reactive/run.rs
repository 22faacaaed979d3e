//! Run instances.
//!
//! Every execution of an effect or operation gets a fresh [`RunInstance`].
//! It owns what the run created: the cleanups it registered, the fields it
//! read, and the derivative store it dispatches through.
//!
//! # Lifecycle
//!
//! A run instance is flushed exactly once, either right before the next run
//! of the same effect or operation starts, or when its owner is destroyed.
//! Flushing runs the cleanups in registration order and then destroys the
//! derivative store, so a superseded run can no longer dispatch.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use parking_lot::Mutex;

use super::tracked::TrackedFields;
use crate::store::{AbortSignal, DerivativeStore};

type Cleanup = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Cleanups {
    pending: Vec<Cleanup>,
    flushed: bool,
}

/// State owned by one run of an effect or operation.
pub struct RunInstance {
    label: String,
    store: DerivativeStore,
    cleanups: Mutex<Cleanups>,
    tracked: Mutex<TrackedFields>,
}

impl RunInstance {
    pub(crate) fn new(label: &str, store: DerivativeStore) -> Self {
        Self {
            label: label.to_string(),
            store,
            cleanups: Mutex::new(Cleanups::default()),
            tracked: Mutex::new(TrackedFields::new()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn store(&self) -> &DerivativeStore {
        &self.store
    }

    pub fn signal(&self) -> &AbortSignal {
        self.store.signal()
    }

    /// Register a cleanup for this run.
    ///
    /// If the run was already flushed, the cleanup runs immediately.
    pub fn add_cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut cleanups = self.cleanups.lock();
        if cleanups.flushed {
            drop(cleanups);
            tracing::warn!(run = %self.label, "cleanup added after the run was flushed, running it now");
            run_cleanup(&self.label, Box::new(cleanup));
            return;
        }
        cleanups.pending.push(Box::new(cleanup));
    }

    /// Run every cleanup once, in registration order, then destroy the
    /// derivative store. Later calls do nothing.
    pub fn flush(&self) {
        let pending = {
            let mut cleanups = self.cleanups.lock();
            if cleanups.flushed {
                return;
            }
            cleanups.flushed = true;
            std::mem::take(&mut cleanups.pending)
        };

        tracing::trace!(run = %self.label, cleanups = pending.len(), "flushing run");
        for cleanup in pending {
            run_cleanup(&self.label, cleanup);
        }
        self.store.destroy();
    }

    pub fn is_flushed(&self) -> bool {
        self.cleanups.lock().flushed
    }

    pub(crate) fn tracked(&self) -> &Mutex<TrackedFields> {
        &self.tracked
    }

    pub(crate) fn take_tracked(&self) -> TrackedFields {
        std::mem::take(&mut *self.tracked.lock())
    }
}

impl fmt::Debug for RunInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunInstance")
            .field("label", &self.label)
            .field("flushed", &self.is_flushed())
            .finish()
    }
}

/// A panicking cleanup must not keep the remaining ones from running.
fn run_cleanup(label: &str, cleanup: Cleanup) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(cleanup)) {
        tracing::error!(run = %label, panic = %panic_message(payload.as_ref()), "cleanup panicked");
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "callback panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    fn instance() -> RunInstance {
        RunInstance::new("test", DerivativeStore::detached("test"))
    }

    #[test]
    fn flush_runs_cleanups_once_in_order() {
        let run = instance();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            run.add_cleanup(move || order.lock().push(i));
        }

        run.flush();
        run.flush();

        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(run.is_flushed());
        assert!(run.store().is_destroyed());
    }

    #[test]
    fn late_cleanup_runs_immediately() {
        let run = instance();
        let count = Arc::new(AtomicI32::new(0));
        run.flush();

        let c = count.clone();
        run.add_cleanup(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_cleanup_does_not_stop_the_rest() {
        let run = instance();
        let count = Arc::new(AtomicI32::new(0));

        run.add_cleanup(|| panic!("boom"));
        let c = count.clone();
        run.add_cleanup(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        run.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload = panic::catch_unwind(|| panic!("{}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "42");
    }
}
