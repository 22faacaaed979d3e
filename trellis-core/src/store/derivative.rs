//! Derivative stores and abort signals.
//!
//! Effects and operations never receive the root [`Store`]. Each run gets a
//! [`DerivativeStore`]: a named, weak handle to the root with its own abort
//! signal chained to the root's. Destroying the run destroys its derivative
//! store, so work from a superseded run fails loudly instead of dispatching
//! into state that has moved on.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{Dispatch, DispatchOptions, Store, WeakStore};
use crate::error::{Result, StoreError};
use crate::state::StoreState;

/// Cooperative cancellation flag.
///
/// A child signal reports aborted when it, or any ancestor, was aborted.
/// Nothing is interrupted: long-running work is expected to check it.
#[derive(Clone, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AbortSignal>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal aborted together with this one, that can also be aborted on
    /// its own.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Abort. Returns `false` if this signal was already aborted directly.
    pub fn abort(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted_here() || self.parent.as_ref().is_some_and(|p| p.is_aborted())
    }

    /// Aborted through this signal rather than an ancestor.
    pub fn aborted_here(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// The store handle given to one effect or operation run.
#[derive(Clone)]
pub struct DerivativeStore {
    inner: Arc<DerivativeInner>,
}

struct DerivativeInner {
    name: String,
    root: WeakStore,
    signal: AbortSignal,
}

impl DerivativeStore {
    pub(crate) fn new(name: &str, root: &Store) -> Self {
        Self {
            inner: Arc::new(DerivativeInner {
                name: name.to_string(),
                root: root.downgrade(),
                signal: root.abort_signal().child(),
            }),
        }
    }

    /// A derivative store with no root, for unit tests of run bookkeeping.
    #[cfg(test)]
    pub(crate) fn detached(name: &str) -> Self {
        Self {
            inner: Arc::new(DerivativeInner {
                name: name.to_string(),
                root: WeakStore::new(),
                signal: AbortSignal::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.inner.signal
    }

    /// Destroyed directly, or through its root.
    pub fn is_destroyed(&self) -> bool {
        self.inner.signal.is_aborted()
    }

    /// The root store.
    ///
    /// Fails if this derivative store was destroyed, or if the root was
    /// destroyed or dropped.
    pub fn root(&self) -> Result<Store> {
        if self.inner.signal.aborted_here() {
            return Err(StoreError::DerivativeStoreDestroyed(self.inner.name.clone()));
        }
        match self.inner.root.upgrade() {
            Some(store) if !store.is_destroyed() => Ok(store),
            Some(store) => Err(StoreError::StoreDestroyed(store.name().to_string())),
            None => Err(StoreError::StoreDestroyed(self.inner.name.clone())),
        }
    }

    /// Current state of the root store.
    pub fn state(&self) -> Result<StoreState> {
        Ok(self.root()?.state())
    }

    pub fn dispatch(&self, payload: impl Into<Dispatch>) -> Result<()> {
        self.dispatch_with(payload, DispatchOptions::default())
    }

    /// Dispatch through the root, labelled with this store's name unless
    /// `opts` names a dispatcher.
    pub fn dispatch_with(&self, payload: impl Into<Dispatch>, mut opts: DispatchOptions) -> Result<()> {
        let root = self.root()?;
        if opts.dispatcher.is_none() {
            opts.dispatcher = Some(self.inner.name.clone());
        }
        root.dispatch_with(payload, opts)
    }

    pub(crate) fn destroy(&self) {
        if self.inner.signal.abort() {
            tracing::trace!(store = %self.inner.name, "destroyed derivative store");
        }
    }
}

impl fmt::Debug for DerivativeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivativeStore")
            .field("name", &self.inner.name)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_signal_follows_parent() {
        let parent = AbortSignal::new();
        let child = parent.child();

        assert!(!child.is_aborted());
        assert!(parent.abort());
        assert!(!parent.abort());

        assert!(child.is_aborted());
        assert!(!child.aborted_here());
    }

    #[test]
    fn child_abort_does_not_reach_parent() {
        let parent = AbortSignal::new();
        let child = parent.child();

        child.abort();
        assert!(child.is_aborted());
        assert!(!parent.is_aborted());
    }

    #[test]
    fn detached_store_has_no_root() {
        let store = DerivativeStore::detached("orphan");
        assert!(matches!(store.root(), Err(StoreError::StoreDestroyed(_))));

        store.destroy();
        assert!(matches!(
            store.root(),
            Err(StoreError::DerivativeStoreDestroyed(_))
        ));
    }
}
