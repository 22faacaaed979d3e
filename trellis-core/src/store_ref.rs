//! Store-scoped refs.
//!
//! A [`StoreRefDef`] declares a mutable cell that exists once per root
//! store. The first [`StoreRefDef::get`] on a store runs the initializer;
//! later calls on the same store, from any effect, operation or derivative
//! store, return the same cell. Another store gets its own cell.
//!
//! The cells live in a table owned by the root store and are dropped when
//! the store is destroyed.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::id::Token;
use crate::store::{DerivativeStore, Store};

/// Anything that leads to a live root store.
pub trait StoreHandle {
    fn root_store(&self) -> Result<Store>;
}

impl StoreHandle for Store {
    fn root_store(&self) -> Result<Store> {
        if self.is_destroyed() {
            return Err(StoreError::StoreDestroyed(self.name().to_string()));
        }
        Ok(self.clone())
    }
}

impl StoreHandle for DerivativeStore {
    fn root_store(&self) -> Result<Store> {
        self.root()
    }
}

/// Declaration of a per-store cell.
pub struct StoreRefDef<T> {
    token: Token,
    init: Arc<dyn Fn() -> T + Send + Sync>,
}

impl<T: Send + 'static> StoreRefDef<T> {
    pub fn new<F>(init: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            token: Token::next(),
            init: Arc::new(init),
        }
    }

    /// The cell for `store`'s root, created on first use.
    ///
    /// Fails if the root store (or the derivative store used to reach it)
    /// has been destroyed.
    pub fn get(&self, store: &impl StoreHandle) -> Result<StoreRef<T>> {
        let root = store.root_store()?;
        let slot = root.ref_slot(self.token, || {
            Arc::new(Mutex::new((self.init)())) as Arc<dyn Any + Send + Sync>
        });

        match slot.downcast::<Mutex<T>>() {
            Ok(cell) => Ok(StoreRef { cell }),
            Err(_) => {
                // unreachable while tokens stay unique per definition
                let cell = Arc::new(Mutex::new((self.init)()));
                root.replace_ref_slot(self.token, cell.clone());
                Ok(StoreRef { cell })
            }
        }
    }
}

impl<T> Clone for StoreRefDef<T> {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            init: Arc::clone(&self.init),
        }
    }
}

impl<T> fmt::Debug for StoreRefDef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRefDef").field("token", &self.token).finish()
    }
}

/// A store-scoped mutable cell.
pub struct StoreRef<T> {
    cell: Arc<Mutex<T>>,
}

impl<T> StoreRef<T> {
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.cell.lock())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.cell.lock())
    }

    pub fn set(&self, value: T) {
        *self.cell.lock() = value;
    }

    /// True when both refs are the same cell.
    pub fn ptr_eq(&self, other: &StoreRef<T>) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T: Clone> StoreRef<T> {
    pub fn get(&self) -> T {
        self.cell.lock().clone()
    }
}

impl<T> Clone for StoreRef<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for StoreRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StoreRef").field(&*self.cell.lock()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::ManualScheduler;
    use crate::state::{ActionRegistry, Slice};
    use crate::{record, StoreOptions};
    use std::sync::atomic::{AtomicI32, Ordering};

    fn store(name: &str) -> Store {
        let registry = ActionRegistry::new();
        let a = Slice::new(&registry, "a", &[], record! {});
        Store::create(
            &registry,
            vec![a],
            StoreOptions::new(name).scheduler(Arc::new(ManualScheduler::new())),
        )
        .unwrap()
    }

    #[test]
    fn one_cell_per_store() {
        let inits = Arc::new(AtomicI32::new(0));
        let i = inits.clone();
        let counter = StoreRefDef::new(move || {
            i.fetch_add(1, Ordering::SeqCst);
            0u32
        });

        let first = store("first");
        let second = store("second");

        let a = counter.get(&first).unwrap();
        let b = counter.get(&first).unwrap();
        a.set(5);
        assert!(a.ptr_eq(&b));
        assert_eq!(b.get(), 5);

        let c = counter.get(&second).unwrap();
        assert!(!a.ptr_eq(&c));
        assert_eq!(c.get(), 0);
        assert_eq!(inits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn destroyed_store_has_no_refs() {
        let counter = StoreRefDef::new(|| 0u32);
        let store = store("main");
        counter.get(&store).unwrap().with_mut(|n| *n += 1);

        store.destroy();
        assert!(matches!(counter.get(&store), Err(StoreError::StoreDestroyed(_))));
    }
}
