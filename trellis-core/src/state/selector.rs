//! Selectors: derived fields of a slice.
//!
//! A selector is a pure calculation over a snapshot. Its result is merged
//! into the slice's resolved record under the selector's name.
//!
//! Two caches keep selectors cheap and stable:
//!
//! - Each snapshot caches its resolved records, so resolving the same slice
//!   twice against one snapshot computes the selectors once.
//! - A [`StoreStateKey`], shared by every snapshot that descends from one
//!   store, remembers the last value of each selector. When the selector's
//!   equality says the new value equals the old one, the old value object is
//!   returned, so downstream identity checks ([`Value::is_same`]) see no
//!   change.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::slice::Slice;
use super::store_state::{ResolveOptions, StoreState};
use crate::error::{Result, StoreError};
use crate::id::SliceId;
use crate::value::{Record, Value};

pub type SelectorFn = Arc<dyn Fn(&SelectorContext<'_>) -> Result<Value> + Send + Sync>;
pub type EqualFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// A named derived field.
#[derive(Clone)]
pub struct Selector {
    name: String,
    calc: SelectorFn,
    equal: Option<EqualFn>,
}

impl Selector {
    pub(crate) fn new(name: &str, calc: SelectorFn, equal: Option<EqualFn>) -> Self {
        Self {
            name: name.to_string(),
            calc,
            equal,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compute this selector for `slice` in `state`, returning the previous
    /// value object when it is equal to the new one.
    pub(crate) fn evaluate(&self, slice: &Slice, own: &Arc<Record>, state: &StoreState) -> Result<Value> {
        let ctx = SelectorContext { slice, own, state };
        let next = (self.calc)(&ctx)?;
        Ok(state.key().remember(slice.id(), &self.name, next, |prev, next| match &self.equal {
            Some(equal) => equal(prev, next),
            None => prev.is_same(next),
        }))
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("name", &self.name)
            .field("custom_equal", &self.equal.is_some())
            .finish()
    }
}

/// What a selector sees: its slice's raw state and its dependencies.
pub struct SelectorContext<'a> {
    slice: &'a Slice,
    own: &'a Arc<Record>,
    state: &'a StoreState,
}

impl SelectorContext<'_> {
    /// The owning slice's state, without derived fields.
    pub fn own(&self) -> &Record {
        self.own
    }

    /// Resolved state of a declared dependency.
    pub fn get(&self, dependency: &Slice) -> Result<Arc<Record>> {
        if dependency.id() == self.slice.id() || !self.slice.can_read(dependency.id()) {
            return Err(StoreError::UndeclaredDependency {
                slice: self.slice.id().clone(),
                dependency: dependency.id().clone(),
            });
        }
        self.state.resolve(dependency.id(), ResolveOptions::default())
    }
}

/// Selector memory shared by all snapshots descended from one store.
#[derive(Debug)]
pub struct StoreStateKey {
    previous: Mutex<HashMap<(SliceId, String), Value>>,
}

impl StoreStateKey {
    pub(crate) fn new() -> Self {
        Self {
            previous: Mutex::new(HashMap::new()),
        }
    }

    fn remember<F>(&self, slice: &SliceId, name: &str, next: Value, equal: F) -> Value
    where
        F: Fn(&Value, &Value) -> bool,
    {
        let mut previous = self.previous.lock();
        let key = (slice.clone(), name.to_string());
        if let Some(prev) = previous.get(&key) {
            if equal(prev, &next) {
                return prev.clone();
            }
        }
        previous.insert(key, next.clone());
        next
    }

    /// Forget remembered selector values.
    pub(crate) fn clear(&self) {
        self.previous.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_returns_previous_when_equal() {
        let key = StoreStateKey::new();
        let slice = SliceId::from("sl_a$");
        let by_len = |a: &Value, b: &Value| {
            a.as_list().map(<[Value]>::len) == b.as_list().map(<[Value]>::len)
        };

        let first = key.remember(&slice, "items", Value::list([1, 2]), by_len);
        let second = key.remember(&slice, "items", Value::list([3, 4]), by_len);
        assert!(first.is_same(&second));

        let third = key.remember(&slice, "items", Value::list([1]), by_len);
        assert!(!third.is_same(&first));
    }

    #[test]
    fn remember_is_scoped_per_selector() {
        let key = StoreStateKey::new();
        let slice = SliceId::from("sl_a$");
        let always = |_: &Value, _: &Value| true;

        key.remember(&slice, "x", Value::Int(1), always);
        let y = key.remember(&slice, "y", Value::Int(2), always);
        assert_eq!(y, Value::Int(2));
    }
}
