//! Actions and the action registry.
//!
//! An action is a registered (slice, callback) pair. Calling it does not
//! touch any state: it produces a one-step [`Transaction`] naming the action
//! and carrying the call's arguments. When a snapshot applies the step, it
//! looks the callback up again in the registry, turns the arguments into a
//! [`TxBuilder`] and runs the builder against the snapshot.
//!
//! Resolving through the registry at apply time is what lets a transaction
//! be encoded, stored, and replayed later.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use super::slice::Slice;
use super::store_state::{ResolveOptions, StoreState};
use super::transaction::{Step, Transaction};
use crate::error::{Result, StoreError};
use crate::id::{ActionId, IdGenerator, SliceId, Token};
use crate::value::{Record, Value};

/// Callback stored for each action: call arguments to state calculation.
pub type ActionCallback = Arc<dyn Fn(&[Value]) -> TxBuilder + Send + Sync>;

/// How a step changes its slice.
#[derive(Debug, Clone)]
pub enum SliceUpdate {
    /// Shallow-merge these fields into the current record.
    Merge(Record),
    /// Use this record as the new state.
    Replace(Arc<Record>),
}

impl SliceUpdate {
    /// Compute the next record. Returns `current` itself (same `Arc`) when
    /// nothing changes, which is how snapshots detect no-op steps.
    pub fn apply(self, current: &Arc<Record>) -> Arc<Record> {
        match self {
            SliceUpdate::Replace(next) => next,
            SliceUpdate::Merge(partial) => {
                let unchanged = partial
                    .iter()
                    .all(|(key, value)| current.get(key).is_some_and(|c| c.is_same(value)));
                if unchanged {
                    return Arc::clone(current);
                }
                let mut next = Record::clone(current);
                next.extend(partial);
                Arc::new(next)
            }
        }
    }
}

/// A deferred calculation of one slice's next state.
pub struct TxBuilder {
    calc: Box<dyn FnOnce(&TxContext<'_>) -> Result<SliceUpdate> + Send>,
}

impl TxBuilder {
    pub fn new<F>(calc: F) -> Self
    where
        F: FnOnce(&TxContext<'_>) -> Result<SliceUpdate> + Send + 'static,
    {
        Self { calc: Box::new(calc) }
    }

    pub(crate) fn build(self, ctx: &TxContext<'_>) -> Result<SliceUpdate> {
        (self.calc)(ctx)
    }
}

/// What a [`TxBuilder`] sees while computing its slice's next state.
///
/// Reads are scoped: the builder may read its own slice and the slices it
/// declared as dependencies, nothing else.
pub struct TxContext<'a> {
    slice: &'a Slice,
    state: &'a StoreState,
    current: Arc<Record>,
}

impl<'a> TxContext<'a> {
    pub(crate) fn new(slice: &'a Slice, state: &'a StoreState, current: Arc<Record>) -> Self {
        Self { slice, state, current }
    }

    pub fn slice(&self) -> &Slice {
        self.slice
    }

    /// The slice's own state, without derived fields.
    pub fn current(&self) -> Arc<Record> {
        Arc::clone(&self.current)
    }

    /// The slice's own state with derived fields merged in.
    pub fn resolved(&self) -> Result<Arc<Record>> {
        self.state.resolve(self.slice.id(), ResolveOptions::default())
    }

    /// Resolved state of a declared dependency.
    pub fn get(&self, dependency: &Slice) -> Result<Arc<Record>> {
        if !self.slice.can_read(dependency.id()) {
            return Err(StoreError::UndeclaredDependency {
                slice: self.slice.id().clone(),
                dependency: dependency.id().clone(),
            });
        }
        self.state.resolve(dependency.id(), ResolveOptions::default())
    }

    /// Merge `partial` into the current state.
    pub fn update(&self, partial: Record) -> SliceUpdate {
        SliceUpdate::Merge(partial)
    }

    /// Merge the fields returned by `updater(current)`.
    pub fn update_with<F>(&self, updater: F) -> SliceUpdate
    where
        F: FnOnce(&Record) -> Record,
    {
        SliceUpdate::Merge(updater(&self.current))
    }

    /// Replace the whole state.
    pub fn replace(&self, record: Record) -> SliceUpdate {
        SliceUpdate::Replace(Arc::new(record))
    }
}

/// A registered action, stored by id.
#[derive(Clone)]
pub struct RegisteredAction {
    pub slice: SliceId,
    pub callback: ActionCallback,
}

impl fmt::Debug for RegisteredAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredAction")
            .field("slice", &self.slice)
            .finish_non_exhaustive()
    }
}

/// Table of every action, keyed by id, plus the id generator.
///
/// One registry is typically shared by a whole application. Slices are
/// declared against it and stores are created with it. Cloning yields a
/// handle to the same table.
#[derive(Clone)]
pub struct ActionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    token: Token,
    ids: IdGenerator,
    actions: DashMap<ActionId, RegisteredAction>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                token: Token::next(),
                ids: IdGenerator::new(),
                actions: DashMap::new(),
            }),
        }
    }

    pub fn ids(&self) -> &IdGenerator {
        &self.inner.ids
    }

    pub fn ptr_eq(&self, other: &ActionRegistry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a callback under `id`. Ids are never overwritten.
    pub fn register(&self, id: ActionId, slice: SliceId, callback: ActionCallback) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.inner.actions.entry(id) {
            Entry::Occupied(entry) => Err(StoreError::DuplicateAction(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::trace!(action = %entry.key(), slice = %slice, "registered action");
                entry.insert(RegisteredAction { slice, callback });
                Ok(())
            }
        }
    }

    /// Look an action up. The entry is cloned so no map guard is held
    /// while user code runs.
    pub fn lookup(&self, id: &ActionId) -> Result<RegisteredAction> {
        self.inner
            .actions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::UnknownAction(id.clone()))
    }

    pub fn contains(&self, id: &ActionId) -> bool {
        self.inner.actions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.actions.is_empty()
    }

    /// Drop every action and restart id numbering.
    ///
    /// Slices declared before the reset keep their ids but lose their
    /// actions; dispatching their old transactions fails with
    /// [`StoreError::UnknownAction`].
    pub fn reset(&self) {
        self.inner.actions.clear();
        self.inner.ids.reset();
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("token", &self.inner.token)
            .field("actions", &self.len())
            .finish()
    }
}

/// Handle returned by [`Slice::action`]. Calling it produces a transaction.
#[derive(Clone, Debug)]
pub struct Action {
    id: ActionId,
    slice: Slice,
}

impl Action {
    pub(crate) fn new(id: ActionId, slice: Slice) -> Self {
        Self { id, slice }
    }

    pub fn id(&self) -> &ActionId {
        &self.id
    }

    pub fn slice(&self) -> &Slice {
        &self.slice
    }

    /// Build a one-step transaction with these arguments.
    pub fn call<P, V>(&self, params: P) -> Transaction
    where
        P: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let step = Step {
            action_id: self.id.clone(),
            source_slice_id: self.slice.id().clone(),
            target_slice_id: self.slice.id().clone(),
            params: params.into_iter().map(Into::into).collect(),
        };
        Transaction::new(self.slice.registry().ids().transaction_id(), vec![step])
    }

    /// Build a one-step transaction for an action that takes no arguments.
    pub fn invoke(&self) -> Transaction {
        self.call(Vec::<Value>::new())
    }
}
