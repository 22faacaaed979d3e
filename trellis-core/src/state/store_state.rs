//! Immutable store snapshots.
//!
//! A [`StoreState`] maps every registered slice to its current record.
//! Snapshots are never mutated: applying a transaction builds a new
//! snapshot that shares every untouched record with its parent by pointer.
//!
//! # Identity Rules
//!
//! - A step whose update leaves a record unchanged keeps the same `Arc`.
//! - A transaction whose steps are all no-ops returns the original
//!   snapshot (`StoreState::ptr_eq(&before, &after)`).
//!
//! Effects rely on both: comparing pointers is how they skip work.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::action::{ActionRegistry, TxContext};
use super::selector::StoreStateKey;
use super::slice::Slice;
use super::transaction::Transaction;
use crate::error::{Result, StoreError};
use crate::graph::{self, ReverseDependencies, SliceNode};
use crate::id::SliceId;
use crate::value::Record;

/// The validated, ordered slice list of one store.
///
/// Built once per store and shared by every snapshot, so the reverse
/// dependency map is computed at most once per slice list.
pub struct SliceSet {
    slices: Vec<Slice>,
    index: HashMap<SliceId, usize>,
    reverse: OnceLock<ReverseDependencies>,
}

impl SliceSet {
    /// Validate `slices` and index them.
    pub fn new(registry: &ActionRegistry, slices: Vec<Slice>) -> Result<Self> {
        for slice in &slices {
            if !slice.registry().ptr_eq(registry) {
                return Err(StoreError::ForeignSlice(slice.id().clone()));
            }
        }

        let nodes: Vec<SliceNode> = slices.iter().map(Slice::node).collect();
        graph::validate(&nodes)?;

        let index = slices
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id().clone(), i))
            .collect();

        Ok(Self {
            slices,
            index,
            reverse: OnceLock::new(),
        })
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn get(&self, id: &SliceId) -> Option<&Slice> {
        self.index.get(id).map(|&i| &self.slices[i])
    }

    pub fn contains(&self, id: &SliceId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Slice -> every slice that transitively depends on it.
    pub fn reverse_dependencies(&self) -> &ReverseDependencies {
        self.reverse.get_or_init(|| {
            let nodes: Vec<SliceNode> = self.slices.iter().map(Slice::node).collect();
            ReverseDependencies::compute(&nodes)
        })
    }
}

/// Options for [`StoreState::resolve`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Return the raw record even if the slice declares derived fields.
    pub skip_derived: bool,
}

/// An immutable snapshot of every slice's state.
///
/// Cloning is cheap and yields a handle to the same snapshot.
#[derive(Clone)]
pub struct StoreState {
    inner: Arc<StateInner>,
}

struct StateInner {
    slices: Arc<SliceSet>,
    records: HashMap<SliceId, Arc<Record>>,
    key: Arc<StoreStateKey>,
    registry: ActionRegistry,
    /// Resolved (raw + derived) records computed against this snapshot.
    derived: Mutex<HashMap<SliceId, Arc<Record>>>,
}

impl StoreState {
    /// Validate `slices` and seed each with its initial state, or with the
    /// override given for it.
    pub fn create(
        registry: &ActionRegistry,
        slices: Vec<Slice>,
        overrides: HashMap<SliceId, Record>,
    ) -> Result<Self> {
        let set = Arc::new(SliceSet::new(registry, slices)?);
        Self::seed(set, registry, overrides)
    }

    pub(crate) fn seed(
        slices: Arc<SliceSet>,
        registry: &ActionRegistry,
        mut overrides: HashMap<SliceId, Record>,
    ) -> Result<Self> {
        if let Some(unknown) = overrides.keys().find(|id| !slices.contains(id)) {
            return Err(StoreError::UnknownOverride(unknown.clone()));
        }

        let records = slices
            .slices()
            .iter()
            .map(|slice| {
                let record = match overrides.remove(slice.id()) {
                    Some(record) => Arc::new(record),
                    None => Arc::clone(slice.initial_state()),
                };
                (slice.id().clone(), record)
            })
            .collect();

        Ok(Self {
            inner: Arc::new(StateInner {
                slices,
                records,
                key: Arc::new(StoreStateKey::new()),
                registry: registry.clone(),
                derived: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// True when both handles refer to the same snapshot.
    pub fn ptr_eq(a: &StoreState, b: &StoreState) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn slice_set(&self) -> &Arc<SliceSet> {
        &self.inner.slices
    }

    pub fn slices(&self) -> &[Slice] {
        self.inner.slices.slices()
    }

    pub fn key(&self) -> &StoreStateKey {
        &self.inner.key
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.inner.registry
    }

    /// Apply every step of `tx` in order and return the resulting snapshot.
    ///
    /// Marks `tx` as applied, even when a step fails.
    pub fn apply_transaction(&self, tx: &Transaction) -> Result<StoreState> {
        tx.consume()?;

        let mut current = self.clone();
        for step in tx.steps() {
            let action = self.inner.registry.lookup(&step.action_id)?;
            let slice = current
                .inner
                .slices
                .get(&step.target_slice_id)
                .cloned()
                .ok_or_else(|| StoreError::UnknownSlice(step.target_slice_id.clone()))?;

            let previous = current.raw(slice.id())?;
            let builder = (action.callback)(&step.params);
            let update = builder.build(&TxContext::new(&slice, &current, Arc::clone(&previous)))?;
            let next = update.apply(&previous);

            if !Arc::ptr_eq(&previous, &next) {
                current = current.with_record(slice.id().clone(), next);
            }
        }
        Ok(current)
    }

    fn with_record(&self, id: SliceId, record: Arc<Record>) -> StoreState {
        let mut records = self.inner.records.clone();
        records.insert(id, record);
        StoreState {
            inner: Arc::new(StateInner {
                slices: Arc::clone(&self.inner.slices),
                records,
                key: Arc::clone(&self.inner.key),
                registry: self.inner.registry.clone(),
                derived: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn raw(&self, id: &SliceId) -> Result<Arc<Record>> {
        self.inner
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownSlice(id.clone()))
    }

    /// A slice's record, with derived fields merged in unless the slice has
    /// none or the caller opts out.
    pub fn resolve(&self, id: &SliceId, opts: ResolveOptions) -> Result<Arc<Record>> {
        let raw = self.raw(id)?;
        let Some(slice) = self.inner.slices.get(id) else {
            return Ok(raw);
        };
        if opts.skip_derived || !slice.has_derived() {
            return Ok(raw);
        }

        if let Some(hit) = self.inner.derived.lock().get(id) {
            return Ok(Arc::clone(hit));
        }

        // computed without holding the cache lock: selectors resolve their
        // dependencies through this same snapshot
        let mut merged = Record::clone(&raw);
        for selector in slice.selectors() {
            let value = selector.evaluate(slice, &raw, self)?;
            merged.insert(selector.name().to_string(), value);
        }

        let mut cache = self.inner.derived.lock();
        Ok(Arc::clone(cache.entry(id.clone()).or_insert_with(|| Arc::new(merged))))
    }

    /// Slices whose record differs (by pointer) from `other`'s.
    ///
    /// Slices unknown to `other` count as changed.
    pub fn changed_slices(&self, other: &StoreState) -> Vec<SliceId> {
        if StoreState::ptr_eq(self, other) {
            return Vec::new();
        }
        self.slices()
            .iter()
            .map(Slice::id)
            .filter(|id| match (self.inner.records.get(*id), other.inner.records.get(*id)) {
                (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
                _ => true,
            })
            .cloned()
            .collect()
    }

    /// Forget selector values remembered across snapshots.
    pub(crate) fn clear_selector_memory(&self) {
        self.inner.key.clear();
    }
}

impl fmt::Debug for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for slice in self.slices() {
            map.entry(slice.id(), &self.inner.records.get(slice.id()));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use crate::state::action::{SliceUpdate, TxBuilder};
    use crate::value::Value;

    fn counter(registry: &ActionRegistry) -> Slice {
        Slice::new(registry, "counter", &[], record! { "a" => 1, "b" => 0 })
    }

    #[test]
    fn create_seeds_initial_state() {
        let registry = ActionRegistry::new();
        let slice = counter(&registry);
        let state = StoreState::create(&registry, vec![slice.clone()], HashMap::new()).unwrap();

        let record = slice.get(&state).unwrap();
        assert!(Arc::ptr_eq(&record, slice.initial_state()));
    }

    #[test]
    fn create_applies_overrides() {
        let registry = ActionRegistry::new();
        let slice = counter(&registry);
        let overrides = HashMap::from([(slice.id().clone(), record! { "a" => 10 })]);
        let state = StoreState::create(&registry, vec![slice.clone()], overrides).unwrap();

        assert_eq!(slice.get(&state).unwrap()["a"], Value::Int(10));
    }

    #[test]
    fn create_rejects_unknown_override() {
        let registry = ActionRegistry::new();
        let slice = counter(&registry);
        let overrides = HashMap::from([(SliceId::from("sl_ghost$"), record! {})]);
        let err = StoreState::create(&registry, vec![slice], overrides).unwrap_err();
        assert!(matches!(err, StoreError::UnknownOverride(_)));
    }

    #[test]
    fn create_rejects_foreign_slice() {
        let registry = ActionRegistry::new();
        let other = ActionRegistry::new();
        let slice = counter(&other);
        let err = StoreState::create(&registry, vec![slice], HashMap::new()).unwrap_err();
        assert!(matches!(err, StoreError::ForeignSlice(_)));
    }

    #[test]
    fn no_op_transaction_returns_same_snapshot() {
        let registry = ActionRegistry::new();
        let slice = counter(&registry);
        let set_a = slice.simple_action("a").unwrap();
        let state = StoreState::create(&registry, vec![slice], HashMap::new()).unwrap();

        let after = state.apply_transaction(&set_a.call([1])).unwrap();
        assert!(StoreState::ptr_eq(&state, &after));
    }

    #[test]
    fn transaction_is_single_use() {
        let registry = ActionRegistry::new();
        let slice = counter(&registry);
        let set_a = slice.simple_action("a").unwrap();
        let state = StoreState::create(&registry, vec![slice], HashMap::new()).unwrap();

        let tx = set_a.call([2]);
        state.apply_transaction(&tx).unwrap();
        assert!(matches!(
            state.apply_transaction(&tx),
            Err(StoreError::TransactionDestroyed(_))
        ));
    }

    #[test]
    fn untouched_slices_are_shared() {
        let registry = ActionRegistry::new();
        let a = counter(&registry);
        let b = Slice::new(&registry, "other", &[], record! { "x" => 1 });
        let set_a = a.simple_action("a").unwrap();
        let state = StoreState::create(&registry, vec![a.clone(), b.clone()], HashMap::new()).unwrap();

        let after = state.apply_transaction(&set_a.call([5])).unwrap();

        assert!(Arc::ptr_eq(&b.get(&state).unwrap(), &b.get(&after).unwrap()));
        assert_eq!(after.changed_slices(&state), vec![a.id().clone()]);
        assert_eq!(a.get(&state).unwrap()["a"], Value::Int(1));
        assert_eq!(a.get(&after).unwrap()["a"], Value::Int(5));
    }

    #[test]
    fn unknown_action_fails() {
        let registry = ActionRegistry::new();
        let slice = counter(&registry);
        let set_a = slice.simple_action("a").unwrap();
        let state = StoreState::create(&registry, vec![slice], HashMap::new()).unwrap();

        let tx = set_a.call([3]);
        registry.reset();
        assert!(matches!(
            state.apply_transaction(&tx),
            Err(StoreError::UnknownAction(_))
        ));
    }

    #[test]
    fn undeclared_dependency_read_fails() {
        let registry = ActionRegistry::new();
        let a = counter(&registry);
        let b = Slice::new(&registry, "b", &[], record! { "x" => 1 });
        let peek = {
            let a = a.clone();
            b.action("peek", move |_| {
                let a = a.clone();
                TxBuilder::new(move |ctx| {
                    let other = ctx.get(&a)?;
                    Ok(ctx.update(record! { "x" => other["a"].clone() }))
                })
            })
            .unwrap()
        };
        let state = StoreState::create(&registry, vec![a, b], HashMap::new()).unwrap();

        assert!(matches!(
            state.apply_transaction(&peek.invoke()),
            Err(StoreError::UndeclaredDependency { .. })
        ));
    }

    #[test]
    fn derived_fields_are_cached_per_snapshot() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let registry = ActionRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let slice = Slice::builder(&registry, "doubler")
            .state(record! { "n" => 2 })
            .selector("double", move |ctx| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                let n = ctx.own()["n"].as_int().unwrap_or(0);
                Ok(Value::Int(n * 2))
            })
            .build();
        let state = StoreState::create(&registry, vec![slice.clone()], HashMap::new()).unwrap();

        assert_eq!(slice.selector_value(&state, "double").unwrap(), Value::Int(4));
        assert_eq!(slice.get(&state).unwrap()["n"], Value::Int(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let raw = slice.get_raw(&state).unwrap();
        assert!(raw.get("double").is_none());
    }

    #[test]
    fn replace_update_swaps_record() {
        let registry = ActionRegistry::new();
        let slice = counter(&registry);
        let reset = slice
            .action("reset", |_| TxBuilder::new(|ctx| Ok(ctx.replace(record! { "a" => 0 }))))
            .unwrap();
        let state = StoreState::create(&registry, vec![slice.clone()], HashMap::new()).unwrap();

        let after = state.apply_transaction(&reset.invoke()).unwrap();
        let record = slice.get(&after).unwrap();
        assert_eq!(record.len(), 1);
        assert!(matches!(
            slice.update(&after, record! {}, Default::default()).unwrap(),
            SliceUpdate::Merge(_)
        ));
    }
}
