//! Slice Implementation
//!
//! A Slice is a named partition of global state. It declares an initial
//! record, the slices it may read, and optionally derived fields computed
//! by selectors. A slice never holds state itself: state lives only inside
//! a [`StoreState`] snapshot, and the slice is the key used to find it.
//!
//! # Declaring Slices
//!
//! ```rust,ignore
//! let registry = ActionRegistry::new();
//!
//! let counter = Slice::new(&registry, "counter", &[], record! { "count" => 0 });
//!
//! let summary = Slice::builder(&registry, "summary")
//!     .depends_on(&counter)
//!     .state(record! { "label" => "clicks" })
//!     .selector("text", |ctx| {
//!         let count = ctx.get(&counter)?["count"].clone();
//!         Ok(Value::from(format!("{} {}", count, ctx.own()["label"])))
//!     })
//!     .build();
//! ```

use std::fmt;
use std::sync::Arc;

use super::action::{Action, ActionRegistry, SliceUpdate, TxBuilder, TxContext};
use super::selector::{EqualFn, Selector, SelectorContext};
use super::store_state::{ResolveOptions, StoreState};
use crate::error::Result;
use crate::graph::SliceNode;
use crate::id::SliceId;
use crate::value::{Record, Value};

/// A named, typed partition of global state.
///
/// Cloning a slice is cheap and yields a handle to the same declaration.
#[derive(Clone)]
pub struct Slice {
    inner: Arc<SliceInner>,
}

struct SliceInner {
    id: SliceId,
    name: String,
    initial_state: Arc<Record>,
    dependencies: Vec<Slice>,
    selectors: Vec<Selector>,
    registry: ActionRegistry,
}

/// How a [`Slice::update`] descriptor treats the current record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Replace the whole record instead of merging into it.
    pub replace: bool,
}

impl Slice {
    /// Declare a slice without derived fields.
    pub fn new(registry: &ActionRegistry, name: &str, dependencies: &[&Slice], state: Record) -> Self {
        let mut builder = Self::builder(registry, name).state(state);
        for dep in dependencies {
            builder = builder.depends_on(dep);
        }
        builder.build()
    }

    /// Start declaring a slice.
    pub fn builder(registry: &ActionRegistry, name: &str) -> SliceBuilder {
        SliceBuilder {
            registry: registry.clone(),
            name: name.to_string(),
            dependencies: Vec::new(),
            state: Record::new(),
            selectors: Vec::new(),
        }
    }

    pub fn id(&self) -> &SliceId {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn initial_state(&self) -> &Arc<Record> {
        &self.inner.initial_state
    }

    pub fn dependencies(&self) -> &[Slice] {
        &self.inner.dependencies
    }

    pub fn selectors(&self) -> &[Selector] {
        &self.inner.selectors
    }

    /// Whether resolving this slice merges derived fields over its state.
    pub fn has_derived(&self) -> bool {
        !self.inner.selectors.is_empty()
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.inner.registry
    }

    /// True when both handles refer to the same declaration.
    pub fn ptr_eq(&self, other: &Slice) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether code running on behalf of this slice may read `other`:
    /// itself or one of its declared dependencies.
    pub fn can_read(&self, other: &SliceId) -> bool {
        self.id() == other || self.inner.dependencies.iter().any(|d| d.id() == other)
    }

    pub(crate) fn node(&self) -> SliceNode {
        SliceNode::new(
            self.id().clone(),
            self.inner.dependencies.iter().map(|d| d.id().clone()).collect(),
        )
    }

    /// State of this slice in `state`, with derived fields merged in.
    pub fn get(&self, state: &StoreState) -> Result<Arc<Record>> {
        state.resolve(self.id(), ResolveOptions::default())
    }

    /// State of this slice in `state`, without derived fields.
    pub fn get_raw(&self, state: &StoreState) -> Result<Arc<Record>> {
        state.resolve(self.id(), ResolveOptions { skip_derived: true })
    }

    /// One derived field. `Null` if the slice has no selector with that name.
    pub fn selector_value(&self, state: &StoreState, name: &str) -> Result<Value> {
        let resolved = self.get(state)?;
        Ok(resolved.get(name).cloned().unwrap_or_default())
    }

    /// Build an update descriptor against this slice's current state.
    pub fn update(&self, state: &StoreState, partial: Record, opts: UpdateOptions) -> Result<SliceUpdate> {
        // fail early if the slice is not part of the snapshot
        self.get_raw(state)?;
        Ok(if opts.replace {
            SliceUpdate::Replace(Arc::new(partial))
        } else {
            SliceUpdate::Merge(partial)
        })
    }

    /// Wrap a calculation of this slice's next state.
    ///
    /// This is the primitive action callbacks return.
    pub fn tx<F>(&self, calc: F) -> TxBuilder
    where
        F: FnOnce(&TxContext<'_>) -> Result<SliceUpdate> + Send + 'static,
    {
        TxBuilder::new(calc)
    }

    /// Register an action on this slice.
    ///
    /// `callback` turns the arguments of one call into a [`TxBuilder`]. It is
    /// stored in the registry, so a recorded step can be replayed later.
    pub fn action<F>(&self, hint: &str, callback: F) -> Result<Action>
    where
        F: Fn(&[Value]) -> TxBuilder + Send + Sync + 'static,
    {
        let id = self.registry().ids().action_id(self.id(), Some(hint));
        self.registry().register(id.clone(), self.id().clone(), Arc::new(callback))?;
        Ok(Action::new(id, self.clone()))
    }

    /// An action that sets `key` to its first argument.
    ///
    /// Setting a value that is the same as the current one is a no-op.
    pub fn simple_action(&self, key: &str) -> Result<Action> {
        self.simple_action_with(key, |incoming, _| incoming.clone())
    }

    /// Like [`Slice::simple_action`], but the stored value is
    /// `updater(argument, current record)`.
    pub fn simple_action_with<F>(&self, key: &str, updater: F) -> Result<Action>
    where
        F: Fn(&Value, &Record) -> Value + Send + Sync + 'static,
    {
        let key = key.to_string();
        let updater = Arc::new(updater);
        self.action(&format!("set_{}", key), move |params| {
            let incoming = params.first().cloned().unwrap_or_default();
            let key = key.clone();
            let updater = Arc::clone(&updater);
            // a merge whose fields are all unchanged keeps the current record
            TxBuilder::new(move |ctx| {
                let next = updater(&incoming, &ctx.current());
                let mut partial = Record::new();
                partial.insert(key, next);
                Ok(SliceUpdate::Merge(partial))
            })
        })
    }
}

impl fmt::Debug for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slice")
            .field("id", self.id())
            .field("dependencies", &self.inner.dependencies.iter().map(Slice::id).collect::<Vec<_>>())
            .field("selectors", &self.inner.selectors.len())
            .finish()
    }
}

/// Builder for slices with dependencies and derived fields.
pub struct SliceBuilder {
    registry: ActionRegistry,
    name: String,
    dependencies: Vec<Slice>,
    state: Record,
    selectors: Vec<Selector>,
}

impl SliceBuilder {
    pub fn depends_on(mut self, slice: &Slice) -> Self {
        self.dependencies.push(slice.clone());
        self
    }

    pub fn state(mut self, state: Record) -> Self {
        self.state = state;
        self
    }

    /// Add a derived field compared with [`Value::is_same`].
    pub fn selector<F>(mut self, name: &str, calc: F) -> Self
    where
        F: Fn(&SelectorContext<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        self.selectors.push(Selector::new(name, Arc::new(calc), None));
        self
    }

    /// Add a derived field with a custom equality. When `equal(previous,
    /// next)` holds, readers keep getting the previous value object.
    pub fn selector_with<F, E>(mut self, name: &str, calc: F, equal: E) -> Self
    where
        F: Fn(&SelectorContext<'_>) -> Result<Value> + Send + Sync + 'static,
        E: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        let equal: EqualFn = Arc::new(equal);
        self.selectors.push(Selector::new(name, Arc::new(calc), Some(equal)));
        self
    }

    pub fn build(self) -> Slice {
        let id = self.registry.ids().slice_id(&self.name);
        Slice {
            inner: Arc::new(SliceInner {
                id,
                name: self.name,
                initial_state: Arc::new(self.state),
                dependencies: self.dependencies,
                selectors: self.selectors,
                registry: self.registry,
            }),
        }
    }
}
