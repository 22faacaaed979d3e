//! Store Implementation
//!
//! The store owns the current [`StoreState`] and is the single entry point
//! for dispatch.
//!
//! # How Dispatch Works
//!
//! 1. The transaction is stamped with the store name and a dispatcher label
//!    (the running effect or operation, unless the caller names one).
//!
//! 2. The current snapshot applies it, producing the next snapshot.
//!
//! 3. The store swaps the snapshot in and diffs it against the previous one.
//!
//! 4. Unless effects are triggered manually, the changed slices go to the
//!    [`EffectManager`], which schedules whichever effects care.
//!
//! Dispatch never suspends and never runs effects inline.
//!
//! # Lifetime
//!
//! [`Store::destroy`] (or dropping the last handle) aborts the store's
//! signal, destroys every effect and operation executor, and clears the
//! ref table. Dispatching into a destroyed store logs and does nothing.

mod derivative;

pub use derivative::{AbortSignal, DerivativeStore};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};

use crate::config::{EffectOptions, OperationOptions, StoreOptions};
use crate::debug::{emit, DebugLogger, LogRecord};
use crate::error::{BoxError, Result};
use crate::id::{SliceId, Token};
use crate::operation::{Operation, OperationCall, OperationContext, OperationExecutor, OperationOutcome};
use crate::reactive::{Effect, EffectContext, EffectManager, RunContext, Scheduler, TokioScheduler};
use crate::state::{ActionRegistry, Slice, StoreState, Transaction};
use crate::value::Value;

/// What can be dispatched.
pub enum Dispatch {
    Transaction(Transaction),
    Operation(OperationCall),
}

impl From<Transaction> for Dispatch {
    fn from(tx: Transaction) -> Self {
        Dispatch::Transaction(tx)
    }
}

impl From<OperationCall> for Dispatch {
    fn from(call: OperationCall) -> Self {
        Dispatch::Operation(call)
    }
}

/// Debug metadata for one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Who dispatched. Defaults to the running effect or operation.
    pub dispatcher: Option<String>,
    pub debug_info: Option<String>,
}

impl DispatchOptions {
    pub fn debug_info(info: &str) -> Self {
        Self {
            dispatcher: None,
            debug_info: Some(info.to_string()),
        }
    }
}

/// The root store.
///
/// Cloning yields a handle to the same store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// A handle that does not keep the store alive.
#[derive(Clone, Default)]
pub struct WeakStore {
    inner: Weak<StoreInner>,
}

impl WeakStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }
}

type RefSlot = Arc<dyn Any + Send + Sync>;

struct StoreInner {
    token: Token,
    name: String,
    registry: ActionRegistry,
    state: RwLock<StoreState>,
    effects: EffectManager,
    scheduler: Arc<dyn Scheduler>,
    signal: AbortSignal,
    manual_effects_trigger: bool,
    effect_max_wait: Duration,
    logger: Option<DebugLogger>,
    refs: Mutex<HashMap<Token, RefSlot>>,
    executors: Mutex<HashMap<Token, Arc<OperationExecutor>>>,
}

impl Store {
    /// Validate `slices` and create a store seeded with their initial
    /// state.
    ///
    /// Without a scheduler in `options`, the store schedules onto the Tokio
    /// runtime it is created in.
    pub fn create(registry: &ActionRegistry, slices: Vec<Slice>, options: StoreOptions) -> Result<Store> {
        let scheduler: Arc<dyn Scheduler> = match options.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::current()?),
        };
        let state = StoreState::create(registry, slices, options.overrides)?;
        let effects = EffectManager::new(Arc::clone(state.slice_set()));

        tracing::debug!(store = %options.name, slices = state.slices().len(), "created store");

        Ok(Store {
            inner: Arc::new(StoreInner {
                token: Token::next(),
                name: options.name,
                registry: registry.clone(),
                state: RwLock::new(state),
                effects,
                scheduler,
                signal: AbortSignal::new(),
                manual_effects_trigger: options.manual_effects_trigger,
                effect_max_wait: options.effect_max_wait,
                logger: options.logger,
                refs: Mutex::new(HashMap::new()),
                executors: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn token(&self) -> Token {
        self.inner.token
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.inner.registry
    }

    /// The current snapshot.
    pub fn state(&self) -> StoreState {
        self.inner.state.read().clone()
    }

    pub fn ptr_eq(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakStore {
        WeakStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn dispatch(&self, payload: impl Into<Dispatch>) -> Result<()> {
        self.dispatch_with(payload, DispatchOptions::default())
    }

    /// Dispatch a transaction or operation call.
    ///
    /// Errors from applying a transaction are returned; the state is left
    /// as it was. On a destroyed store this logs a warning and does nothing.
    pub fn dispatch_with(&self, payload: impl Into<Dispatch>, opts: DispatchOptions) -> Result<()> {
        let payload = payload.into();
        if self.is_destroyed() {
            tracing::warn!(store = %self.inner.name, "dispatch on a destroyed store ignored");
            return Ok(());
        }

        match payload {
            Dispatch::Transaction(tx) => self.apply(tx, opts),
            Dispatch::Operation(call) => {
                call.run(self);
                Ok(())
            }
        }
    }

    fn apply(&self, mut tx: Transaction, opts: DispatchOptions) -> Result<()> {
        let dispatcher = opts.dispatcher.or_else(RunContext::current_label);
        tx.stamp(&self.inner.name, dispatcher, opts.debug_info);

        // readers may take the lock while actions compute; a second
        // dispatcher waits for the swap
        let (before, after) = {
            let guard = self.inner.state.upgradable_read();
            let next = guard.apply_transaction(&tx)?;
            let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
            let before = std::mem::replace(&mut *guard, next.clone());
            (before, next)
        };

        let changed = after.changed_slices(&before);
        tracing::debug!(
            store = %self.inner.name,
            tx = tx.id(),
            steps = tx.len(),
            changed = changed.len(),
            dispatcher = tx.metadata().dispatcher.as_deref().unwrap_or("-"),
            "applied transaction"
        );
        emit(self.logger(), || LogRecord::Transaction {
            store: self.inner.name.clone(),
            tx: tx.id(),
            dispatcher: tx.metadata().dispatcher.clone(),
            debug_info: tx.metadata().debug_info.clone(),
            steps: tx.steps().to_vec(),
            changed: changed.clone(),
        });

        if !self.inner.manual_effects_trigger {
            self.inner.effects.run(Some(changed.as_slice()));
        }
        Ok(())
    }

    /// Register an effect on the sync lane.
    pub fn effect<F>(&self, name: &str, callback: F) -> Effect
    where
        F: Fn(&EffectContext<'_>) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.effect_with(callback, EffectOptions::named(name))
    }

    /// Register an effect. Its first run is scheduled on the next tick.
    pub fn effect_with<F>(&self, callback: F, options: EffectOptions) -> Effect
    where
        F: Fn(&EffectContext<'_>) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        let name = options.name.clone().unwrap_or_else(|| "effect".to_string());
        let effect = Effect::new(
            &name,
            options.lane(self.inner.effect_max_wait),
            Arc::new(callback),
            self.downgrade(),
            Arc::clone(&self.inner.scheduler),
        );
        self.inner.effects.register(effect.clone());
        effect
    }

    /// Destroy an effect. Returns whether it belonged to this store.
    pub fn unregister_effect(&self, effect: &Effect) -> bool {
        self.inner.effects.unregister(effect)
    }

    pub fn effects(&self) -> Vec<Effect> {
        self.inner.effects.effects()
    }

    /// Re-evaluate effects by hand, for stores created with
    /// `manual_effects_trigger`. Without `changed`, every effect re-runs
    /// its field check.
    pub fn run_effects(&self, changed: Option<&[SliceId]>) -> usize {
        self.inner.effects.run(changed)
    }

    /// Declare an operation. Shorthand for [`Operation::new`]; the
    /// operation is not tied to this store.
    pub fn operation<F>(&self, options: OperationOptions, callback: F) -> Operation
    where
        F: Fn(&OperationContext, &[Value]) -> std::result::Result<OperationOutcome, BoxError>
            + Send
            + Sync
            + 'static,
    {
        Operation::new(options, callback)
    }

    /// Tear the store down. Idempotent.
    pub fn destroy(&self) {
        if self.inner.signal.abort() {
            self.inner.teardown();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.signal.is_aborted()
    }

    /// Aborted when the store is destroyed.
    pub fn abort_signal(&self) -> &AbortSignal {
        &self.inner.signal
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }

    pub(crate) fn effect_max_wait(&self) -> Duration {
        self.inner.effect_max_wait
    }

    pub(crate) fn logger(&self) -> Option<&DebugLogger> {
        self.inner.logger.as_ref()
    }

    /// Log a failed effect or operation callback.
    pub(crate) fn report_error(&self, source: &str, error: &dyn fmt::Display) {
        let message = error.to_string();
        tracing::error!(store = %self.inner.name, source, error = %message, "callback failed");
        emit(self.logger(), || LogRecord::Error {
            store: self.inner.name.clone(),
            source: source.to_string(),
            message,
        });
    }

    /// The executor shared by every call of `operation` on this store.
    pub(crate) fn executor_for(&self, operation: &Operation) -> Arc<OperationExecutor> {
        let mut executors = self.inner.executors.lock();
        let executor = executors
            .entry(operation.token())
            .or_insert_with(|| Arc::new(OperationExecutor::new(operation.clone(), self)));
        Arc::clone(executor)
    }

    /// The ref slot for `token`, created by `init` on first use. `init`
    /// runs without the table locked.
    pub(crate) fn ref_slot<F>(&self, token: Token, init: F) -> RefSlot
    where
        F: FnOnce() -> RefSlot,
    {
        if let Some(slot) = self.inner.refs.lock().get(&token) {
            return Arc::clone(slot);
        }
        let fresh = init();
        Arc::clone(self.inner.refs.lock().entry(token).or_insert(fresh))
    }

    pub(crate) fn replace_ref_slot(&self, token: Token, slot: RefSlot) {
        self.inner.refs.lock().insert(token, slot);
    }
}

impl StoreInner {
    fn teardown(&self) {
        self.effects.destroy();

        let executors: Vec<_> = self.executors.lock().drain().map(|(_, executor)| executor).collect();
        for executor in executors {
            executor.destroy();
        }

        self.refs.lock().clear();
        self.state.read().clear_selector_memory();
        tracing::debug!(store = %self.name, "destroyed store");
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if self.signal.abort() {
            self.teardown();
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("effects", &self.inner.effects.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
