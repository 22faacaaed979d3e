//! Operations: explicitly invoked, store-scoped units of work.
//!
//! An [`Operation`] is a definition, independent of any store. Calling it
//! produces an [`OperationCall`] that is dispatched into a store like a
//! transaction. The callback may finish synchronously or hand back a future
//! that the store's scheduler drives.
//!
//! # Serialization
//!
//! Each (operation, store) pair has one [`OperationExecutor`], cached in the
//! store. An invocation first flushes the previous invocation's run: its
//! cleanups execute and its derivative store is destroyed. The previous
//! body may still be in flight, but it can no longer dispatch, so only the
//! latest invocation's writes land.
//!
//! ```rust,ignore
//! let save = Operation::new(OperationOptions::named("save"), move |ctx, params| {
//!     let store = ctx.store().clone();
//!     let tx = set_status.call([params[0].clone()]);
//!     Ok(OperationOutcome::future(async move {
//!         store.dispatch(tx)?;
//!         Ok(())
//!     }))
//! });
//!
//! store.dispatch(save.call(["draft"]))?;
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use crate::config::OperationOptions;
use crate::debug::{emit, LogRecord};
use crate::error::{BoxError, Result};
use crate::id::Token;
use crate::reactive::{panic_message, RunContext, RunInstance};
use crate::state::StoreState;
use crate::store::{AbortSignal, DerivativeStore, Store, WeakStore};
use crate::value::Value;

/// What an operation callback hands back.
pub enum OperationOutcome {
    /// The work is done.
    Complete,
    /// The work continues in this future.
    Pending(BoxFuture<'static, std::result::Result<(), BoxError>>),
}

impl OperationOutcome {
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        OperationOutcome::Pending(Box::pin(future))
    }
}

impl fmt::Debug for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationOutcome::Complete => f.write_str("Complete"),
            OperationOutcome::Pending(_) => f.write_str("Pending"),
        }
    }
}

pub type OperationCallback = Arc<
    dyn Fn(&OperationContext, &[Value]) -> std::result::Result<OperationOutcome, BoxError> + Send + Sync,
>;

/// An operation definition.
///
/// Cloning yields a handle to the same definition, which shares executors.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationDef>,
}

struct OperationDef {
    token: Token,
    name: String,
    options: OperationOptions,
    callback: OperationCallback,
}

impl Operation {
    pub fn new<F>(options: OperationOptions, callback: F) -> Self
    where
        F: Fn(&OperationContext, &[Value]) -> std::result::Result<OperationOutcome, BoxError>
            + Send
            + Sync
            + 'static,
    {
        let name = options.name.clone().unwrap_or_else(|| "operation".to_string());
        Self {
            inner: Arc::new(OperationDef {
                token: Token::next(),
                name,
                options,
                callback: Arc::new(callback),
            }),
        }
    }

    pub fn token(&self) -> Token {
        self.inner.token
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &OperationOptions {
        &self.inner.options
    }

    /// Bind arguments. The call runs once dispatched.
    pub fn call<P, V>(&self, params: P) -> OperationCall
    where
        P: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        OperationCall {
            operation: self.clone(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Bind no arguments.
    pub fn invoke(&self) -> OperationCall {
        self.call(Vec::<Value>::new())
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .finish()
    }
}

/// An operation bound to its arguments, ready to dispatch.
#[derive(Debug, Clone)]
pub struct OperationCall {
    operation: Operation,
    params: Vec<Value>,
}

impl OperationCall {
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Schedule on `store`. On a destroyed store this logs and does nothing.
    pub(crate) fn run(self, store: &Store) {
        if store.is_destroyed() {
            tracing::warn!(
                store = %store.name(),
                operation = %self.operation.name(),
                "operation called on a destroyed store, ignoring"
            );
            return;
        }
        let executor = store.executor_for(&self.operation);
        executor.run(store, self.params);
    }
}

#[derive(Default)]
struct ExecutorState {
    invocations: u64,
    current: Option<Arc<RunInstance>>,
    destroyed: bool,
    /// A body is on some thread's stack.
    running: bool,
    /// Parameters of invocations that arrived while a body was running.
    queued: VecDeque<Vec<Value>>,
}

/// Runs one operation against one store, one invocation at a time.
pub(crate) struct OperationExecutor {
    operation: Operation,
    store: WeakStore,
    state: Mutex<ExecutorState>,
}

impl OperationExecutor {
    pub(crate) fn new(operation: Operation, store: &Store) -> Self {
        Self {
            operation,
            store: store.downgrade(),
            state: Mutex::new(ExecutorState::default()),
        }
    }

    pub(crate) fn run(self: &Arc<Self>, store: &Store, params: Vec<Value>) {
        let lane = self.operation.inner.options.lane(store.effect_max_wait());
        let executor = Arc::clone(self);
        store
            .scheduler()
            .schedule(lane, Box::new(move || executor.execute(params)));
    }

    fn execute(&self, params: Vec<Value>) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            if state.running {
                state.queued.push_back(params);
                return;
            }
            state.running = true;
        }

        let mut next = Some(params);
        while let Some(params) = next {
            self.execute_claimed(params);
            let mut state = self.state.lock();
            next = if state.destroyed { None } else { state.queued.pop_front() };
            if next.is_none() {
                state.running = false;
                state.queued.clear();
            }
        }
    }

    /// One invocation, with `running` held by the caller.
    fn execute_claimed(&self, params: Vec<Value>) {
        let name = self.operation.name();
        let Some(store) = self.store.upgrade() else {
            tracing::warn!(operation = %name, "operation ran after its store was dropped, ignoring");
            return;
        };
        if store.is_destroyed() {
            tracing::warn!(store = %store.name(), operation = %name, "operation ran after its store was destroyed, ignoring");
            return;
        }

        let (previous, invocation) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.invocations += 1;
            (state.current.take(), state.invocations)
        };
        if let Some(previous) = previous {
            previous.flush();
        }

        let label = format!("operation:{}", name);
        let run = Arc::new(RunInstance::new(&label, DerivativeStore::new(&label, &store)));
        {
            let mut state = self.state.lock();
            if state.destroyed {
                drop(state);
                run.flush();
                return;
            }
            state.current = Some(Arc::clone(&run));
        }

        tracing::debug!(store = %store.name(), operation = %name, invocation, "running operation");
        emit(store.logger(), || LogRecord::Operation {
            store: store.name().to_string(),
            operation: name.to_string(),
            invocation,
        });

        let ctx = OperationContext { run, invocation };
        let outcome = {
            let _guard = RunContext::enter(self.operation.token(), &label);
            panic::catch_unwind(AssertUnwindSafe(|| (self.operation.inner.callback)(&ctx, &params)))
        };

        match outcome {
            Ok(Ok(OperationOutcome::Complete)) => {}
            Ok(Ok(OperationOutcome::Pending(future))) => {
                let weak = self.store.clone();
                store.scheduler().spawn(Box::pin(async move {
                    if let Err(err) = future.await {
                        match weak.upgrade() {
                            Some(store) => store.report_error(&label, &err),
                            None => tracing::error!(source = %label, error = %err, "operation failed"),
                        }
                    }
                }));
            }
            Ok(Err(err)) => store.report_error(&label, &err),
            Err(payload) => store.report_error(&label, &panic_message(payload.as_ref())),
        }
    }

    /// Flush the last invocation and refuse new ones.
    pub(crate) fn destroy(&self) {
        let current = {
            let mut state = self.state.lock();
            state.destroyed = true;
            state.queued.clear();
            state.current.take()
        };
        if let Some(run) = current {
            run.flush();
        }
    }
}

/// What an operation callback receives. Clone it into the returned future
/// to dispatch or register cleanups after the first await.
#[derive(Clone)]
pub struct OperationContext {
    run: Arc<RunInstance>,
    invocation: u64,
}

impl OperationContext {
    /// The store for this invocation. Destroyed when the next invocation
    /// starts or the root store is destroyed.
    pub fn store(&self) -> &DerivativeStore {
        self.run.store()
    }

    pub fn state(&self) -> Result<StoreState> {
        self.run.store().state()
    }

    pub fn signal(&self) -> &AbortSignal {
        self.run.signal()
    }

    /// Run `cleanup` before the next invocation starts, or when the store
    /// is destroyed.
    pub fn cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.run.add_cleanup(cleanup);
    }

    /// 1 for the first invocation on this store.
    pub fn invocation(&self) -> u64 {
        self.invocation
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("run", &self.run)
            .field("invocation", &self.invocation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::ManualScheduler;
    use crate::state::{ActionRegistry, Slice};
    use crate::{record, StoreOptions};
    use std::sync::atomic::{AtomicI32, Ordering};

    fn setup() -> (Arc<ManualScheduler>, Store, Slice) {
        let registry = ActionRegistry::new();
        let a = Slice::new(&registry, "a", &[], record! { "a" => 0 });
        let scheduler = Arc::new(ManualScheduler::new());
        let store = Store::create(
            &registry,
            vec![a.clone()],
            StoreOptions::new("ops").scheduler(scheduler.clone()),
        )
        .unwrap();
        (scheduler, store, a)
    }

    #[test]
    fn executor_is_shared_per_store() {
        let (_, store, _) = setup();
        let op = Operation::new(OperationOptions::named("noop"), |_, _| Ok(OperationOutcome::Complete));

        let first = store.executor_for(&op);
        let second = store.executor_for(&op);
        assert!(Arc::ptr_eq(&first, &second));

        let other = Operation::new(OperationOptions::default(), |_, _| Ok(OperationOutcome::Complete));
        assert!(!Arc::ptr_eq(&first, &store.executor_for(&other)));
    }

    #[test]
    fn operation_dispatches_through_its_derivative_store() {
        let (scheduler, store, a) = setup();
        let set_a = a.simple_action("a").unwrap();

        let op = Operation::new(OperationOptions::named("set"), move |ctx, params| {
            ctx.store().dispatch(set_a.call([params[0].clone()]))?;
            Ok(OperationOutcome::Complete)
        });

        store.dispatch(op.call([7])).unwrap();
        assert_eq!(a.get(&store.state()).unwrap()["a"], Value::Int(0));

        scheduler.run_until_idle();
        assert_eq!(a.get(&store.state()).unwrap()["a"], Value::Int(7));
    }

    #[test]
    fn invocations_count_up_and_flush_previous() {
        let (scheduler, store, _) = setup();
        let cleanups = Arc::new(AtomicI32::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let c = cleanups.clone();
        let s = seen.clone();
        let op = Operation::new(OperationOptions::named("count"), move |ctx, _| {
            s.lock().push((ctx.invocation(), c.load(Ordering::SeqCst)));
            let c = c.clone();
            ctx.cleanup(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            Ok(OperationOutcome::Complete)
        });

        for _ in 0..3 {
            store.dispatch(op.invoke()).unwrap();
        }
        scheduler.run_until_idle();

        assert_eq!(*seen.lock(), vec![(1, 0), (2, 1), (3, 2)]);

        store.destroy();
        assert_eq!(cleanups.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failing_future_is_reported() {
        let (scheduler, store, _) = setup();
        let ran = Arc::new(AtomicI32::new(0));
        let r = ran.clone();

        let op = Operation::new(OperationOptions::named("async"), move |_, _| {
            let r = r.clone();
            Ok(OperationOutcome::future(async move {
                r.fetch_add(1, Ordering::SeqCst);
                Err::<(), BoxError>("disk full".into())
            }))
        });

        store.dispatch(op.invoke()).unwrap();
        scheduler.run_until_idle();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_futures(), 0);
    }

    #[test]
    fn destroyed_store_ignores_operations() {
        let (scheduler, store, _) = setup();
        let ran = Arc::new(AtomicI32::new(0));
        let r = ran.clone();
        let op = Operation::new(OperationOptions::default(), move |_, _| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(OperationOutcome::Complete)
        });

        store.destroy();
        store.dispatch(op.invoke()).unwrap();
        scheduler.run_until_idle();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
