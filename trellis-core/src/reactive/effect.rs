//! Effect Implementation
//!
//! An Effect is a side-effecting computation over store state that re-runs
//! when the fields it read on its last run change.
//!
//! # How Effects Work
//!
//! 1. When registered, the effect is scheduled on the next tick. The first
//!    run always happens, whatever changed in the meantime.
//!
//! 2. While running, the callback reads state through
//!    [`EffectContext::track`]. Every field read is recorded with its value.
//!
//! 3. After a dispatch, the effect manager calls [`Effect::run`] with the
//!    changed slices. The effect schedules itself only if it tracks one of
//!    them, and only if no run is already pending.
//!
//! 4. When the scheduled run executes, it first compares every tracked
//!    field against the current state. If none differs, it stops there,
//!    without touching the previous run's cleanups.
//!
//! 5. Otherwise the previous run is flushed (cleanups, derivative store)
//!    and the callback runs again, rebuilding the tracked set from zero.
//!
//! # States
//!
//! pending-first-run, idle, pending-run, running, destroyed. Destroyed is
//! terminal: the last run is flushed once and every later request is
//! ignored.
//!
//! A run that arrives while another is running, on any thread, only marks
//! a rerun; the running one schedules it once its callback returns.

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use super::context::RunContext;
use super::run::{panic_message, RunInstance};
use super::scheduler::{Lane, Scheduler};
use super::tracked::{Tracked, TrackedFields};
use crate::debug::{emit, LogRecord};
use crate::error::{BoxError, Result};
use crate::id::{SliceId, Token};
use crate::state::{Slice, StoreState};
use crate::store::{AbortSignal, DerivativeStore, WeakStore};

/// User callback of an effect.
pub type EffectCallback = Arc<dyn Fn(&EffectContext<'_>) -> std::result::Result<(), BoxError> + Send + Sync>;

/// A registered reactive computation.
///
/// Cloning yields a handle to the same effect.
#[derive(Clone)]
pub struct Effect {
    inner: Arc<EffectInner>,
}

struct EffectInner {
    token: Token,
    name: String,
    lane: Lane,
    callback: EffectCallback,
    store: WeakStore,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<EffectState>,
}

#[derive(Default)]
struct EffectState {
    pending_run: bool,
    destroyed: bool,
    /// Held from the start of `execute` until the callback returns, on
    /// whichever thread runs it.
    running: bool,
    /// Set when a run was requested while another one was in progress.
    rerun_requested: bool,
    run_count: u64,
    tracked: TrackedFields,
    current: Option<Arc<RunInstance>>,
}

impl Effect {
    pub(crate) fn new(
        name: &str,
        lane: Lane,
        callback: EffectCallback,
        store: WeakStore,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            inner: Arc::new(EffectInner {
                token: Token::next(),
                name: name.to_string(),
                lane,
                callback,
                store,
                scheduler,
                state: Mutex::new(EffectState::default()),
            }),
        }
    }

    pub fn token(&self) -> Token {
        self.inner.token
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Completed runs.
    pub fn run_count(&self) -> u64 {
        self.inner.state.lock().run_count
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending_run
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    /// Fields read by the last completed run.
    pub fn tracked(&self) -> TrackedFields {
        self.inner.state.lock().tracked.clone()
    }

    fn label(&self) -> String {
        format!("effect:{}", self.inner.name)
    }

    /// Schedule the first run on the next tick, whatever the lane.
    pub(crate) fn schedule_first_run(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.destroyed || state.pending_run {
                return;
            }
            state.pending_run = true;
        }
        self.schedule(Lane::Sync);
    }

    /// Ask the effect to re-evaluate.
    ///
    /// With `changed`, the request is dropped when the effect has already
    /// run and tracks none of those slices. Returns whether a run was
    /// scheduled.
    pub(crate) fn run(&self, changed: Option<&HashSet<SliceId>>) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.destroyed || state.pending_run {
                return false;
            }
            if let Some(changed) = changed {
                if state.run_count > 0 && !state.tracked.intersects(changed) {
                    return false;
                }
            }
            state.pending_run = true;
        }
        self.schedule(self.inner.lane);
        true
    }

    fn schedule(&self, lane: Lane) {
        let effect = self.clone();
        self.inner.scheduler.schedule(lane, Box::new(move || effect.execute()));
    }

    fn execute(&self) {
        let (first_run, previous) = {
            let mut state = self.inner.state.lock();
            state.pending_run = false;
            if state.destroyed {
                return;
            }
            if state.running {
                state.rerun_requested = true;
                return;
            }
            state.running = true;
            (state.run_count == 0, state.current.clone())
        };

        self.execute_claimed(first_run, previous);

        let rerun = {
            let mut state = self.inner.state.lock();
            state.running = false;
            std::mem::take(&mut state.rerun_requested) && !state.destroyed
        };
        if rerun {
            self.run(None);
        }
    }

    /// One run, with `running` held by the caller.
    fn execute_claimed(&self, first_run: bool, previous: Option<Arc<RunInstance>>) {
        let Some(store) = self.inner.store.upgrade() else {
            return;
        };
        if store.is_destroyed() {
            return;
        }

        let snapshot = store.state();
        let trigger = if first_run {
            None
        } else {
            let change = self.inner.state.lock().tracked.first_change(&snapshot);
            match change {
                Some((slice, field)) => Some(format!("{}.{}", slice, field)),
                None => {
                    tracing::trace!(effect = %self.inner.name, "tracked fields unchanged, skipping run");
                    return;
                }
            }
        };

        if let Some(previous) = previous {
            previous.flush();
        }

        let label = self.label();
        let run = Arc::new(RunInstance::new(&label, DerivativeStore::new(&label, &store)));
        let run_count = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                drop(state);
                run.flush();
                return;
            }
            state.current = Some(Arc::clone(&run));
            state.run_count
        };

        tracing::debug!(
            store = %store.name(),
            effect = %self.inner.name,
            run = run_count + 1,
            changed = trigger.as_deref().unwrap_or("<first run>"),
            "running effect"
        );
        emit(store.logger(), || LogRecord::Effect {
            store: store.name().to_string(),
            effect: self.inner.name.clone(),
            run: run_count + 1,
            changed: trigger.clone(),
        });

        let ctx = EffectContext {
            run: &run,
            state: snapshot,
            run_count,
        };
        let outcome = {
            let _guard = RunContext::enter(self.inner.token, &label);
            panic::catch_unwind(AssertUnwindSafe(|| (self.inner.callback)(&ctx)))
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => store.report_error(&label, &err),
            Err(payload) => store.report_error(&label, &panic_message(payload.as_ref())),
        }

        let mut state = self.inner.state.lock();
        state.run_count += 1;
        state.tracked = run.take_tracked();
    }

    /// Flush the last run and make the effect inert. Idempotent.
    pub(crate) fn destroy(&self) {
        let current = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.pending_run = false;
            state.current.take()
        };

        if let Some(run) = current {
            run.flush();
        }
        tracing::trace!(effect = %self.inner.name, "destroyed effect");
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Effect")
            .field("name", &self.inner.name)
            .field("lane", &self.inner.lane)
            .field("run_count", &state.run_count)
            .field("pending_run", &state.pending_run)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

/// What an effect callback receives.
///
/// All reads within one run see the snapshot that was current when the run
/// started.
pub struct EffectContext<'a> {
    run: &'a RunInstance,
    state: StoreState,
    run_count: u64,
}

impl EffectContext<'_> {
    /// A read-tracking view of `slice`.
    pub fn track(&self, slice: &Slice) -> Result<Tracked<'_>> {
        let record = slice.get(&self.state)?;
        Ok(Tracked::new(slice.clone(), record, self.run.tracked()))
    }

    /// The snapshot this run reads. Reads through it are not tracked.
    pub fn state(&self) -> &StoreState {
        &self.state
    }

    /// The store to dispatch through. Destroyed when this run is superseded.
    pub fn store(&self) -> &DerivativeStore {
        self.run.store()
    }

    pub fn signal(&self) -> &AbortSignal {
        self.run.signal()
    }

    /// Run `cleanup` before the next run, or when the effect is destroyed.
    pub fn cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.run.add_cleanup(cleanup);
    }

    /// Runs completed before this one; zero on the first run.
    pub fn run_count(&self) -> u64 {
        self.run_count
    }
}
