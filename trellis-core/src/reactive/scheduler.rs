//! Effect and Operation Scheduling
//!
//! Dispatch is synchronous; effects and operations are not. They are handed
//! to a [`Scheduler`] on one of two lanes:
//!
//! - [`Lane::Sync`]: run on the next turn, before any deferred work.
//! - [`Lane::Deferred`]: run when the scheduler is otherwise idle, but no
//!   later than `max_wait` after being scheduled.
//!
//! # Implementations
//!
//! [`TokioScheduler`] maps both lanes onto a Tokio runtime. The deferred
//! lane yields to the runtime a few times (so already-ready tasks go first)
//! and races that against a `max_wait` timer.
//!
//! [`ManualScheduler`] queues everything until the embedder drains it. It
//! is deterministic, which makes it the scheduler of choice for tests and
//! for hosts that own their event loop.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::task::noop_waker_ref;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::error::{Result, StoreError};

/// A unit of scheduled work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Priority lane for scheduled work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Next turn.
    Sync,
    /// When idle, bounded by `max_wait`.
    Deferred { max_wait: Duration },
}

impl Lane {
    pub fn new(deferred: bool, max_wait: Duration) -> Self {
        if deferred {
            Lane::Deferred { max_wait }
        } else {
            Lane::Sync
        }
    }
}

/// Pluggable two-lane scheduler.
pub trait Scheduler: Send + Sync {
    /// Queue `task` on `lane`. Must never run `task` before returning.
    fn schedule(&self, lane: Lane, task: Task);

    /// Drive a future to completion in the background.
    fn spawn(&self, future: BoxFuture<'static, ()>);
}

/// Number of runtime yields that stand in for "the runtime is idle".
const IDLE_YIELDS: usize = 4;

/// Scheduler backed by a Tokio runtime handle.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| StoreError::SchedulerUnavailable)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, lane: Lane, task: Task) {
        match lane {
            Lane::Sync => {
                self.handle.spawn(async move { task() });
            }
            Lane::Deferred { max_wait } => {
                self.handle.spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(max_wait) => {}
                        _ = idle() => {}
                    }
                    task()
                });
            }
        }
    }

    fn spawn(&self, future: BoxFuture<'static, ()>) {
        self.handle.spawn(future);
    }
}

async fn idle() {
    for _ in 0..IDLE_YIELDS {
        tokio::task::yield_now().await;
    }
}

/// Deterministic scheduler drained explicitly by the caller.
#[derive(Default)]
pub struct ManualScheduler {
    sync: Mutex<VecDeque<Task>>,
    deferred: Mutex<VecDeque<Task>>,
    futures: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run sync-lane tasks until the lane is empty, including tasks queued
    /// while draining. Returns how many ran.
    pub fn run_sync(&self) -> usize {
        let mut ran = 0;
        loop {
            // the lock must be released before the task runs
            let next = self.sync.lock().pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Run the deferred tasks queued so far, draining the sync lane after
    /// each one. Returns how many tasks ran on either lane.
    pub fn run_deferred(&self) -> usize {
        let batch: Vec<Task> = self.deferred.lock().drain(..).collect();
        let mut ran = 0;
        for task in batch {
            task();
            ran += 1 + self.run_sync();
        }
        ran
    }

    /// Poll every spawned future once. Returns how many completed.
    pub fn poll_futures(&self) -> usize {
        let mut futures = std::mem::take(&mut *self.futures.lock());
        let mut cx = Context::from_waker(noop_waker_ref());
        let before = futures.len();
        futures.retain_mut(|future| matches!(future.as_mut().poll(&mut cx), Poll::Pending));
        let completed = before - futures.len();

        // futures spawned while polling were queued behind our backs
        self.futures.lock().extend(futures);
        completed
    }

    /// Drain both lanes and poll futures until nothing makes progress.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let ran = self.run_sync() + self.poll_futures() + self.run_deferred();
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }

    /// Tasks queued on either lane.
    pub fn pending(&self) -> usize {
        self.sync.lock().len() + self.deferred.lock().len()
    }

    /// Spawned futures that have not completed.
    pub fn pending_futures(&self) -> usize {
        self.futures.lock().len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, lane: Lane, task: Task) {
        match lane {
            Lane::Sync => self.sync.lock().push_back(task),
            Lane::Deferred { .. } => self.deferred.lock().push_back(task),
        }
    }

    fn spawn(&self, future: BoxFuture<'static, ()>) {
        self.futures.lock().push(future);
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("sync", &self.sync.lock().len())
            .field("deferred", &self.deferred.lock().len())
            .field("futures", &self.futures.lock().len())
            .finish()
    }
}
