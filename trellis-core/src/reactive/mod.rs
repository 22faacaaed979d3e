//! Reactive Machinery
//!
//! This module implements what happens after a dispatch: deciding which
//! effects care, scheduling them, and running them with cleanup semantics.
//!
//! # Concepts
//!
//! ## Effects
//!
//! An [`Effect`] is a computation over store state. It reads slices through
//! [`Tracked`] views, so it knows exactly which fields it depends on, and it
//! re-runs only when one of those fields changes.
//!
//! ## Runs
//!
//! Each execution of an effect or operation owns a [`RunInstance`] holding
//! its cleanups and its derivative store. A run is flushed exactly once,
//! before the next run starts or when its owner is destroyed.
//!
//! ## Scheduling
//!
//! Effects and operations never run inline with a dispatch. They are handed
//! to a [`Scheduler`] on the sync lane (next tick) or the deferred lane
//! (when idle, bounded by a maximum wait).
//!
//! # Implementation Notes
//!
//! Field reads are recorded explicitly through the accessor returned by
//! `track`, and a thread-local [`RunContext`] records which run is on the
//! stack, for re-entrancy checks and dispatch labels.

mod context;
mod effect;
mod manager;
mod run;
mod scheduler;
mod tracked;

pub use context::RunContext;
pub use effect::{Effect, EffectCallback, EffectContext};
pub use manager::EffectManager;
pub use run::RunInstance;
pub(crate) use run::panic_message;
pub use scheduler::{Lane, ManualScheduler, Scheduler, Task, TokioScheduler};
pub use tracked::{Tracked, TrackedFields};
