//! Trellis Core
//!
//! This crate provides the state runtime of the Trellis application shell.
//! It implements:
//!
//! - Immutable, structurally shared global state partitioned into slices
//! - Transactional updates through registered actions
//! - Effects that re-run only when the exact fields they read change
//! - Operations for imperative, serialized async work with cleanups
//! - Store-scoped refs
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `state`: slices, snapshots, actions, transactions and selectors
//! - `graph`: slice dependency validation and reverse dependencies
//! - `reactive`: effects, run instances, tracking and scheduling
//! - `store`: the root store, derivative stores and abort signals
//! - `operation`, `store_ref`: operations and refs
//! - `config`, `debug`, `error`: the ambient pieces
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::{record, ActionRegistry, ManualScheduler, Slice, Store, StoreOptions};
//!
//! let registry = ActionRegistry::new();
//! let counter = Slice::new(&registry, "counter", &[], record! { "count" => 0 });
//! let increment = counter.action("increment", |_| {
//!     TxBuilder::new(|ctx| {
//!         let count = ctx.current()["count"].as_int().unwrap_or(0);
//!         Ok(ctx.update(record! { "count" => count + 1 }))
//!     })
//! })?;
//!
//! let scheduler = Arc::new(ManualScheduler::new());
//! let store = Store::create(
//!     &registry,
//!     vec![counter.clone()],
//!     StoreOptions::new("app").scheduler(scheduler.clone()),
//! )?;
//!
//! store.effect("log", move |ctx| {
//!     println!("count: {}", ctx.track(&counter)?.get("count"));
//!     Ok(())
//! });
//!
//! store.dispatch(increment.invoke())?;
//! scheduler.run_until_idle();
//! // prints "count: 1"
//! ```

pub mod config;
pub mod debug;
pub mod error;
pub mod graph;
pub mod id;
pub mod operation;
pub mod reactive;
pub mod state;
pub mod store;
pub mod store_ref;
pub mod value;

pub use config::{EffectOptions, OperationOptions, StoreConfig, StoreOptions, DEFAULT_MAX_WAIT};
pub use debug::{tracing_logger, DebugLogger, LogRecord};
pub use error::{BoxError, Result, StoreError};
pub use id::{ActionId, IdGenerator, SliceId, Token};
pub use operation::{Operation, OperationCall, OperationContext, OperationOutcome};
pub use reactive::{
    Effect, EffectContext, Lane, ManualScheduler, Scheduler, TokioScheduler, Tracked,
};
pub use state::{
    Action, ActionRegistry, ResolveOptions, Slice, SliceBuilder, SliceUpdate, StoreState, Transaction,
    TxBuilder, TxContext, UpdateOptions,
};
pub use store::{AbortSignal, DerivativeStore, Dispatch, DispatchOptions, Store, WeakStore};
pub use store_ref::{StoreHandle, StoreRef, StoreRefDef};
pub use value::{Record, Value};
