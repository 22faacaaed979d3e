//! State Model
//!
//! Slices, snapshots, actions and transactions.
//!
//! # Concepts
//!
//! ## Slices
//!
//! A [`Slice`] is a named partition of global state with explicit
//! dependencies on other slices. It may derive extra fields with selectors.
//!
//! ## Snapshots
//!
//! A [`StoreState`] is an immutable snapshot of every slice. Applying a
//! [`Transaction`] yields a new snapshot that shares untouched records.
//!
//! ## Actions
//!
//! An [`Action`] is a registered (slice, callback) pair. Calling it produces
//! a one-step transaction; transactions from different slices can be
//! appended and applied atomically.

mod action;
mod selector;
mod slice;
mod store_state;
mod transaction;

pub use action::{
    Action, ActionCallback, ActionRegistry, RegisteredAction, SliceUpdate, TxBuilder, TxContext,
};
pub use selector::{EqualFn, Selector, SelectorContext, SelectorFn, StoreStateKey};
pub use slice::{Slice, SliceBuilder, UpdateOptions};
pub use store_state::{ResolveOptions, SliceSet, StoreState};
pub use transaction::{Step, Transaction, TxMetadata};
