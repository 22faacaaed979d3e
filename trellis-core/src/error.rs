//! Error types for trellis-core
//!
//! Construction and registry errors are returned synchronously to the
//! caller. Failures inside effect and operation callbacks never surface
//! here: they are caught at the scheduler boundary and reported through
//! `tracing` and the store's debug hook.

use thiserror::Error;

use crate::id::{ActionId, SliceId};

/// Boxed error returned by user effect and operation callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Core error type
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("slice {slice} lists dependency {dependency} more than once")]
    DuplicateDependency { slice: SliceId, dependency: SliceId },

    #[error("duplicate slice id {0}")]
    DuplicateSliceId(SliceId),

    #[error("slice {slice} depends on {dependency}, which is registered after this slice")]
    DependencyOrder { slice: SliceId, dependency: SliceId },

    #[error("slice {slice} depends on {dependency}, which is not registered in this store")]
    MissingDependency { slice: SliceId, dependency: SliceId },

    #[error("circular dependency detected: {}", format_cycle(.path))]
    DependencyCycle { path: Vec<SliceId> },

    #[error("state override names slice {0}, which is not registered in this store")]
    UnknownOverride(SliceId),

    #[error("slice {0} was declared against a different action registry")]
    ForeignSlice(SliceId),

    #[error("action {0} is not registered; was the slice re-declared without its actions?")]
    UnknownAction(ActionId),

    #[error("action id {0} is already registered")]
    DuplicateAction(ActionId),

    #[error("slice {0} is not part of this store state")]
    UnknownSlice(SliceId),

    #[error("transaction {0} was already applied and cannot be applied again")]
    TransactionDestroyed(u64),

    #[error("index {index} is out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("slice {slice} read {dependency} without declaring it as a dependency")]
    UndeclaredDependency { slice: SliceId, dependency: SliceId },

    #[error("store {0} has been destroyed")]
    StoreDestroyed(String),

    #[error("derivative store {0} has been destroyed")]
    DerivativeStoreDestroyed(String),

    #[error("no scheduler was provided and no Tokio runtime is running")]
    SchedulerUnavailable,

    #[error("failed to encode transaction: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode transaction: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("invalid store config: {0}")]
    Config(#[from] serde_json::Error),
}

fn format_cycle(path: &[SliceId]) -> String {
    path.iter()
        .map(SliceId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StoreError>;
