//! Dependency Graph
//!
//! This module implements the slice dependency graph that decides which
//! effects may care about a change.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes represent slices
//! - Edges represent dependencies: if B depends on A, B may read A's state
//!
//! When a slice changes, every slice that transitively depends on it may
//! present a different view (its derived fields read the changed slice), so
//! the effect manager widens "A changed" into "A and its dependents changed"
//! before asking effects whether to re-run.
//!
//! # Design Decisions
//!
//! 1. The graph is validated once per store and never mutated afterwards.
//!
//! 2. Dependencies must be registered before dependents. This rules out
//!    forward references and lets reverse dependencies be computed in one
//!    linear pass.

mod node;
mod validator;

pub use node::SliceNode;
pub use validator::{find_cycle, validate, ReverseDependencies};
