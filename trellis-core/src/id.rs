//! Identifiers for slices, actions, transactions and store-scoped tokens.
//!
//! Slice and action ids are human readable (`sl_counter$`,
//! `a_increment[sl_counter$]`) so that debug records and error messages can
//! be read without a lookup table. Names that collide get a numeric suffix.
//!
//! Every counter lives in an [`IdGenerator`] owned by an action registry,
//! so tests can reset it between cases instead of sharing process globals.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Unique identifier for a slice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SliceId(Arc<str>);

impl SliceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SliceId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

/// Unique identifier for a registered action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(Arc<str>);

impl ActionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

/// Opaque numeric token. Used for effects, operations, refs and stores,
/// which only need process-unique identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    /// Generate a process-unique token.
    ///
    /// Tokens are never reset: they key store-owned tables, and a reset
    /// would let a new definition alias a stale entry.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Generates slice, action and transaction ids.
#[derive(Debug, Default)]
pub struct IdGenerator {
    /// Times each base id has been handed out.
    seen: Mutex<HashMap<String, u32>>,
    transactions: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `sl_<name>$`, suffixed with a counter when the name was used before.
    pub fn slice_id(&self, name: &str) -> SliceId {
        SliceId(Arc::from(self.dedupe(format!("sl_{}$", name))))
    }

    /// `a_<hint>[<slice id>]`, suffixed with a counter on collision.
    pub fn action_id(&self, slice: &SliceId, hint: Option<&str>) -> ActionId {
        let hint = hint.filter(|h| !h.is_empty()).unwrap_or("action");
        ActionId(Arc::from(self.dedupe(format!("a_{}[{}]", hint, slice))))
    }

    pub fn transaction_id(&self) -> u64 {
        self.transactions.fetch_add(1, Ordering::Relaxed)
    }

    /// Forget every id handed out so far.
    pub fn reset(&self) {
        self.seen.lock().clear();
        self.transactions.store(0, Ordering::Relaxed);
    }

    fn dedupe(&self, base: String) -> String {
        let mut seen = self.seen.lock();
        let count = seen.entry(base.clone()).or_insert(0);
        let id = if *count == 0 {
            base
        } else {
            format!("{}{}", base, count)
        };
        *count += 1;
        id
    }
}
