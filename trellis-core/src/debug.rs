//! Debug records for devtools.
//!
//! Every store logs through `tracing`. A store created with a debug logger
//! additionally hands a structured [`LogRecord`] to that logger for every
//! transaction, operation dispatch, effect run and callback failure.
//! Records serialize with serde, so a devtools bridge can forward them as
//! JSON without knowing anything about the store.

use std::sync::Arc;

use serde::Serialize;

use crate::id::SliceId;
use crate::state::Step;

/// One debug event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogRecord {
    Transaction {
        store: String,
        tx: u64,
        dispatcher: Option<String>,
        debug_info: Option<String>,
        steps: Vec<Step>,
        changed: Vec<SliceId>,
    },
    Operation {
        store: String,
        operation: String,
        invocation: u64,
    },
    Effect {
        store: String,
        effect: String,
        run: u64,
        /// `slice.field` that triggered the run; `None` on the first run.
        changed: Option<String>,
    },
    Error {
        store: String,
        source: String,
        message: String,
    },
}

impl LogRecord {
    pub fn store(&self) -> &str {
        match self {
            LogRecord::Transaction { store, .. }
            | LogRecord::Operation { store, .. }
            | LogRecord::Effect { store, .. }
            | LogRecord::Error { store, .. } => store,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Callback receiving every [`LogRecord`] of a store.
pub type DebugLogger = Arc<dyn Fn(&LogRecord) + Send + Sync>;

/// A logger that forwards records to `tracing` at debug level.
pub fn tracing_logger() -> DebugLogger {
    Arc::new(|record: &LogRecord| {
        tracing::debug!(target: "trellis::devtools", store = record.store(), record = ?record);
    })
}

pub(crate) fn emit(logger: Option<&DebugLogger>, record: impl FnOnce() -> LogRecord) {
    if let Some(logger) = logger {
        logger(&record());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_serialize_with_a_type_tag() {
        let record = LogRecord::Effect {
            store: "main".into(),
            effect: "render".into(),
            run: 2,
            changed: Some("sl_a$.a".into()),
        };

        let json: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "effect");
        assert_eq!(json["store"], "main");
        assert_eq!(json["changed"], "sl_a$.a");
    }

    #[test]
    fn emit_is_lazy_without_logger() {
        let mut built = false;
        emit(None, || {
            built = true;
            LogRecord::Error {
                store: "main".into(),
                source: "x".into(),
                message: "y".into(),
            }
        });
        assert!(!built);
    }
}
