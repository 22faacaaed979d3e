//! Store, effect and operation configuration.
//!
//! [`StoreOptions`] is the programmatic builder. [`StoreConfig`] is its
//! serializable subset, for hosts that keep store settings in a JSON file:
//!
//! ```json
//! { "name": "workspace", "debug": true, "effect_max_wait_ms": 30 }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::debug::{tracing_logger, DebugLogger};
use crate::error::Result;
use crate::id::SliceId;
use crate::reactive::{Lane, Scheduler};
use crate::state::Slice;
use crate::value::Record;

/// Upper bound on how long deferred effects and operations wait for the
/// scheduler to go idle, unless configured otherwise.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(15);

/// Serializable store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub name: String,
    /// Install a `tracing`-backed debug logger.
    pub debug: bool,
    /// Leave effect evaluation to [`Store::run_effects`](crate::Store::run_effects).
    pub manual_effects_trigger: bool,
    pub effect_max_wait_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "store".to_string(),
            debug: false,
            manual_effects_trigger: false,
            effect_max_wait_ms: DEFAULT_MAX_WAIT.as_millis() as u64,
        }
    }
}

impl StoreConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn into_options(self) -> StoreOptions {
        let mut options = StoreOptions::new(&self.name)
            .manual_effects_trigger(self.manual_effects_trigger)
            .effect_max_wait(Duration::from_millis(self.effect_max_wait_ms));
        if self.debug {
            options = options.debug(tracing_logger());
        }
        options
    }
}

/// Options for [`Store::create`](crate::Store::create).
pub struct StoreOptions {
    pub(crate) name: String,
    pub(crate) logger: Option<DebugLogger>,
    pub(crate) manual_effects_trigger: bool,
    pub(crate) scheduler: Option<Arc<dyn Scheduler>>,
    pub(crate) overrides: HashMap<SliceId, Record>,
    pub(crate) effect_max_wait: Duration,
}

impl StoreOptions {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            logger: None,
            manual_effects_trigger: false,
            scheduler: None,
            overrides: HashMap::new(),
            effect_max_wait: DEFAULT_MAX_WAIT,
        }
    }

    pub fn debug(mut self, logger: DebugLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn manual_effects_trigger(mut self, manual: bool) -> Self {
        self.manual_effects_trigger = manual;
        self
    }

    /// Use `scheduler` instead of the current Tokio runtime.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Seed `slice` with `state` instead of its initial state.
    pub fn override_state(mut self, slice: &Slice, state: Record) -> Self {
        self.overrides.insert(slice.id().clone(), state);
        self
    }

    /// Default `max_wait` for deferred effects and operations.
    pub fn effect_max_wait(mut self, max_wait: Duration) -> Self {
        self.effect_max_wait = max_wait;
        self
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreConfig::default().into_options()
    }
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("name", &self.name)
            .field("debug", &self.logger.is_some())
            .field("manual_effects_trigger", &self.manual_effects_trigger)
            .field("custom_scheduler", &self.scheduler.is_some())
            .field("overrides", &self.overrides.len())
            .field("effect_max_wait", &self.effect_max_wait)
            .finish()
    }
}

/// Options for [`Store::effect_with`](crate::Store::effect_with).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectOptions {
    pub name: Option<String>,
    /// Run on the deferred lane instead of the next tick. The first run is
    /// always on the next tick.
    pub deferred: bool,
    /// Overrides the store's default `max_wait`.
    pub max_wait: Option<Duration>,
}

impl EffectOptions {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn deferred(mut self, deferred: bool) -> Self {
        self.deferred = deferred;
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub(crate) fn lane(&self, default_max_wait: Duration) -> Lane {
        Lane::new(self.deferred, self.max_wait.unwrap_or(default_max_wait))
    }
}

/// Options for [`Operation::new`](crate::Operation::new).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationOptions {
    pub name: Option<String>,
    pub deferred: bool,
    pub max_wait: Option<Duration>,
}

impl OperationOptions {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn deferred(mut self, deferred: bool) -> Self {
        self.deferred = deferred;
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub(crate) fn lane(&self, default_max_wait: Duration) -> Lane {
        Lane::new(self.deferred, self.max_wait.unwrap_or(default_max_wait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config = StoreConfig::from_json(r#"{ "name": "workspace" }"#).unwrap();

        assert_eq!(config.name, "workspace");
        assert!(!config.debug);
        assert_eq!(config.effect_max_wait_ms, 15);
    }

    #[test]
    fn config_into_options() {
        let config = StoreConfig::from_json(
            r#"{ "name": "w", "debug": true, "manual_effects_trigger": true, "effect_max_wait_ms": 40 }"#,
        )
        .unwrap();
        let options = config.into_options();

        assert_eq!(options.name, "w");
        assert!(options.logger.is_some());
        assert!(options.manual_effects_trigger);
        assert_eq!(options.effect_max_wait, Duration::from_millis(40));
    }

    #[test]
    fn invalid_config_is_an_error() {
        let err = StoreConfig::from_json("{ \"debug\": 3 }").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn lanes_follow_options() {
        let default = Duration::from_millis(15);

        assert_eq!(EffectOptions::default().lane(default), Lane::Sync);
        assert_eq!(
            EffectOptions::named("e").deferred(true).lane(default),
            Lane::Deferred { max_wait: default }
        );
        assert_eq!(
            OperationOptions::default()
                .deferred(true)
                .max_wait(Duration::from_millis(3))
                .lane(default),
            Lane::Deferred { max_wait: Duration::from_millis(3) }
        );
    }
}
