//! Effect Manager
//!
//! The effect manager owns every effect registered on one store and decides
//! which of them to wake up after a dispatch.
//!
//! # How It Works
//!
//! 1. `register` adds the effect and schedules its first run.
//!
//! 2. After a transaction, the store hands over the slices whose records
//!    changed. The manager widens that set with every slice that depends on
//!    them (transitively), because a dependent's derived fields may read the
//!    changed slice.
//!
//! 3. Each effect gets the widened set and decides on its own whether to
//!    schedule a run. Effects only schedule here; they never run inline, so
//!    one effect's failure cannot keep the others from being asked.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::effect::Effect;
use crate::id::{SliceId, Token};
use crate::state::SliceSet;

/// All effects of one store.
pub struct EffectManager {
    slices: Arc<SliceSet>,
    effects: RwLock<IndexMap<Token, Effect>>,
    destroyed: AtomicBool,
}

impl EffectManager {
    pub fn new(slices: Arc<SliceSet>) -> Self {
        Self {
            slices,
            effects: RwLock::new(IndexMap::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Add an effect and schedule its first run.
    ///
    /// Registering on a destroyed manager destroys the effect instead.
    pub fn register(&self, effect: Effect) {
        if self.destroyed.load(Ordering::SeqCst) {
            tracing::warn!(effect = %effect.name(), "effect registered after the store was destroyed");
            effect.destroy();
            return;
        }

        self.effects.write().insert(effect.token(), effect.clone());
        effect.schedule_first_run();
    }

    /// Remove and destroy an effect. Returns whether it was registered.
    pub fn unregister(&self, effect: &Effect) -> bool {
        let removed = self.effects.write().shift_remove(&effect.token());
        match removed {
            Some(effect) => {
                effect.destroy();
                true
            }
            None => false,
        }
    }

    /// Re-evaluate effects.
    ///
    /// With `changed`, each effect sees those slices plus their transitive
    /// dependents. Without it every effect re-evaluates. Returns how many
    /// runs were scheduled.
    pub fn run(&self, changed: Option<&[SliceId]>) -> usize {
        if self.destroyed.load(Ordering::SeqCst) {
            return 0;
        }

        let affected = changed.map(|changed| self.slices.reverse_dependencies().closure(changed));

        // scheduling may re-enter register/unregister through the scheduler
        let effects: Vec<Effect> = self.effects.read().values().cloned().collect();
        let scheduled = effects
            .iter()
            .filter(|effect| effect.run(affected.as_ref()))
            .count();

        tracing::trace!(effects = effects.len(), scheduled, "evaluated effects");
        scheduled
    }

    /// Destroy every effect. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let effects: Vec<Effect> = self.effects.write().drain(..).map(|(_, effect)| effect).collect();
        for effect in effects {
            effect.destroy();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.effects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.read().is_empty()
    }

    pub fn effects(&self) -> Vec<Effect> {
        self.effects.read().values().cloned().collect()
    }
}

impl fmt::Debug for EffectManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectManager")
            .field("slices", &self.slices.len())
            .field("effects", &self.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
