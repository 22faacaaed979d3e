//! Field-level dependency tracking.
//!
//! An effect does not subscribe to whole slices. It asks for a [`Tracked`]
//! view of a slice and every field it reads through that view is recorded
//! together with the value it saw. On the next scheduled run the recorded
//! values are compared against the current snapshot, and the effect only
//! re-runs if one of them is no longer the same.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::id::SliceId;
use crate::state::{ResolveOptions, Slice, StoreState};
use crate::value::{Record, Value};

/// Fields read during one run, per slice, with the value first observed.
#[derive(Debug, Clone, Default)]
pub struct TrackedFields {
    fields: IndexMap<SliceId, SmallVec<[(String, Value); 4]>>,
}

impl TrackedFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read. Later reads of the same field keep the first value.
    pub fn record(&mut self, slice: &SliceId, field: &str, value: &Value) {
        let reads = self.fields.entry(slice.clone()).or_default();
        if !reads.iter().any(|(name, _)| name == field) {
            reads.push((field.to_string(), value.clone()));
        }
    }

    /// Number of distinct (slice, field) pairs.
    pub fn len(&self) -> usize {
        self.fields.values().map(SmallVec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, slice: &SliceId, field: &str) -> bool {
        self.fields
            .get(slice)
            .is_some_and(|reads| reads.iter().any(|(name, _)| name == field))
    }

    /// Whether any tracked slice is in `changed`.
    pub fn intersects(&self, changed: &HashSet<SliceId>) -> bool {
        self.fields.keys().any(|slice| changed.contains(slice))
    }

    /// The first tracked field whose current value is not the same as the
    /// recorded one. A slice that can no longer be resolved counts as
    /// changed, and a field that disappeared reads as `Null`.
    pub fn first_change(&self, state: &StoreState) -> Option<(SliceId, String)> {
        for (slice, reads) in &self.fields {
            let record = match state.resolve(slice, ResolveOptions::default()) {
                Ok(record) => record,
                Err(_) => {
                    let field = reads.first().map(|(name, _)| name.clone()).unwrap_or_default();
                    return Some((slice.clone(), field));
                }
            };

            for (field, seen) in reads {
                let now = record.get(field).unwrap_or(&Value::Null);
                if !now.is_same(seen) {
                    return Some((slice.clone(), field.clone()));
                }
            }
        }
        None
    }
}

/// Read-tracking view of one slice, returned by `EffectContext::track`.
pub struct Tracked<'a> {
    slice: Slice,
    record: Arc<Record>,
    fields: &'a Mutex<TrackedFields>,
}

impl<'a> Tracked<'a> {
    pub(crate) fn new(slice: Slice, record: Arc<Record>, fields: &'a Mutex<TrackedFields>) -> Self {
        Self { slice, record, fields }
    }

    pub fn slice(&self) -> &Slice {
        &self.slice
    }

    /// Read a field (raw or derived) and record the read. Missing fields
    /// read as `Null`.
    pub fn get(&self, field: &str) -> Value {
        let value = self.record.get(field).cloned().unwrap_or_default();
        self.fields.lock().record(self.slice.id(), field, &value);
        value
    }

    /// The whole record, without recording any read.
    pub fn untracked(&self) -> &Record {
        &self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use crate::state::ActionRegistry;
    use std::collections::HashMap;

    #[test]
    fn first_read_wins() {
        let mut fields = TrackedFields::new();
        let slice = SliceId::from("sl_a$");

        fields.record(&slice, "a", &Value::Int(1));
        fields.record(&slice, "a", &Value::Int(2));

        assert_eq!(fields.len(), 1);
        assert!(fields.contains(&slice, "a"));
        assert!(!fields.contains(&slice, "b"));
    }

    #[test]
    fn intersects_checks_slices() {
        let mut fields = TrackedFields::new();
        fields.record(&SliceId::from("sl_a$"), "a", &Value::Null);

        assert!(fields.intersects(&HashSet::from([SliceId::from("sl_a$")])));
        assert!(!fields.intersects(&HashSet::from([SliceId::from("sl_b$")])));
    }

    #[test]
    fn first_change_compares_field_values() {
        let registry = ActionRegistry::new();
        let slice = Slice::new(&registry, "a", &[], record! { "a" => 1, "b" => 1 });
        let set_b = slice.simple_action("b").unwrap();
        let set_a = slice.simple_action("a").unwrap();
        let state = StoreState::create(&registry, vec![slice.clone()], HashMap::new()).unwrap();

        let cell = Mutex::new(TrackedFields::new());
        let tracked = Tracked::new(slice.clone(), slice.get(&state).unwrap(), &cell);
        assert_eq!(tracked.get("a"), Value::Int(1));
        let fields = cell.into_inner();

        let b_changed = state.apply_transaction(&set_b.call([5])).unwrap();
        assert!(fields.first_change(&b_changed).is_none());

        let a_changed = b_changed.apply_transaction(&set_a.call([2])).unwrap();
        assert_eq!(
            fields.first_change(&a_changed),
            Some((slice.id().clone(), "a".to_string()))
        );
    }

    #[test]
    fn missing_field_reads_as_null() {
        let registry = ActionRegistry::new();
        let slice = Slice::new(&registry, "a", &[], record! {});
        let state = StoreState::create(&registry, vec![slice.clone()], HashMap::new()).unwrap();

        let cell = Mutex::new(TrackedFields::new());
        let tracked = Tracked::new(slice.clone(), slice.get(&state).unwrap(), &cell);
        assert!(tracked.get("nope").is_null());
        assert!(cell.lock().first_change(&state).is_none());
    }
}
