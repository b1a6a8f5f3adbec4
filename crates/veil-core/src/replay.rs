// SPDX-License-Identifier: Apache-2.0
//! Server-side replay: apply decoded messages to a generic state image.
//!
//! Real clients apply patches to their native structures; this module
//! is the tooling path. A [`MapState`] is a map-of-fields image of
//! one state instance, [`apply_patch`] / [`apply_full`] mutate it
//! from decoder output, and a [`MapReplayer`] replays recorded
//! [`DiffRecord`] streams for inspection and correctness checks.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::changeset::ChangeOp;
use crate::decoder::{
    ArrayEntry, CollectionDelta, DecodedMessage, DecodedPatch, DecodedState, Decoder, MapEntry,
};
use crate::decoder::DecodeError;
use crate::schema::{Schema, SchemaRegistry};
use crate::value::Value;

/// Map-of-fields image of one state instance, keyed by field name.
pub type MapState = BTreeMap<String, Value>;

/// Applies a decoded patch to a state image.
///
/// Replace and Add overwrite the named slot; Remove deletes the array
/// index or map key; Move relocates an element by its prior index.
/// Absent target collections are created on first touch.
pub fn apply_patch(state: &mut MapState, patch: &DecodedPatch, schema: &Schema) {
    for change in &patch.changes {
        let Some(meta) = schema.field(change.index) else {
            continue;
        };
        if let Some(delta) = &change.delta {
            apply_collection(state, &meta.name, delta);
            continue;
        }
        match change.op {
            ChangeOp::Remove => {
                state.remove(&meta.name);
            }
            _ => {
                if let Some(value) = &change.value {
                    state.insert(meta.name.clone(), value.clone());
                }
            }
        }
    }
}

/// Rebuilds a state image from a decoded full-state message.
pub fn apply_full(state: &mut MapState, full: &DecodedState, schema: &Schema) {
    state.clear();
    for (index, value) in full.fields.iter().enumerate() {
        if let Some(meta) = schema.field(index as u8) {
            state.insert(meta.name.clone(), value.clone());
        }
    }
}

fn apply_collection(state: &mut MapState, field: &str, delta: &CollectionDelta) {
    match delta {
        CollectionDelta::FullArray(items) => {
            state.insert(field.to_owned(), Value::Array(items.clone()));
        }
        CollectionDelta::FullMap(entries) => {
            state.insert(field.to_owned(), Value::Map(entries.clone()));
        }
        CollectionDelta::Array(entries) => {
            let slot = state
                .entry(field.to_owned())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = slot {
                for entry in entries {
                    apply_array_entry(items, entry);
                }
            }
        }
        CollectionDelta::Map(entries) => {
            let slot = state
                .entry(field.to_owned())
                .or_insert_with(|| Value::Map(BTreeMap::new()));
            if let Value::Map(map) = slot {
                for entry in entries {
                    apply_map_entry(map, entry);
                }
            }
        }
    }
}

fn apply_array_entry(items: &mut Vec<Value>, entry: &ArrayEntry) {
    let index = entry.index as usize;
    match entry.op {
        ChangeOp::Add => {
            let Some(value) = entry.value.clone() else {
                return;
            };
            if index >= items.len() {
                items.push(value);
            } else {
                items.insert(index, value);
            }
        }
        ChangeOp::Replace => {
            let Some(value) = entry.value.clone() else {
                return;
            };
            if index >= items.len() {
                items.push(value);
            } else {
                items[index] = value;
            }
        }
        ChangeOp::Remove => {
            if index < items.len() {
                items.remove(index);
            }
        }
        ChangeOp::Move => {
            let Some(prior) = entry.prior_index.map(|p| p as usize) else {
                return;
            };
            if prior < items.len() {
                let value = items.remove(prior);
                let target = index.min(items.len());
                items.insert(target, value);
            }
        }
        ChangeOp::None => {}
    }
}

fn apply_map_entry(map: &mut BTreeMap<String, Value>, entry: &MapEntry) {
    match entry.op {
        ChangeOp::Add | ChangeOp::Replace => {
            if let Some(value) = entry.value.clone() {
                map.insert(entry.key.clone(), value);
            }
        }
        ChangeOp::Remove => {
            map.remove(&entry.key);
        }
        ChangeOp::Move | ChangeOp::None => {}
    }
}

/// One recorded tick on a replay stream. JSON-marshallable for
/// offline storage; `data` is the raw encoded message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRecord {
    /// Sequence number minted by the tick.
    pub seq: u64,
    /// Tick counter of the producing loop.
    pub tick: u64,
    /// Wall-clock unix millis at capture.
    pub timestamp_ms: i64,
    /// Producer tag (server name, room id).
    pub source: String,
    /// Raw encoded patch or full-state message.
    pub data: Vec<u8>,
    /// Raw encoded event messages emitted in the same tick.
    pub events: Vec<Vec<u8>>,
    /// Nanoseconds elapsed since the previous record.
    pub delta_ns: u64,
}

/// Replays [`DiffRecord`] streams into per-schema state images.
#[derive(Debug)]
pub struct MapReplayer {
    decoder: Decoder,
    registry: Arc<SchemaRegistry>,
    states: BTreeMap<u16, MapState>,
}

impl MapReplayer {
    /// Creates a replayer resolving schemas through `registry`.
    #[must_use]
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            decoder: Decoder::new(Arc::clone(&registry)),
            registry,
            states: BTreeMap::new(),
        }
    }

    /// Decodes and applies one record.
    ///
    /// Full-state messages reset the schema's image; patch batches
    /// apply in order; event records carry no state and are skipped.
    ///
    /// # Errors
    /// Any [`DecodeError`] from the record's `data`.
    pub fn replay(&mut self, record: &DiffRecord) -> Result<(), DecodeError> {
        match self.decoder.decode(&record.data)? {
            DecodedMessage::Full(full) => {
                if let Some(schema) = self.registry.get(full.schema_id).map(Arc::clone) {
                    let state = self.states.entry(full.schema_id).or_default();
                    apply_full(state, &full, &schema);
                }
            }
            DecodedMessage::Patch(patch) => self.apply(&patch),
            DecodedMessage::PatchBatch(patches) => {
                for patch in patches {
                    self.apply(&patch);
                }
            }
            DecodedMessage::Events(_) => {}
        }
        Ok(())
    }

    /// The current image for `schema_id`, if any record touched it.
    #[must_use]
    pub fn state(&self, schema_id: u16) -> Option<&MapState> {
        self.states.get(&schema_id)
    }

    fn apply(&mut self, patch: &DecodedPatch) {
        if let Some(schema) = self.registry.get(patch.schema_id).map(Arc::clone) {
            let state = self.states.entry(patch.schema_id).or_default();
            apply_patch(state, patch, &schema);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::decoder::DecodedChange;
    use crate::field::FieldKind;

    fn schema() -> Schema {
        Schema::builder("S")
            .id(1)
            .scalar("score", FieldKind::I32)
            .array("items", FieldKind::I32)
            .map("stats", FieldKind::I64)
            .build()
            .unwrap()
    }

    fn change(index: u8, op: ChangeOp, value: Option<Value>) -> DecodedChange {
        DecodedChange {
            index,
            op,
            value,
            delta: None,
        }
    }

    #[test]
    fn scalar_replace_and_remove() {
        let schema = schema();
        let mut state = MapState::new();
        apply_patch(
            &mut state,
            &DecodedPatch {
                schema_id: 1,
                changes: vec![change(0, ChangeOp::Replace, Some(Value::I32(42)))],
            },
            &schema,
        );
        assert_eq!(state.get("score"), Some(&Value::I32(42)));

        apply_patch(
            &mut state,
            &DecodedPatch {
                schema_id: 1,
                changes: vec![change(0, ChangeOp::Remove, None)],
            },
            &schema,
        );
        assert!(state.get("score").is_none());
    }

    #[test]
    fn array_entries_create_and_mutate_collection() {
        let schema = schema();
        let mut state = MapState::new();
        let delta = CollectionDelta::Array(vec![
            ArrayEntry {
                index: 0,
                op: ChangeOp::Add,
                value: Some(Value::I32(10)),
                prior_index: None,
            },
            ArrayEntry {
                index: 1,
                op: ChangeOp::Add,
                value: Some(Value::I32(20)),
                prior_index: None,
            },
        ]);
        apply_patch(
            &mut state,
            &DecodedPatch {
                schema_id: 1,
                changes: vec![DecodedChange {
                    index: 1,
                    op: ChangeOp::Replace,
                    value: None,
                    delta: Some(delta),
                }],
            },
            &schema,
        );
        assert_eq!(
            state.get("items"),
            Some(&Value::Array(vec![Value::I32(10), Value::I32(20)]))
        );

        // Remove index 0, then move the remaining element is a no-op.
        let delta = CollectionDelta::Array(vec![ArrayEntry {
            index: 0,
            op: ChangeOp::Remove,
            value: None,
            prior_index: None,
        }]);
        apply_patch(
            &mut state,
            &DecodedPatch {
                schema_id: 1,
                changes: vec![DecodedChange {
                    index: 1,
                    op: ChangeOp::Replace,
                    value: None,
                    delta: Some(delta),
                }],
            },
            &schema,
        );
        assert_eq!(state.get("items"), Some(&Value::Array(vec![Value::I32(20)])));
    }

    #[test]
    fn move_relocates_by_prior_index() {
        let mut items = vec![Value::I32(1), Value::I32(2), Value::I32(3)];
        apply_array_entry(
            &mut items,
            &ArrayEntry {
                index: 0,
                op: ChangeOp::Move,
                value: None,
                prior_index: Some(2),
            },
        );
        assert_eq!(items, vec![Value::I32(3), Value::I32(1), Value::I32(2)]);
    }

    #[test]
    fn map_entries_apply_in_order() {
        let schema = schema();
        let mut state = MapState::new();
        let delta = CollectionDelta::Map(vec![
            MapEntry {
                key: "a".into(),
                op: ChangeOp::Remove,
                value: None,
            },
            MapEntry {
                key: "c".into(),
                op: ChangeOp::Add,
                value: Some(Value::I64(3)),
            },
        ]);
        apply_patch(
            &mut state,
            &DecodedPatch {
                schema_id: 1,
                changes: vec![DecodedChange {
                    index: 2,
                    op: ChangeOp::Replace,
                    value: None,
                    delta: Some(delta),
                }],
            },
            &schema,
        );
        let mut expected = BTreeMap::new();
        expected.insert("c".to_owned(), Value::I64(3));
        assert_eq!(state.get("stats"), Some(&Value::Map(expected)));
    }

    #[test]
    fn diff_record_round_trips_through_json() {
        let record = DiffRecord {
            seq: 7,
            tick: 7,
            timestamp_ms: 1_700_000_000_000,
            source: "room-1".into(),
            data: vec![1, 2, 3],
            events: vec![vec![0x10]],
            delta_ns: 16_000_000,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: DiffRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
