// SPDX-License-Identifier: Apache-2.0
//! Reference tracked state type, written the way a generator would.
//!
//! [`PlayerState`] exercises every corner of the trackable contract:
//! scalar fields with dirty-marking setters, an identity-keyed
//! struct array, a string-keyed map, and the fast-encode path for
//! scalars. Real projects generate types like this one; the runtime
//! sees only the [`Trackable`] surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::changeset::{ChangeOp, ChangeSet};
use crate::encoder::Encoder;
use crate::field::FieldKind;
use crate::schema::{Schema, SchemaRegistry};
use crate::trackable::{FastEncode, Trackable};
use crate::value::Value;

/// One inventory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Inventory slot number.
    pub slot: u8,
    /// Item kind tag.
    pub kind: String,
    /// Stack count.
    pub count: u64,
}

impl Item {
    fn to_value(&self) -> Value {
        Value::Struct(Some(vec![
            Value::U8(self.slot),
            Value::Str(self.kind.clone()),
            Value::U64(self.count),
        ]))
    }
}

/// Field indices of [`PlayerState`]'s schema.
mod field_index {
    pub const ID: u8 = 0;
    pub const NAME: u8 = 1;
    pub const SCORE: u8 = 2;
    pub const INVENTORY: u8 = 3;
    pub const STATS: u8 = 4;
    pub const LAST_SEEN: u8 = 5;
}

/// Registers the demo schemas and returns the player schema.
///
/// Safe to call once per registry; repeated calls re-register under
/// the same names (latest wins).
pub fn register_schemas(registry: &mut SchemaRegistry) -> Arc<Schema> {
    #[allow(clippy::unwrap_used)] // literal schema, validated by tests
    let item = registry.register(
        Schema::builder("Item")
            .scalar("slot", FieldKind::U8)
            .scalar("kind", FieldKind::Str)
            .scalar("count", FieldKind::VarUint)
            .build()
            .unwrap(),
    );
    #[allow(clippy::unwrap_used)] // literal schema, validated by tests
    let player = registry.register(
        Schema::builder("Player")
            .scalar("id", FieldKind::U64)
            .scalar("name", FieldKind::Str)
            .scalar("score", FieldKind::VarInt)
            .struct_array("inventory", item)
            .map("stats", FieldKind::I64)
            .scalar("last_seen", FieldKind::Timestamp)
            .build()
            .unwrap(),
    );
    player
}

/// Demo player state with generated-style dirty-marking setters.
///
/// Clones share the change set (it sits behind `Arc`), so effect and
/// filter copies stay coupled to the base instance's tracking.
#[derive(Debug, Clone)]
pub struct PlayerState {
    schema: Arc<Schema>,
    changes: Arc<ChangeSet>,
    /// Player id.
    pub id: u64,
    /// Display name.
    pub name: String,
    /// Score (zigzag on the wire; may go negative).
    pub score: i64,
    /// Inventory, tracked incrementally by index.
    pub inventory: Vec<Item>,
    /// Named counters, tracked incrementally by key.
    pub stats: BTreeMap<String, i64>,
    /// Last activity, unix millis.
    pub last_seen: i64,
}

impl PlayerState {
    /// Creates an empty player bound to the registered schema.
    #[must_use]
    pub fn new(schema: Arc<Schema>, id: u64) -> Self {
        Self {
            schema,
            changes: Arc::new(ChangeSet::new()),
            id,
            name: String::new(),
            score: 0,
            inventory: Vec::new(),
            stats: BTreeMap::new(),
            last_seen: 0,
        }
    }

    /// Sets the display name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.changes.mark(field_index::NAME, ChangeOp::Replace);
    }

    /// Sets the score.
    pub fn set_score(&mut self, score: i64) {
        self.score = score;
        self.changes.mark(field_index::SCORE, ChangeOp::Replace);
    }

    /// Sets the last-activity timestamp.
    pub fn set_last_seen(&mut self, millis: i64) {
        self.last_seen = millis;
        self.changes.mark(field_index::LAST_SEEN, ChangeOp::Replace);
    }

    /// Appends an inventory item.
    pub fn add_item(&mut self, item: Item) {
        let index = self.inventory.len() as u64;
        self.changes
            .get_or_create_array(field_index::INVENTORY)
            .mark_add(index, item.to_value());
        self.inventory.push(item);
    }

    /// Replaces the item at `index`; out-of-range is ignored.
    pub fn replace_item(&mut self, index: usize, item: Item) {
        if index >= self.inventory.len() {
            return;
        }
        self.changes
            .get_or_create_array(field_index::INVENTORY)
            .mark_replace(index as u64, item.to_value());
        self.inventory[index] = item;
    }

    /// Removes the item at `index`; out-of-range is ignored.
    pub fn remove_item(&mut self, index: usize) {
        if index >= self.inventory.len() {
            return;
        }
        self.inventory.remove(index);
        self.changes
            .get_or_create_array(field_index::INVENTORY)
            .mark_remove(index as u64);
    }

    /// Sets a stat counter, recording Add or Replace by presence.
    pub fn set_stat(&mut self, key: impl Into<String>, value: i64) {
        let key = key.into();
        let log = self.changes.get_or_create_map(field_index::STATS);
        if self.stats.insert(key.clone(), value).is_some() {
            log.mark_replace(key, Value::I64(value));
        } else {
            log.mark_add(key, Value::I64(value));
        }
    }

    /// Removes a stat counter; a miss is ignored.
    pub fn remove_stat(&mut self, key: &str) {
        if self.stats.remove(key).is_some() {
            self.changes
                .get_or_create_map(field_index::STATS)
                .mark_remove(key);
        }
    }
}

impl Trackable for PlayerState {
    fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    fn field_value(&self, index: u8) -> Option<Value> {
        match index {
            field_index::ID => Some(Value::U64(self.id)),
            field_index::NAME => Some(Value::Str(self.name.clone())),
            field_index::SCORE => Some(Value::I64(self.score)),
            field_index::INVENTORY => Some(Value::Array(
                self.inventory.iter().map(Item::to_value).collect(),
            )),
            field_index::STATS => Some(Value::Map(
                self.stats
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::I64(*v)))
                    .collect(),
            )),
            field_index::LAST_SEEN => Some(Value::Timestamp(self.last_seen)),
            _ => None,
        }
    }

    fn as_fast_encode(&self) -> Option<&dyn FastEncode> {
        Some(self)
    }
}

impl FastEncode for PlayerState {
    fn encode_field(&self, index: u8, enc: &mut Encoder) -> bool {
        match index {
            field_index::ID => enc.write_u64(self.id),
            field_index::NAME => enc.write_str(&self.name),
            field_index::SCORE => enc.write_varint(self.score),
            field_index::LAST_SEEN => enc.write_timestamp(self.last_seen),
            // Collections take the boxed path.
            _ => return false,
        }
        true
    }
}
