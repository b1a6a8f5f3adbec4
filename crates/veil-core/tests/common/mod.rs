// SPDX-License-Identifier: Apache-2.0
//! Shared fixtures: a map-backed tracked state with explicit schemas.

use std::collections::BTreeMap;
use std::sync::Arc;

use veil_core::{ChangeOp, ChangeSet, Schema, Trackable, Value};

/// Map-backed [`Trackable`] for driving the codec with arbitrary
/// schemas and values (no generated type required).
#[derive(Debug, Clone)]
pub struct DynState {
    schema: Arc<Schema>,
    changes: Arc<ChangeSet>,
    values: BTreeMap<u8, Value>,
}

impl DynState {
    /// Creates an empty state bound to `schema`.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            changes: Arc::new(ChangeSet::new()),
            values: BTreeMap::new(),
        }
    }

    /// Sets a field value and marks it replaced.
    pub fn set(&mut self, index: u8, value: Value) {
        self.values.insert(index, value);
        self.changes.mark(index, ChangeOp::Replace);
    }

    /// Sets a field value without touching the change set.
    pub fn set_silent(&mut self, index: u8, value: Value) {
        self.values.insert(index, value);
    }
}

impl Trackable for DynState {
    fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    fn field_value(&self, index: u8) -> Option<Value> {
        self.values.get(&index).cloned()
    }
}
