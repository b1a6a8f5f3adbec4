// SPDX-License-Identifier: Apache-2.0
//! Per-instance change tracking: dirty bitset plus incremental logs.
//!
//! Every tracked state object owns one [`ChangeSet`]. Scalar and
//! struct fields are tracked by a 256-bit dirty bitset with one
//! [`ChangeOp`] slot per field; array and map fields additionally
//! carry incremental logs ([`ArrayChangeSet`], [`MapChangeSet`])
//! recording per-index / per-key operations with their new values.
//!
//! Repeated marks on the same field, index, or key overwrite the
//! prior operation — the system never merges ops, the latest wins.
//!
//! Concurrency: each change set has one internal lock; nested change
//! sets have their own. Callers serialize mutation through the
//! tracked-state write lock; the locks here make reads safe from the
//! encoder path.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::value::Value;

/// Change operation, also the wire op byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ChangeOp {
    /// No operation recorded.
    #[default]
    None = 0,
    /// Element or value added.
    Add = 1,
    /// Value replaced.
    Replace = 2,
    /// Element, key, or value removed.
    Remove = 3,
    /// Array element moved from a prior index.
    Move = 4,
}

impl ChangeOp {
    /// Wire byte for this op.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Parses a wire op byte.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Add),
            2 => Some(Self::Replace),
            3 => Some(Self::Remove),
            4 => Some(Self::Move),
            _ => None,
        }
    }
}

/// Per-field change record; valid only while the field's dirty bit is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldChange {
    /// Recorded operation.
    pub op: ChangeOp,
    /// Prior position for move-style records.
    pub old_index: u32,
    /// New position for move-style records.
    pub new_index: u32,
}

/// One recorded array element change.
///
/// `value` is present for `Add` and `Replace`; `prior_index` is
/// present for `Move` (the log key is the element's new index).
#[derive(Debug, Clone)]
pub struct ArrayChange {
    /// Recorded operation.
    pub op: ChangeOp,
    /// New element value for `Add` / `Replace`.
    pub value: Option<Value>,
    /// Prior index for `Move`.
    pub prior_index: Option<u64>,
}

/// Incremental change log for one array field.
///
/// Entries are keyed by element index, so draining yields ascending
/// index order — the order the wire requires.
#[derive(Debug, Default)]
pub struct ArrayChangeSet {
    entries: Mutex<BTreeMap<u64, ArrayChange>>,
}

impl ArrayChangeSet {
    /// Records an element insertion at `index`.
    pub fn mark_add(&self, index: u64, value: Value) {
        self.lock().insert(
            index,
            ArrayChange {
                op: ChangeOp::Add,
                value: Some(value),
                prior_index: None,
            },
        );
    }

    /// Records an element replacement at `index`.
    pub fn mark_replace(&self, index: u64, value: Value) {
        self.lock().insert(
            index,
            ArrayChange {
                op: ChangeOp::Replace,
                value: Some(value),
                prior_index: None,
            },
        );
    }

    /// Records an element removal at `index`.
    pub fn mark_remove(&self, index: u64) {
        self.lock().insert(
            index,
            ArrayChange {
                op: ChangeOp::Remove,
                value: None,
                prior_index: None,
            },
        );
    }

    /// Records an element move from `old_index` to `new_index`.
    pub fn mark_move(&self, old_index: u64, new_index: u64) {
        self.lock().insert(
            new_index,
            ArrayChange {
                op: ChangeOp::Move,
                value: None,
                prior_index: Some(old_index),
            },
        );
    }

    /// Snapshot of the recorded changes in ascending index order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(u64, ArrayChange)> {
        self.lock().iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    /// Number of recorded changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no changes are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Truncates the log; the allocation is kept for reuse.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, ArrayChange>> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// One recorded map entry change; `value` is present for `Add` / `Replace`.
#[derive(Debug, Clone)]
pub struct MapChange {
    /// Recorded operation.
    pub op: ChangeOp,
    /// New value for `Add` / `Replace`.
    pub value: Option<Value>,
}

/// Incremental change log for one map field, keyed by entry key.
#[derive(Debug, Default)]
pub struct MapChangeSet {
    entries: Mutex<BTreeMap<String, MapChange>>,
}

impl MapChangeSet {
    /// Records an entry insertion under `key`.
    pub fn mark_add(&self, key: impl Into<String>, value: Value) {
        self.lock().insert(
            key.into(),
            MapChange {
                op: ChangeOp::Add,
                value: Some(value),
            },
        );
    }

    /// Records an entry replacement under `key`.
    pub fn mark_replace(&self, key: impl Into<String>, value: Value) {
        self.lock().insert(
            key.into(),
            MapChange {
                op: ChangeOp::Replace,
                value: Some(value),
            },
        );
    }

    /// Records an entry removal under `key`.
    pub fn mark_remove(&self, key: impl Into<String>) {
        self.lock().insert(
            key.into(),
            MapChange {
                op: ChangeOp::Remove,
                value: None,
            },
        );
    }

    /// Snapshot of the recorded changes in ascending key order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, MapChange)> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of recorded changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no changes are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Truncates the log; the allocation is kept for reuse.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, MapChange>> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

const WORDS: usize = 4;

#[derive(Debug)]
struct ChangeSetInner {
    bits: [u64; WORDS],
    slots: Box<[FieldChange; 256]>,
    children: BTreeMap<u8, Arc<ChangeSet>>,
    arrays: BTreeMap<u8, Arc<ArrayChangeSet>>,
    maps: BTreeMap<u8, Arc<MapChangeSet>>,
}

impl Default for ChangeSetInner {
    fn default() -> Self {
        Self {
            bits: [0; WORDS],
            slots: Box::new([FieldChange::default(); 256]),
            children: BTreeMap::new(),
            arrays: BTreeMap::new(),
            maps: BTreeMap::new(),
        }
    }
}

/// Per-instance change log: 256-bit dirty bitset + nested logs.
///
/// A field is dirty iff its bit is set or its nested log holds
/// changes. [`ChangeSet::changed_fields`] returns the union of both
/// sources in strictly ascending index order, which is the order
/// patches are encoded in.
#[derive(Debug, Default)]
pub struct ChangeSet {
    inner: Mutex<ChangeSetInner>,
}

impl ChangeSet {
    /// Creates an empty change set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the dirty bit for `index` and records `op`.
    ///
    /// A repeated mark on the same index overwrites the prior op.
    pub fn mark(&self, index: u8, op: ChangeOp) {
        let mut inner = self.lock();
        inner.bits[usize::from(index >> 6)] |= 1u64 << (index & 63);
        inner.slots[usize::from(index)] = FieldChange {
            op,
            old_index: 0,
            new_index: 0,
        };
    }

    /// Whether `index` is dirty (bit set or nested log non-empty).
    #[must_use]
    pub fn is_dirty(&self, index: u8) -> bool {
        let inner = self.lock();
        if inner.bits[usize::from(index >> 6)] & (1u64 << (index & 63)) != 0 {
            return true;
        }
        Self::nested_dirty(&inner, index)
    }

    /// The recorded op for a dirty field (`None` op when clean).
    #[must_use]
    pub fn field_change(&self, index: u8) -> FieldChange {
        let inner = self.lock();
        if inner.bits[usize::from(index >> 6)] & (1u64 << (index & 63)) != 0 {
            inner.slots[usize::from(index)]
        } else {
            FieldChange::default()
        }
    }

    /// Changed field indices in strictly ascending order.
    ///
    /// Bitset words are scanned with a trailing-zeros extraction; any
    /// index dirty only through a nested log is merged in afterwards.
    #[must_use]
    pub fn changed_fields(&self) -> Vec<u8> {
        let inner = self.lock();
        let mut out = Vec::new();
        for (w, &word) in inner.bits.iter().enumerate() {
            let mut word = word;
            while word != 0 {
                let bit = word.trailing_zeros() as u8;
                out.push(((w as u8) << 6) | bit);
                word &= word - 1;
            }
        }
        let mut extra: Vec<u8> = Vec::new();
        for index in inner
            .children
            .iter()
            .filter(|(_, c)| c.has_changes())
            .map(|(i, _)| *i)
            .chain(inner.arrays.iter().filter(|(_, a)| !a.is_empty()).map(|(i, _)| *i))
            .chain(inner.maps.iter().filter(|(_, m)| !m.is_empty()).map(|(i, _)| *i))
        {
            if inner.bits[usize::from(index >> 6)] & (1u64 << (index & 63)) == 0 {
                extra.push(index);
            }
        }
        if !extra.is_empty() {
            out.extend(extra);
            out.sort_unstable();
            out.dedup();
        }
        out
    }

    /// Whether anything at all is dirty.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        let inner = self.lock();
        inner.bits.iter().any(|w| *w != 0)
            || inner.children.values().any(|c| c.has_changes())
            || inner.arrays.values().any(|a| !a.is_empty())
            || inner.maps.values().any(|m| !m.is_empty())
    }

    /// The incremental array log for `index`, creating it lazily.
    #[must_use]
    pub fn get_or_create_array(&self, index: u8) -> Arc<ArrayChangeSet> {
        Arc::clone(self.lock().arrays.entry(index).or_default())
    }

    /// The incremental map log for `index`, creating it lazily.
    #[must_use]
    pub fn get_or_create_map(&self, index: u8) -> Arc<MapChangeSet> {
        Arc::clone(self.lock().maps.entry(index).or_default())
    }

    /// The nested change set for struct field `index`, creating it lazily.
    #[must_use]
    pub fn get_or_create_child(&self, index: u8) -> Arc<ChangeSet> {
        Arc::clone(self.lock().children.entry(index).or_default())
    }

    /// The array log for `index`, when one was created.
    #[must_use]
    pub fn array(&self, index: u8) -> Option<Arc<ArrayChangeSet>> {
        self.lock().arrays.get(&index).map(Arc::clone)
    }

    /// The map log for `index`, when one was created.
    #[must_use]
    pub fn map(&self, index: u8) -> Option<Arc<MapChangeSet>> {
        self.lock().maps.get(&index).map(Arc::clone)
    }

    /// The child change set for `index`, when one was created.
    #[must_use]
    pub fn child(&self, index: u8) -> Option<Arc<ChangeSet>> {
        self.lock().children.get(&index).map(Arc::clone)
    }

    /// Resets all tracking: zeroes the bitset, truncates every nested
    /// log, and recursively clears child change sets. Nested
    /// allocations stay in place for reuse.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.bits = [0; WORDS];
        for slot in &mut *inner.slots {
            *slot = FieldChange::default();
        }
        for array in inner.arrays.values() {
            array.clear();
        }
        for map in inner.maps.values() {
            map.clear();
        }
        for child in inner.children.values() {
            child.clear();
        }
    }

    fn nested_dirty(inner: &ChangeSetInner, index: u8) -> bool {
        inner.children.get(&index).is_some_and(|c| c.has_changes())
            || inner.arrays.get(&index).is_some_and(|a| !a.is_empty())
            || inner.maps.get(&index).is_some_and(|m| !m.is_empty())
    }

    fn lock(&self) -> MutexGuard<'_, ChangeSetInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
