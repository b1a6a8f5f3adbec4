// SPDX-License-Identifier: Apache-2.0
//! Deterministic binary encoder for patch and full-state messages.
//!
//! The encoder owns a reusable scratch buffer and hands out freshly
//! allocated [`Bytes`] per message, so callers may retain returned
//! buffers indefinitely. Determinism contract: given equal change-set
//! contents and equal values, two encoders produce byte-identical
//! output. Every ordering decision that reaches the wire — ascending
//! field indices, ascending array indices, ascending map keys — is
//! made here, at the single encoder boundary, never upstream.

use bytes::Bytes;

use crate::changeset::ChangeOp;
use crate::field::{FieldKind, FieldMeta};
use crate::schema::Schema;
use crate::trackable::Trackable;
use crate::value::Value;
use crate::varint::{write_uvarint, write_varint};
use crate::wire::{
    MODE_FULL, MODE_INCREMENTAL, MSG_FULL_STATE, MSG_PATCH, MSG_PATCH_BATCH,
};

/// Initial scratch buffer capacity.
const INITIAL_CAPACITY: usize = 4096;
/// Below this capacity the buffer doubles.
const GROW_DOUBLE_BELOW: usize = 64 * 1024;
/// Below this capacity the buffer grows by half.
const GROW_HALF_BELOW: usize = 1024 * 1024;

/// Binary message encoder with a growable scratch buffer.
#[derive(Debug)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// Creates an encoder with the standard initial capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Grows the scratch buffer until at least `min_needed` more bytes
    /// fit: double below 64 KiB, +50% below 1 MiB, +25% above.
    fn grow(&mut self, min_needed: usize) {
        let required = self.buf.len() + min_needed;
        let mut cap = self.buf.capacity().max(INITIAL_CAPACITY);
        while cap < required {
            cap = if cap < GROW_DOUBLE_BELOW {
                cap * 2
            } else if cap < GROW_HALF_BELOW {
                cap + cap / 2
            } else {
                cap + cap / 4
            };
        }
        self.buf.reserve_exact(cap - self.buf.len());
    }

    fn ensure(&mut self, needed: usize) {
        if self.buf.len() + needed > self.buf.capacity() {
            self.grow(needed);
        }
    }

    /// Current scratch capacity (growth-policy observability).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    // ── Typed writers (the fast-encode surface) ─────────────────────

    /// Writes one raw byte.
    pub fn write_u8(&mut self, v: u8) {
        self.ensure(1);
        self.buf.push(v);
    }

    /// Writes a signed byte.
    pub fn write_i8(&mut self, v: i8) {
        self.write_u8(v as u8);
    }

    /// Writes a little-endian `u16`.
    pub fn write_u16(&mut self, v: u16) {
        self.ensure(2);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Writes a little-endian `i16`.
    pub fn write_i16(&mut self, v: i16) {
        self.ensure(2);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Writes a little-endian `u32`.
    pub fn write_u32(&mut self, v: u32) {
        self.ensure(4);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Writes a little-endian `i32`.
    pub fn write_i32(&mut self, v: i32) {
        self.ensure(4);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Writes a little-endian `u64`.
    pub fn write_u64(&mut self, v: u64) {
        self.ensure(8);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Writes a little-endian `i64`.
    pub fn write_i64(&mut self, v: i64) {
        self.ensure(8);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Writes an IEEE 754 single, little-endian bit pattern.
    pub fn write_f32(&mut self, v: f32) {
        self.ensure(4);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Writes an IEEE 754 double, little-endian bit pattern.
    pub fn write_f64(&mut self, v: f64) {
        self.ensure(8);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Writes a bool as one byte, 0 or 1.
    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(u8::from(v));
    }

    /// Writes a varuint length then the raw UTF-8 bytes.
    pub fn write_str(&mut self, v: &str) {
        self.write_uvarint(v.len() as u64);
        self.ensure(v.len());
        self.buf.extend_from_slice(v.as_bytes());
    }

    /// Writes a varuint length then the raw bytes.
    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_uvarint(v.len() as u64);
        self.ensure(v.len());
        self.buf.extend_from_slice(v);
    }

    /// Writes a base-128 varuint.
    pub fn write_uvarint(&mut self, v: u64) {
        self.ensure(crate::varint::MAX_VARINT_LEN);
        write_uvarint(&mut self.buf, v);
    }

    /// Writes a zigzag varint.
    pub fn write_varint(&mut self, v: i64) {
        self.ensure(crate::varint::MAX_VARINT_LEN);
        write_varint(&mut self.buf, v);
    }

    /// Writes a unix-millisecond timestamp (8 bytes LE).
    pub fn write_timestamp(&mut self, millis: i64) {
        self.write_i64(millis);
    }

    // ── Message encoding ────────────────────────────────────────────

    /// Encodes a patch message for `state`'s pending changes.
    ///
    /// Returns `None` when the change set is empty. Changes are
    /// emitted in ascending field-index order; collection fields
    /// prefer their incremental log and fall back to a full body.
    pub fn encode_patch(&mut self, state: &dyn Trackable) -> Option<Bytes> {
        let changed = state.changes().changed_fields();
        if changed.is_empty() {
            return None;
        }
        let schema = std::sync::Arc::clone(state.schema());
        self.buf.clear();
        self.write_u8(MSG_PATCH);
        self.write_u16(schema.id());
        self.write_uvarint(changed.len() as u64);
        for index in changed {
            let Some(meta) = schema.field(index) else {
                // Index outside the schema: mark discipline violation
                // upstream; skip rather than emit undecodable bytes.
                debug_assert!(false, "changed field {index} not in schema");
                continue;
            };
            self.write_u8(index);
            match meta.kind {
                FieldKind::Array => self.encode_array_change(state, meta),
                FieldKind::Map => self.encode_map_change(state, meta),
                _ => self.encode_scalar_change(state, meta),
            }
        }
        Some(Bytes::copy_from_slice(&self.buf))
    }

    /// Encodes a full-state message for `state`.
    pub fn encode_full(&mut self, state: &dyn Trackable) -> Bytes {
        let schema = std::sync::Arc::clone(state.schema());
        self.buf.clear();
        self.write_u8(MSG_FULL_STATE);
        self.write_u16(schema.id());
        self.write_u8(schema.field_count());
        for meta in schema.fields() {
            if let Some(fast) = state.as_fast_encode() {
                if fast.encode_field(meta.index, self) {
                    continue;
                }
            }
            let value = state.field_value(meta.index);
            self.write_field_value(meta, value.as_ref());
        }
        Bytes::copy_from_slice(&self.buf)
    }

    /// Packs already-encoded patch messages into one batch message.
    ///
    /// Body: varuint patch count, then each patch varuint-length
    /// prefixed. Used as the resume transport framing.
    pub fn encode_patch_batch(&mut self, schema_id: u16, patches: &[Bytes]) -> Bytes {
        self.buf.clear();
        self.write_u8(MSG_PATCH_BATCH);
        self.write_u16(schema_id);
        self.write_uvarint(patches.len() as u64);
        for patch in patches {
            self.write_uvarint(patch.len() as u64);
            self.ensure(patch.len());
            self.buf.extend_from_slice(patch);
        }
        Bytes::copy_from_slice(&self.buf)
    }

    fn encode_scalar_change(&mut self, state: &dyn Trackable, meta: &FieldMeta) {
        let recorded = state.changes().field_change(meta.index).op;
        // A struct field dirty only through its child change set has no
        // recorded op; it re-encodes whole as a replacement.
        let op = if recorded == ChangeOp::None {
            ChangeOp::Replace
        } else {
            recorded
        };
        self.write_u8(op.code());
        if op == ChangeOp::Remove {
            return;
        }
        if let Some(fast) = state.as_fast_encode() {
            if fast.encode_field(meta.index, self) {
                return;
            }
        }
        let value = state.field_value(meta.index);
        self.write_field_value(meta, value.as_ref());
    }

    fn encode_array_change(&mut self, state: &dyn Trackable, meta: &FieldMeta) {
        let log = state.changes().array(meta.index);
        let entries = log.map_or_else(Vec::new, |l| l.snapshot());
        if entries.is_empty() {
            // Dirty bit without an incremental log: ship the whole array.
            self.write_u8(MODE_FULL);
            let value = state.field_value(meta.index);
            self.write_array_body(meta, value.as_ref());
            return;
        }
        self.write_u8(MODE_INCREMENTAL);
        self.write_uvarint(entries.len() as u64);
        for (index, change) in entries {
            self.write_uvarint(index);
            self.write_u8(change.op.code());
            match change.op {
                ChangeOp::Add | ChangeOp::Replace => {
                    self.write_element(meta, change.value.as_ref());
                }
                ChangeOp::Move => {
                    self.write_uvarint(change.prior_index.unwrap_or_default());
                }
                ChangeOp::Remove | ChangeOp::None => {}
            }
        }
    }

    fn encode_map_change(&mut self, state: &dyn Trackable, meta: &FieldMeta) {
        let log = state.changes().map(meta.index);
        let entries = log.map_or_else(Vec::new, |l| l.snapshot());
        if entries.is_empty() {
            self.write_u8(MODE_FULL);
            let value = state.field_value(meta.index);
            self.write_map_body(meta, value.as_ref());
            return;
        }
        self.write_u8(MODE_INCREMENTAL);
        self.write_uvarint(entries.len() as u64);
        for (key, change) in entries {
            self.write_str(&key);
            self.write_u8(change.op.code());
            match change.op {
                ChangeOp::Add | ChangeOp::Replace => {
                    self.write_element(meta, change.value.as_ref());
                }
                ChangeOp::Remove | ChangeOp::Move | ChangeOp::None => {}
            }
        }
    }

    /// Writes a field value by its declared kind.
    fn write_field_value(&mut self, meta: &FieldMeta, value: Option<&Value>) {
        match meta.kind {
            FieldKind::Array => self.write_array_body(meta, value),
            FieldKind::Map => self.write_map_body(meta, value),
            FieldKind::Struct => self.write_struct_body(meta, value),
            kind => self.write_scalar(kind, value),
        }
    }

    /// Writes a collection element by the field's element kind.
    fn write_element(&mut self, meta: &FieldMeta, value: Option<&Value>) {
        match meta.elem_kind.unwrap_or(FieldKind::Struct) {
            FieldKind::Struct => self.write_struct_body(meta, value),
            kind => self.write_scalar(kind, value),
        }
    }

    fn write_array_body(&mut self, meta: &FieldMeta, value: Option<&Value>) {
        let empty: &[Value] = &[];
        let items = value.and_then(Value::as_array).unwrap_or(empty);
        self.write_uvarint(items.len() as u64);
        for item in items {
            self.write_element(meta, Some(item));
        }
    }

    fn write_map_body(&mut self, meta: &FieldMeta, value: Option<&Value>) {
        match value {
            Some(Value::Map(entries)) => {
                self.write_uvarint(entries.len() as u64);
                // BTreeMap iteration is already ascending by key.
                for (key, item) in entries {
                    self.write_str(key);
                    self.write_element(meta, Some(item));
                }
            }
            _ => self.write_uvarint(0),
        }
    }

    fn write_struct_body(&mut self, meta: &FieldMeta, value: Option<&Value>) {
        let Some(Value::Struct(Some(fields))) = value else {
            self.write_u8(0); // null marker
            return;
        };
        self.write_u8(1);
        let Some(child) = meta.child.as_ref() else {
            debug_assert!(false, "struct field {} without child schema", meta.name);
            return;
        };
        let child = std::sync::Arc::clone(child);
        for child_meta in child.fields() {
            self.write_field_value(child_meta, fields.get(usize::from(child_meta.index)));
        }
    }

    /// Writes a scalar by kind, coercing across integer widths and
    /// defaulting to the kind's zero value on a variant mismatch.
    fn write_scalar(&mut self, kind: FieldKind, value: Option<&Value>) {
        match kind {
            FieldKind::I8 => self.write_i8(value.and_then(Value::as_i64).unwrap_or(0) as i8),
            FieldKind::I16 => self.write_i16(value.and_then(Value::as_i64).unwrap_or(0) as i16),
            FieldKind::I32 => self.write_i32(value.and_then(Value::as_i64).unwrap_or(0) as i32),
            FieldKind::I64 => self.write_i64(value.and_then(Value::as_i64).unwrap_or(0)),
            FieldKind::U8 => self.write_u8(value.and_then(Value::as_u64).unwrap_or(0) as u8),
            FieldKind::U16 => self.write_u16(value.and_then(Value::as_u64).unwrap_or(0) as u16),
            FieldKind::U32 => self.write_u32(value.and_then(Value::as_u64).unwrap_or(0) as u32),
            FieldKind::U64 => self.write_u64(value.and_then(Value::as_u64).unwrap_or(0)),
            FieldKind::F32 => self.write_f32(value.and_then(Value::as_f64).unwrap_or(0.0) as f32),
            FieldKind::F64 => self.write_f64(value.and_then(Value::as_f64).unwrap_or(0.0)),
            FieldKind::Bool => self.write_bool(value.and_then(Value::as_bool).unwrap_or(false)),
            FieldKind::Str => self.write_str(value.and_then(Value::as_str).unwrap_or("")),
            FieldKind::Bytes => {
                let empty = bytes::Bytes::new();
                let bytes = value.and_then(Value::as_bytes).unwrap_or(&empty);
                self.write_bytes(bytes);
            }
            FieldKind::VarInt => self.write_varint(value.and_then(Value::as_i64).unwrap_or(0)),
            FieldKind::VarUint => self.write_uvarint(value.and_then(Value::as_u64).unwrap_or(0)),
            FieldKind::Timestamp => {
                self.write_timestamp(value.and_then(Value::as_i64).unwrap_or(0));
            }
            FieldKind::Struct | FieldKind::Array | FieldKind::Map => {
                debug_assert!(false, "write_scalar called with composite kind");
            }
        }
    }
}

/// Encodes a full-state message for a bare schema and value list
/// (tooling path; the runtime uses [`Encoder::encode_full`]).
#[must_use]
pub fn encode_full_from_values(schema: &Schema, values: &[Value]) -> Bytes {
    let mut enc = Encoder::new();
    enc.buf.clear();
    enc.write_u8(MSG_FULL_STATE);
    enc.write_u16(schema.id());
    enc.write_u8(schema.field_count());
    for meta in schema.fields() {
        enc.write_field_value(meta, values.get(usize::from(meta.index)));
    }
    Bytes::copy_from_slice(&enc.buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_capacity_is_4096() {
        let enc = Encoder::new();
        assert_eq!(enc.capacity(), INITIAL_CAPACITY);
    }

    #[test]
    fn growth_doubles_then_slows() {
        let mut enc = Encoder::new();
        enc.grow(INITIAL_CAPACITY + 1);
        assert_eq!(enc.capacity(), INITIAL_CAPACITY * 2);

        let mut enc = Encoder::new();
        enc.grow(GROW_DOUBLE_BELOW + 1);
        // Doubling from 4096 crosses 64 KiB exactly, then +50% once.
        assert_eq!(enc.capacity(), GROW_DOUBLE_BELOW + GROW_DOUBLE_BELOW / 2);
    }

    #[test]
    fn growth_loops_until_capacity_suffices() {
        let mut enc = Encoder::new();
        enc.grow(3 * 1024 * 1024);
        assert!(enc.capacity() >= 3 * 1024 * 1024);
    }

    #[test]
    fn typed_writers_are_little_endian() {
        let mut enc = Encoder::new();
        enc.write_u16(0x0102);
        enc.write_i32(-2);
        enc.write_bool(true);
        enc.write_str("ab");
        assert_eq!(
            enc.buf,
            vec![0x02, 0x01, 0xfe, 0xff, 0xff, 0xff, 0x01, 0x02, b'a', b'b']
        );
    }

    #[test]
    fn f32_uses_ieee_bit_pattern() {
        let mut enc = Encoder::new();
        enc.write_f32(1.0);
        assert_eq!(enc.buf, 1.0f32.to_le_bytes().to_vec());
    }
}
