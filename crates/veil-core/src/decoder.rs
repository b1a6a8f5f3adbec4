// SPDX-License-Identifier: Apache-2.0
//! Binary message decoder producing structural patches.
//!
//! The decoder is bound to a [`SchemaRegistry`] and walks a byte
//! slice with a cursor, reconstructing values into their natural host
//! types. Its output is structural — [`DecodedPatch`] /
//! [`DecodedState`] — which the server-side replay tooling applies to
//! a generic map-of-fields image; real clients apply the same bytes
//! to their native structures.
//!
//! Every failure is a typed, recoverable [`DecodeError`]; the decoder
//! never panics on malformed input.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::changeset::ChangeOp;
use crate::field::{FieldKind, FieldMeta};
use crate::schema::{Schema, SchemaRegistry};
use crate::value::Value;
use crate::varint::{self, VarintError};
use crate::wire::{
    MODE_FULL, MODE_INCREMENTAL, MSG_EVENT, MSG_EVENT_BATCH, MSG_FULL_STATE, MSG_PATCH,
    MSG_PATCH_BATCH,
};

/// Decode failures. All are recoverable at the caller level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Input ended before the message did.
    #[error("truncated buffer at offset {0}")]
    Truncated(usize),
    /// First byte is not a known message kind.
    #[error("unknown message kind 0x{0:02x}")]
    UnknownMessageKind(u8),
    /// Schema id is not present in the registry.
    #[error("unknown schema id {0}")]
    UnknownSchema(u16),
    /// Op byte outside the defined operations.
    #[error("invalid op byte 0x{0:02x}")]
    InvalidOp(u8),
    /// Collection mode byte outside the defined modes.
    #[error("invalid collection mode 0x{0:02x}")]
    InvalidMode(u8),
    /// Varint ran past 10 bytes or overflowed 64 bits.
    #[error("varint overflow")]
    VarintOverflow,
    /// String bytes are not valid UTF-8.
    #[error("invalid utf-8 in string value")]
    InvalidUtf8,
}

/// One decoded field change.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChange {
    /// Field index within the schema.
    pub index: u8,
    /// Operation applied to the field.
    pub op: ChangeOp,
    /// Scalar/struct replacement value (absent for `Remove` and for
    /// collection fields).
    pub value: Option<Value>,
    /// Collection delta for array/map fields.
    pub delta: Option<CollectionDelta>,
}

/// Decoded collection field payload.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionDelta {
    /// Incremental array element changes, ascending by index.
    Array(Vec<ArrayEntry>),
    /// Incremental map entry changes, ascending by key.
    Map(Vec<MapEntry>),
    /// Full array replacement.
    FullArray(Vec<Value>),
    /// Full map replacement.
    FullMap(BTreeMap<String, Value>),
}

/// One incremental array element change.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayEntry {
    /// Element index (new index for `Move`).
    pub index: u64,
    /// Operation.
    pub op: ChangeOp,
    /// New element value for `Add` / `Replace`.
    pub value: Option<Value>,
    /// Prior index for `Move`.
    pub prior_index: Option<u64>,
}

/// One incremental map entry change.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    /// Entry key.
    pub key: String,
    /// Operation.
    pub op: ChangeOp,
    /// New value for `Add` / `Replace`.
    pub value: Option<Value>,
}

/// Structural form of a patch message.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPatch {
    /// Schema the patch targets.
    pub schema_id: u16,
    /// Field changes in ascending index order.
    pub changes: Vec<DecodedChange>,
}

/// Structural form of a full-state message.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedState {
    /// Schema the message targets.
    pub schema_id: u16,
    /// One value per schema field, in field order.
    pub fields: Vec<Value>,
}

/// One decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    /// Event type tag.
    pub kind: String,
    /// Raw payload bytes.
    pub payload: Bytes,
}

/// Any decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    /// Full-state message.
    Full(DecodedState),
    /// Patch message.
    Patch(DecodedPatch),
    /// Batch of patch messages.
    PatchBatch(Vec<DecodedPatch>),
    /// Event or event batch.
    Events(Vec<DecodedEvent>),
}

/// Registry-bound message decoder.
#[derive(Debug)]
pub struct Decoder {
    registry: Arc<SchemaRegistry>,
}

impl Decoder {
    /// Creates a decoder resolving schema ids through `registry`.
    #[must_use]
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Decodes one message.
    ///
    /// # Errors
    /// Any [`DecodeError`]; the input is never partially applied.
    pub fn decode(&self, buf: &[u8]) -> Result<DecodedMessage, DecodeError> {
        let mut cur = Cursor::new(buf);
        let kind = cur.u8()?;
        match kind {
            MSG_FULL_STATE => {
                let schema = self.schema(&mut cur)?;
                Ok(DecodedMessage::Full(Self::decode_full_body(
                    &mut cur, &schema,
                )?))
            }
            MSG_PATCH => {
                let schema = self.schema(&mut cur)?;
                Ok(DecodedMessage::Patch(Self::decode_patch_body(
                    &mut cur, &schema,
                )?))
            }
            MSG_PATCH_BATCH => {
                let schema = self.schema(&mut cur)?;
                let count = cur.uvarint()?;
                let mut patches = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let len = cur.uvarint()? as usize;
                    let inner = cur.take(len)?;
                    match self.decode(inner)? {
                        DecodedMessage::Patch(p) => patches.push(p),
                        _ => return Err(DecodeError::UnknownMessageKind(MSG_PATCH_BATCH)),
                    }
                }
                Ok(DecodedMessage::PatchBatch(patches))
            }
            MSG_EVENT | MSG_EVENT_BATCH => Ok(DecodedMessage::Events(Self::decode_events(
                &mut cur, kind,
            )?)),
            other => Err(DecodeError::UnknownMessageKind(other)),
        }
    }

    fn schema(&self, cur: &mut Cursor<'_>) -> Result<Arc<Schema>, DecodeError> {
        let id = cur.u16()?;
        self.registry
            .get(id)
            .map(Arc::clone)
            .ok_or(DecodeError::UnknownSchema(id))
    }

    fn decode_full_body(
        cur: &mut Cursor<'_>,
        schema: &Schema,
    ) -> Result<DecodedState, DecodeError> {
        let count = cur.u8()?;
        let mut fields = Vec::with_capacity(usize::from(count));
        for index in 0..count {
            let Some(meta) = schema.field(index) else {
                return Err(DecodeError::Truncated(cur.pos));
            };
            fields.push(Self::read_field_value(cur, meta)?);
        }
        Ok(DecodedState {
            schema_id: schema.id(),
            fields,
        })
    }

    fn decode_patch_body(
        cur: &mut Cursor<'_>,
        schema: &Schema,
    ) -> Result<DecodedPatch, DecodeError> {
        let count = cur.uvarint()?;
        let mut changes = Vec::with_capacity(count.min(256) as usize);
        for _ in 0..count {
            let index = cur.u8()?;
            let Some(meta) = schema.field(index) else {
                return Err(DecodeError::Truncated(cur.pos));
            };
            match meta.kind {
                FieldKind::Array => {
                    let delta = Self::read_array_delta(cur, meta)?;
                    changes.push(DecodedChange {
                        index,
                        op: ChangeOp::Replace,
                        value: None,
                        delta: Some(delta),
                    });
                }
                FieldKind::Map => {
                    let delta = Self::read_map_delta(cur, meta)?;
                    changes.push(DecodedChange {
                        index,
                        op: ChangeOp::Replace,
                        value: None,
                        delta: Some(delta),
                    });
                }
                _ => {
                    let op = Self::op(cur.u8()?)?;
                    let value = if op == ChangeOp::Remove {
                        None
                    } else {
                        Some(Self::read_field_value(cur, meta)?)
                    };
                    changes.push(DecodedChange {
                        index,
                        op,
                        value,
                        delta: None,
                    });
                }
            }
        }
        Ok(DecodedPatch {
            schema_id: schema.id(),
            changes,
        })
    }

    fn read_array_delta(
        cur: &mut Cursor<'_>,
        meta: &FieldMeta,
    ) -> Result<CollectionDelta, DecodeError> {
        match cur.u8()? {
            MODE_INCREMENTAL => {
                let count = cur.uvarint()?;
                let mut entries = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let index = cur.uvarint()?;
                    let op = Self::op(cur.u8()?)?;
                    let (value, prior_index) = match op {
                        ChangeOp::Add | ChangeOp::Replace => {
                            (Some(Self::read_element(cur, meta)?), None)
                        }
                        ChangeOp::Move => (None, Some(cur.uvarint()?)),
                        ChangeOp::Remove | ChangeOp::None => (None, None),
                    };
                    entries.push(ArrayEntry {
                        index,
                        op,
                        value,
                        prior_index,
                    });
                }
                Ok(CollectionDelta::Array(entries))
            }
            MODE_FULL => {
                let count = cur.uvarint()?;
                let mut items = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    items.push(Self::read_element(cur, meta)?);
                }
                Ok(CollectionDelta::FullArray(items))
            }
            other => Err(DecodeError::InvalidMode(other)),
        }
    }

    fn read_map_delta(
        cur: &mut Cursor<'_>,
        meta: &FieldMeta,
    ) -> Result<CollectionDelta, DecodeError> {
        match cur.u8()? {
            MODE_INCREMENTAL => {
                let count = cur.uvarint()?;
                let mut entries = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let key = cur.string()?;
                    let op = Self::op(cur.u8()?)?;
                    let value = match op {
                        ChangeOp::Add | ChangeOp::Replace => Some(Self::read_element(cur, meta)?),
                        _ => None,
                    };
                    entries.push(MapEntry { key, op, value });
                }
                Ok(CollectionDelta::Map(entries))
            }
            MODE_FULL => {
                let count = cur.uvarint()?;
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let key = cur.string()?;
                    let value = Self::read_element(cur, meta)?;
                    map.insert(key, value);
                }
                Ok(CollectionDelta::FullMap(map))
            }
            other => Err(DecodeError::InvalidMode(other)),
        }
    }

    fn decode_events(cur: &mut Cursor<'_>, kind: u8) -> Result<Vec<DecodedEvent>, DecodeError> {
        let count = if kind == MSG_EVENT { 1 } else { cur.uvarint()? };
        let mut events = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let kind_len = cur.uvarint()? as usize;
            let kind_bytes = cur.take(kind_len)?;
            let kind = std::str::from_utf8(kind_bytes)
                .map_err(|_| DecodeError::InvalidUtf8)?
                .to_owned();
            let payload_len = cur.uvarint()? as usize;
            let payload = Bytes::copy_from_slice(cur.take(payload_len)?);
            events.push(DecodedEvent { kind, payload });
        }
        Ok(events)
    }

    fn read_field_value(cur: &mut Cursor<'_>, meta: &FieldMeta) -> Result<Value, DecodeError> {
        match meta.kind {
            FieldKind::Array => {
                let count = cur.uvarint()?;
                let mut items = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    items.push(Self::read_element(cur, meta)?);
                }
                Ok(Value::Array(items))
            }
            FieldKind::Map => {
                let count = cur.uvarint()?;
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let key = cur.string()?;
                    map.insert(key, Self::read_element(cur, meta)?);
                }
                Ok(Value::Map(map))
            }
            FieldKind::Struct => Self::read_struct(cur, meta),
            kind => Self::read_scalar(cur, kind),
        }
    }

    fn read_element(cur: &mut Cursor<'_>, meta: &FieldMeta) -> Result<Value, DecodeError> {
        match meta.elem_kind.unwrap_or(FieldKind::Struct) {
            FieldKind::Struct => Self::read_struct(cur, meta),
            kind => Self::read_scalar(cur, kind),
        }
    }

    fn read_struct(cur: &mut Cursor<'_>, meta: &FieldMeta) -> Result<Value, DecodeError> {
        match cur.u8()? {
            0 => Ok(Value::Struct(None)),
            _ => {
                let Some(child) = meta.child.as_ref() else {
                    return Err(DecodeError::Truncated(cur.pos));
                };
                let mut fields = Vec::with_capacity(child.fields().len());
                for child_meta in child.fields() {
                    fields.push(Self::read_field_value(cur, child_meta)?);
                }
                Ok(Value::Struct(Some(fields)))
            }
        }
    }

    fn read_scalar(cur: &mut Cursor<'_>, kind: FieldKind) -> Result<Value, DecodeError> {
        Ok(match kind {
            FieldKind::I8 => Value::I8(cur.u8()? as i8),
            FieldKind::I16 => Value::I16(i16::from_le_bytes(cur.array::<2>()?)),
            FieldKind::I32 => Value::I32(i32::from_le_bytes(cur.array::<4>()?)),
            FieldKind::I64 => Value::I64(i64::from_le_bytes(cur.array::<8>()?)),
            FieldKind::U8 => Value::U8(cur.u8()?),
            FieldKind::U16 => Value::U16(cur.u16()?),
            FieldKind::U32 => Value::U32(u32::from_le_bytes(cur.array::<4>()?)),
            FieldKind::U64 => Value::U64(u64::from_le_bytes(cur.array::<8>()?)),
            FieldKind::F32 => Value::F32(f32::from_le_bytes(cur.array::<4>()?)),
            FieldKind::F64 => Value::F64(f64::from_le_bytes(cur.array::<8>()?)),
            FieldKind::Bool => Value::Bool(cur.u8()? != 0),
            FieldKind::Str => Value::Str(cur.string()?),
            FieldKind::Bytes => {
                let len = cur.uvarint()? as usize;
                Value::Bytes(Bytes::copy_from_slice(cur.take(len)?))
            }
            FieldKind::VarInt => {
                let raw = cur.uvarint()?;
                Value::I64(varint::unzigzag(raw))
            }
            FieldKind::VarUint => Value::U64(cur.uvarint()?),
            FieldKind::Timestamp => Value::Timestamp(i64::from_le_bytes(cur.array::<8>()?)),
            FieldKind::Struct | FieldKind::Array | FieldKind::Map => {
                return Err(DecodeError::Truncated(cur.pos))
            }
        })
    }

    fn op(code: u8) -> Result<ChangeOp, DecodeError> {
        ChangeOp::from_code(code).ok_or(DecodeError::InvalidOp(code))
    }
}

/// Byte-slice cursor with typed reads.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(DecodeError::Truncated(self.pos))?;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated(self.pos));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array::<2>()?))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn uvarint(&mut self) -> Result<u64, DecodeError> {
        let read = varint::read_uvarint(&self.buf[self.pos..]).map_err(|e| match e {
            VarintError::Truncated => DecodeError::Truncated(self.pos),
            VarintError::Overflow => DecodeError::VarintOverflow,
        })?;
        self.pos += read.len;
        Ok(read.value)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.uvarint()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }
}
