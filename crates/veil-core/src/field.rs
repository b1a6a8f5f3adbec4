// SPDX-License-Identifier: Apache-2.0
//! Field wire kinds and per-field descriptors.
//!
//! A [`Schema`](crate::Schema) is an ordered list of [`FieldMeta`] entries;
//! each entry names a field and pins its [`FieldKind`], which fully
//! determines the byte layout of the field's values on the wire.

use std::sync::Arc;

use crate::schema::Schema;

/// Wire type of a field value.
///
/// Fixed-width kinds report their byte size via [`FieldKind::wire_size`];
/// variable-width kinds report 0. All multi-byte encodings are
/// little-endian; floats use IEEE 754 bit patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Signed 8-bit integer.
    I8,
    /// Signed 16-bit integer, little-endian.
    I16,
    /// Signed 32-bit integer, little-endian.
    I32,
    /// Signed 64-bit integer, little-endian.
    I64,
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer, little-endian.
    U16,
    /// Unsigned 32-bit integer, little-endian.
    U32,
    /// Unsigned 64-bit integer, little-endian.
    U64,
    /// IEEE 754 single-precision float, little-endian.
    F32,
    /// IEEE 754 double-precision float, little-endian.
    F64,
    /// One byte, 0 or 1.
    Bool,
    /// UTF-8 string: varuint length then raw bytes, never NUL-terminated.
    Str,
    /// Byte string: varuint length then raw bytes.
    Bytes,
    /// Variable-length signed integer (zigzag then base-128).
    VarInt,
    /// Variable-length unsigned integer (base-128).
    VarUint,
    /// Unix-millisecond timestamp, 8 bytes little-endian.
    Timestamp,
    /// Nested struct: null-marker byte then the child schema's fields.
    Struct,
    /// Sequence of elements of a single element kind.
    Array,
    /// String-keyed map, entries sorted ascending by key on the wire.
    Map,
}

impl FieldKind {
    /// Fixed wire width in bytes, or 0 for variable-width kinds.
    #[must_use]
    pub const fn wire_size(self) -> usize {
        match self {
            Self::I8 | Self::U8 | Self::Bool => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 | Self::Timestamp => 8,
            Self::Str
            | Self::Bytes
            | Self::VarInt
            | Self::VarUint
            | Self::Struct
            | Self::Array
            | Self::Map => 0,
        }
    }

    /// Whether values of this kind occupy a fixed number of bytes.
    #[must_use]
    pub const fn is_fixed_width(self) -> bool {
        self.wire_size() != 0
    }

    /// Whether this kind is a collection (array or map).
    #[must_use]
    pub const fn is_collection(self) -> bool {
        matches!(self, Self::Array | Self::Map)
    }
}

/// Immutable description of one schema field.
///
/// For `Array` and `Map` fields, `elem_kind` pins the element/value
/// kind; `child` points at the element schema when elements are
/// structs. For `Struct` fields, `child` is the nested schema.
/// `key_field` names the element field used as a stable identity key
/// for identity-keyed arrays (change tracking by key instead of
/// positional index).
#[derive(Debug, Clone)]
pub struct FieldMeta {
    /// Field index within the schema (0–255); also the wire index.
    pub index: u8,
    /// Field name, unique within the schema.
    pub name: String,
    /// Wire kind of the field value.
    pub kind: FieldKind,
    /// Element kind for arrays, value kind for maps.
    pub elem_kind: Option<FieldKind>,
    /// Child schema for nested structs and struct elements.
    pub child: Option<Arc<Schema>>,
    /// Identity-key field name for identity-keyed arrays.
    pub key_field: Option<String>,
}

impl FieldMeta {
    /// Creates a scalar field descriptor.
    #[must_use]
    pub fn scalar(index: u8, name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            index,
            name: name.into(),
            kind,
            elem_kind: None,
            child: None,
            key_field: None,
        }
    }

    /// Creates an array field descriptor.
    #[must_use]
    pub fn array(index: u8, name: impl Into<String>, elem_kind: FieldKind) -> Self {
        Self {
            index,
            name: name.into(),
            kind: FieldKind::Array,
            elem_kind: Some(elem_kind),
            child: None,
            key_field: None,
        }
    }

    /// Creates a map field descriptor with the given value kind.
    #[must_use]
    pub fn map(index: u8, name: impl Into<String>, value_kind: FieldKind) -> Self {
        Self {
            index,
            name: name.into(),
            kind: FieldKind::Map,
            elem_kind: Some(value_kind),
            child: None,
            key_field: None,
        }
    }

    /// Creates a nested-struct field descriptor.
    #[must_use]
    pub fn nested(index: u8, name: impl Into<String>, child: Arc<Schema>) -> Self {
        Self {
            index,
            name: name.into(),
            kind: FieldKind::Struct,
            elem_kind: None,
            child: Some(child),
            key_field: None,
        }
    }

    /// Sets the child schema (struct-element arrays).
    #[must_use]
    pub fn with_child(mut self, child: Arc<Schema>) -> Self {
        self.child = Some(child);
        self
    }

    /// Sets the identity-key field name.
    #[must_use]
    pub fn with_key_field(mut self, key_field: impl Into<String>) -> Self {
        self.key_field = Some(key_field.into());
        self
    }
}
