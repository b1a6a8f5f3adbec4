// SPDX-License-Identifier: Apache-2.0
//! Schemas and the per-tree schema registry.
//!
//! A [`Schema`] is the ordered field list for one state type; field
//! order is wire order. The [`SchemaRegistry`] maps 16-bit schema ids
//! and type names to their descriptors and is created once per state
//! tree — it must not be mutated after the tree starts broadcasting.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::field::{FieldKind, FieldMeta};

/// Errors produced while building a schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// More than 256 fields.
    #[error("schema {0} exceeds 256 fields")]
    TooManyFields(String),
    /// Field indices are not dense `0..N-1`.
    #[error("schema {name}: field index {index} out of order (expected {expected})")]
    SparseIndex {
        /// Schema type name.
        name: String,
        /// Offending field index.
        index: u8,
        /// Index the dense ordering required.
        expected: u8,
    },
    /// Two fields share a name.
    #[error("schema {name}: duplicate field name {field}")]
    DuplicateName {
        /// Schema type name.
        name: String,
        /// Duplicated field name.
        field: String,
    },
}

/// Ordered field list with a 16-bit id and a type name.
///
/// Invariants (enforced by [`SchemaBuilder::build`]): indices are
/// dense `0..N-1` with `N <= 256`, names are unique, field order is
/// wire order. The id uniquely identifies the schema within its
/// registry; id 0 means "assign on register".
#[derive(Debug, Clone)]
pub struct Schema {
    id: u16,
    name: String,
    fields: Vec<FieldMeta>,
}

impl Schema {
    /// Starts a builder for a schema with the given type name.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            id: 0,
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Schema id (0 until assigned by a registry).
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in wire order.
    #[must_use]
    pub fn fields(&self) -> &[FieldMeta] {
        &self.fields
    }

    /// Number of fields.
    #[must_use]
    pub fn field_count(&self) -> u8 {
        self.fields.len() as u8
    }

    /// Field descriptor by index.
    #[must_use]
    pub fn field(&self, index: u8) -> Option<&FieldMeta> {
        self.fields.get(usize::from(index))
    }

    /// Field descriptor by name (linear scan; schemas are small).
    #[must_use]
    pub fn field_by_name(&self, name: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn with_id(&self, id: u16) -> Self {
        Self {
            id,
            name: self.name.clone(),
            fields: self.fields.clone(),
        }
    }
}

/// Incremental [`Schema`] constructor with auto-assigned indices.
#[derive(Debug)]
pub struct SchemaBuilder {
    id: u16,
    name: String,
    fields: Vec<FieldMeta>,
}

impl SchemaBuilder {
    /// Pins an explicit schema id (defaults to 0 = assign on register).
    #[must_use]
    pub fn id(mut self, id: u16) -> Self {
        self.id = id;
        self
    }

    /// Appends a scalar field at the next index.
    #[must_use]
    pub fn scalar(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        let index = self.fields.len() as u8;
        self.fields.push(FieldMeta::scalar(index, name, kind));
        self
    }

    /// Appends an array field at the next index.
    #[must_use]
    pub fn array(mut self, name: impl Into<String>, elem_kind: FieldKind) -> Self {
        let index = self.fields.len() as u8;
        self.fields.push(FieldMeta::array(index, name, elem_kind));
        self
    }

    /// Appends an array-of-structs field at the next index.
    #[must_use]
    pub fn struct_array(mut self, name: impl Into<String>, child: Arc<Schema>) -> Self {
        let index = self.fields.len() as u8;
        self.fields
            .push(FieldMeta::array(index, name, FieldKind::Struct).with_child(child));
        self
    }

    /// Appends a map field at the next index.
    #[must_use]
    pub fn map(mut self, name: impl Into<String>, value_kind: FieldKind) -> Self {
        let index = self.fields.len() as u8;
        self.fields.push(FieldMeta::map(index, name, value_kind));
        self
    }

    /// Appends a nested-struct field at the next index.
    #[must_use]
    pub fn nested(mut self, name: impl Into<String>, child: Arc<Schema>) -> Self {
        let index = self.fields.len() as u8;
        self.fields.push(FieldMeta::nested(index, name, child));
        self
    }

    /// Appends a pre-built field descriptor as-is.
    #[must_use]
    pub fn field(mut self, meta: FieldMeta) -> Self {
        self.fields.push(meta);
        self
    }

    /// Validates the invariants and returns the schema.
    ///
    /// # Errors
    /// Returns [`SchemaError`] when the field list exceeds 256 entries,
    /// indices are not dense, or a name repeats.
    pub fn build(self) -> Result<Schema, SchemaError> {
        if self.fields.len() > 256 {
            return Err(SchemaError::TooManyFields(self.name));
        }
        let mut seen = BTreeMap::new();
        for (pos, meta) in self.fields.iter().enumerate() {
            if usize::from(meta.index) != pos {
                return Err(SchemaError::SparseIndex {
                    name: self.name,
                    index: meta.index,
                    expected: pos as u8,
                });
            }
            if seen.insert(meta.name.clone(), meta.index).is_some() {
                return Err(SchemaError::DuplicateName {
                    name: self.name,
                    field: meta.name.clone(),
                });
            }
        }
        Ok(Schema {
            id: self.id,
            name: self.name,
            fields: self.fields,
        })
    }
}

/// Bidirectional schema lookup: id → schema and name → schema.
///
/// Ids auto-assign from 1 upward when a schema registers with id 0.
/// Re-registering an id or name overwrites without a structural
/// equality check — the latest schema wins, and keeping ids stable
/// across runs is the caller's responsibility.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    by_id: BTreeMap<u16, Arc<Schema>>,
    by_name: BTreeMap<String, Arc<Schema>>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema, assigning the next free id when its id is 0.
    ///
    /// Returns the registered descriptor (with the assigned id).
    pub fn register(&mut self, schema: Schema) -> Arc<Schema> {
        let id = if schema.id() == 0 {
            self.next_free_id()
        } else {
            schema.id()
        };
        let entry = Arc::new(schema.with_id(id));
        self.by_id.insert(id, Arc::clone(&entry));
        self.by_name.insert(entry.name().to_owned(), Arc::clone(&entry));
        entry
    }

    /// Looks up a schema by id.
    #[must_use]
    pub fn get(&self, id: u16) -> Option<&Arc<Schema>> {
        self.by_id.get(&id)
    }

    /// Looks up a schema by type name.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&Arc<Schema>> {
        self.by_name.get(name)
    }

    /// Number of registered schemas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn next_free_id(&self) -> u16 {
        let mut id = 1u16;
        while self.by_id.contains_key(&id) {
            id += 1;
        }
        id
    }
}
