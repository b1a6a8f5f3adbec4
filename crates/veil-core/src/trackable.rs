// SPDX-License-Identifier: Apache-2.0
//! The contract between generated state types and the runtime.
//!
//! The runtime never inspects concrete state types: everything it
//! needs — schema, change set, field values, lifecycle hooks — flows
//! through [`Trackable`]. Code generators emit types implementing it;
//! hand-written states (see the `demo` module) work the same way.
//!
//! Generated types should keep their [`ChangeSet`] behind `Arc` so the
//! shallow clones produced by effects and filters share tracking state
//! with the base instance.

use std::sync::Arc;

use crate::changeset::ChangeSet;
use crate::encoder::Encoder;
use crate::schema::Schema;
use crate::value::Value;

/// A state object the sync engine can track and encode.
pub trait Trackable: Send + Sync {
    /// Schema describing this type's wire layout.
    fn schema(&self) -> &Arc<Schema>;

    /// This instance's change set.
    fn changes(&self) -> &ChangeSet;

    /// Current value of the field at `index`, boxed.
    ///
    /// Returns `None` for indices outside the schema.
    fn field_value(&self, index: u8) -> Option<Value>;

    /// Clears all tracked changes (post-commit hook).
    fn clear_changes(&self) {
        self.changes().clear();
    }

    /// Marks every field dirty (full-resync hook).
    fn mark_all_dirty(&self) {
        let count = self.schema().field_count();
        for index in 0..count {
            self.changes().mark(index, crate::changeset::ChangeOp::Replace);
        }
    }

    /// The fast-encode capability of this instance, when implemented.
    fn as_fast_encode(&self) -> Option<&dyn FastEncode> {
        None
    }
}

/// Optional fast path: stream field values straight into the encoder.
///
/// Generated types implement this to skip the boxed [`Value`] path on
/// the hot loop. Returning `false` from [`FastEncode::encode_field`]
/// falls the encoder back to [`Trackable::field_value`]; collections
/// and nested structs typically do, scalars typically don't.
pub trait FastEncode: Trackable {
    /// Writes the current value of field `index` using the encoder's
    /// typed writers. Returns `false` to use the boxed fallback.
    fn encode_field(&self, index: u8, enc: &mut Encoder) -> bool;
}
