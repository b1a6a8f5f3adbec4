// SPDX-License-Identifier: Apache-2.0
//! veil-core: deterministic state tracking and wire codec.
//!
//! Servers hold an authoritative state tree; clients receive a compact
//! binary stream of changes. This crate is the engine core: schemas
//! and change tracking, the deterministic patch/full-state codec, the
//! read-time effect stack, per-viewer filters, and the single-writer
//! [`TrackedState`] seam. Session fan-out, history, and events live in
//! `veil-session`.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_lossless
)]

mod changeset;
/// Reference tracked state type, written the way a generator would.
pub mod demo;
mod decoder;
mod effect;
mod encoder;
mod field;
mod filter;
mod replay;
mod schema;
mod trackable;
mod tracked_state;
mod value;
/// Variable-length integer codec (varuint + zigzag varint).
pub mod varint;
/// Wire-level constants (message kinds, collection modes).
pub mod wire;

// Re-exports for stable public API
/// Change tracking: dirty bitset, ops, and incremental collection logs.
pub use changeset::{
    ArrayChange, ArrayChangeSet, ChangeOp, ChangeSet, FieldChange, MapChange, MapChangeSet,
};
/// Structural decoder output and errors.
pub use decoder::{
    ArrayEntry, CollectionDelta, DecodeError, DecodedChange, DecodedEvent, DecodedMessage,
    DecodedPatch, DecodedState, Decoder, MapEntry,
};
/// Read-time effect stack and capability traits.
pub use effect::{Effect, EffectError, EffectStack, Schedulable};
/// Deterministic binary encoder.
pub use encoder::{encode_full_from_values, Encoder};
/// Field wire kinds and descriptors.
pub use field::{FieldKind, FieldMeta};
/// Per-viewer projections and their registry.
pub use filter::{Filter, FilterRegistry};
/// Server-side replay tooling.
pub use replay::{apply_full, apply_patch, DiffRecord, MapReplayer, MapState};
/// Schemas and the per-tree registry.
pub use schema::{Schema, SchemaBuilder, SchemaError, SchemaRegistry};
/// The contract between state types and the runtime.
pub use trackable::{FastEncode, Trackable};
/// The single-writer seam binding state, effects, and codec.
pub use tracked_state::TrackedState;
/// Boxed runtime field values.
pub use value::Value;
