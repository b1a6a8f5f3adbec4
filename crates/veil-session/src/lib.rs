// SPDX-License-Identifier: Apache-2.0
//! veil-session: per-viewer broadcast over a tracked state tree.
//!
//! One [`TrackedSession`] fans a `veil-core` state out to any number
//! of viewers, each seeing its own filtered projection. The session
//! owns the tick loop bookkeeping: sequence numbers, the history ring
//! for reconnection resume, the single-tick event side channel,
//! debounced broadcasting, and snapshot persistence. Transports are
//! injected — this crate produces and consumes byte buffers only.
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
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_lossless
)]

mod debounce;
mod event;
mod history;
mod session;
/// Snapshot persistence (framed, checksummed, atomic writes).
pub mod snapshot;

/// Single-tick event side channel.
pub use event::{encode_events, Event, EventBuffer, EventPayload, EventTarget, PayloadError};
/// Bounded patch history for reconnection resume.
pub use history::{HistoryEntry, HistoryRing};
/// The per-viewer broadcast session and its pipeline types.
pub use session::{
    AfterBroadcastHook, BroadcastCallback, BroadcastMapHook, EncodeHook, Resume, SessionHooks,
    TickOutput, TrackedSession, ViewHook,
};
/// Snapshot persistence types, re-exported for convenience.
pub use snapshot::{EffectMeta, EffectRestoreFailure, Snapshot, SnapshotError};
