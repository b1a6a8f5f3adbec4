// SPDX-License-Identifier: Apache-2.0
//! Wire-level constants shared by the encoder and decoder.

/// Message kind byte: full-state message.
pub const MSG_FULL_STATE: u8 = 0x01;
/// Message kind byte: patch message.
pub const MSG_PATCH: u8 = 0x02;
/// Message kind byte: batch of patch messages (resume transport).
pub const MSG_PATCH_BATCH: u8 = 0x03;
/// Message kind byte: single event.
pub const MSG_EVENT: u8 = 0x10;
/// Message kind byte: batch of events.
pub const MSG_EVENT_BATCH: u8 = 0x11;

/// Collection mode byte: incremental element/entry changes follow.
pub const MODE_INCREMENTAL: u8 = 0x00;
/// Collection mode byte: a full collection body follows.
pub const MODE_FULL: u8 = 0x01;
