// SPDX-License-Identifier: Apache-2.0
//! Single-tick event side channel.
//!
//! Events are fire-and-forget notifications that ride alongside state
//! patches: buffered by emitters during a tick, drained at tick end,
//! fanned out by target, and encoded one message per viewer. The
//! buffer pairs a mutex-guarded vec with an atomic counter so the
//! tick loop can ask "anything pending?" without taking the lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use veil_core::varint::write_uvarint;
use veil_core::wire::{MSG_EVENT, MSG_EVENT_BATCH};

/// Event payload encoding failures.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// JSON marshalling of a structured payload failed; the event is
    /// not buffered.
    #[error("unencodable event payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// One event: a type tag and an opaque payload body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Event type tag.
    pub kind: String,
    /// Encoded payload body (possibly empty).
    pub payload: Bytes,
}

impl Event {
    /// Creates an event from an already-encoded payload.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: impl Into<EventPayload>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into().into_bytes(),
        }
    }

    /// Creates an event with a JSON-encoded payload.
    ///
    /// # Errors
    /// [`PayloadError::Json`] when the value does not marshal.
    pub fn json(kind: impl Into<String>, payload: &impl Serialize) -> Result<Self, PayloadError> {
        let body = serde_json::to_vec(payload)?;
        Ok(Self {
            kind: kind.into(),
            payload: Bytes::from(body),
        })
    }
}

/// Recognized payload shapes: empty, raw bytes, or UTF-8 text.
/// Anything else goes through [`Event::json`].
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// No body.
    Empty,
    /// Raw bytes, passed through untouched.
    Bytes(Bytes),
    /// Text, shipped as UTF-8 bytes.
    Text(String),
}

impl EventPayload {
    fn into_bytes(self) -> Bytes {
        match self {
            Self::Empty => Bytes::new(),
            Self::Bytes(b) => b,
            Self::Text(s) => Bytes::from(s.into_bytes()),
        }
    }
}

impl From<()> for EventPayload {
    fn from((): ()) -> Self {
        Self::Empty
    }
}

impl From<Bytes> for EventPayload {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<u8>> for EventPayload {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<&str> for EventPayload {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for EventPayload {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Delivery target of one buffered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTarget<V> {
    /// Every connected viewer.
    All,
    /// One viewer.
    To(V),
    /// Every viewer except one.
    Except(V),
    /// An explicit viewer list.
    ToMany(Vec<V>),
}

/// Per-tick event buffer: emitters push, the tick loop drains.
#[derive(Debug)]
pub struct EventBuffer<V> {
    entries: Mutex<Vec<(Event, EventTarget<V>)>>,
    pending: AtomicUsize,
}

impl<V> Default for EventBuffer<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
        }
    }
}

impl<V> EventBuffer<V> {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers an event for its target.
    pub fn push(&self, event: Event, target: EventTarget<V>) {
        let mut entries = self.lock();
        entries.push((event, target));
        self.pending.store(entries.len(), Ordering::Release);
    }

    /// Whether anything is buffered; lock-free.
    #[must_use]
    pub fn has_events(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }

    /// Empties the buffer atomically, returning everything buffered.
    #[must_use]
    pub fn drain(&self) -> Vec<(Event, EventTarget<V>)> {
        let mut entries = self.lock();
        self.pending.store(0, Ordering::Release);
        std::mem::take(&mut *entries)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(Event, EventTarget<V>)>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Encodes a viewer's event list as one message.
///
/// A single event ships as `Event`; more become `EventBatch` with a
/// varuint count. Entries are `(varuint kind-len, kind bytes, varuint
/// payload-len, payload bytes)`.
#[must_use]
pub fn encode_events(events: &[Event]) -> Option<Bytes> {
    if events.is_empty() {
        return None;
    }
    let mut out = Vec::with_capacity(16 + events.iter().map(|e| e.kind.len() + e.payload.len()).sum::<usize>());
    if events.len() == 1 {
        out.push(MSG_EVENT);
    } else {
        out.push(MSG_EVENT_BATCH);
        write_uvarint(&mut out, events.len() as u64);
    }
    for event in events {
        write_uvarint(&mut out, event.kind.len() as u64);
        out.extend_from_slice(event.kind.as_bytes());
        write_uvarint(&mut out, event.payload.len() as u64);
        out.extend_from_slice(&event.payload);
    }
    Some(Bytes::from(out))
}
