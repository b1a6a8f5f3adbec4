// SPDX-License-Identifier: Apache-2.0
//! The single-writer seam: one tracked state, its effects, one codec.
//!
//! [`TrackedState`] binds a [`Trackable`] instance, its
//! [`EffectStack`], and an [`Encoder`] under a single read-write
//! lock. Writers go through [`TrackedState::update`]; between two
//! commits the batch of changes is atomic with respect to readers —
//! any read sees all of a batch's effects in the effective state or
//! none of them.
//!
//! Encoded buffers are freshly allocated per call; callers may retain
//! them indefinitely. The growable scratch buffer never leaves the
//! encoder.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;

use crate::effect::{Effect, EffectError, EffectStack};
use crate::encoder::Encoder;
use crate::filter::Filter;
use crate::schema::SchemaRegistry;
use crate::trackable::Trackable;

struct Guarded<T, A> {
    state: T,
    effects: EffectStack<T, A>,
}

/// A tracked state tree with read-time effects and a bound encoder.
pub struct TrackedState<T, A> {
    guarded: RwLock<Guarded<T, A>>,
    encoder: Mutex<Encoder>,
    registry: Arc<SchemaRegistry>,
}

impl<T, A> std::fmt::Debug for TrackedState<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedState")
            .field("effects", &self.read_guard().effects.len())
            .finish()
    }
}

impl<T, A> TrackedState<T, A>
where
    T: Trackable + Clone,
{
    /// Creates a tracked state from its initial value.
    #[must_use]
    pub fn new(initial: T, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            guarded: RwLock::new(Guarded {
                state: initial,
                effects: EffectStack::new(),
            }),
            // One encoder per state tree, scratch reused across calls.
            encoder: Mutex::new(Encoder::new()),
            registry,
        }
    }

    /// The schema registry this tree encodes against.
    #[must_use]
    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Effective state: base state folded through the effect stack.
    ///
    /// The returned clone shares its change set with the live
    /// instance; prefer [`TrackedState::read`] when a borrow will do.
    #[must_use]
    pub fn get(&self) -> T {
        let guard = self.read_guard();
        guard.effects.apply_all(guard.state.clone())
    }

    /// Base state without effects (same sharing caveat as
    /// [`TrackedState::get`]).
    #[must_use]
    pub fn get_base(&self) -> T {
        self.read_guard().state.clone()
    }

    /// Runs `f` against the effective state under the read lock.
    /// `f` must not let the state escape.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.read_guard();
        let effective = guard.effects.apply_all(guard.state.clone());
        f(&effective)
    }

    /// Runs `f` against the base state under the read lock.
    pub fn read_base<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.read_guard().state)
    }

    /// Runs `f` with mutable access to the state under the write
    /// lock. Trackable setters invoked inside `f` populate the change
    /// set; the whole call is one atomic batch for readers.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.write_guard();
        f(&mut guard.state)
    }

    /// Replaces the state wholesale and marks every field dirty.
    pub fn set(&self, new_state: T) {
        let mut guard = self.write_guard();
        guard.state = new_state;
        guard.state.mark_all_dirty();
    }

    /// Encodes a patch for the effective state's pending changes.
    /// Returns `None` when nothing changed.
    #[must_use]
    pub fn encode(&self) -> Option<Bytes> {
        let guard = self.read_guard();
        if !guard.state.changes().has_changes() {
            return None;
        }
        let effective = guard.effects.apply_all(guard.state.clone());
        self.encoder_guard().encode_patch(&effective)
    }

    /// Encodes a full-state message for the effective state.
    #[must_use]
    pub fn encode_all(&self) -> Bytes {
        let guard = self.read_guard();
        let effective = guard.effects.apply_all(guard.state.clone());
        self.encoder_guard().encode_full(&effective)
    }

    /// Encodes a patch for the effective state projected through
    /// `filter`. Returns `None` when the filtered change set is empty.
    #[must_use]
    pub fn encode_with_filter(&self, filter: &Filter<T>) -> Option<Bytes> {
        let guard = self.read_guard();
        let effective = guard.effects.apply_all(guard.state.clone());
        let projected = filter(&effective);
        if !projected.changes().has_changes() {
            return None;
        }
        self.encoder_guard().encode_patch(&projected)
    }

    /// Encodes a full-state message for the filtered effective state.
    #[must_use]
    pub fn encode_all_with_filter(&self, filter: &Filter<T>) -> Bytes {
        let guard = self.read_guard();
        let effective = guard.effects.apply_all(guard.state.clone());
        let projected = filter(&effective);
        self.encoder_guard().encode_full(&projected)
    }

    /// Clears all tracked changes (the commit boundary).
    pub fn commit(&self) {
        self.write_guard().state.clear_changes();
    }

    /// Whether any field is dirty.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.read_guard().state.changes().has_changes()
    }

    // ── Effect stack, proxied under the same lock ───────────────────

    /// Adds an effect with its activator.
    ///
    /// # Errors
    /// [`EffectError::DuplicateId`] when the id is already present.
    pub fn add_effect(
        &self,
        effect: Arc<dyn Effect<T, A>>,
        activator: A,
    ) -> Result<(), EffectError> {
        self.write_guard().effects.add(effect, activator)
    }

    /// Removes the effect with `id`; silent miss, reports removal.
    pub fn remove_effect(&self, id: &str) -> bool {
        self.write_guard().effects.remove(id)
    }

    /// Removes every effect.
    pub fn clear_effects(&self) {
        self.write_guard().effects.clear();
    }

    /// Sweeps expired effects; returns the number removed.
    pub fn cleanup_expired_effects(&self) -> usize {
        self.write_guard().effects.cleanup_expired()
    }

    /// Effect ids in application order.
    #[must_use]
    pub fn effect_ids(&self) -> Vec<String> {
        self.read_guard().effects.ids()
    }

    /// Snapshot of the stacked effects in application order.
    #[must_use]
    pub fn effects(&self) -> Vec<Arc<dyn Effect<T, A>>> {
        self.read_guard().effects.effects()
    }

    /// Number of effects on the stack.
    #[must_use]
    pub fn effect_count(&self) -> usize {
        self.read_guard().effects.len()
    }
}

impl<T, A> TrackedState<T, A> {
    fn read_guard(&self) -> RwLockReadGuard<'_, Guarded<T, A>> {
        self.guarded
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, Guarded<T, A>> {
        self.guarded
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn encoder_guard(&self) -> MutexGuard<'_, Encoder> {
        self.encoder
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
