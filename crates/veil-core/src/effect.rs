// SPDX-License-Identifier: Apache-2.0
//! Ordered, reversible read-time state transformations.
//!
//! Effects never touch the authoritative state: they are applied on
//! read, in insertion order, each producing a new (shallow-cloned)
//! value. Removing an effect therefore restores the composition
//! without it — no undo log required.
//!
//! Dispatch follows a small capability set rather than inheritance:
//! [`Effect`] is the required surface, expiry is an overridable
//! default, and [`Schedulable`] is an optional extension discovered
//! through [`Effect::as_schedulable`].

use std::sync::Arc;

use thiserror::Error;

/// Effect-stack errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectError {
    /// An effect with the same id is already on the stack.
    #[error("duplicate effect id {0}")]
    DuplicateId(String),
}

/// A keyed `state → state` transformation parameterized by an
/// activator value (e.g. the player who triggered a buff).
pub trait Effect<S, A>: Send + Sync {
    /// Stable identifier; unique within one stack.
    fn id(&self) -> &str;

    /// Applies the transformation. Must not mutate shared data the
    /// input aliases; returns a new value.
    fn apply(&self, state: S, activator: &A) -> S;

    /// Whether this effect has expired and should be swept by
    /// [`EffectStack::cleanup_expired`].
    fn expired(&self) -> bool {
        false
    }

    /// The self-scheduling capability, when implemented.
    fn as_schedulable(&self) -> Option<&dyn Schedulable> {
        None
    }
}

/// Optional capability: an effect that owns an expiry timer.
pub trait Schedulable: Send + Sync {
    /// Arms the expiry timer; `on_expire` runs when it fires.
    fn schedule_expiration(&self, on_expire: Box<dyn FnOnce() + Send>);

    /// Cancels a pending expiry timer, if any.
    fn cancel_scheduled_expiration(&self);
}

struct EffectEntry<S, A> {
    effect: Arc<dyn Effect<S, A>>,
    activator: A,
}

/// Ordered list of effects with their activators.
///
/// Insertion order is application order. The stack itself is not
/// locked — it lives inside [`TrackedState`](crate::TrackedState)'s
/// write-guarded interior.
pub struct EffectStack<S, A> {
    entries: Vec<EffectEntry<S, A>>,
}

impl<S, A> Default for EffectStack<S, A> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<S, A> std::fmt::Debug for EffectStack<S, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectStack")
            .field("ids", &self.ids())
            .finish()
    }
}

impl<S, A> EffectStack<S, A> {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an effect with its activator.
    ///
    /// # Errors
    /// [`EffectError::DuplicateId`] when an effect with the same id is
    /// already present; the stack is unchanged.
    pub fn add(&mut self, effect: Arc<dyn Effect<S, A>>, activator: A) -> Result<(), EffectError> {
        if self.entries.iter().any(|e| e.effect.id() == effect.id()) {
            return Err(EffectError::DuplicateId(effect.id().to_owned()));
        }
        self.entries.push(EffectEntry { effect, activator });
        Ok(())
    }

    /// Removes the effect with `id`, cancelling its expiry timer.
    /// Returns whether anything was removed; a miss is silent.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| {
            if e.effect.id() == id {
                if let Some(s) = e.effect.as_schedulable() {
                    s.cancel_scheduled_expiration();
                }
                false
            } else {
                true
            }
        });
        self.entries.len() != before
    }

    /// Removes every effect, cancelling all timers.
    pub fn clear(&mut self) {
        for entry in &self.entries {
            if let Some(s) = entry.effect.as_schedulable() {
                s.cancel_scheduled_expiration();
            }
        }
        self.entries.clear();
    }

    /// Sweeps expired effects, cancelling their timers. Returns the
    /// number removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| {
            if e.effect.expired() {
                if let Some(s) = e.effect.as_schedulable() {
                    s.cancel_scheduled_expiration();
                }
                false
            } else {
                true
            }
        });
        before - self.entries.len()
    }

    /// Snapshot of effect ids in application order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.effect.id().to_owned())
            .collect()
    }

    /// Snapshot of the effects in application order.
    #[must_use]
    pub fn effects(&self) -> Vec<Arc<dyn Effect<S, A>>> {
        self.entries.iter().map(|e| Arc::clone(&e.effect)).collect()
    }

    /// Number of effects on the stack.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Folds `state` through every effect in insertion order.
    #[must_use]
    pub fn apply_all(&self, state: S) -> S {
        self.entries
            .iter()
            .fold(state, |s, e| e.effect.apply(s, &e.activator))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct AddPoints {
        id: String,
        amount: i64,
        expired: AtomicBool,
    }

    impl AddPoints {
        fn new(id: &str, amount: i64) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_owned(),
                amount,
                expired: AtomicBool::new(false),
            })
        }
    }

    impl Effect<i64, u32> for AddPoints {
        fn id(&self) -> &str {
            &self.id
        }

        fn apply(&self, state: i64, _activator: &u32) -> i64 {
            state + self.amount
        }

        fn expired(&self) -> bool {
            self.expired.load(Ordering::SeqCst)
        }
    }

    struct Doubler;

    impl Effect<i64, u32> for Doubler {
        fn id(&self) -> &str {
            "double"
        }

        fn apply(&self, state: i64, _activator: &u32) -> i64 {
            state * 2
        }
    }

    struct Cancellable {
        cancels: Arc<AtomicUsize>,
    }

    impl Effect<i64, u32> for Cancellable {
        fn id(&self) -> &str {
            "cancellable"
        }

        fn apply(&self, state: i64, _activator: &u32) -> i64 {
            state
        }

        fn expired(&self) -> bool {
            true
        }

        fn as_schedulable(&self) -> Option<&dyn Schedulable> {
            Some(self)
        }
    }

    impl Schedulable for Cancellable {
        fn schedule_expiration(&self, _on_expire: Box<dyn FnOnce() + Send>) {}

        fn cancel_scheduled_expiration(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn applies_in_insertion_order() {
        let mut stack = EffectStack::new();
        stack.add(AddPoints::new("plus", 3), 0).unwrap();
        stack.add(Arc::new(Doubler), 0).unwrap();
        // (10 + 3) * 2, not 10 * 2 + 3.
        assert_eq!(stack.apply_all(10), 26);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut stack = EffectStack::new();
        stack.add(AddPoints::new("buff", 1), 0).unwrap();
        let err = stack.add(AddPoints::new("buff", 2), 0);
        assert_eq!(err, Err(EffectError::DuplicateId("buff".into())));
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn remove_restores_composition_without_the_effect() {
        let mut stack = EffectStack::new();
        stack.add(AddPoints::new("plus", 3), 0).unwrap();
        stack.add(Arc::new(Doubler), 0).unwrap();
        assert!(stack.remove("plus"));
        assert_eq!(stack.apply_all(10), 20);
        assert!(!stack.remove("plus"));
    }

    #[test]
    fn cleanup_sweeps_expired_only() {
        let mut stack = EffectStack::new();
        let keep = AddPoints::new("keep", 1);
        let drop_me = AddPoints::new("drop", 100);
        drop_me.expired.store(true, Ordering::SeqCst);
        stack.add(keep, 0).unwrap();
        stack.add(drop_me, 0).unwrap();
        assert_eq!(stack.cleanup_expired(), 1);
        assert_eq!(stack.ids(), vec!["keep".to_owned()]);
    }

    #[test]
    fn remove_and_clear_cancel_timers() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let mut stack = EffectStack::new();
        stack
            .add(
                Arc::new(Cancellable {
                    cancels: Arc::clone(&cancels),
                }),
                0,
            )
            .unwrap();
        assert!(stack.remove("cancellable"));
        assert_eq!(cancels.load(Ordering::SeqCst), 1);

        stack
            .add(
                Arc::new(Cancellable {
                    cancels: Arc::clone(&cancels),
                }),
                0,
            )
            .unwrap();
        stack.clear();
        assert_eq!(cancels.load(Ordering::SeqCst), 2);

        stack
            .add(
                Arc::new(Cancellable {
                    cancels: Arc::clone(&cancels),
                }),
                0,
            )
            .unwrap();
        assert_eq!(stack.cleanup_expired(), 1);
        assert_eq!(cancels.load(Ordering::SeqCst), 3);
    }
}
