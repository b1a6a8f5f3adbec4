// SPDX-License-Identifier: Apache-2.0
//! Per-viewer state projections and their registry.
//!
//! A filter is a pure `&state → state` projection (hide a hand, strip
//! team-only fields, apply fog of war) applied after effects and
//! before encoding. Filters must not mutate their argument; they
//! shallow-clone before altering fields so the base state stays safe
//! to read concurrently.
//!
//! The registry stores each viewer's filters in a `BTreeMap` keyed by
//! filter id, so composition order is deterministic (ascending id).
//! Registered filters are required to be order-independent under
//! composition; pipelines that need a strict order express it through
//! [`FilterRegistry::compose_with`] with an explicit base filter.

use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;

/// A pure per-viewer projection of state.
pub type Filter<S> = Arc<dyn Fn(&S) -> S + Send + Sync>;

/// Per-viewer filter table: viewer id → (filter id → filter).
///
/// One lock guards the nested map; composition copies the filter list
/// out of the lock so filter execution is lock-free.
pub struct FilterRegistry<V, S> {
    inner: Mutex<FxHashMap<V, BTreeMap<String, Filter<S>>>>,
}

impl<V, S> Default for FilterRegistry<V, S> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(FxHashMap::default()),
        }
    }
}

impl<V, S> std::fmt::Debug for FilterRegistry<V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("viewers", &self.lock().len())
            .finish()
    }
}

impl<V, S> FilterRegistry<V, S>
where
    V: Eq + Hash + Clone,
    S: 'static,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `filter` under (`viewer`, `filter_id`), replacing any
    /// prior filter with that id.
    pub fn add(&self, viewer: &V, filter_id: impl Into<String>, filter: Filter<S>) {
        self.lock()
            .entry(viewer.clone())
            .or_default()
            .insert(filter_id.into(), filter);
    }

    /// Removes one filter. Returns whether it was present.
    pub fn remove(&self, viewer: &V, filter_id: &str) -> bool {
        let mut inner = self.lock();
        let Some(filters) = inner.get_mut(viewer) else {
            return false;
        };
        let removed = filters.remove(filter_id).is_some();
        if filters.is_empty() {
            inner.remove(viewer);
        }
        removed
    }

    /// Whether (`viewer`, `filter_id`) is registered.
    #[must_use]
    pub fn has(&self, viewer: &V, filter_id: &str) -> bool {
        self.lock()
            .get(viewer)
            .is_some_and(|f| f.contains_key(filter_id))
    }

    /// The filter registered under (`viewer`, `filter_id`).
    #[must_use]
    pub fn get(&self, viewer: &V, filter_id: &str) -> Option<Filter<S>> {
        self.lock()
            .get(viewer)
            .and_then(|f| f.get(filter_id))
            .map(Arc::clone)
    }

    /// All filter ids registered for `viewer`, ascending.
    #[must_use]
    pub fn all_ids(&self, viewer: &V) -> Vec<String> {
        self.lock()
            .get(viewer)
            .map_or_else(Vec::new, |f| f.keys().cloned().collect())
    }

    /// Number of filters registered for `viewer`.
    #[must_use]
    pub fn count(&self, viewer: &V) -> usize {
        self.lock().get(viewer).map_or(0, BTreeMap::len)
    }

    /// Removes every filter for `viewer`.
    pub fn clear(&self, viewer: &V) {
        self.lock().remove(viewer);
    }

    /// Removes every filter for every viewer.
    pub fn clear_all(&self) {
        self.lock().clear();
    }

    /// Composes `viewer`'s filters in ascending filter-id order.
    ///
    /// Returns `None` when the viewer has no filters and the single
    /// filter unwrapped when there is exactly one. The filter list is
    /// copied before the lock is released, so executing the returned
    /// composition takes no lock.
    #[must_use]
    pub fn compose(&self, viewer: &V) -> Option<Filter<S>> {
        let filters: Vec<Filter<S>> = {
            let inner = self.lock();
            let Some(map) = inner.get(viewer) else {
                return None;
            };
            map.values().map(Arc::clone).collect()
        };
        match filters.len() {
            0 => None,
            1 => filters.into_iter().next(),
            _ => Some(Arc::new(move |state: &S| {
                let mut current = (filters[0])(state);
                for filter in &filters[1..] {
                    current = filter(&current);
                }
                current
            })),
        }
    }

    /// Composes `base` (first) with the registry composition.
    /// Returns `None` only when both are absent.
    #[must_use]
    pub fn compose_with(&self, viewer: &V, base: Option<Filter<S>>) -> Option<Filter<S>> {
        let registered = self.compose(viewer);
        match (base, registered) {
            (None, None) => None,
            (Some(f), None) | (None, Some(f)) => Some(f),
            (Some(base), Some(registered)) => Some(Arc::new(move |state: &S| {
                let projected = base(state);
                registered(&projected)
            })),
        }
    }
}

impl<V, S> FilterRegistry<V, S> {
    fn lock(&self) -> MutexGuard<'_, FxHashMap<V, BTreeMap<String, Filter<S>>>> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
