// SPDX-License-Identifier: Apache-2.0
//! Per-viewer session broadcasting over one tracked state.
//!
//! A [`TrackedSession`] owns the viewer table, the tick sequence
//! counter, the history ring, the event buffer, and the pipeline
//! hooks. Each tick produces one patch per viewer (projected through
//! that viewer's filter), commits the change set, mints the next
//! sequence number, and records the tick for reconnection resume.
//!
//! Lock layout: one lock covers viewers + history + sequence + acks
//! (and the hooks, which broadcast snapshots out of it); a second
//! lock covers only debounce state. The broadcast fan-out itself runs
//! without either lock held.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, trace};

use veil_core::{Encoder, Filter, Trackable, TrackedState};

use crate::debounce::Debouncer;
use crate::event::{encode_events, Event, EventBuffer, EventPayload, EventTarget, PayloadError};
use crate::history::{HistoryEntry, HistoryRing};

/// Hook observing a viewer and a state value in the pipeline.
pub type ViewHook<T, V> = Arc<dyn Fn(&V, &T) + Send + Sync>;
/// Hook rewriting a viewer's encoded buffer; an empty result skips
/// the viewer.
pub type EncodeHook<V> = Arc<dyn Fn(&V, Bytes) -> Bytes + Send + Sync>;
/// Hook filtering or rewriting the whole broadcast result map.
pub type BroadcastMapHook<V> = Arc<dyn Fn(&mut BTreeMap<V, Bytes>) + Send + Sync>;
/// Hook observing the finished broadcast and its sequence number.
pub type AfterBroadcastHook<V> = Arc<dyn Fn(&BTreeMap<V, Bytes>, u64) + Send + Sync>;
/// Callback invoked by debounced broadcasts.
pub type BroadcastCallback<V> = Arc<dyn Fn(&BTreeMap<V, Bytes>, u64) + Send + Sync>;

/// Optional pipeline hooks, invoked per broadcast.
pub struct SessionHooks<T, V> {
    /// Before the viewer's filter runs (receives the raw effective state).
    pub on_before_filter: Option<ViewHook<T, V>>,
    /// After the viewer's filter ran (receives the projected state).
    pub on_after_filter: Option<ViewHook<T, V>>,
    /// Right before encoding the projected state.
    pub on_before_encode: Option<ViewHook<T, V>>,
    /// After encoding; may rewrite, compress, or annotate the buffer.
    pub on_after_encode: Option<EncodeHook<V>>,
    /// Before the result map is returned; may drop or rewrite entries.
    pub on_before_broadcast: Option<BroadcastMapHook<V>>,
    /// After the tick completed, with the minted sequence number.
    pub on_after_broadcast: Option<AfterBroadcastHook<V>>,
}

impl<T, V> Default for SessionHooks<T, V> {
    fn default() -> Self {
        Self {
            on_before_filter: None,
            on_after_filter: None,
            on_before_encode: None,
            on_after_encode: None,
            on_before_broadcast: None,
            on_after_broadcast: None,
        }
    }
}

impl<T, V> Clone for SessionHooks<T, V> {
    fn clone(&self) -> Self {
        Self {
            on_before_filter: self.on_before_filter.clone(),
            on_after_filter: self.on_after_filter.clone(),
            on_before_encode: self.on_before_encode.clone(),
            on_after_encode: self.on_after_encode.clone(),
            on_before_broadcast: self.on_before_broadcast.clone(),
            on_after_broadcast: self.on_after_broadcast.clone(),
        }
    }
}

impl<T, V> std::fmt::Debug for SessionHooks<T, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHooks").finish_non_exhaustive()
    }
}

/// Outcome of a reconnection attempt. Resume never happens silently:
/// the variant tells the caller whether the viewer got a full state,
/// nothing, or an ordered run of patches.
#[derive(Debug, Clone)]
pub enum Resume {
    /// History could not cover the gap; one full-state message.
    Full(Bytes),
    /// The viewer already has the latest tick; nothing to send.
    UpToDate,
    /// Ordered patches covering every tick after the acked sequence.
    Patches(Vec<Bytes>),
}

impl Resume {
    /// Whether this resume fell back to a full state.
    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

/// Everything a tick produces: per-viewer diffs, per-viewer event
/// messages, and the minted sequence number.
#[derive(Debug)]
pub struct TickOutput<V> {
    /// Per-viewer patch / full-state buffers.
    pub diffs: BTreeMap<V, Bytes>,
    /// Per-viewer encoded event messages.
    pub events: BTreeMap<V, Bytes>,
    /// Sequence number minted by this tick.
    pub seq: u64,
}

struct ClientRecord<T> {
    filter: Option<Filter<T>>,
    needs_full: bool,
    last_ack: u64,
}

struct SessionInner<T, V> {
    clients: BTreeMap<V, ClientRecord<T>>,
    history: HistoryRing<V>,
    next_seq: u64,
    hooks: SessionHooks<T, V>,
}

struct BroadcastCtl<V> {
    interval: Duration,
    callback: Option<BroadcastCallback<V>>,
}

/// Per-viewer broadcast session over one [`TrackedState`].
pub struct TrackedSession<T, A, V> {
    state: Arc<TrackedState<T, A>>,
    inner: Mutex<SessionInner<T, V>>,
    codec: Mutex<Encoder>,
    events: EventBuffer<V>,
    ctl: Mutex<BroadcastCtl<V>>,
    debouncer: Debouncer,
    disposed: AtomicBool,
}

impl<T, A, V> std::fmt::Debug for TrackedSession<T, A, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedSession")
            .field("clients", &self.lock_inner().clients.len())
            .finish_non_exhaustive()
    }
}

impl<T, A, V> TrackedSession<T, A, V>
where
    T: Trackable + Clone,
    V: Ord + Clone + std::fmt::Debug,
{
    /// Creates a session with history disabled.
    #[must_use]
    pub fn new(state: Arc<TrackedState<T, A>>) -> Self {
        Self::with_history(state, 0)
    }

    /// Creates a session retaining up to `history` ticks for resume.
    #[must_use]
    pub fn with_history(state: Arc<TrackedState<T, A>>, history: usize) -> Self {
        Self {
            state,
            inner: Mutex::new(SessionInner {
                clients: BTreeMap::new(),
                history: HistoryRing::new(history),
                next_seq: 1,
                hooks: SessionHooks::default(),
            }),
            codec: Mutex::new(Encoder::new()),
            events: EventBuffer::new(),
            ctl: Mutex::new(BroadcastCtl {
                interval: Duration::ZERO,
                callback: None,
            }),
            debouncer: Debouncer::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// The tracked state this session broadcasts.
    #[must_use]
    pub fn state(&self) -> &Arc<TrackedState<T, A>> {
        &self.state
    }

    /// Installs the pipeline hooks (wholesale replacement).
    pub fn set_hooks(&self, hooks: SessionHooks<T, V>) {
        self.lock_inner().hooks = hooks;
    }

    // ── Viewer lifecycle ────────────────────────────────────────────

    /// Registers a viewer. Idempotent: a repeat connect overwrites the
    /// filter, re-arms the full-snapshot flag, and zeroes the ack.
    pub fn connect(&self, viewer: V, filter: Option<Filter<T>>) {
        debug!(viewer = ?viewer, has_filter = filter.is_some(), "viewer connected");
        self.lock_inner().clients.insert(
            viewer,
            ClientRecord {
                filter,
                needs_full: true,
                last_ack: 0,
            },
        );
    }

    /// Removes all bookkeeping for a viewer.
    pub fn disconnect(&self, viewer: &V) {
        debug!(viewer = ?viewer, "viewer disconnected");
        self.lock_inner().clients.remove(viewer);
    }

    /// Whether the viewer is connected.
    #[must_use]
    pub fn has_client(&self, viewer: &V) -> bool {
        self.lock_inner().clients.contains_key(viewer)
    }

    /// The viewer's filter, if connected and filtered.
    #[must_use]
    pub fn get_filter(&self, viewer: &V) -> Option<Filter<T>> {
        self.lock_inner()
            .clients
            .get(viewer)
            .and_then(|c| c.filter.clone())
    }

    /// Replaces the viewer's filter; ignored when not connected.
    pub fn set_filter(&self, viewer: &V, filter: Option<Filter<T>>) {
        if let Some(record) = self.lock_inner().clients.get_mut(viewer) {
            record.filter = filter;
        }
    }

    /// Connected viewers in ascending order.
    #[must_use]
    pub fn clients(&self) -> Vec<V> {
        self.lock_inner().clients.keys().cloned().collect()
    }

    /// Number of connected viewers.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.lock_inner().clients.len()
    }

    /// The viewer's last acknowledged sequence number.
    #[must_use]
    pub fn last_ack(&self, viewer: &V) -> Option<u64> {
        self.lock_inner().clients.get(viewer).map(|c| c.last_ack)
    }

    /// Number of ticks currently retained for resume.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.lock_inner().history.len()
    }

    // ── Broadcast pipeline ──────────────────────────────────────────

    /// Computes the per-viewer buffers for the current pending
    /// changes without committing or minting a sequence number.
    ///
    /// Viewers flagged for a full snapshot get a full-state message
    /// (the flag clears on read). Unfiltered viewers share one cached
    /// patch encoding; filtered viewers are encoded from their
    /// projected state and skipped when it has no changes.
    pub fn broadcast(&self) -> BTreeMap<V, Bytes> {
        let (viewers, hooks) = {
            let mut inner = self.lock_inner();
            let viewers: Vec<(V, Option<Filter<T>>, bool)> = inner
                .clients
                .iter_mut()
                .map(|(viewer, record)| {
                    let needs_full = std::mem::take(&mut record.needs_full);
                    (viewer.clone(), record.filter.clone(), needs_full)
                })
                .collect();
            (viewers, inner.hooks.clone())
        };

        let raw = self.state.get();
        let mut unfiltered_patch: Option<Option<Bytes>> = None;
        let mut result = BTreeMap::new();

        for (viewer, filter, needs_full) in viewers {
            if let Some(hook) = &hooks.on_before_filter {
                hook(&viewer, &raw);
            }
            let projected = filter.as_ref().map(|f| f(&raw));
            let view = projected.as_ref().unwrap_or(&raw);
            if let Some(hook) = &hooks.on_after_filter {
                hook(&viewer, view);
            }
            if let Some(hook) = &hooks.on_before_encode {
                hook(&viewer, view);
            }

            let data = if needs_full {
                Some(self.lock_codec().encode_full(view))
            } else if filter.is_none() {
                // One shared encoding for every unfiltered viewer.
                unfiltered_patch
                    .get_or_insert_with(|| self.lock_codec().encode_patch(&raw))
                    .clone()
            } else {
                self.lock_codec().encode_patch(view)
            };
            let Some(mut data) = data else {
                trace!(viewer = ?viewer, "no changes for viewer, skipped");
                continue;
            };

            if let Some(hook) = &hooks.on_after_encode {
                data = hook(&viewer, data);
                if data.is_empty() {
                    continue;
                }
            }
            result.insert(viewer, data);
        }

        if let Some(hook) = &hooks.on_before_broadcast {
            hook(&mut result);
        }
        result
    }

    /// Runs one tick; returns the per-viewer buffers.
    pub fn tick(&self) -> BTreeMap<V, Bytes> {
        self.tick_with_seq().0
    }

    /// Runs one tick; returns the buffers and the minted sequence.
    ///
    /// Order: broadcast, capture the unfiltered base patch (history
    /// only), commit the change set, mint the sequence, record the
    /// history entry, fire the after-broadcast hook.
    pub fn tick_with_seq(&self) -> (BTreeMap<V, Bytes>, u64) {
        let diffs = self.broadcast();
        let history_enabled = self.lock_inner().history.is_enabled();
        let base = if history_enabled {
            self.state.encode()
        } else {
            None
        };
        self.state.commit();

        let (seq, after_hook) = {
            let mut inner = self.lock_inner();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            if let Some(base) = base {
                inner.history.push(HistoryEntry {
                    seq,
                    base,
                    per_viewer: diffs.clone(),
                });
            }
            (seq, inner.hooks.on_after_broadcast.clone())
        };
        trace!(seq, viewers = diffs.len(), "tick complete");

        if let Some(hook) = after_hook {
            hook(&diffs, seq);
        }
        (diffs, seq)
    }

    /// Runs one tick and drains the event buffer into per-viewer
    /// event messages.
    pub fn tick_with_events(&self) -> TickOutput<V> {
        let had_events = self.events.has_events();
        let (diffs, seq) = self.tick_with_seq();

        let mut events_out = BTreeMap::new();
        if had_events {
            let viewers: BTreeSet<V> = {
                self.lock_inner().clients.keys().cloned().collect()
            };
            let mut per_viewer: BTreeMap<V, Vec<Event>> = BTreeMap::new();
            for (event, target) in self.events.drain() {
                match target {
                    EventTarget::All => {
                        for viewer in &viewers {
                            per_viewer
                                .entry(viewer.clone())
                                .or_default()
                                .push(event.clone());
                        }
                    }
                    EventTarget::To(viewer) => {
                        if viewers.contains(&viewer) {
                            per_viewer.entry(viewer).or_default().push(event);
                        }
                    }
                    EventTarget::Except(excluded) => {
                        for viewer in viewers.iter().filter(|v| **v != excluded) {
                            per_viewer
                                .entry(viewer.clone())
                                .or_default()
                                .push(event.clone());
                        }
                    }
                    EventTarget::ToMany(targets) => {
                        for viewer in targets {
                            if viewers.contains(&viewer) {
                                per_viewer
                                    .entry(viewer)
                                    .or_default()
                                    .push(event.clone());
                            }
                        }
                    }
                }
            }
            for (viewer, list) in per_viewer {
                if let Some(bytes) = encode_events(&list) {
                    events_out.insert(viewer, bytes);
                }
            }
        }

        TickOutput {
            diffs,
            events: events_out,
            seq,
        }
    }

    // ── Reconnection ────────────────────────────────────────────────

    /// Re-registers a viewer and computes its resume path.
    ///
    /// History disabled or not reaching back to `last_seq` falls back
    /// to one full-state message (projected through `filter` when
    /// present). A viewer that already acked the latest tick resumes
    /// with no updates. Otherwise every retained entry after
    /// `last_seq` is returned in order, preferring the viewer's own
    /// cached diff and falling back to the base diff.
    pub fn reconnect(&self, viewer: V, last_seq: u64, filter: Option<Filter<T>>) -> Resume {
        enum Plan {
            Full,
            UpToDate,
            Patches(Vec<Bytes>),
        }

        let (plan, current) = {
            let inner = self.lock_inner();
            let current = inner.next_seq.saturating_sub(1);
            let unreachable_history = !inner.history.is_enabled()
                || inner.history.earliest_seq().is_none_or(|e| e > last_seq);
            let plan = if unreachable_history {
                Plan::Full
            } else if last_seq >= current {
                Plan::UpToDate
            } else {
                let patches = inner
                    .history
                    .entries_after(last_seq)
                    .into_iter()
                    .map(|entry| {
                        entry
                            .per_viewer
                            .get(&viewer)
                            .cloned()
                            .unwrap_or_else(|| entry.base.clone())
                    })
                    .collect();
                Plan::Patches(patches)
            };
            (plan, current)
        };

        match plan {
            Plan::Full => {
                let data = match &filter {
                    Some(f) => self.state.encode_all_with_filter(f),
                    None => self.state.encode_all(),
                };
                self.register_resumed(viewer.clone(), filter, current);
                debug!(viewer = ?viewer, last_seq, "reconnect: full state");
                Resume::Full(data)
            }
            Plan::UpToDate => {
                self.register_resumed(viewer.clone(), filter, last_seq);
                debug!(viewer = ?viewer, last_seq, "reconnect: up to date");
                Resume::UpToDate
            }
            Plan::Patches(patches) => {
                self.register_resumed(viewer.clone(), filter, current);
                debug!(
                    viewer = ?viewer,
                    last_seq,
                    patches = patches.len(),
                    "reconnect: incremental resume"
                );
                Resume::Patches(patches)
            }
        }
    }

    /// Packs a [`Resume`] into a single transport message:
    /// full state as-is, patch runs as one patch-batch message.
    #[must_use]
    pub fn resume_message(&self, resume: &Resume) -> Option<Bytes> {
        match resume {
            Resume::Full(data) => Some(data.clone()),
            Resume::UpToDate => None,
            Resume::Patches(patches) => {
                let schema_id = self.state.read_base(|s| s.schema().id());
                Some(self.lock_codec().encode_patch_batch(schema_id, patches))
            }
        }
    }

    fn register_resumed(&self, viewer: V, filter: Option<Filter<T>>, last_ack: u64) {
        self.lock_inner().clients.insert(
            viewer,
            ClientRecord {
                filter,
                needs_full: false,
                last_ack,
            },
        );
    }

    // ── Events ──────────────────────────────────────────────────────

    /// Buffers an event for every viewer.
    pub fn emit(&self, kind: impl Into<String>, payload: impl Into<EventPayload>) {
        self.events.push(Event::new(kind, payload), EventTarget::All);
    }

    /// Buffers an event for one viewer.
    pub fn emit_to(&self, viewer: V, kind: impl Into<String>, payload: impl Into<EventPayload>) {
        self.events
            .push(Event::new(kind, payload), EventTarget::To(viewer));
    }

    /// Buffers an event for everyone except one viewer.
    pub fn emit_except(
        &self,
        viewer: V,
        kind: impl Into<String>,
        payload: impl Into<EventPayload>,
    ) {
        self.events
            .push(Event::new(kind, payload), EventTarget::Except(viewer));
    }

    /// Buffers an event for an explicit viewer list.
    pub fn emit_to_many(
        &self,
        viewers: Vec<V>,
        kind: impl Into<String>,
        payload: impl Into<EventPayload>,
    ) {
        self.events
            .push(Event::new(kind, payload), EventTarget::ToMany(viewers));
    }

    /// Buffers a pre-built event for a target.
    pub fn emit_raw(&self, event: Event, target: EventTarget<V>) {
        self.events.push(event, target);
    }

    /// Buffers a JSON-encoded event for every viewer.
    ///
    /// # Errors
    /// [`PayloadError`] when the payload does not marshal; the event
    /// is not buffered.
    pub fn emit_json(
        &self,
        kind: impl Into<String>,
        payload: &impl Serialize,
    ) -> Result<(), PayloadError> {
        let event = Event::json(kind, payload)?;
        self.events.push(event, EventTarget::All);
        Ok(())
    }

    // ── Debounce ────────────────────────────────────────────────────

    /// Sets the debounce interval; zero broadcasts synchronously.
    pub fn set_debounce(&self, interval: Duration) {
        self.lock_ctl().interval = interval;
    }

    /// Installs the debounced-broadcast callback.
    pub fn set_broadcast_callback(&self, callback: BroadcastCallback<V>) {
        self.lock_ctl().callback = Some(callback);
    }

    /// Stops timers, cancels scheduled effect expirations, and drains
    /// the event buffer. No broadcast runs after this returns.
    pub fn shutdown(&self) {
        debug!("session shutdown");
        self.disposed.store(true, Ordering::SeqCst);
        self.debouncer.dispose();
        self.state.clear_effects();
        let _ = self.events.drain();
    }
}

impl<T, A, V> TrackedSession<T, A, V>
where
    T: Trackable + Clone + 'static,
    A: Send + Sync + 'static,
    V: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
{
    /// Requests a broadcast. With a zero interval the tick and
    /// callback run inline; otherwise any pending timer is cancelled
    /// and a single fire is armed at `now + interval`.
    pub fn schedule_broadcast(self: &Arc<Self>) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let (interval, callback) = {
            let ctl = self.lock_ctl();
            (ctl.interval, ctl.callback.clone())
        };
        if interval.is_zero() {
            let (diffs, seq) = self.tick_with_seq();
            if let Some(callback) = callback {
                callback(&diffs, seq);
            }
            return;
        }

        let weak = Arc::downgrade(self);
        self.debouncer.schedule(interval, move || {
            let Some(session) = weak.upgrade() else {
                return;
            };
            if session.disposed.load(Ordering::SeqCst) {
                return;
            }
            let (diffs, seq) = session.tick_with_seq();
            let callback = session.lock_ctl().callback.clone();
            if let Some(callback) = callback {
                callback(&diffs, seq);
            }
        });
    }
}

impl<T, A, V> TrackedSession<T, A, V> {
    fn lock_inner(&self) -> MutexGuard<'_, SessionInner<T, V>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_codec(&self) -> MutexGuard<'_, Encoder> {
        self.codec
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_ctl(&self) -> MutexGuard<'_, BroadcastCtl<V>> {
        self.ctl
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<T, A, V> Drop for TrackedSession<T, A, V> {
    fn drop(&mut self) {
        self.debouncer.dispose();
    }
}
