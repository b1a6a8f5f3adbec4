// SPDX-License-Identifier: Apache-2.0
//! Broadcast pipeline behavior: full-then-patch lifecycle, filters,
//! hooks, and sequence numbering.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use veil_core::demo::{register_schemas, PlayerState};
use veil_core::wire::{MSG_FULL_STATE, MSG_PATCH};
use veil_core::{Filter, SchemaRegistry, TrackedState};
use veil_session::{SessionHooks, TrackedSession};

type Session = TrackedSession<PlayerState, u64, &'static str>;

fn session() -> Arc<Session> {
    let mut registry = SchemaRegistry::new();
    let schema = register_schemas(&mut registry);
    let registry = Arc::new(registry);
    let state = Arc::new(TrackedState::new(
        PlayerState::new(schema, 1),
        Arc::clone(&registry),
    ));
    Arc::new(TrackedSession::new(state))
}

fn hide_name() -> Filter<PlayerState> {
    Arc::new(|p: &PlayerState| {
        let mut projected = p.clone();
        projected.name = String::new();
        projected
    })
}

#[test]
fn first_tick_sends_full_state_then_patches() {
    let session = session();
    session.connect("alice", None);
    session.state().update(|p| p.set_score(1));

    let diffs = session.tick();
    assert_eq!(diffs["alice"][0], MSG_FULL_STATE);

    session.state().update(|p| p.set_score(2));
    let diffs = session.tick();
    assert_eq!(diffs["alice"][0], MSG_PATCH);
}

#[test]
fn unfiltered_viewers_share_one_patch_encoding() {
    let session = session();
    session.connect("alice", None);
    session.connect("bob", None);
    session.tick(); // consume the initial full snapshots

    session.state().update(|p| p.set_score(7));
    let diffs = session.tick();
    assert_eq!(diffs["alice"], diffs["bob"]);
}

#[test]
fn quiet_tick_produces_no_buffers_but_mints_a_seq() {
    let session = session();
    session.connect("alice", None);
    session.tick();

    let (diffs, seq) = session.tick_with_seq();
    assert!(diffs.is_empty());
    assert_eq!(seq, 2);
}

#[test]
fn sequence_numbers_increase_by_one() {
    let session = session();
    let mut seqs = Vec::new();
    for _ in 0..5 {
        seqs.push(session.tick_with_seq().1);
    }
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}

#[test]
fn filtered_viewer_gets_its_own_projection() {
    let session = session();
    session.connect("spectator", Some(hide_name()));
    session.connect("player", None);
    session.state().update(|p| {
        p.set_name("secret");
        p.set_score(3);
    });

    let diffs = session.tick();
    // Both got full states, but the spectator's must not carry the name.
    assert!(diffs["player"].windows(6).any(|w| w == b"secret"));
    assert!(!diffs["spectator"].windows(6).any(|w| w == b"secret"));
}

#[test]
fn repeat_connect_rearms_the_full_snapshot() {
    let session = session();
    session.connect("alice", None);
    session.tick();
    session.state().update(|p| p.set_score(4));

    session.connect("alice", None);
    let diffs = session.tick();
    assert_eq!(diffs["alice"][0], MSG_FULL_STATE);
}

#[test]
fn disconnect_removes_the_viewer_from_broadcasts() {
    let session = session();
    session.connect("alice", None);
    session.connect("bob", None);
    session.tick();
    session.disconnect(&"bob");

    session.state().update(|p| p.set_score(9));
    let diffs = session.tick();
    assert!(diffs.contains_key("alice"));
    assert!(!diffs.contains_key("bob"));
    assert_eq!(session.client_count(), 1);
}

#[test]
fn after_encode_hook_rewrites_and_empty_skips() {
    let session = session();
    session.connect("keep", None);
    session.connect("skip", None);

    session.set_hooks(SessionHooks {
        on_after_encode: Some(Arc::new(|viewer: &&'static str, data| {
            if *viewer == "skip" {
                Bytes::new()
            } else {
                data
            }
        })),
        ..SessionHooks::default()
    });

    session.state().update(|p| p.set_score(1));
    let diffs = session.tick();
    assert!(diffs.contains_key("keep"));
    assert!(!diffs.contains_key("skip"));
}

#[test]
fn pipeline_hooks_fire_in_order_per_viewer() {
    let session = session();
    session.connect("alice", Some(hide_name()));

    let calls = Arc::new(AtomicUsize::new(0));
    let before_filter = Arc::clone(&calls);
    let after_filter = Arc::clone(&calls);
    let before_encode = Arc::clone(&calls);
    session.set_hooks(SessionHooks {
        on_before_filter: Some(Arc::new(move |_: &&'static str, _: &PlayerState| {
            before_filter.fetch_add(1, Ordering::SeqCst);
        })),
        on_after_filter: Some(Arc::new(move |_: &&'static str, state: &PlayerState| {
            // The filter already ran: the name is projected away.
            assert!(state.name.is_empty());
            after_filter.fetch_add(1, Ordering::SeqCst);
        })),
        on_before_encode: Some(Arc::new(move |_: &&'static str, _: &PlayerState| {
            before_encode.fetch_add(1, Ordering::SeqCst);
        })),
        ..SessionHooks::default()
    });

    session.state().update(|p| p.set_name("bob"));
    session.tick();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn before_broadcast_hook_can_drop_entries() {
    let session = session();
    session.connect("alice", None);
    session.connect("bob", None);

    session.set_hooks(SessionHooks {
        on_before_broadcast: Some(Arc::new(|result| {
            result.remove("bob");
        })),
        ..SessionHooks::default()
    });

    session.state().update(|p| p.set_score(2));
    let diffs = session.tick();
    assert!(diffs.contains_key("alice"));
    assert!(!diffs.contains_key("bob"));
}

#[test]
fn after_broadcast_hook_sees_the_minted_seq() {
    let session = session();
    session.connect("alice", None);

    let seen = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&seen);
    session.set_hooks(SessionHooks {
        on_after_broadcast: Some(Arc::new(move |_, seq| {
            observed.store(seq as usize, Ordering::SeqCst);
        })),
        ..SessionHooks::default()
    });

    session.tick();
    session.tick();
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}
