// SPDX-License-Identifier: Apache-2.0
//! Reconnection resume: history windows, full-state fallback, and
//! equivalence of resumed patches with the tick-by-tick stream.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;

use veil_core::demo::{register_schemas, PlayerState};
use veil_core::wire::MSG_PATCH_BATCH;
use veil_core::{
    apply_full, apply_patch, DecodedMessage, Decoder, MapState, SchemaRegistry, TrackedState,
    Value,
};
use veil_session::{Resume, TrackedSession};

type Session = TrackedSession<PlayerState, u64, &'static str>;

fn session_with_history(capacity: usize) -> (Arc<SchemaRegistry>, Arc<Session>) {
    let mut registry = SchemaRegistry::new();
    let schema = register_schemas(&mut registry);
    let registry = Arc::new(registry);
    let state = Arc::new(TrackedState::new(
        PlayerState::new(schema, 1),
        Arc::clone(&registry),
    ));
    (
        Arc::clone(&registry),
        Arc::new(TrackedSession::with_history(state, capacity)),
    )
}

fn apply_message(image: &mut MapState, decoder: &Decoder, registry: &SchemaRegistry, data: &[u8]) {
    let schema_id = match decoder.decode(data).unwrap() {
        DecodedMessage::Patch(patch) => {
            let schema = registry.get(patch.schema_id).unwrap();
            apply_patch(image, &patch, schema);
            patch.schema_id
        }
        DecodedMessage::Full(full) => {
            let schema = registry.get(full.schema_id).unwrap();
            apply_full(image, &full, schema);
            full.schema_id
        }
        _ => panic!("unexpected message"),
    };
    assert_ne!(schema_id, 0);
}

#[test]
fn resume_within_history_returns_the_missing_patches() {
    let (registry, session) = session_with_history(10);
    let decoder = Decoder::new(Arc::clone(&registry));

    // One live viewer follows the whole stream: a full snapshot on the
    // first tick, patches after.
    session.connect("live", None);
    let mut per_tick = Vec::new();
    let mut streamed = MapState::new();
    for score in 1..=5 {
        session.state().update(|p| p.set_score(score));
        let (diffs, seq) = session.tick_with_seq();
        assert_eq!(seq, score as u64);
        per_tick.push(diffs["live"].clone());
    }
    for message in &per_tick {
        apply_message(&mut streamed, &decoder, &registry, message);
    }
    assert_eq!(streamed.get("score"), Some(&Value::I64(5)));

    // A client that last saw seq 2 resumes with exactly seqs 3..5.
    let resume = session.reconnect("late", 2, None);
    let Resume::Patches(patches) = &resume else {
        panic!("expected patches, got {resume:?}");
    };
    assert!(!resume.is_full());
    assert_eq!(patches.len(), 3);

    // Applying them on top of the seq-2 state converges with the stream.
    let mut resumed = MapState::new();
    for message in &per_tick[..2] {
        apply_message(&mut resumed, &decoder, &registry, message);
    }
    assert_eq!(resumed.get("score"), Some(&Value::I64(2)));
    for patch in patches {
        apply_message(&mut resumed, &decoder, &registry, patch);
    }
    assert_eq!(resumed, streamed);
}

#[test]
fn resume_past_the_window_falls_back_to_full_state() {
    let (registry, session) = session_with_history(3);
    let decoder = Decoder::new(Arc::clone(&registry));

    for score in 1..=10 {
        session.state().update(|p| p.set_score(score));
        session.tick();
    }
    // Ring now holds seqs 8..10; seq 1 is long gone.
    assert_eq!(session.history_len(), 3);

    let resume = session.reconnect("late", 1, None);
    assert!(resume.is_full());
    let Resume::Full(data) = resume else {
        panic!("expected full state");
    };
    let mut image = MapState::new();
    apply_message(&mut image, &decoder, &registry, &data);
    assert_eq!(image.get("score"), Some(&Value::I64(10)));
}

#[test]
fn current_client_resumes_with_no_updates() {
    let (_, session) = session_with_history(10);
    for score in 1..=4 {
        session.state().update(|p| p.set_score(score));
        session.tick();
    }
    let resume = session.reconnect("current", 4, None);
    assert!(matches!(resume, Resume::UpToDate));
    assert_eq!(session.last_ack(&"current"), Some(4));
}

#[test]
fn history_disabled_always_reconnects_full() {
    let (_, session) = session_with_history(0);
    session.state().update(|p| p.set_score(1));
    session.tick();
    assert!(session.reconnect("v", 1, None).is_full());
}

#[test]
fn reconnected_viewer_does_not_get_a_second_full_on_next_tick() {
    let (_, session) = session_with_history(10);
    session.state().update(|p| p.set_score(1));
    session.tick();

    let _ = session.reconnect("v", 0, None);
    session.state().update(|p| p.set_score(2));
    let diffs = session.tick();
    // A patch, not another full snapshot.
    assert_eq!(diffs["v"][0], veil_core::wire::MSG_PATCH);
}

#[test]
fn filtered_reconnect_projects_the_full_state() {
    let (registry, session) = session_with_history(0);
    let decoder = Decoder::new(Arc::clone(&registry));
    session.state().update(|p| {
        p.set_name("secret");
        p.set_score(5);
    });
    session.tick();

    let hide_name = Arc::new(|p: &PlayerState| {
        let mut projected = p.clone();
        projected.name = String::new();
        projected
    });
    let Resume::Full(data) = session.reconnect("spy", 0, Some(hide_name)) else {
        panic!("expected full state");
    };
    let mut image = MapState::new();
    apply_message(&mut image, &decoder, &registry, &data);
    assert_eq!(image.get("name"), Some(&Value::Str(String::new())));
    assert_eq!(image.get("score"), Some(&Value::I64(5)));
}

#[test]
fn resume_message_packs_patches_into_a_batch() {
    let (registry, session) = session_with_history(10);
    for score in 1..=3 {
        session.state().update(|p| p.set_score(score));
        session.tick();
    }
    let resume = session.reconnect("v", 1, None);
    let message = session.resume_message(&resume).unwrap();
    assert_eq!(message[0], MSG_PATCH_BATCH);

    let decoder = Decoder::new(registry);
    let DecodedMessage::PatchBatch(patches) = decoder.decode(&message).unwrap() else {
        panic!("expected patch batch");
    };
    assert_eq!(patches.len(), 2);

    // Up-to-date resumes produce no message at all.
    let current = session.reconnect("v", 3, None);
    assert!(session.resume_message(&current).is_none());
}

#[test]
fn quiet_ticks_leave_gaps_in_history_but_resume_still_works() {
    let (_, session) = session_with_history(10);
    session.state().update(|p| p.set_score(1));
    session.tick(); // seq 1, recorded
    session.tick(); // seq 2, quiet: no entry
    session.state().update(|p| p.set_score(3));
    session.tick(); // seq 3, recorded

    let Resume::Patches(patches) = session.reconnect("v", 1, None) else {
        panic!("expected patches");
    };
    // Only the non-quiet tick is replayed.
    assert_eq!(patches.len(), 1);
}
