// SPDX-License-Identifier: Apache-2.0
//! TrackedState behavior: effect composition, filters, commit cycle.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;

use veil_core::demo::{register_schemas, Item, PlayerState};
use veil_core::{
    DecodedMessage, Decoder, Effect, EffectError, Filter, SchemaRegistry, Trackable, TrackedState,
    Value,
};

struct ScoreBoost {
    id: &'static str,
    amount: i64,
}

impl Effect<PlayerState, u64> for ScoreBoost {
    fn id(&self) -> &str {
        self.id
    }

    fn apply(&self, state: PlayerState, _activator: &u64) -> PlayerState {
        let mut next = state;
        next.score += self.amount;
        next
    }
}

struct ScoreDouble;

impl Effect<PlayerState, u64> for ScoreDouble {
    fn id(&self) -> &str {
        "double"
    }

    fn apply(&self, state: PlayerState, _activator: &u64) -> PlayerState {
        let mut next = state;
        next.score *= 2;
        next
    }
}

fn tracked() -> (Arc<SchemaRegistry>, TrackedState<PlayerState, u64>) {
    let mut registry = SchemaRegistry::new();
    let schema = register_schemas(&mut registry);
    let registry = Arc::new(registry);
    let state = TrackedState::new(PlayerState::new(schema, 1), Arc::clone(&registry));
    (registry, state)
}

#[test]
fn effects_compose_in_insertion_order() {
    let (_, tracked) = tracked();
    tracked.update(|p| p.set_score(10));
    tracked
        .add_effect(Arc::new(ScoreBoost { id: "boost", amount: 3 }), 1)
        .unwrap();
    tracked.add_effect(Arc::new(ScoreDouble), 1).unwrap();

    // (10 + 3) * 2; the base state is untouched.
    assert_eq!(tracked.get().score, 26);
    assert_eq!(tracked.get_base().score, 10);
}

#[test]
fn removing_an_effect_restores_the_composition_without_it() {
    let (_, tracked) = tracked();
    tracked.update(|p| p.set_score(10));
    tracked
        .add_effect(Arc::new(ScoreBoost { id: "boost", amount: 3 }), 1)
        .unwrap();
    tracked.add_effect(Arc::new(ScoreDouble), 1).unwrap();

    assert!(tracked.remove_effect("boost"));
    assert_eq!(tracked.get().score, 20);
    assert!(!tracked.remove_effect("boost"));
}

#[test]
fn duplicate_effect_id_fails_and_leaves_stack_intact() {
    let (_, tracked) = tracked();
    tracked
        .add_effect(Arc::new(ScoreBoost { id: "boost", amount: 1 }), 1)
        .unwrap();
    let err = tracked.add_effect(Arc::new(ScoreBoost { id: "boost", amount: 9 }), 2);
    assert_eq!(err, Err(EffectError::DuplicateId("boost".into())));
    assert_eq!(tracked.effect_ids(), vec!["boost".to_owned()]);
}

#[test]
fn encode_reflects_effects_but_commit_clears_tracking() {
    let (registry, tracked) = tracked();
    tracked.update(|p| p.set_score(10));
    tracked
        .add_effect(Arc::new(ScoreBoost { id: "boost", amount: 5 }), 1)
        .unwrap();

    let bytes = tracked.encode().unwrap();
    let decoder = Decoder::new(registry);
    let DecodedMessage::Patch(patch) = decoder.decode(&bytes).unwrap() else {
        panic!("expected patch");
    };
    // Field 2 is the score; the patch carries the effective value.
    assert_eq!(patch.changes[0].index, 2);
    assert_eq!(patch.changes[0].value, Some(Value::I64(15)));

    tracked.commit();
    assert!(!tracked.has_changes());
    assert!(tracked.encode().is_none());
}

#[test]
fn filter_projects_without_touching_the_change_set() {
    let (_, tracked) = tracked();
    tracked.update(|p| {
        p.set_name("kara");
        p.add_item(Item {
            slot: 0,
            kind: "sword".into(),
            count: 1,
        });
    });
    tracked.commit();

    let hide_inventory: Filter<PlayerState> = Arc::new(|p: &PlayerState| {
        let mut projected = p.clone();
        projected.inventory = Vec::new();
        projected
    });

    // Applying a filter to a committed state leaves tracking unchanged.
    let before = tracked.get_base().changes().changed_fields();
    let projected = hide_inventory(&tracked.get_base());
    assert!(projected.inventory.is_empty());
    assert_eq!(tracked.get_base().changes().changed_fields(), before);
    assert!(!tracked.has_changes());
}

#[test]
fn encode_all_with_filter_hides_projected_fields() {
    let (registry, tracked) = tracked();
    tracked.update(|p| {
        p.set_name("kara");
        p.add_item(Item {
            slot: 0,
            kind: "sword".into(),
            count: 3,
        });
    });

    let hide_inventory: Filter<PlayerState> = Arc::new(|p: &PlayerState| {
        let mut projected = p.clone();
        projected.inventory = Vec::new();
        projected
    });

    let bytes = tracked.encode_all_with_filter(&hide_inventory);
    let decoder = Decoder::new(registry);
    let DecodedMessage::Full(full) = decoder.decode(&bytes).unwrap() else {
        panic!("expected full state");
    };
    assert_eq!(full.fields[1], Value::Str("kara".into()));
    assert_eq!(full.fields[3], Value::Array(Vec::new()));
}

#[test]
fn set_marks_everything_dirty() {
    let (_, tracked) = tracked();
    tracked.commit();
    let mut registry2 = SchemaRegistry::new();
    let schema2 = register_schemas(&mut registry2);
    tracked.set(PlayerState::new(schema2, 2));
    let fields = tracked.get_base().changes().changed_fields();
    assert_eq!(fields, vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn cleanup_expired_sweeps_and_counts() {
    struct Expiring;
    impl Effect<PlayerState, u64> for Expiring {
        fn id(&self) -> &str {
            "expiring"
        }
        fn apply(&self, state: PlayerState, _activator: &u64) -> PlayerState {
            state
        }
        fn expired(&self) -> bool {
            true
        }
    }

    let (_, tracked) = tracked();
    tracked.add_effect(Arc::new(Expiring), 1).unwrap();
    tracked
        .add_effect(Arc::new(ScoreBoost { id: "stay", amount: 1 }), 1)
        .unwrap();
    assert_eq!(tracked.cleanup_expired_effects(), 1);
    assert_eq!(tracked.effect_ids(), vec!["stay".to_owned()]);
}
