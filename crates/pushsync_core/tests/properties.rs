//! Property tests for dirty tracking and reconciliation.

use proptest::prelude::*;
use pushsync_core::{
    AttrValue, AttributeKey, AttributeTracker, AttributesSet, EntityKind, MemoryEntityStore,
    Reconciler,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

fn user_key() -> impl Strategy<Value = AttributeKey> {
    let keys: Vec<AttributeKey> = AttributesSet::of_kind(EntityKind::User).into_iter().collect();
    prop::sample::select(keys)
}

fn user_keys() -> impl Strategy<Value = Vec<AttributeKey>> {
    prop::collection::vec(user_key(), 0..8)
}

fn value() -> impl Strategy<Value = AttrValue> {
    prop_oneof![
        any::<bool>().prop_map(AttrValue::from),
        any::<i32>().prop_map(AttrValue::from),
        "[a-z]{0,8}".prop_map(AttrValue::from),
    ]
}

proptest! {
    #[test]
    fn sync_clears_exactly_the_snapshot(
        before in user_keys(),
        during in user_keys(),
        response_keys in user_keys(),
        v in value(),
    ) {
        let store = Arc::new(MemoryEntityStore::new());
        let tracker = AttributeTracker::open(EntityKind::User, store).unwrap();

        for key in &before {
            tracker.set(*key, v.clone()).unwrap();
        }
        let snapshot = tracker.dirty_keys();

        // Mutations that land while the request is in flight, on keys the
        // snapshot does not cover.
        let late: AttributesSet = during
            .into_iter()
            .filter(|k| !snapshot.contains(*k))
            .collect();
        for key in late.iter() {
            tracker.set(key, json!("late")).unwrap();
        }
        let dirty_outside_before = tracker.dirty_keys().difference(&snapshot);

        let response: BTreeMap<_, _> = response_keys
            .into_iter()
            .map(|k| (k, json!("server")))
            .collect();
        tracker
            .transact(|entity| Reconciler::apply(&response, entity, &snapshot))
            .unwrap();

        let dirty_after = tracker.dirty_keys();
        prop_assert!(dirty_after.intersection(&snapshot).is_empty());
        prop_assert_eq!(dirty_after.difference(&snapshot), dirty_outside_before);

        for key in late.iter() {
            prop_assert_eq!(tracker.get(key), Some(json!("late")));
        }
    }

    #[test]
    fn reedited_snapshot_keys_stay_dirty(
        before in user_keys(),
        reedit in user_keys(),
        response_keys in user_keys(),
        v in value(),
    ) {
        let store = Arc::new(MemoryEntityStore::new());
        let tracker = AttributeTracker::open(EntityKind::User, store).unwrap();
        for key in &before {
            tracker.set(*key, v.clone()).unwrap();
        }
        let snapshot = tracker.dirty_keys();
        let sent = tracker.snapshot().values_for(&snapshot);

        let reedited: AttributesSet = reedit
            .into_iter()
            .filter(|k| snapshot.contains(*k))
            .collect();
        for key in reedited.iter() {
            tracker.set(key, json!("EDITED")).unwrap();
        }

        let response: BTreeMap<_, _> = response_keys
            .into_iter()
            .map(|k| (k, json!("server")))
            .collect();
        let report = tracker
            .transact(|entity| Reconciler::apply_sent(&response, entity, &snapshot, &sent))
            .unwrap();

        prop_assert_eq!(tracker.dirty_keys(), reedited.clone());
        prop_assert_eq!(report.superseded, reedited.clone());
        for key in reedited.iter() {
            prop_assert_eq!(tracker.get(key), Some(json!("EDITED")));
        }
    }

    #[test]
    fn clear_is_set_difference(set_keys in user_keys(), clear_keys in user_keys()) {
        let store = Arc::new(MemoryEntityStore::new());
        let tracker = AttributeTracker::open(EntityKind::User, store).unwrap();
        for key in &set_keys {
            tracker.set(*key, json!(1)).unwrap();
        }
        let before = tracker.dirty_keys();
        let clear: AttributesSet = clear_keys.into_iter().collect();

        tracker.clear(&clear).unwrap();
        prop_assert_eq!(tracker.dirty_keys(), before.difference(&clear));
    }
}
