//! Property-based tests for keyflux-core using proptest.

use keyflux_core::{Cache, CacheUpdater, ChangeAwareCache, ChangeReason};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

#[derive(Clone, Debug)]
enum Op {
    Upsert(u8, i32),
    Remove(u8),
    Refresh(u8),
    Clear,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u8..16, any::<i32>()).prop_map(|(k, v)| Op::Upsert(k, v)),
        3 => (0u8..16).prop_map(Op::Remove),
        2 => (0u8..16).prop_map(Op::Refresh),
        1 => Just(Op::Clear),
    ]
}

fn apply(updater: &mut CacheUpdater<'_, (u8, i32), u8>, op: &Op) {
    match op {
        Op::Upsert(k, v) => updater.add_or_update((*k, *v)),
        Op::Remove(k) => updater.remove_key(k),
        Op::Refresh(k) => updater.refresh(k),
        Op::Clear => updater.clear(),
    }
}

fn key_of(item: &(u8, i32)) -> u8 {
    item.0
}

proptest! {
    /// Replaying every captured batch into a mirror reproduces the cache.
    #[test]
    fn captured_batches_replay_to_same_state(
        batches in prop::collection::vec(prop::collection::vec(op_strategy(), 0..20), 1..10)
    ) {
        let mut cache = ChangeAwareCache::new();
        let mut mirror: Cache<(u8, i32), u8> = Cache::new();

        for batch in &batches {
            {
                let mut updater = CacheUpdater::new(&mut cache, &key_of);
                for op in batch {
                    apply(&mut updater, op);
                }
            }
            let changes = cache.capture_changes();
            mirror.clone_changes(&changes);
        }

        let expected: HashMap<u8, (u8, i32)> = cache.iter().map(|(k, v)| (*k, *v)).collect();
        let actual: HashMap<u8, (u8, i32)> = mirror.iter().map(|(k, v)| (*k, *v)).collect();
        prop_assert_eq!(expected, actual);
    }

    /// A captured batch never holds two changes for the same key.
    #[test]
    fn captured_batch_has_unique_keys(ops in prop::collection::vec(op_strategy(), 0..50)) {
        let mut cache = ChangeAwareCache::new();
        {
            let mut updater = CacheUpdater::new(&mut cache, &key_of);
            for op in &ops {
                apply(&mut updater, op);
            }
        }
        let changes = cache.capture_changes();
        let mut seen = HashSet::new();
        for change in &changes {
            prop_assert!(seen.insert(*change.key()), "duplicate change for key {}", change.key());
        }
    }

    /// Upserting an existing key yields exactly one update and never an add.
    #[test]
    fn upsert_existing_key_is_update(k in 0u8..16, a in any::<i32>(), b in any::<i32>()) {
        let mut cache = ChangeAwareCache::new();
        CacheUpdater::new(&mut cache, &key_of).add_or_update((k, a));
        cache.capture_changes();

        CacheUpdater::new(&mut cache, &key_of).add_or_update((k, b));
        let changes = cache.capture_changes();
        prop_assert_eq!(changes.len(), 1);
        prop_assert_eq!(changes.iter().next().map(|c| c.reason()), Some(ChangeReason::Update));
        prop_assert_eq!(cache.len(), 1);
    }

    /// edit_diff emits exactly the symmetric difference plus changed values.
    #[test]
    fn edit_diff_is_minimal(
        before in prop::collection::hash_map(0u8..32, 0i32..4, 0..20),
        after in prop::collection::hash_map(0u8..32, 0i32..4, 0..20),
    ) {
        let mut cache = ChangeAwareCache::new();
        CacheUpdater::new(&mut cache, &key_of)
            .add_or_update_many(before.iter().map(|(k, v)| (*k, *v)));
        cache.capture_changes();

        CacheUpdater::new(&mut cache, &key_of)
            .edit_diff(after.iter().map(|(k, v)| (*k, *v)), |a, b| a == b);
        let changes = cache.capture_changes();

        let adds = after.keys().filter(|k| !before.contains_key(k)).count();
        let removes = before.keys().filter(|k| !after.contains_key(k)).count();
        let updates = after
            .iter()
            .filter(|(k, v)| before.get(k).map(|old| old != *v).unwrap_or(false))
            .count();

        prop_assert_eq!(changes.adds(), adds);
        prop_assert_eq!(changes.removes(), removes);
        prop_assert_eq!(changes.updates(), updates);
        prop_assert_eq!(changes.len(), adds + removes + updates);
    }
}
