//! Property-based tests for whole pipelines using proptest.

use keyflux::operators::filter::{filter_dynamic, Predicate};
use keyflux::{BehaviorSubject, ChangeReason, ChangeSet, ChangeSetStreamExt, Observer, SourceCache};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Clone, Debug)]
enum Op {
    Upsert(u8, u16),
    Remove(u8),
    Threshold(u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..24, 0u16..100).prop_map(|(k, v)| Op::Upsert(k, v)),
        2 => (0u8..24).prop_map(Op::Remove),
        1 => (0u16..100).prop_map(Op::Threshold),
    ]
}

fn make_cache() -> SourceCache<(u8, u16), u8> {
    SourceCache::new(|item: &(u8, u16)| item.0)
}

fn above(threshold: u16) -> Predicate<(u8, u16)> {
    Arc::new(move |item: &(u8, u16)| item.1 >= threshold)
}

/// Replays `ops` onto the cache and a plain model; threshold changes go to
/// `on_threshold`.
fn replay(cache: &SourceCache<(u8, u16), u8>, ops: &[Op], mut on_threshold: impl FnMut(u16)) -> BTreeMap<u8, u16> {
    let mut model = BTreeMap::new();
    for op in ops {
        match *op {
            Op::Upsert(k, v) => {
                cache.add_or_update((k, v)).unwrap();
                model.insert(k, v);
            }
            Op::Remove(k) => {
                cache.remove_key(&k).unwrap();
                model.remove(&k);
            }
            Op::Threshold(t) => on_threshold(t),
        }
    }
    model
}

proptest! {
    /// Keys stay unique and an existing key is never added twice.
    #[test]
    fn key_uniqueness(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let cache = make_cache();
        let violations = Arc::new(Mutex::new(0usize));
        let present: Arc<Mutex<HashSet<u8>>> = Arc::new(Mutex::new(HashSet::new()));
        let (count, keys) = (violations.clone(), present.clone());
        let _sub = cache.connect().subscribe_next(move |changes: ChangeSet<(u8, u16), u8>| {
            let mut keys = keys.lock();
            for change in &changes {
                let fresh = match change.reason() {
                    ChangeReason::Add => keys.insert(*change.key()),
                    ChangeReason::Remove => keys.remove(change.key()),
                    _ => keys.contains(change.key()),
                };
                if !fresh {
                    *count.lock() += 1;
                }
            }
        });

        let model = replay(&cache, &ops, |_| {});

        prop_assert_eq!(*violations.lock(), 0);
        let mut keys = cache.keys();
        keys.sort_unstable();
        prop_assert_eq!(keys, model.keys().copied().collect::<Vec<_>>());
    }

    /// The filtered view always equals the items matching the latest predicate.
    #[test]
    fn filter_completeness(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let cache = make_cache();
        let predicates = BehaviorSubject::new(above(50));
        let view = filter_dynamic(&cache.connect(), &predicates.as_observable(), None).as_observable_cache();

        let mut threshold = 50;
        let model = replay(&cache, &ops, |t| {
            threshold = t;
            predicates.on_next(above(t));
        });

        let mut actual = view.key_values();
        actual.sort_unstable();
        let expected: Vec<(u8, (u8, u16))> = model
            .iter()
            .filter(|(_, v)| **v >= threshold)
            .map(|(k, v)| (*k, (*k, *v)))
            .collect();
        prop_assert_eq!(actual, expected);
    }

    /// Every group holds exactly the items mapping to it and no group is empty.
    #[test]
    fn group_completeness(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let cache = make_cache();
        let groups = cache.connect().group_on(|item: &(u8, u16)| item.1 % 4).as_observable_cache();

        let model = replay(&cache, &ops, |_| {});

        let mut expected: BTreeMap<u16, Vec<u8>> = BTreeMap::new();
        for (k, v) in &model {
            expected.entry(v % 4).or_default().push(*k);
        }
        let mut actual: BTreeMap<u16, Vec<u8>> = BTreeMap::new();
        for group in groups.items() {
            let mut members = group.keys();
            members.sort_unstable();
            prop_assert!(!members.is_empty());
            actual.insert(*group.key(), members);
        }
        prop_assert_eq!(actual, expected);
    }

    /// A diff against new contents touches only the keys that differ.
    #[test]
    fn diff_minimality(
        before in prop::collection::btree_map(0u8..24, 0u16..4, 0..20),
        after in prop::collection::btree_map(0u8..24, 0u16..4, 0..20),
    ) {
        let cache = make_cache();
        cache.add_or_update_many(before.iter().map(|(k, v)| (*k, *v))).unwrap();

        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let _sub = cache.connect().subscribe_next(move |changes: ChangeSet<(u8, u16), u8>| sink.lock().push(changes));
        batches.lock().clear();

        cache.edit_diff(after.iter().map(|(k, v)| (*k, *v)), |a, b| a == b).unwrap();

        let removes = before.keys().filter(|k| !after.contains_key(*k)).count();
        let adds = after.keys().filter(|k| !before.contains_key(*k)).count();
        let updates = after.iter().filter(|(k, v)| before.get(*k).is_some_and(|old| old != *v)).count();

        let batches = batches.lock();
        let summary = batches.iter().map(|b| b.summary()).fold((0, 0, 0), |acc, s| (acc.0 + s.adds, acc.1 + s.updates, acc.2 + s.removes));
        prop_assert_eq!(summary, (adds, updates, removes));
        prop_assert!(batches.len() <= 1);
    }
}
