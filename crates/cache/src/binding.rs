//! Keeping a plain list in step with a change-set stream.
//!
//! A bound list is an `Arc<RwLock<Vec<T>>>` owned by the consumer. Each
//! batch is applied under one write lock, so readers never see half a batch.

use crate::operators::forward;
use crate::operators::sort::{SortReason, SortedChangeSet};
use crate::BindingOptions;
use keyflux_core::{CacheItem, CacheKey, ChangeReason, ChangeSet};
use keyflux_reactive::{Observable, Observer, Subscriber};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// A list shared with a binding adaptor.
pub type BoundList<T> = Arc<RwLock<Vec<T>>>;

/// Applies sorted batches to a list by position.
///
/// Loads, resets and batches larger than the reset threshold rebuild the
/// list from the sorted snapshot.
pub struct SortedListAdaptor<T> {
    target: BoundList<T>,
    options: BindingOptions,
}

impl<T: CacheItem> SortedListAdaptor<T> {
    pub fn new(target: BoundList<T>, options: BindingOptions) -> Self {
        Self { target, options }
    }

    pub fn adapt<K: CacheKey>(&mut self, changes: &SortedChangeSet<T, K>) {
        let mut list = self.target.write();
        let rebuild = match changes.reason() {
            SortReason::InitialLoad | SortReason::Reset => true,
            SortReason::ComparerChanged | SortReason::Reorder | SortReason::DataChanged => {
                changes.changes().len() > self.options.reset_threshold
            }
        };
        if !rebuild && patch(&mut list, changes.changes()) {
            return;
        }
        if !rebuild {
            tracing::debug!("bound list out of step, rebuilding");
        }
        list.clear();
        list.extend(changes.sorted().iter().map(|(_, item)| item.clone()));
    }
}

/// Applies positioned changes in order. Returns false when a position does
/// not fit the list.
fn patch<T: Clone, K>(list: &mut Vec<T>, changes: &ChangeSet<T, K>) -> bool {
    for change in changes {
        let (to, from) = (change.current_index(), change.previous_index());
        match change.reason() {
            ChangeReason::Add => match to {
                Some(to) if to <= list.len() => list.insert(to, change.current().clone()),
                _ => return false,
            },
            ChangeReason::Remove => match to {
                Some(at) if at < list.len() => {
                    list.remove(at);
                }
                _ => return false,
            },
            ChangeReason::Refresh => match to {
                Some(at) if at < list.len() => list[at] = change.current().clone(),
                _ => return false,
            },
            ChangeReason::Update | ChangeReason::Moved => match (to, from) {
                (Some(to), Some(from)) if from < list.len() => {
                    list.remove(from);
                    if to > list.len() {
                        return false;
                    }
                    list.insert(to, change.current().clone());
                }
                _ => return false,
            },
        }
    }
    true
}

/// Applies unsorted batches to a list, keeping one row per key in arrival
/// order.
pub struct ListAdaptor<T, K> {
    target: BoundList<T>,
    keys: Vec<K>,
}

impl<T, K> ListAdaptor<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    pub fn new(target: BoundList<T>) -> Self {
        Self {
            target,
            keys: Vec::new(),
        }
    }

    pub fn adapt(&mut self, changes: &ChangeSet<T, K>) {
        let mut list = self.target.write();
        for change in changes {
            let row = self.keys.iter().position(|key| key == change.key());
            match (change.reason(), row) {
                (ChangeReason::Add | ChangeReason::Update, None) => {
                    self.keys.push(change.key().clone());
                    list.push(change.current().clone());
                }
                (ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh, Some(row)) => {
                    list[row] = change.current().clone();
                }
                (ChangeReason::Remove, Some(row)) => {
                    self.keys.remove(row);
                    list.remove(row);
                }
                _ => {}
            }
        }
    }
}

/// Mirrors every sorted batch into `target`, then forwards it.
pub fn bind_sorted<T, K>(
    source: &Observable<SortedChangeSet<T, K>>,
    target: BoundList<T>,
    options: BindingOptions,
) -> Observable<SortedChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
{
    let source = source.clone();
    Observable::create(move |subscriber: Subscriber<SortedChangeSet<T, K>>| {
        let adaptor = Mutex::new(SortedListAdaptor::new(target.clone(), options));
        forward(&source, subscriber, move |subscriber, changes: SortedChangeSet<T, K>| {
            adaptor.lock().adapt(&changes);
            subscriber.on_next(changes);
        })
    })
}

/// Mirrors every batch into `target`, then forwards it.
pub fn bind<T, K>(source: &Observable<ChangeSet<T, K>>, target: BoundList<T>) -> Observable<ChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
{
    let source = source.clone();
    Observable::create(move |subscriber: Subscriber<ChangeSet<T, K>>| {
        let adaptor = Mutex::new(ListAdaptor::new(target.clone()));
        forward(&source, subscriber, move |subscriber, changes: ChangeSet<T, K>| {
            adaptor.lock().adapt(&changes);
            subscriber.on_next(changes);
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::sort::{sort, sort_with_options, SortComparer};
    use crate::SortOptions;
    use keyflux_core::Change;
    use keyflux_reactive::Subject;

    fn make_list() -> BoundList<u32> {
        Arc::new(RwLock::new(Vec::new()))
    }

    #[test]
    fn test_patch_applies_positions_in_order() {
        let mut list = vec!['a', 'c'];
        let changes: ChangeSet<char, u32> = ChangeSet::from(vec![
            Change::add_at(2, 'b', 1),
            Change::moved(3, 'c', 0, 2),
            Change::remove_at(1, 'a', 1),
        ]);
        assert!(patch(&mut list, &changes));
        assert_eq!(list, vec!['c', 'b']);
    }

    #[test]
    fn test_patch_rejects_bad_position() {
        let mut list = vec!['a'];
        let changes: ChangeSet<char, u32> = ChangeSet::from(vec![Change::remove_at(1, 'a', 3)]);
        assert!(!patch(&mut list, &changes));
    }

    #[test]
    fn test_bind_sorted_follows_sort() {
        let source = Subject::new();
        let list = make_list();
        let sorted = sort(&source.as_observable(), SortComparer::ascending(|v: &u32| *v));
        let _sub = bind_sorted(&sorted, list.clone(), BindingOptions::default()).subscribe_next(|_| {});

        source.on_next(ChangeSet::initial(vec![('a', 30), ('b', 10), ('c', 20)]));
        assert_eq!(*list.read(), vec![10, 20, 30]);

        source.on_next(ChangeSet::from(vec![Change::update('b', 40, 10), Change::remove('c', 20), Change::add('d', 15)]));
        assert_eq!(*list.read(), vec![15, 30, 40]);
    }

    #[test]
    fn test_bind_sorted_resets_past_threshold() {
        let source = Subject::new();
        let list = make_list();
        let sorted = sort_with_options(&source.as_observable(), SortComparer::ascending(|v: &u32| *v), SortOptions::new());
        let _sub = bind_sorted(&sorted, list.clone(), BindingOptions::new().reset_threshold(1)).subscribe_next(|_| {});

        source.on_next(ChangeSet::initial(vec![(1u8, 3), (2, 1)]));
        source.on_next(ChangeSet::from(vec![Change::add(3, 2), Change::add(4, 0)]));
        assert_eq!(*list.read(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_bind_unsorted() {
        let source = Subject::new();
        let list = make_list();
        let _sub = bind(&source.as_observable(), list.clone()).subscribe_next(|_: ChangeSet<u32, char>| {});

        source.on_next(ChangeSet::initial(vec![('a', 1), ('b', 2), ('c', 3)]));
        source.on_next(ChangeSet::from(vec![Change::update('b', 20, 2), Change::remove('a', 1)]));
        assert_eq!(*list.read(), vec![20, 3]);
    }
}
