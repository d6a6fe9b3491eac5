//! Sort operators.
//!
//! A sort keeps the upstream items in a vector ordered by a comparer and
//! reports every change with its position in that vector. Positions are
//! sequential: replaying a batch change by change against the previous order
//! yields the new order.

use super::{Driver, Emission, Operator};
use crate::SortOptions;
use keyflux_core::{Cache, CacheItem, CacheKey, Change, ChangeReason, ChangeSet, Result};
use keyflux_reactive::{Observable, Subscription};
use std::cmp::Ordering;
use std::sync::Arc;

/// A shareable item comparer.
pub type Comparer<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Builds a comparer from a list of sort keys.
///
/// ```rust
/// use keyflux::SortComparer;
///
/// let comparer = SortComparer::ascending(|p: &(u32, u8)| p.1).then_descending(|p| p.0);
/// let mut people = vec![(1, 2), (2, 1), (3, 2)];
/// people.sort_by(|a, b| comparer.compare(a, b));
/// assert_eq!(people, vec![(2, 1), (3, 2), (1, 2)]);
/// ```
pub struct SortComparer<T> {
    keys: Vec<Comparer<T>>,
}

impl<T> Clone for SortComparer<T> {
    fn clone(&self) -> Self {
        Self { keys: self.keys.clone() }
    }
}

impl<T: 'static> SortComparer<T> {
    /// Orders by `key`, smallest first.
    pub fn ascending<V, F>(key: F) -> Self
    where
        V: Ord,
        F: Fn(&T) -> V + Send + Sync + 'static,
    {
        Self { keys: Vec::new() }.then_ascending(key)
    }

    /// Orders by `key`, largest first.
    pub fn descending<V, F>(key: F) -> Self
    where
        V: Ord,
        F: Fn(&T) -> V + Send + Sync + 'static,
    {
        Self { keys: Vec::new() }.then_descending(key)
    }

    /// Breaks ties by `key`, smallest first.
    pub fn then_ascending<V, F>(mut self, key: F) -> Self
    where
        V: Ord,
        F: Fn(&T) -> V + Send + Sync + 'static,
    {
        self.keys.push(Arc::new(move |a: &T, b: &T| key(a).cmp(&key(b))));
        self
    }

    /// Breaks ties by `key`, largest first.
    pub fn then_descending<V, F>(mut self, key: F) -> Self
    where
        V: Ord,
        F: Fn(&T) -> V + Send + Sync + 'static,
    {
        self.keys.push(Arc::new(move |a: &T, b: &T| key(b).cmp(&key(a))));
        self
    }

    pub fn compare(&self, a: &T, b: &T) -> Ordering {
        self.keys
            .iter()
            .map(|key| key(a, b))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// Converts into a shareable comparer.
    pub fn into_comparer(self) -> Comparer<T>
    where
        T: Send + Sync,
    {
        Arc::new(move |a: &T, b: &T| self.compare(a, b))
    }
}

/// Why a sorted batch was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SortReason {
    /// The first batch after a comparer and data were both available.
    InitialLoad,
    /// The comparer was replaced; changes are moves.
    ComparerChanged,
    /// Upstream data changed.
    DataChanged,
    /// A resort was requested; changes are moves.
    Reorder,
    /// Too many items were reordered to report moves. Consumers rebuild from
    /// the sorted snapshot.
    Reset,
}

impl SortReason {
    fn rank(self) -> u8 {
        match self {
            SortReason::DataChanged => 0,
            SortReason::InitialLoad => 1,
            SortReason::Reorder => 2,
            SortReason::ComparerChanged => 3,
            SortReason::Reset => 4,
        }
    }
}

/// A change set with positions, plus the sorted items after it.
#[derive(Clone, Debug)]
pub struct SortedChangeSet<T, K> {
    changes: ChangeSet<T, K>,
    reason: SortReason,
    sorted: Arc<Vec<(K, T)>>,
}

impl<T, K> SortedChangeSet<T, K> {
    pub(crate) fn new(changes: ChangeSet<T, K>, reason: SortReason, sorted: Arc<Vec<(K, T)>>) -> Self {
        Self { changes, reason, sorted }
    }

    pub fn changes(&self) -> &ChangeSet<T, K> {
        &self.changes
    }

    pub fn reason(&self) -> SortReason {
        self.reason
    }

    /// The full sorted key/value sequence after this batch.
    pub fn sorted(&self) -> &Arc<Vec<(K, T)>> {
        &self.sorted
    }

    pub fn into_changes(self) -> ChangeSet<T, K> {
        self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// The ordered projection behind every sort operator.
pub(crate) struct SortState<T, K> {
    comparer: Option<Comparer<T>>,
    sorted: Vec<(K, T)>,
    values: Cache<T, K>,
    loaded: bool,
    options: SortOptions,
}

impl<T, K> SortState<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    pub(crate) fn new(comparer: Option<Comparer<T>>, options: SortOptions) -> Self {
        Self {
            comparer,
            sorted: Vec::new(),
            values: Cache::new(),
            loaded: false,
            options,
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<(K, T)>> {
        Arc::new(self.sorted.clone())
    }

    /// Applies an upstream batch. Nothing is reported until a comparer is
    /// known.
    pub(crate) fn apply(&mut self, changes: ChangeSet<T, K>) -> Option<(ChangeSet<T, K>, SortReason)> {
        let Some(comparer) = self.comparer.clone() else {
            self.values.clone_changes(&changes);
            return None;
        };
        if !self.loaded {
            self.values.clone_changes(&changes);
            return self.load(&*comparer);
        }

        let mut out = ChangeSet::with_capacity(changes.len());
        for change in changes {
            match change.reason() {
                ChangeReason::Add => {
                    let (key, current) = change.into_key_value();
                    if let Some(previous) = self.values.lookup(&key).cloned() {
                        out.push(self.replace(&*comparer, key, current, previous));
                        continue;
                    }
                    let index = self.insertion_point(&*comparer, &current);
                    self.sorted.insert(index, (key.clone(), current.clone()));
                    self.values.add_or_update(current.clone(), key.clone());
                    out.push(Change::add_at(key, current, index));
                }
                ChangeReason::Update => {
                    let (key, current, _) = change.into_parts();
                    match self.values.lookup(&key).cloned() {
                        Some(previous) => out.push(self.replace(&*comparer, key, current, previous)),
                        None => {
                            let index = self.insertion_point(&*comparer, &current);
                            self.sorted.insert(index, (key.clone(), current.clone()));
                            self.values.add_or_update(current.clone(), key.clone());
                            out.push(Change::add_at(key, current, index));
                        }
                    }
                }
                ChangeReason::Remove => {
                    let Some(previous) = self.values.remove(change.key()) else {
                        continue;
                    };
                    if let Some(index) = self.position(&*comparer, change.key(), &previous) {
                        let (key, removed) = self.sorted.remove(index);
                        out.push(Change::remove_at(key, removed, index));
                    }
                }
                ChangeReason::Refresh => {
                    let Some(previous) = self.values.lookup(change.key()).cloned() else {
                        continue;
                    };
                    let Some(from) = self.position(&*comparer, change.key(), &previous) else {
                        continue;
                    };
                    let (key, current) = change.into_key_value();
                    self.sorted.remove(from);
                    let to = self.insertion_point(&*comparer, &current);
                    self.sorted.insert(to, (key.clone(), current.clone()));
                    self.values.add_or_update(current.clone(), key.clone());
                    if to == from {
                        out.push(Change::refresh_at(key, current, to));
                    } else {
                        out.push(Change::moved(key, current, to, from));
                    }
                }
                ChangeReason::Moved => {}
            }
        }
        Some((out, SortReason::DataChanged))
    }

    /// Installs a new comparer and reorders.
    pub(crate) fn set_comparer(&mut self, comparer: Comparer<T>) -> Option<(ChangeSet<T, K>, SortReason)> {
        self.comparer = Some(comparer.clone());
        if !self.loaded {
            return self.load(&*comparer);
        }
        Some(self.reorder(&*comparer, SortReason::ComparerChanged))
    }

    /// Re-sorts with the current comparer, for items that changed in place.
    pub(crate) fn resort(&mut self) -> Option<(ChangeSet<T, K>, SortReason)> {
        let comparer = self.comparer.clone()?;
        if !self.loaded {
            return None;
        }
        Some(self.reorder(&*comparer, SortReason::Reorder))
    }

    fn load(&mut self, comparer: &dyn Fn(&T, &T) -> Ordering) -> Option<(ChangeSet<T, K>, SortReason)> {
        if self.values.is_empty() {
            return None;
        }
        self.loaded = true;
        self.sorted = self.values.key_values();
        self.sorted.sort_by(|a, b| comparer(&a.1, &b.1));
        let changes = self
            .sorted
            .iter()
            .enumerate()
            .map(|(index, (key, item))| Change::add_at(key.clone(), item.clone(), index))
            .collect();
        tracing::trace!(count = self.sorted.len(), "sort loaded");
        Some((changes, SortReason::InitialLoad))
    }

    fn reorder(&mut self, comparer: &dyn Fn(&T, &T) -> Ordering, reason: SortReason) -> (ChangeSet<T, K>, SortReason) {
        let mut target = self.sorted.clone();
        target.sort_by(|a, b| comparer(&a.1, &b.1));

        if self.sorted.len() > self.options.reset_threshold {
            tracing::debug!(count = target.len(), threshold = self.options.reset_threshold, "sort reset");
            self.sorted = target;
            return (ChangeSet::new(), SortReason::Reset);
        }

        let mut changes = ChangeSet::new();
        let mut current: Vec<K> = self.sorted.iter().map(|(key, _)| key.clone()).collect();
        for (to, (key, item)) in target.iter().enumerate() {
            let Some(offset) = current[to..].iter().position(|k| k == key) else {
                continue;
            };
            let from = to + offset;
            if from != to {
                let moved = current.remove(from);
                current.insert(to, moved);
                changes.push(Change::moved(key.clone(), item.clone(), to, from));
            }
        }
        self.sorted = target;
        (changes, reason)
    }

    fn replace(&mut self, comparer: &dyn Fn(&T, &T) -> Ordering, key: K, current: T, previous: T) -> Change<T, K> {
        let from = self.position(comparer, &key, &previous);
        if let Some(from) = from {
            self.sorted.remove(from);
        }
        let to = self.insertion_point(comparer, &current);
        self.sorted.insert(to, (key.clone(), current.clone()));
        self.values.add_or_update(current.clone(), key.clone());
        match from {
            Some(from) => Change::update_at(key, current, previous, to, from),
            None => Change::update(key, current, previous).with_indices(Some(to), None),
        }
    }

    /// Index after every item ordering at or before `item`.
    fn insertion_point(&self, comparer: &dyn Fn(&T, &T) -> Ordering, item: &T) -> usize {
        self.sorted
            .partition_point(|(_, existing)| comparer(existing, item) != Ordering::Greater)
    }

    /// Index of `key`, found by searching the run of items equal to `value`.
    fn position(&self, comparer: &dyn Fn(&T, &T) -> Ordering, key: &K, value: &T) -> Option<usize> {
        let start = self
            .sorted
            .partition_point(|(_, existing)| comparer(existing, value) == Ordering::Less);
        let found = self.sorted[start..]
            .iter()
            .take_while(|(_, existing)| comparer(existing, value) == Ordering::Equal)
            .position(|(k, _)| k == key)
            .map(|offset| start + offset);
        found.or_else(|| self.sorted.iter().position(|(k, _)| k == key))
    }

    #[cfg(test)]
    pub(crate) fn keys(&self) -> Vec<K> {
        self.sorted.iter().map(|(key, _)| key.clone()).collect()
    }
}

enum SortEvent<T, K> {
    Data(ChangeSet<T, K>),
    Comparer(Comparer<T>),
    Resort,
    DataCompleted,
    Ignored,
}

struct SortOperator<T, K> {
    state: SortState<T, K>,
    pending: Option<(ChangeSet<T, K>, SortReason)>,
    done: bool,
}

impl<T, K> SortOperator<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    fn stage(&mut self, produced: Option<(ChangeSet<T, K>, SortReason)>) {
        let Some((changes, reason)) = produced else {
            return;
        };
        match &mut self.pending {
            Some((pending, pending_reason)) => {
                pending.merge(changes);
                if reason.rank() > pending_reason.rank() {
                    *pending_reason = reason;
                }
            }
            None => self.pending = Some((changes, reason)),
        }
    }
}

impl<T, K> Operator for SortOperator<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    type Event = SortEvent<T, K>;
    type Output = SortedChangeSet<T, K>;

    fn apply(&mut self, event: Self::Event) -> Result<()> {
        let produced = match event {
            SortEvent::Data(changes) => self.state.apply(changes),
            SortEvent::Comparer(comparer) => self.state.set_comparer(comparer),
            SortEvent::Resort => self.state.resort(),
            SortEvent::DataCompleted => {
                self.done = true;
                None
            }
            SortEvent::Ignored => None,
        };
        self.stage(produced);
        Ok(())
    }

    fn flush(&mut self) -> Emission<SortedChangeSet<T, K>> {
        let output = self.pending.take().and_then(|(changes, reason)| {
            if changes.is_empty() && reason == SortReason::DataChanged {
                return None;
            }
            Some(SortedChangeSet::new(changes, reason, self.state.snapshot()))
        });
        Emission::output(output)
    }

    fn is_completed(&self) -> bool {
        self.done
    }
}

fn build<T, K>(
    source: &Observable<ChangeSet<T, K>>,
    comparer: Option<Comparer<T>>,
    comparers: Option<Observable<Comparer<T>>>,
    resort: Option<Observable<()>>,
    options: SortOptions,
) -> Observable<SortedChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
{
    let source = source.clone();
    Observable::create(move |subscriber| {
        let operator = SortOperator {
            state: SortState::new(comparer.clone(), options),
            pending: None,
            done: false,
        };
        let driver = Driver::new(operator, subscriber);
        let mut subscription = Subscription::empty();
        if let Some(comparers) = &comparers {
            subscription.add(driver.subscribe_input(comparers, SortEvent::Comparer, || SortEvent::Ignored));
        }
        if let Some(resort) = &resort {
            subscription.add(driver.subscribe_input(resort, |_| SortEvent::Resort, || SortEvent::Ignored));
        }
        subscription.add(driver.subscribe_input(&source, SortEvent::Data, || SortEvent::DataCompleted));
        subscription
    })
}

/// Sorts with a fixed comparer.
pub fn sort<T, K>(source: &Observable<ChangeSet<T, K>>, comparer: SortComparer<T>) -> Observable<SortedChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
{
    sort_with_options(source, comparer, SortOptions::default())
}

/// Sorts with a fixed comparer and explicit options.
pub fn sort_with_options<T, K>(
    source: &Observable<ChangeSet<T, K>>,
    comparer: SortComparer<T>,
    options: SortOptions,
) -> Observable<SortedChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
{
    build(source, Some(comparer.into_comparer()), None, None, options)
}

/// Sorts with a comparer that can be replaced at runtime.
///
/// Nothing is emitted until the first comparer arrives. A signal on
/// `resort` reorders items whose sort keys changed without an upstream
/// change, such as items with interior mutability.
pub fn sort_dynamic<T, K>(
    source: &Observable<ChangeSet<T, K>>,
    comparers: &Observable<Comparer<T>>,
    resort: Option<&Observable<()>>,
    options: SortOptions,
) -> Observable<SortedChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
{
    build(source, None, Some(comparers.clone()), resort.cloned(), options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyflux_reactive::{Observer, Subject};
    use parking_lot::Mutex;

    fn make_state(threshold: usize) -> SortState<i32, &'static str> {
        let comparer = SortComparer::ascending(|v: &i32| *v).into_comparer();
        SortState::new(Some(comparer), SortOptions::new().reset_threshold(threshold))
    }

    fn make_loaded(threshold: usize) -> SortState<i32, &'static str> {
        let mut state = make_state(threshold);
        state.apply(ChangeSet::initial(vec![("c", 30), ("a", 10), ("b", 20)]));
        state
    }

    fn replay(before: &[&'static str], changes: &ChangeSet<i32, &'static str>) -> Vec<&'static str> {
        let mut keys = before.to_vec();
        for change in changes {
            match change.reason() {
                ChangeReason::Add => keys.insert(change.current_index().unwrap(), *change.key()),
                ChangeReason::Remove => {
                    keys.remove(change.current_index().unwrap());
                }
                ChangeReason::Update | ChangeReason::Moved => {
                    keys.remove(change.previous_index().unwrap());
                    keys.insert(change.current_index().unwrap(), *change.key());
                }
                ChangeReason::Refresh => {}
            }
        }
        keys
    }

    #[test]
    fn test_sort_initial_load_is_ordered() {
        let mut state = make_state(10);
        let (changes, reason) = state
            .apply(ChangeSet::initial(vec![("c", 30), ("a", 10), ("b", 20)]))
            .unwrap();
        assert_eq!(reason, SortReason::InitialLoad);
        assert_eq!(replay(&[], &changes), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sort_changes_replay_to_sorted_order() {
        let mut state = make_loaded(10);
        let changes = ChangeSet::from(vec![
            Change::add("d", 15),
            Change::update("c", 5, 30),
            Change::remove("a", 10),
        ]);
        let (out, reason) = state.apply(changes).unwrap();
        assert_eq!(reason, SortReason::DataChanged);
        assert_eq!(replay(&["a", "b", "c"], &out), vec!["c", "d", "b"]);
        assert_eq!(state.keys(), vec!["c", "d", "b"]);
    }

    #[test]
    fn test_sort_refresh_moves_only_when_position_changes() {
        let mut state = make_loaded(10);
        let (out, _) = state.apply(ChangeSet::from(vec![Change::refresh("b", 20)])).unwrap();
        assert_eq!(out.refreshes(), 1);

        let (out, _) = state.apply(ChangeSet::from(vec![Change::refresh("b", 40)])).unwrap();
        let change = out.iter().next().unwrap();
        assert_eq!(change.reason(), ChangeReason::Moved);
        assert_eq!((change.current_index(), change.previous_index()), (Some(2), Some(1)));
    }

    #[test]
    fn test_sort_comparer_change_below_threshold_moves() {
        let mut state = make_loaded(10);
        let descending = SortComparer::descending(|v: &i32| *v).into_comparer();
        let (out, reason) = state.set_comparer(descending).unwrap();
        assert_eq!(reason, SortReason::ComparerChanged);
        assert_eq!(out.moves(), out.len());
        assert_eq!(replay(&["a", "b", "c"], &out), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_sort_comparer_change_above_threshold_resets() {
        let mut state = make_loaded(2);
        let descending = SortComparer::descending(|v: &i32| *v).into_comparer();
        let (out, reason) = state.set_comparer(descending).unwrap();
        assert_eq!(reason, SortReason::Reset);
        assert!(out.is_empty());
        assert_eq!(state.keys(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_sort_comparer_tie_breaks() {
        let comparer = SortComparer::ascending(|p: &(u32, u32)| p.0).then_descending(|p| p.1);
        assert_eq!(comparer.compare(&(1, 5), &(1, 2)), Ordering::Less);
        assert_eq!(comparer.compare(&(2, 5), &(1, 9)), Ordering::Greater);
        assert_eq!(comparer.compare(&(1, 1), &(1, 1)), Ordering::Equal);
    }

    #[test]
    fn test_sort_dynamic_waits_for_comparer() {
        let source = Subject::new();
        let comparers: Subject<Comparer<i32>> = Subject::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = sort_dynamic(&source.as_observable(), &comparers.as_observable(), None, SortOptions::default())
            .subscribe_next(move |sorted: SortedChangeSet<i32, u32>| {
                let keys: Vec<u32> = sorted.sorted().iter().map(|(k, _)| *k).collect();
                sink.lock().push((sorted.reason(), keys));
            });

        source.on_next(ChangeSet::initial(vec![(1, 3), (2, 1), (3, 2)]));
        assert!(seen.lock().is_empty());

        comparers.on_next(SortComparer::ascending(|v: &i32| *v).into_comparer());
        comparers.on_next(SortComparer::descending(|v: &i32| *v).into_comparer());

        let seen = seen.lock();
        assert_eq!(seen[0], (SortReason::InitialLoad, vec![2, 3, 1]));
        assert_eq!(seen[1], (SortReason::ComparerChanged, vec![1, 3, 2]));
    }
}
