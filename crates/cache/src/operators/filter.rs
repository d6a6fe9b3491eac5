//! Filter operators.
//!
//! A filter keeps a mirror of the items currently passing its predicate and
//! re-derives inclusion for every change. An item entering the filter is
//! reported as `Add`, an item leaving it as `Remove`; changes that keep their
//! inclusion pass through. Moves are never forwarded.

use super::{Driver, Emission, Operator};
use crate::FilterOptions;
use hashbrown::HashMap;
use keyflux_core::{Cache, CacheItem, CacheKey, Change, ChangeAwareCache, ChangeReason, ChangeSet, Result};
use keyflux_reactive::{Observable, Observer, Subscriber, Subscription};
use std::sync::{Arc, Weak};

/// A shareable item predicate.
pub type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Mirror of the passing items for a fixed predicate.
pub(crate) struct FilterState<T, K> {
    mirror: Cache<T, K>,
}

impl<T, K> FilterState<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    pub(crate) fn new() -> Self {
        Self { mirror: Cache::new() }
    }

    /// Filters one upstream batch. Changes keeping their reason keep their
    /// positions.
    pub(crate) fn apply(&mut self, changes: ChangeSet<T, K>, predicate: &dyn Fn(&T) -> bool) -> ChangeSet<T, K> {
        let mut out = ChangeSet::with_capacity(changes.len());
        for change in changes {
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    if predicate(change.current()) {
                        let prior = self
                            .mirror
                            .add_or_update(change.current().clone(), change.key().clone());
                        match (prior, change.reason()) {
                            (Some(_), ChangeReason::Update) | (None, ChangeReason::Add) => out.push(change),
                            (Some(prior), _) => {
                                let (key, current, _) = change.into_parts();
                                out.push(Change::update(key, current, prior));
                            }
                            (None, _) => {
                                let (key, current) = change.into_key_value();
                                out.push(Change::add(key, current));
                            }
                        }
                    } else if let Some(removed) = self.mirror.remove(change.key()) {
                        out.push(Change::remove(change.key().clone(), removed));
                    }
                }
                ChangeReason::Remove => {
                    if self.mirror.remove(change.key()).is_some() {
                        out.push(change);
                    }
                }
                ChangeReason::Refresh => {
                    let included = self.mirror.contains_key(change.key());
                    match (included, predicate(change.current())) {
                        (true, true) => out.push(change),
                        (false, true) => {
                            let (key, current) = change.into_key_value();
                            self.mirror.add_or_update(current.clone(), key.clone());
                            out.push(Change::add(key, current));
                        }
                        (true, false) => {
                            if let Some(removed) = self.mirror.remove(change.key()) {
                                out.push(Change::remove(change.key().clone(), removed));
                            }
                        }
                        (false, false) => {}
                    }
                }
                ChangeReason::Moved => {}
            }
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.mirror.len()
    }
}

struct StaticFilter<T, K> {
    state: FilterState<T, K>,
    predicate: Predicate<T>,
    options: FilterOptions,
    pending: Option<ChangeSet<T, K>>,
    done: bool,
}

enum StaticEvent<T, K> {
    Data(ChangeSet<T, K>),
    Completed,
}

impl<T, K> Operator for StaticFilter<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    type Event = StaticEvent<T, K>;
    type Output = ChangeSet<T, K>;

    fn apply(&mut self, event: Self::Event) -> Result<()> {
        match event {
            StaticEvent::Data(changes) => {
                let filtered = self.state.apply(changes, &*self.predicate);
                self.pending.get_or_insert_with(ChangeSet::new).merge(filtered);
            }
            StaticEvent::Completed => self.done = true,
        }
        Ok(())
    }

    fn flush(&mut self) -> Emission<ChangeSet<T, K>> {
        let suppress = self.options.suppress_empty_changesets;
        Emission::output(self.pending.take().filter(|changes| !(suppress && changes.is_empty())))
    }

    fn is_completed(&self) -> bool {
        self.done
    }
}

/// Keeps the items matching `predicate`.
pub fn filter<T, K, P>(source: &Observable<ChangeSet<T, K>>, predicate: P) -> Observable<ChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    filter_with(source, predicate, FilterOptions::default())
}

/// Keeps the items matching `predicate`, with explicit options.
pub fn filter_with<T, K, P>(
    source: &Observable<ChangeSet<T, K>>,
    predicate: P,
    options: FilterOptions,
) -> Observable<ChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    let source = source.clone();
    let predicate: Predicate<T> = Arc::new(predicate);
    Observable::create(move |subscriber| {
        let operator = StaticFilter {
            state: FilterState::new(),
            predicate: predicate.clone(),
            options,
            pending: None,
            done: false,
        };
        Driver::new(operator, subscriber).subscribe_input(&source, StaticEvent::Data, || StaticEvent::Completed)
    })
}

/// Stateless filter for items that never change in place.
///
/// Updates are classified from their previous and current values, every
/// position is dropped and a refresh is forwarded only when its item passes.
pub fn filter_immutable<T, K, P>(source: &Observable<ChangeSet<T, K>>, predicate: P) -> Observable<ChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    let source = source.clone();
    let predicate = Arc::new(predicate);
    Observable::create(move |subscriber: Subscriber<ChangeSet<T, K>>| {
        let predicate = predicate.clone();
        super::forward(&source, subscriber, move |subscriber, changes: ChangeSet<T, K>| {
            let mut out = ChangeSet::with_capacity(changes.len());
            for change in changes {
                let change = change.without_indices();
                match change.reason() {
                    ChangeReason::Add | ChangeReason::Remove | ChangeReason::Refresh => {
                        if predicate(change.current()) {
                            out.push(change);
                        }
                    }
                    ChangeReason::Update => {
                        let was = change.previous().map(|p| predicate(p)).unwrap_or(false);
                        let now = predicate(change.current());
                        match (was, now) {
                            (true, true) => out.push(change),
                            (false, true) => {
                                let (key, current) = change.into_key_value();
                                out.push(Change::add(key, current));
                            }
                            (true, false) => {
                                let (key, _, previous) = change.into_parts();
                                if let Some(previous) = previous {
                                    out.push(Change::remove(key, previous));
                                }
                            }
                            (false, false) => {}
                        }
                    }
                    ChangeReason::Moved => {}
                }
            }
            if !out.is_empty() {
                subscriber.on_next(out);
            }
        })
    })
}

/// Mirror of passing items over the full upstream contents, for filters
/// whose predicate changes.
pub(crate) struct ReevaluatingFilter<T, K> {
    all: Cache<T, K>,
    mirror: ChangeAwareCache<T, K>,
}

impl<T, K> ReevaluatingFilter<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    pub(crate) fn new() -> Self {
        Self {
            all: Cache::new(),
            mirror: ChangeAwareCache::new(),
        }
    }

    /// Tracks an upstream batch, filtering it when a predicate is known.
    pub(crate) fn apply(&mut self, changes: &ChangeSet<T, K>, predicate: Option<&(dyn Fn(&T) -> bool + Send + Sync)>) {
        self.all.clone_changes(changes);
        let Some(predicate) = predicate else {
            return;
        };
        for change in changes {
            let key = change.key();
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    if predicate(change.current()) {
                        self.mirror.add_or_update(change.current().clone(), key.clone());
                    } else {
                        self.mirror.remove(key);
                    }
                }
                ChangeReason::Remove => self.mirror.remove(key),
                ChangeReason::Refresh => {
                    if !predicate(change.current()) {
                        self.mirror.remove(key);
                    } else if self.mirror.contains_key(key) {
                        self.mirror.refresh(key);
                    } else {
                        self.mirror.add_or_update(change.current().clone(), key.clone());
                    }
                }
                ChangeReason::Moved => {}
            }
        }
    }

    /// Reclassifies every known item.
    pub(crate) fn reevaluate(&mut self, predicate: &dyn Fn(&T) -> bool) {
        for (key, item) in self.all.iter() {
            if predicate(item) {
                if !self.mirror.contains_key(key) {
                    self.mirror.add_or_update(item.clone(), key.clone());
                }
            } else {
                self.mirror.remove(key);
            }
        }
    }

    pub(crate) fn capture(&mut self) -> ChangeSet<T, K> {
        self.mirror.capture_changes()
    }

    pub(crate) fn has_items(&self) -> bool {
        !self.all.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn passing(&self) -> usize {
        self.mirror.len()
    }
}

enum DynamicEvent<T, K> {
    Data(ChangeSet<T, K>),
    Predicate(Predicate<T>),
    Reapply,
    DataCompleted,
    PredicateCompleted,
}

struct DynamicFilter<T, K> {
    filter: ReevaluatingFilter<T, K>,
    predicate: Option<Predicate<T>>,
    options: FilterOptions,
    touched: bool,
    data_done: bool,
    predicate_done: bool,
}

impl<T, K> Operator for DynamicFilter<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    type Event = DynamicEvent<T, K>;
    type Output = ChangeSet<T, K>;

    fn apply(&mut self, event: Self::Event) -> Result<()> {
        match event {
            DynamicEvent::Data(changes) => {
                self.filter.apply(&changes, self.predicate.as_deref());
                self.touched |= self.predicate.is_some();
            }
            DynamicEvent::Predicate(predicate) => {
                self.filter.reevaluate(&*predicate);
                self.predicate = Some(predicate);
                self.touched = true;
            }
            DynamicEvent::Reapply => {
                if let Some(predicate) = &self.predicate {
                    self.filter.reevaluate(&**predicate);
                    self.touched = true;
                }
            }
            DynamicEvent::DataCompleted => self.data_done = true,
            DynamicEvent::PredicateCompleted => self.predicate_done = true,
        }
        Ok(())
    }

    fn flush(&mut self) -> Emission<ChangeSet<T, K>> {
        let changes = self.filter.capture();
        let touched = std::mem::take(&mut self.touched);
        if changes.is_empty() && (self.options.suppress_empty_changesets || !touched) {
            return Emission::none();
        }
        Emission::output(Some(changes))
    }

    fn is_completed(&self) -> bool {
        self.data_done && (self.predicate_done || !self.filter.has_items())
    }
}

/// Filters with a predicate that can be replaced at runtime.
///
/// Nothing passes until the first predicate arrives. Each new predicate, and
/// each signal on `reapply`, reclassifies every upstream item and emits the
/// difference as one batch.
pub fn filter_dynamic<T, K>(
    source: &Observable<ChangeSet<T, K>>,
    predicates: &Observable<Predicate<T>>,
    reapply: Option<&Observable<()>>,
) -> Observable<ChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
{
    filter_dynamic_with(source, predicates, reapply, FilterOptions::default())
}

/// Filters with a replaceable predicate, with explicit options.
pub fn filter_dynamic_with<T, K>(
    source: &Observable<ChangeSet<T, K>>,
    predicates: &Observable<Predicate<T>>,
    reapply: Option<&Observable<()>>,
    options: FilterOptions,
) -> Observable<ChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
{
    let source = source.clone();
    let predicates = predicates.clone();
    let reapply = reapply.cloned();
    Observable::create(move |subscriber| {
        let operator = DynamicFilter {
            filter: ReevaluatingFilter::new(),
            predicate: None,
            options,
            touched: false,
            data_done: false,
            predicate_done: false,
        };
        let driver = Driver::new(operator, subscriber);
        let mut subscription = Subscription::composite([
            driver.subscribe_input(&predicates, DynamicEvent::Predicate, || DynamicEvent::PredicateCompleted),
            driver.subscribe_input(&source, DynamicEvent::Data, || DynamicEvent::DataCompleted),
        ]);
        if let Some(reapply) = &reapply {
            subscription.add(driver.subscribe_input(reapply, |_| DynamicEvent::Reapply, || DynamicEvent::Reapply));
        }
        subscription
    })
}

/// Filters on a state value combined with each item.
///
/// Every state emission reclassifies all items with `predicate(state, item)`.
pub fn filter_on_state<T, K, S, P>(
    source: &Observable<ChangeSet<T, K>>,
    state: &Observable<S>,
    predicate: P,
) -> Observable<ChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
    S: Clone + Send + Sync + 'static,
    P: Fn(&S, &T) -> bool + Send + Sync + 'static,
{
    let predicate = Arc::new(predicate);
    let predicates = state.map(move |state: S| {
        let predicate = predicate.clone();
        Arc::new(move |item: &T| predicate(&state, item)) as Predicate<T>
    });
    filter_dynamic(source, &predicates, None)
}

struct Tracked<T> {
    item: T,
    generation: u64,
    subscription: Subscription,
}

enum ObservedEvent<T, K> {
    Data(ChangeSet<T, K>),
    Passes { key: K, generation: u64, passes: bool },
    Completed,
}

type InclusionSelector<T, K> = Arc<dyn Fn(&T, &K) -> Observable<bool> + Send + Sync>;

struct ObservedFilter<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    selector: InclusionSelector<T, K>,
    tracked: HashMap<K, Tracked<T>>,
    mirror: ChangeAwareCache<T, K>,
    next_generation: u64,
    driver: Weak<Driver<Self>>,
    done: bool,
}

impl<T, K> ObservedFilter<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    fn track(&mut self, key: K, item: T) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let observable = (self.selector)(&item, &key);
        let driver = self.driver.clone();
        let event_key = key.clone();
        let error_driver = self.driver.clone();
        let subscription = observable.subscribe_all(
            move |passes| {
                if let Some(driver) = driver.upgrade() {
                    driver.push(ObservedEvent::Passes {
                        key: event_key.clone(),
                        generation,
                        passes,
                    });
                }
            },
            move |error| {
                if let Some(driver) = error_driver.upgrade() {
                    driver.fail(error);
                }
            },
            || {},
        );
        // Replacing drops the previous item's subscription.
        self.tracked.insert(
            key,
            Tracked {
                item,
                generation,
                subscription,
            },
        );
    }
}

impl<T, K> Operator for ObservedFilter<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    type Event = ObservedEvent<T, K>;
    type Output = ChangeSet<T, K>;

    fn apply(&mut self, event: Self::Event) -> Result<()> {
        match event {
            ObservedEvent::Data(changes) => {
                for change in changes {
                    match change.reason() {
                        ChangeReason::Add | ChangeReason::Update => {
                            let (key, item) = change.into_key_value();
                            if self.mirror.contains_key(&key) {
                                self.mirror.add_or_update(item.clone(), key.clone());
                            }
                            self.track(key, item);
                        }
                        ChangeReason::Remove => {
                            if let Some(mut tracked) = self.tracked.remove(change.key()) {
                                tracked.subscription.unsubscribe();
                            }
                            self.mirror.remove(change.key());
                        }
                        ChangeReason::Refresh => self.mirror.refresh(change.key()),
                        ChangeReason::Moved => {}
                    }
                }
            }
            ObservedEvent::Passes { key, generation, passes } => {
                let Some(tracked) = self.tracked.get(&key) else {
                    return Ok(());
                };
                if tracked.generation != generation {
                    return Ok(());
                }
                if passes {
                    if !self.mirror.contains_key(&key) {
                        self.mirror.add_or_update(tracked.item.clone(), key);
                    }
                } else {
                    self.mirror.remove(&key);
                }
            }
            ObservedEvent::Completed => self.done = true,
        }
        Ok(())
    }

    fn flush(&mut self) -> Emission<ChangeSet<T, K>> {
        let changes = self.mirror.capture_changes();
        Emission::output((!changes.is_empty()).then_some(changes))
    }

    fn is_completed(&self) -> bool {
        self.done
    }
}

/// Filters each item on its own observable of inclusion.
///
/// An item is excluded until its observable first emits `true`. Replacing an
/// item resubscribes to the observable built for the new value; an error in
/// any item's observable fails the whole stream.
pub fn filter_on_observable<T, K, F>(source: &Observable<ChangeSet<T, K>>, selector: F) -> Observable<ChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
    F: Fn(&T, &K) -> Observable<bool> + Send + Sync + 'static,
{
    let source = source.clone();
    let selector: InclusionSelector<T, K> = Arc::new(selector);
    Observable::create(move |subscriber| {
        let operator = ObservedFilter {
            selector: selector.clone(),
            tracked: HashMap::new(),
            mirror: ChangeAwareCache::new(),
            next_generation: 0,
            driver: Weak::new(),
            done: false,
        };
        let driver = Driver::new(operator, subscriber);
        driver.state().driver = Arc::downgrade(&driver);
        let teardown = driver.clone();
        driver
            .subscribe_input(&source, ObservedEvent::Data, || ObservedEvent::Completed)
            .with(Subscription::new(move || {
                let tracked: Vec<Tracked<T>> = teardown.state().tracked.drain().map(|(_, t)| t).collect();
                drop(tracked);
            }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyflux_reactive::{BehaviorSubject, Subject};
    use parking_lot::Mutex;

    fn make_changes(changes: Vec<Change<i32, u32>>) -> ChangeSet<i32, u32> {
        ChangeSet::from(changes)
    }

    fn is_even(v: &i32) -> bool {
        v % 2 == 0
    }

    fn record(observable: &Observable<ChangeSet<i32, u32>>) -> (Arc<Mutex<Vec<ChangeSet<i32, u32>>>>, Subscription) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let sub = observable.subscribe_next(move |changes| sink.lock().push(changes));
        (batches, sub)
    }

    #[test]
    fn test_filter_state_inclusion_transitions() {
        let mut state = FilterState::new();
        let out = state.apply(make_changes(vec![Change::add(1, 2), Change::add(2, 3)]), &is_even);
        assert_eq!(out.adds(), 1);

        // Excluded becomes included: Add. Included becomes excluded: Remove.
        let out = state.apply(
            make_changes(vec![Change::update(2, 4, 3), Change::update(1, 5, 2)]),
            &is_even,
        );
        let reasons: Vec<_> = out.iter().map(|c| (c.reason(), *c.key())).collect();
        assert_eq!(reasons, vec![(ChangeReason::Add, 2), (ChangeReason::Remove, 1)]);
        assert_eq!(state.len(), 1);

        // Value change keeping inclusion passes through unchanged.
        let out = state.apply(make_changes(vec![Change::update_at(2, 6, 4, 0, 1)]), &is_even);
        let change = out.iter().next().unwrap();
        assert_eq!(change.reason(), ChangeReason::Update);
        assert_eq!(change.current_index(), Some(0));
    }

    #[test]
    fn test_filter_state_swallows_moves_and_ignores_unknown_removes() {
        let mut state = FilterState::new();
        state.apply(make_changes(vec![Change::add(1, 2)]), &is_even);
        let out = state.apply(
            make_changes(vec![Change::moved(1, 2, 0, 1), Change::remove(9, 4)]),
            &is_even,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_filter_state_refresh_reclassifies() {
        let mut state = FilterState::new();
        state.apply(make_changes(vec![Change::add(1, 2), Change::add(2, 3)]), &is_even);
        let out = state.apply(
            make_changes(vec![Change::refresh(1, 2), Change::refresh(2, 3)]),
            &|v: &i32| *v > 2,
        );
        let reasons: Vec<_> = out.iter().map(|c| c.reason()).collect();
        assert_eq!(reasons, vec![ChangeReason::Remove, ChangeReason::Add]);
    }

    #[test]
    fn test_filter_suppresses_empty_batches() {
        let subject = Subject::new();
        let (batches, _sub) = record(&filter(&subject.as_observable(), is_even));
        subject.on_next(make_changes(vec![Change::add(1, 1)]));
        subject.on_next(make_changes(vec![Change::add(2, 2)]));
        assert_eq!(batches.lock().len(), 1);

        let subject = Subject::new();
        let (batches, _sub) = record(&filter_with(
            &subject.as_observable(),
            is_even,
            FilterOptions::new().suppress_empty_changesets(false),
        ));
        subject.on_next(make_changes(vec![Change::add(1, 1)]));
        assert_eq!(batches.lock().len(), 1);
        assert!(batches.lock()[0].is_empty());
    }

    #[test]
    fn test_filter_immutable_drops_indices() {
        let subject = Subject::new();
        let (batches, _sub) = record(&filter_immutable(&subject.as_observable(), is_even));
        subject.on_next(make_changes(vec![
            Change::add_at(1, 2, 0),
            Change::update_at(2, 4, 3, 1, 1),
            Change::update_at(3, 5, 6, 2, 2),
            Change::moved(4, 8, 0, 3),
        ]));

        let batches = batches.lock();
        let out: Vec<_> = batches[0]
            .iter()
            .map(|c| (c.reason(), *c.key(), c.current_index()))
            .collect();
        assert_eq!(
            out,
            vec![
                (ChangeReason::Add, 1, None),
                (ChangeReason::Add, 2, None),
                (ChangeReason::Remove, 3, None),
            ]
        );
    }

    #[test]
    fn test_filter_dynamic_reclassifies_on_new_predicate() {
        let source = Subject::new();
        let predicates: Subject<Predicate<i32>> = Subject::new();
        let (batches, _sub) = record(&filter_dynamic(&source.as_observable(), &predicates.as_observable(), None));

        source.on_next(make_changes(vec![Change::add(1, 1), Change::add(2, 2), Change::add(3, 3)]));
        assert!(batches.lock().is_empty());

        predicates.on_next(Arc::new(is_even));
        predicates.on_next(Arc::new(|v: &i32| *v > 1));

        let batches = batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].adds(), 1);
        assert_eq!(batches[1].adds(), 1);
        assert_eq!(batches[1].removes(), 0);
        assert_eq!(*batches[1].iter().next().unwrap().key(), 3);
    }

    #[test]
    fn test_filter_dynamic_completion_needs_both_legs() {
        let source = Subject::new();
        let predicates: Subject<Predicate<i32>> = Subject::new();
        let done = Arc::new(Mutex::new(false));
        let flag = done.clone();
        let _sub = filter_dynamic(&source.as_observable(), &predicates.as_observable(), None).subscribe_all(
            |_| {},
            |_| {},
            move || *flag.lock() = true,
        );

        source.on_next(make_changes(vec![Change::add(1, 2)]));
        source.on_completed();
        assert!(!*done.lock());
        predicates.on_completed();
        assert!(*done.lock());
    }

    #[test]
    fn test_reevaluating_filter_counts() {
        let mut filter = ReevaluatingFilter::new();
        filter.apply(&make_changes(vec![Change::add(1, 1), Change::add(2, 2)]), None);
        assert_eq!(filter.passing(), 0);
        filter.reevaluate(&is_even);
        assert_eq!(filter.passing(), 1);
        assert_eq!(filter.capture().adds(), 1);
    }

    #[test]
    fn test_filter_on_state() {
        let source = Subject::new();
        let threshold = BehaviorSubject::new(2);
        let (batches, _sub) = record(&filter_on_state(
            &source.as_observable(),
            &threshold.as_observable(),
            |min: &i32, v: &i32| v >= min,
        ));

        source.on_next(make_changes(vec![Change::add(1, 1), Change::add(2, 2), Change::add(3, 3)]));
        threshold.on_next(3);

        let batches = batches.lock();
        assert_eq!(batches[0].adds(), 2);
        assert_eq!(batches[1].removes(), 1);
    }

    #[test]
    fn test_filter_on_observable() {
        let source = Subject::new();
        let switches: Arc<Mutex<HashMap<u32, BehaviorSubject<bool>>>> = Arc::new(Mutex::new(HashMap::new()));
        let lookup = switches.clone();
        let (batches, _sub) = record(&filter_on_observable(&source.as_observable(), move |_, key: &u32| {
            lookup
                .lock()
                .entry(*key)
                .or_insert_with(|| BehaviorSubject::new(false))
                .as_observable()
        }));

        source.on_next(make_changes(vec![Change::add(1, 10), Change::add(2, 20)]));
        assert!(batches.lock().is_empty());

        let switch = switches.lock().get(&1).cloned().unwrap();
        switch.on_next(true);
        switch.on_next(false);

        let batches = batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].adds(), 1);
        assert_eq!(batches[1].removes(), 1);
    }
}
