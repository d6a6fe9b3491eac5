//! Grouping operators.
//!
//! A grouping emits one change per group lifecycle event: `Add` when a group
//! gains its first member and `Remove` when it loses its last. Each `Group`
//! is itself a connectable cache of its members. Member changes are published
//! into the group caches before the outer batch is emitted, so a group is
//! never announced empty, and removed groups complete after it.
//!
//! Group lifecycle is computed per batch: a group emptied and refilled within
//! one batch produces no outer change.

use super::{Driver, Effect, Emission, Operator};
use crate::store::CacheStore;
use crate::ConnectOptions;
use hashbrown::{HashMap, HashSet};
use keyflux_core::{Cache, CacheItem, CacheKey, Change, ChangeAwareCache, ChangeReason, ChangeSet, Result};
use keyflux_reactive::{Observable, Subscription};
use std::fmt;
use std::sync::{Arc, Weak};

/// Computes the group key of an item.
pub type GroupSelector<T, K, G> = Arc<dyn Fn(&T, &K) -> G + Send + Sync>;

/// A live group of items sharing a group key.
pub struct Group<T, K, G> {
    key: G,
    store: Arc<CacheStore<T, K>>,
}

impl<T, K, G: Clone> Clone for Group<T, K, G> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            store: self.store.clone(),
        }
    }
}

impl<T, K, G: fmt::Debug> fmt::Debug for Group<T, K, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group").field("key", &self.key).finish_non_exhaustive()
    }
}

impl<T, K, G> Group<T, K, G>
where
    T: CacheItem,
    K: CacheKey,
    G: CacheKey,
{
    fn new(key: G) -> Self {
        Self {
            key,
            store: Arc::new(CacheStore::new()),
        }
    }

    pub fn key(&self) -> &G {
        &self.key
    }

    /// Streams the members of this group, starting with the current ones.
    /// Completes when the group is removed.
    pub fn connect(&self) -> Observable<ChangeSet<T, K>> {
        self.store.connect(ConnectOptions::default())
    }

    pub fn lookup(&self, key: &K) -> Option<T> {
        self.store.lookup(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.store.keys()
    }

    pub fn items(&self) -> Vec<T> {
        self.store.items()
    }

    pub fn key_values(&self) -> Vec<(K, T)> {
        self.store.key_values()
    }

    pub fn count(&self) -> usize {
        self.store.count()
    }

    /// Takes an immutable copy of the current members.
    pub fn snapshot(&self) -> Grouping<T, K, G> {
        Grouping::new(self.key.clone(), self.store.key_values())
    }
}

/// An immutable group of items sharing a group key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grouping<T, K, G> {
    key: G,
    items: Vec<(K, T)>,
}

impl<T, K, G> Grouping<T, K, G>
where
    K: PartialEq,
{
    pub fn new(key: G, items: Vec<(K, T)>) -> Self {
        Self { key, items }
    }

    pub fn key(&self) -> &G {
        &self.key
    }

    pub fn items(&self) -> &[(K, T)] {
        &self.items
    }

    pub fn lookup(&self, key: &K) -> Option<&T> {
        self.items.iter().find(|(k, _)| k == key).map(|(_, item)| item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

struct Slot<T, K, G> {
    group: Group<T, K, G>,
    members: ChangeAwareCache<T, K>,
}

/// Group membership shared by every grouping variant.
pub(crate) struct GroupState<T, K, G> {
    assigned: HashMap<K, (G, T)>,
    slots: HashMap<G, Slot<T, K, G>>,
    emitted: HashSet<G>,
    touched: HashSet<G>,
}

impl<T, K, G> GroupState<T, K, G>
where
    T: CacheItem,
    K: CacheKey,
    G: CacheKey,
{
    pub(crate) fn new() -> Self {
        Self {
            assigned: HashMap::new(),
            slots: HashMap::new(),
            emitted: HashSet::new(),
            touched: HashSet::new(),
        }
    }

    /// Puts an item into `group`, moving it out of its previous group.
    pub(crate) fn place(&mut self, key: K, item: T, group: G) {
        if let Some((previous, _)) = self.assigned.get(&key) {
            if *previous != group {
                let previous = previous.clone();
                if let Some(slot) = self.slots.get_mut(&previous) {
                    slot.members.remove(&key);
                }
                self.touched.insert(previous);
            }
        }
        let slot = self.slots.entry(group.clone()).or_insert_with(|| Slot {
            group: Group::new(group.clone()),
            members: ChangeAwareCache::new(),
        });
        slot.members.add_or_update(item.clone(), key.clone());
        self.touched.insert(group.clone());
        self.assigned.insert(key, (group, item));
    }

    pub(crate) fn unplace(&mut self, key: &K) {
        if let Some((group, _)) = self.assigned.remove(key) {
            if let Some(slot) = self.slots.get_mut(&group) {
                slot.members.remove(key);
            }
            self.touched.insert(group);
        }
    }

    /// Refreshes an item inside its group.
    pub(crate) fn refresh(&mut self, key: &K) {
        if let Some((group, _)) = self.assigned.get(key) {
            if let Some(slot) = self.slots.get_mut(group) {
                slot.members.refresh(key);
            }
            self.touched.insert(group.clone());
        }
    }

    pub(crate) fn group_of(&self, key: &K) -> Option<&G> {
        self.assigned.get(key).map(|(group, _)| group)
    }

    /// Current items with their keys.
    pub(crate) fn assigned_items(&self) -> Vec<(K, T)> {
        self.assigned
            .iter()
            .map(|(key, (_, item))| (key.clone(), item.clone()))
            .collect()
    }

    /// Releases the batch: member changes are published before the outer
    /// changes, emptied groups complete after them.
    pub(crate) fn capture(&mut self) -> Emission<ChangeSet<Group<T, K, G>, G>> {
        let mut emission = Emission::none();
        let mut outer = ChangeSet::new();
        for key in self.touched.drain() {
            let Some(slot) = self.slots.get_mut(&key) else {
                continue;
            };
            let changes = slot.members.capture_changes();
            let populated = !slot.members.is_empty();
            let announced = self.emitted.contains(&key);

            if !changes.is_empty() && (populated || announced) {
                let store = slot.group.store.clone();
                emission.before.push(Box::new(move || store.publish(changes)) as Effect);
            }
            match (populated, announced) {
                (true, false) => {
                    outer.push(Change::add(key.clone(), slot.group.clone()));
                    self.emitted.insert(key);
                }
                (false, true) => {
                    if let Some(slot) = self.slots.remove(&key) {
                        let store = slot.group.store.clone();
                        outer.push(Change::remove(key.clone(), slot.group));
                        emission.after.push(Box::new(move || store.complete()));
                    }
                    self.emitted.remove(&key);
                }
                (false, false) => {
                    self.slots.remove(&key);
                }
                (true, true) => {}
            }
        }
        if !outer.is_empty() {
            emission.output = Some(outer);
        }
        emission
    }

    /// Completes every remaining group.
    pub(crate) fn close(&mut self) -> Vec<Effect> {
        self.emitted.clear();
        self.slots
            .drain()
            .map(|(_, slot)| {
                let store = slot.group.store;
                Box::new(move || store.complete()) as Effect
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn group_count(&self) -> usize {
        self.slots.len()
    }
}

enum SelectorEvent<T, K, G> {
    Data(ChangeSet<T, K>),
    Selector(GroupSelector<T, K, G>),
    Regroup,
    DataCompleted,
    Ignored,
}

struct SelectorGroup<T, K, G> {
    state: GroupState<T, K, G>,
    selector: Option<GroupSelector<T, K, G>>,
    waiting: Cache<T, K>,
    done: bool,
}

impl<T, K, G> SelectorGroup<T, K, G>
where
    T: CacheItem,
    K: CacheKey,
    G: CacheKey,
{
    fn regroup(&mut self, selector: &dyn Fn(&T, &K) -> G) {
        let mut items = self.state.assigned_items();
        items.extend(self.waiting.key_values());
        self.waiting.clear();
        tracing::debug!(count = items.len(), "regrouping");
        for (key, item) in items {
            let group = selector(&item, &key);
            if self.state.group_of(&key) != Some(&group) {
                self.state.place(key, item, group);
            }
        }
    }
}

impl<T, K, G> Operator for SelectorGroup<T, K, G>
where
    T: CacheItem,
    K: CacheKey,
    G: CacheKey,
{
    type Event = SelectorEvent<T, K, G>;
    type Output = ChangeSet<Group<T, K, G>, G>;

    fn apply(&mut self, event: Self::Event) -> Result<()> {
        match event {
            SelectorEvent::Data(changes) => {
                let Some(selector) = self.selector.clone() else {
                    self.waiting.clone_changes(&changes);
                    return Ok(());
                };
                for change in changes {
                    match change.reason() {
                        ChangeReason::Add | ChangeReason::Update => {
                            let (key, item) = change.into_key_value();
                            let group = selector(&item, &key);
                            self.state.place(key, item, group);
                        }
                        ChangeReason::Remove => self.state.unplace(change.key()),
                        ChangeReason::Refresh => {
                            let group = selector(change.current(), change.key());
                            if self.state.group_of(change.key()) == Some(&group) {
                                self.state.refresh(change.key());
                            } else {
                                let (key, item) = change.into_key_value();
                                self.state.place(key, item, group);
                            }
                        }
                        ChangeReason::Moved => {}
                    }
                }
            }
            SelectorEvent::Selector(selector) => {
                self.regroup(&*selector);
                self.selector = Some(selector);
            }
            SelectorEvent::Regroup => {
                if let Some(selector) = self.selector.clone() {
                    self.regroup(&*selector);
                }
            }
            SelectorEvent::DataCompleted => self.done = true,
            SelectorEvent::Ignored => {}
        }
        Ok(())
    }

    fn flush(&mut self) -> Emission<Self::Output> {
        let mut emission = self.state.capture();
        if self.done {
            emission.after.extend(self.state.close());
        }
        emission
    }

    fn is_completed(&self) -> bool {
        self.done
    }
}

fn build<T, K, G>(
    source: &Observable<ChangeSet<T, K>>,
    selector: Option<GroupSelector<T, K, G>>,
    selectors: Option<Observable<GroupSelector<T, K, G>>>,
    regroup: Option<Observable<()>>,
) -> Observable<ChangeSet<Group<T, K, G>, G>>
where
    T: CacheItem,
    K: CacheKey,
    G: CacheKey,
{
    let source = source.clone();
    Observable::create(move |subscriber| {
        let operator = SelectorGroup {
            state: GroupState::new(),
            selector: selector.clone(),
            waiting: Cache::new(),
            done: false,
        };
        let driver = Driver::new(operator, subscriber);
        let mut subscription = Subscription::empty();
        if let Some(selectors) = &selectors {
            subscription.add(driver.subscribe_input(selectors, SelectorEvent::Selector, || SelectorEvent::Ignored));
        }
        if let Some(regroup) = &regroup {
            subscription.add(driver.subscribe_input(regroup, |_| SelectorEvent::Regroup, || SelectorEvent::Ignored));
        }
        subscription.add(driver.subscribe_input(&source, SelectorEvent::Data, || SelectorEvent::DataCompleted));
        let teardown = driver.clone();
        subscription.with(Subscription::new(move || {
            let closing = teardown.state().state.close();
            for effect in closing {
                effect();
            }
        }))
    })
}

/// Groups items by a key computed when they are added or updated.
pub fn group_on<T, K, G, F>(source: &Observable<ChangeSet<T, K>>, selector: F) -> Observable<ChangeSet<Group<T, K, G>, G>>
where
    T: CacheItem,
    K: CacheKey,
    G: CacheKey,
    F: Fn(&T) -> G + Send + Sync + 'static,
{
    build(source, Some(Arc::new(move |item: &T, _: &K| selector(item))), None, None)
}

/// Groups items by key, recomputing every item's group whenever `regroup`
/// signals.
pub fn group_on_with_regroup<T, K, G, F>(
    source: &Observable<ChangeSet<T, K>>,
    selector: F,
    regroup: &Observable<()>,
) -> Observable<ChangeSet<Group<T, K, G>, G>>
where
    T: CacheItem,
    K: CacheKey,
    G: CacheKey,
    F: Fn(&T) -> G + Send + Sync + 'static,
{
    build(
        source,
        Some(Arc::new(move |item: &T, _: &K| selector(item))),
        None,
        Some(regroup.clone()),
    )
}

/// Groups items with a selector that can be replaced at runtime.
///
/// Items are held back until the first selector arrives. Every new selector
/// regroups all items as one batch.
pub fn group_on_dynamic<T, K, G>(
    source: &Observable<ChangeSet<T, K>>,
    selectors: &Observable<GroupSelector<T, K, G>>,
    regroup: Option<&Observable<()>>,
) -> Observable<ChangeSet<Group<T, K, G>, G>>
where
    T: CacheItem,
    K: CacheKey,
    G: CacheKey,
{
    build(source, None, Some(selectors.clone()), regroup.cloned())
}

struct Tracked<T> {
    item: T,
    generation: u64,
    subscription: Subscription,
}

enum ObservedEvent<T, K, G> {
    Data(ChangeSet<T, K>),
    KeyChanged { key: K, generation: u64, group: G },
    Completed,
}

type KeyObservableSelector<T, K, G> = Arc<dyn Fn(&T, &K) -> Observable<G> + Send + Sync>;

struct ObservedGroup<T, K, G>
where
    T: CacheItem,
    K: CacheKey,
    G: CacheKey,
{
    state: GroupState<T, K, G>,
    selector: KeyObservableSelector<T, K, G>,
    tracked: HashMap<K, Tracked<T>>,
    next_generation: u64,
    driver: Weak<Driver<Self>>,
    done: bool,
}

impl<T, K, G> ObservedGroup<T, K, G>
where
    T: CacheItem,
    K: CacheKey,
    G: CacheKey,
{
    fn track(&mut self, key: K, item: T) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let (next_driver, error_driver) = (self.driver.clone(), self.driver.clone());
        let event_key = key.clone();
        let subscription = (self.selector)(&item, &key).subscribe_all(
            move |group| {
                if let Some(driver) = next_driver.upgrade() {
                    driver.push(ObservedEvent::KeyChanged {
                        key: event_key.clone(),
                        generation,
                        group,
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

impl<T, K, G> Operator for ObservedGroup<T, K, G>
where
    T: CacheItem,
    K: CacheKey,
    G: CacheKey,
{
    type Event = ObservedEvent<T, K, G>;
    type Output = ChangeSet<Group<T, K, G>, G>;

    fn apply(&mut self, event: Self::Event) -> Result<()> {
        match event {
            ObservedEvent::Data(changes) => {
                for change in changes {
                    match change.reason() {
                        ChangeReason::Add | ChangeReason::Update => {
                            let (key, item) = change.into_key_value();
                            if let Some(group) = self.state.group_of(&key).cloned() {
                                self.state.place(key.clone(), item.clone(), group);
                            }
                            self.track(key, item);
                        }
                        ChangeReason::Remove => {
                            if let Some(mut tracked) = self.tracked.remove(change.key()) {
                                tracked.subscription.unsubscribe();
                            }
                            self.state.unplace(change.key());
                        }
                        ChangeReason::Refresh => self.state.refresh(change.key()),
                        ChangeReason::Moved => {}
                    }
                }
            }
            ObservedEvent::KeyChanged { key, generation, group } => {
                let Some(tracked) = self.tracked.get(&key) else {
                    return Ok(());
                };
                if tracked.generation != generation || self.state.group_of(&key) == Some(&group) {
                    return Ok(());
                }
                let item = tracked.item.clone();
                self.state.place(key, item, group);
            }
            ObservedEvent::Completed => self.done = true,
        }
        Ok(())
    }

    fn flush(&mut self) -> Emission<Self::Output> {
        let mut emission = self.state.capture();
        if self.done {
            emission.after.extend(self.state.close());
        }
        emission
    }

    fn is_completed(&self) -> bool {
        self.done
    }
}

/// Groups items by keys that each item publishes through its own observable.
///
/// An item joins a group when its observable first emits and moves whenever
/// it emits a different key. An error from any item's observable fails the
/// grouping.
pub fn group_on_observable<T, K, G, F>(
    source: &Observable<ChangeSet<T, K>>,
    selector: F,
) -> Observable<ChangeSet<Group<T, K, G>, G>>
where
    T: CacheItem,
    K: CacheKey,
    G: CacheKey,
    F: Fn(&T, &K) -> Observable<G> + Send + Sync + 'static,
{
    let source = source.clone();
    let selector: KeyObservableSelector<T, K, G> = Arc::new(selector);
    Observable::create(move |subscriber| {
        let operator = ObservedGroup {
            state: GroupState::new(),
            selector: selector.clone(),
            tracked: HashMap::new(),
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
                let (tracked, closing) = {
                    let mut operator = teardown.state();
                    let tracked: Vec<Tracked<T>> = operator.tracked.drain().map(|(_, t)| t).collect();
                    (tracked, operator.state.close())
                };
                drop(tracked);
                for effect in closing {
                    effect();
                }
            }))
    })
}
