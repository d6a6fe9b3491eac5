//! The root of a pipeline.
//!
//! A `SourceCache` owns its data and is the only place items enter the
//! system. Edits are batched: every change made inside one `edit` call is
//! reduced per key and published as a single `ChangeSet`. Edits from several
//! threads are serialized; subscribers run on the editing thread.

use crate::operators::{expire, filter, limit};
use crate::store::CacheStore;
use crate::ConnectOptions;
use keyflux_core::{
    Cache, CacheItem, CacheKey, CacheUpdater, Change, ChangeAwareCache, ChangeSet, Error, KeySelector, Result,
};
use keyflux_reactive::{Observable, Observer, Scheduler, Subject};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Edits the committed data in place and puts it back on drop. Changes not
/// captured by then (the edit unwound) are rolled back first.
struct Staged<'a, T: CacheItem, K: CacheKey> {
    slot: &'a mut Cache<T, K>,
    cache: ChangeAwareCache<T, K>,
}

impl<'a, T: CacheItem, K: CacheKey> Staged<'a, T, K> {
    fn new(slot: &'a mut Cache<T, K>) -> Self {
        let cache = ChangeAwareCache::with_rollback(std::mem::take(slot));
        Self { slot, cache }
    }
}

impl<T: CacheItem, K: CacheKey> Drop for Staged<'_, T, K> {
    fn drop(&mut self) {
        let mut cache = std::mem::take(&mut self.cache);
        cache.rollback();
        *self.slot = cache.into_cache();
    }
}

pub(crate) struct SourceInner<T, K> {
    key_selector: KeySelector<T, K>,
    pub(crate) store: Arc<CacheStore<T, K>>,
    preview: Subject<ChangeSet<T, K>>,
    disposed: AtomicBool,
}

impl<T, K> SourceInner<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    pub(crate) fn edit<R, F>(&self, edit: F) -> Result<R>
    where
        F: FnOnce(&mut CacheUpdater<'_, T, K>) -> R,
    {
        let _writer = self.store.write_lock();
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }

        let (result, changes) = if self.preview.has_observers() {
            // Stage on a copy so preview observers still read the old state.
            let staged = self.store.data.read().clone();
            let mut cache = ChangeAwareCache::from_cache(staged);
            let result = edit(&mut CacheUpdater::new(&mut cache, &*self.key_selector));
            let changes = cache.capture_changes();
            if !changes.is_empty() {
                self.preview.on_next(changes.clone());
            }
            *self.store.data.write() = cache.into_cache();
            (result, changes)
        } else {
            let mut data = self.store.data.write();
            let mut staged = Staged::new(&mut *data);
            let result = edit(&mut CacheUpdater::new(&mut staged.cache, &*self.key_selector));
            let changes = staged.cache.capture_changes();
            (result, changes)
        };

        tracing::trace!(changes = changes.len(), count = self.store.count(), "edit committed");
        self.store.changes.on_next(changes);
        Ok(result)
    }

    fn dispose(&self) {
        let _writer = self.store.write_lock();
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let changes = {
            let mut data = self.store.data.write();
            let mut cache = ChangeAwareCache::from_cache(std::mem::take(&mut *data));
            cache.clear();
            let changes = cache.capture_changes();
            *data = cache.into_cache();
            changes
        };
        tracing::debug!(removed = changes.len(), "source cache disposed");
        if !changes.is_empty() {
            self.store.changes.on_next(changes);
        }
        self.store.complete();
        self.preview.on_completed();
    }
}

/// An observable keyed cache fed by direct edits.
///
/// # Example
///
/// ```rust
/// use keyflux::SourceCache;
/// use std::sync::{Arc, Mutex};
///
/// let cache = SourceCache::new(|item: &(char, i32)| item.0);
/// cache.add_or_update_many(vec![('A', 1), ('B', 2)]).unwrap();
///
/// let batches = Arc::new(Mutex::new(Vec::new()));
/// let sink = batches.clone();
/// let _sub = cache.connect().subscribe_next(move |changes| {
///     sink.lock().unwrap().push(changes.summary());
/// });
///
/// cache.remove_key(&'A').unwrap();
///
/// let batches = batches.lock().unwrap();
/// assert_eq!(batches[0].adds, 2);
/// assert_eq!(batches[1].removes, 1);
/// assert_eq!(cache.key_values(), vec![('B', ('B', 2))]);
/// ```
pub struct SourceCache<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    pub(crate) inner: Arc<SourceInner<T, K>>,
}

impl<T, K> SourceCache<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    /// Creates an empty cache keyed by `key_selector`.
    pub fn new<F>(key_selector: F) -> Self
    where
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(SourceInner {
                key_selector: Arc::new(key_selector),
                store: Arc::new(CacheStore::new()),
                preview: Subject::new(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Runs a batch of edits and publishes their net effect as one change set.
    ///
    /// The closure must go through the updater for reads as well; reading
    /// this cache directly from inside the closure blocks.
    pub fn edit<R, F>(&self, edit: F) -> Result<R>
    where
        F: FnOnce(&mut CacheUpdater<'_, T, K>) -> R,
    {
        self.inner.edit(edit)
    }

    /// Adds an item or replaces the item with the same key.
    pub fn add_or_update(&self, item: T) -> Result<()> {
        self.edit(|updater| updater.add_or_update(item))
    }

    /// Adds or replaces several items in one batch.
    pub fn add_or_update_many(&self, items: impl IntoIterator<Item = T>) -> Result<()> {
        self.edit(|updater| updater.add_or_update_many(items))
    }

    /// Removes a key. Absent keys produce no change.
    pub fn remove_key(&self, key: &K) -> Result<()> {
        self.edit(|updater| updater.remove_key(key))
    }

    /// Removes several keys in one batch.
    pub fn remove_keys<'k>(&self, keys: impl IntoIterator<Item = &'k K>) -> Result<()> {
        self.edit(|updater| updater.remove_keys(keys))
    }

    /// Removes the item sharing `item`'s key.
    pub fn remove_item(&self, item: &T) -> Result<()> {
        self.edit(|updater| updater.remove_item(item))
    }

    /// Asks downstream stages to re-evaluate a key.
    pub fn refresh(&self, key: &K) -> Result<()> {
        self.edit(|updater| updater.refresh(key))
    }

    /// Asks downstream stages to re-evaluate every item.
    pub fn refresh_all(&self) -> Result<()> {
        self.edit(|updater| updater.refresh_all())
    }

    /// Removes every item.
    pub fn clear(&self) -> Result<()> {
        self.edit(|updater| updater.clear())
    }

    /// Replaces the contents with `items` using the minimal set of changes.
    pub fn edit_diff<F>(&self, items: impl IntoIterator<Item = T>, are_equal: F) -> Result<()>
    where
        F: Fn(&T, &T) -> bool,
    {
        self.edit(|updater| updater.edit_diff(items, are_equal))
    }

    /// Looks up the value for a key.
    pub fn lookup(&self, key: &K) -> Option<T> {
        self.inner.store.lookup(key)
    }

    /// Returns a snapshot of the keys.
    pub fn keys(&self) -> Vec<K> {
        self.inner.store.keys()
    }

    /// Returns a snapshot of the items.
    pub fn items(&self) -> Vec<T> {
        self.inner.store.items()
    }

    /// Returns a snapshot of the key/value pairs.
    pub fn key_values(&self) -> Vec<(K, T)> {
        self.inner.store.key_values()
    }

    /// Returns the number of items.
    pub fn count(&self) -> usize {
        self.inner.store.count()
    }

    /// Returns true once the cache has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Connects to the change stream.
    ///
    /// Each subscriber first receives one batch adding the current contents
    /// and then every later edit.
    pub fn connect(&self) -> Observable<ChangeSet<T, K>> {
        self.connect_with(ConnectOptions::default())
    }

    /// Connects with explicit options.
    pub fn connect_with(&self, options: ConnectOptions) -> Observable<ChangeSet<T, K>> {
        self.inner.store.connect(options)
    }

    /// Connects to the items matching `predicate` only.
    pub fn connect_where<P>(&self, predicate: P) -> Observable<ChangeSet<T, K>>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        filter::filter(&self.connect(), predicate)
    }

    /// Streams every batch before it is committed.
    ///
    /// Observers run while readers of this cache still see the previous
    /// state.
    pub fn preview(&self) -> Observable<ChangeSet<T, K>> {
        self.inner.preview.as_observable()
    }

    /// Streams the changes for one key, starting with its current value.
    pub fn watch(&self, key: K) -> Observable<Change<T, K>> {
        self.inner.store.watch(key)
    }

    /// Streams the item count, starting with the current count.
    pub fn count_changed(&self) -> Observable<usize> {
        self.inner.store.count_changed()
    }

    /// Removes items from this cache once their lifetime elapses.
    ///
    /// `lifetime` returns how long an item lives after it was added or last
    /// updated, or `None` to keep it forever. The returned stream emits each
    /// batch of removed pairs; the timers run while it is subscribed.
    pub fn expire_after<F>(&self, lifetime: F, scheduler: Arc<dyn Scheduler>) -> Observable<Vec<(K, T)>>
    where
        F: Fn(&T) -> Option<Duration> + Send + Sync + 'static,
    {
        expire::expire_source(self, lifetime, scheduler)
    }

    /// Removes the oldest items from this cache whenever it holds more than
    /// `size` items.
    ///
    /// Eviction runs through the scheduler at the current time, as a batch
    /// of its own. The returned stream emits each batch of evicted pairs.
    pub fn limit_size_to(&self, size: usize, scheduler: Arc<dyn Scheduler>) -> Result<Observable<Vec<(K, T)>>> {
        limit::limit_source(self, size, scheduler)
    }

    /// Clears the cache, reporting every item as removed, and completes all
    /// subscribers. Later edits fail with [`Error::Disposed`].
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl<T, K> Drop for SourceCache<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyflux_core::ChangeReason;
    use parking_lot::Mutex;

    #[derive(Clone, Debug, PartialEq)]
    struct Person {
        name: &'static str,
        age: u32,
    }

    fn make_person(name: &'static str, age: u32) -> Person {
        Person { name, age }
    }

    fn make_cache() -> SourceCache<Person, &'static str> {
        SourceCache::new(|p: &Person| p.name)
    }

    fn record(observable: &Observable<ChangeSet<Person, &'static str>>) -> (Arc<Mutex<Vec<ChangeSet<Person, &'static str>>>>, keyflux_reactive::Subscription) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let sub = observable.subscribe_next(move |changes| sink.lock().push(changes));
        (batches, sub)
    }

    #[test]
    fn test_source_cache_round_trip() {
        let cache = make_cache();
        cache
            .add_or_update_many(vec![make_person("A", 1), make_person("B", 2)])
            .unwrap();

        let (batches, _sub) = record(&cache.connect());
        cache.remove_key(&"A").unwrap();

        let batches = batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].adds(), 2);
        assert_eq!(batches[1].removes(), 1);
        assert_eq!(cache.items(), vec![make_person("B", 2)]);
    }

    #[test]
    fn test_source_cache_edit_is_one_batch() {
        let cache = make_cache();
        let (batches, _sub) = record(&cache.connect());

        cache
            .edit(|updater| {
                updater.add_or_update(make_person("A", 1));
                updater.add_or_update(make_person("A", 2));
                updater.add_or_update(make_person("B", 1));
                updater.remove_key(&"B");
            })
            .unwrap();

        let batches = batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        let change = batches[0].iter().next().unwrap();
        assert_eq!(change.reason(), ChangeReason::Add);
        assert_eq!(change.current().age, 2);
    }

    #[test]
    fn test_source_cache_panicking_edit_keeps_data() {
        let cache = make_cache();
        cache
            .add_or_update_many(vec![make_person("A", 1), make_person("B", 2)])
            .unwrap();
        let (batches, _sub) = record(&cache.connect());

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.edit(|updater| {
                updater.add_or_update(make_person("A", 9));
                updater.remove_key(&"B");
                updater.add_or_update(make_person("C", 3));
                panic!("edit aborted");
            })
        }));
        assert!(outcome.is_err());

        let mut items = cache.items();
        items.sort_by_key(|p| p.name);
        assert_eq!(items, vec![make_person("A", 1), make_person("B", 2)]);
        assert_eq!(batches.lock().len(), 1);

        cache.add_or_update(make_person("C", 3)).unwrap();
        assert_eq!(cache.count(), 3);
        assert_eq!(batches.lock()[1].adds(), 1);
    }

    #[test]
    fn test_source_cache_connect_where() {
        let cache = make_cache();
        cache
            .add_or_update_many(vec![make_person("A", 10), make_person("B", 30)])
            .unwrap();
        let (batches, _sub) = record(&cache.connect_where(|p| p.age > 18));

        cache.add_or_update(make_person("A", 20)).unwrap();

        let batches = batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].adds(), 1);
        assert_eq!(*batches[1].iter().next().unwrap().key(), "A");
        assert_eq!(batches[1].adds(), 1);
    }

    #[test]
    fn test_source_cache_preview_sees_old_state() {
        let cache = Arc::new(make_cache());
        cache.add_or_update(make_person("A", 1)).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (reader, sink) = (cache.clone(), seen.clone());
        let _preview = cache.preview().subscribe_next(move |changes: ChangeSet<Person, &str>| {
            sink.lock().push((changes.len(), reader.lookup(&"A").map(|p| p.age)));
        });

        cache.add_or_update(make_person("A", 5)).unwrap();

        assert_eq!(*seen.lock(), vec![(1, Some(1))]);
        assert_eq!(cache.lookup(&"A").unwrap().age, 5);
    }

    #[test]
    fn test_source_cache_dispose_reports_removes_then_completes() {
        let cache = make_cache();
        cache.add_or_update(make_person("A", 1)).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let (l1, l2) = (log.clone(), log.clone());
        let _sub = cache.connect().subscribe_all(
            move |changes: ChangeSet<Person, &str>| l1.lock().push(format!("{:?}", changes.summary())),
            |_| {},
            move || l2.lock().push("done".to_string()),
        );

        cache.dispose();

        let log = log.lock();
        assert_eq!(log.len(), 3);
        assert!(log[1].contains("removes: 1"));
        assert_eq!(log[2], "done");
        assert_eq!(cache.add_or_update(make_person("B", 1)), Err(Error::Disposed));
    }

    #[test]
    fn test_source_cache_concurrent_edits_serialize() {
        let cache = Arc::new(SourceCache::new(|v: &(u32, u32)| v.0));
        let total = Arc::new(Mutex::new(0usize));
        let sink = total.clone();
        let _sub = cache
            .connect()
            .subscribe_next(move |changes: ChangeSet<(u32, u32), u32>| *sink.lock() += changes.adds());

        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        cache.add_or_update((t * 1000 + i, i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.count(), 400);
        assert_eq!(*total.lock(), 400);
    }

    #[test]
    fn test_source_cache_count_changed() {
        let cache = make_cache();
        let counts = Arc::new(Mutex::new(Vec::new()));
        let sink = counts.clone();
        let _sub = cache.count_changed().subscribe_next(move |n| sink.lock().push(n));

        cache.add_or_update(make_person("A", 1)).unwrap();
        cache.refresh(&"Z").unwrap();
        cache.remove_key(&"A").unwrap();

        assert_eq!(*counts.lock(), vec![0, 1, 0]);
    }
}
