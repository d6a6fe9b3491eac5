//! Shared reader/writer core behind every connectable cache.
//!
//! A `CacheStore` holds the committed data and the change subject. Writers
//! hold the reentrant writer lock across commit and publish, so every
//! subscriber sees batches in commit order and a connecting subscriber
//! receives a catch-up batch that no live batch can interleave with.

use crate::ConnectOptions;
use keyflux_core::{Cache, CacheItem, CacheKey, Change, ChangeSet, Error};
use keyflux_reactive::{FnObserver, Observable, Observer, Subject, Subscriber, Subscription};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use std::sync::Arc;

pub(crate) struct CacheStore<T, K> {
    writer: ReentrantMutex<()>,
    pub(crate) data: RwLock<Cache<T, K>>,
    pub(crate) changes: Subject<ChangeSet<T, K>>,
}

impl<T, K> CacheStore<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    pub(crate) fn new() -> Self {
        Self {
            writer: ReentrantMutex::new(()),
            data: RwLock::new(Cache::new()),
            changes: Subject::new(),
        }
    }

    /// Serializes a commit-and-publish sequence.
    pub(crate) fn write_lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.writer.lock()
    }

    /// Applies an already computed batch and publishes it.
    pub(crate) fn publish(&self, changes: ChangeSet<T, K>) {
        let _writer = self.writer.lock();
        self.data.write().clone_changes(&changes);
        self.changes.on_next(changes);
    }

    pub(crate) fn complete(&self) {
        let _writer = self.writer.lock();
        self.changes.on_completed();
    }

    pub(crate) fn fail(&self, error: Error) {
        let _writer = self.writer.lock();
        self.changes.on_error(error);
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.changes.is_terminated()
    }

    pub(crate) fn lookup(&self, key: &K) -> Option<T> {
        self.data.read().lookup(key).cloned()
    }

    pub(crate) fn keys(&self) -> Vec<K> {
        self.data.read().keys().cloned().collect()
    }

    pub(crate) fn items(&self) -> Vec<T> {
        self.data.read().items().cloned().collect()
    }

    pub(crate) fn key_values(&self) -> Vec<(K, T)> {
        self.data.read().key_values()
    }

    pub(crate) fn count(&self) -> usize {
        self.data.read().len()
    }

    /// Returns the catch-up-then-live change stream.
    pub(crate) fn connect(self: &Arc<Self>, options: ConnectOptions) -> Observable<ChangeSet<T, K>> {
        let store = self.clone();
        Observable::create(move |subscriber: Subscriber<ChangeSet<T, K>>| {
            let _writer = store.writer.lock();
            let initial = store.data.read().as_initial_changes();
            if !initial.is_empty() || !options.suppress_empty_changesets {
                subscriber.on_next(initial);
            }

            let suppress = options.suppress_empty_changesets;
            let (on_error, on_completed) = (subscriber.clone(), subscriber.clone());
            store.changes.as_observable().subscribe(
                FnObserver::new(move |changes: ChangeSet<T, K>| {
                    if !(suppress && changes.is_empty()) {
                        subscriber.on_next(changes);
                    }
                })
                .with_error(move |error| on_error.on_error(error))
                .with_completed(move || on_completed.on_completed()),
            )
        })
    }

    /// Emits the current count on subscribe and after every non-empty batch.
    pub(crate) fn count_changed(self: &Arc<Self>) -> Observable<usize> {
        let store = self.clone();
        Observable::create(move |subscriber: Subscriber<usize>| {
            let _writer = store.writer.lock();
            subscriber.on_next(store.count());

            let (reader, on_error, on_completed) = (store.clone(), subscriber.clone(), subscriber.clone());
            store.changes.as_observable().subscribe(
                FnObserver::new(move |changes: ChangeSet<T, K>| {
                    if !changes.is_empty() {
                        subscriber.on_next(reader.count());
                    }
                })
                .with_error(move |error| on_error.on_error(error))
                .with_completed(move || on_completed.on_completed()),
            )
        })
    }

    /// Emits every change for one key, starting with its current value.
    pub(crate) fn watch(self: &Arc<Self>, key: K) -> Observable<Change<T, K>> {
        let store = self.clone();
        Observable::create(move |subscriber: Subscriber<Change<T, K>>| {
            let _writer = store.writer.lock();
            if let Some(current) = store.lookup(&key) {
                subscriber.on_next(Change::add(key.clone(), current));
            }

            let key = key.clone();
            let (on_error, on_completed) = (subscriber.clone(), subscriber.clone());
            store.changes.as_observable().subscribe(
                FnObserver::new(move |changes: ChangeSet<T, K>| {
                    for change in changes {
                        if *change.key() == key {
                            subscriber.on_next(change);
                        }
                    }
                })
                .with_error(move |error| on_error.on_error(error))
                .with_completed(move || on_completed.on_completed()),
            )
        })
    }
}

/// Drives a store from an upstream change stream.
pub(crate) fn attach<T, K>(store: &Arc<CacheStore<T, K>>, source: &Observable<ChangeSet<T, K>>) -> Subscription
where
    T: CacheItem,
    K: CacheKey,
{
    let (on_next, on_error, on_completed) = (store.clone(), store.clone(), store.clone());
    source.subscribe(
        FnObserver::new(move |changes: ChangeSet<T, K>| on_next.publish(changes))
            .with_error(move |error| on_error.fail(error))
            .with_completed(move || on_completed.complete()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn make_store() -> Arc<CacheStore<i32, &'static str>> {
        let store = Arc::new(CacheStore::new());
        store.publish(ChangeSet::initial(vec![("a", 1), ("b", 2)]));
        store
    }

    #[test]
    fn test_store_connect_catches_up() {
        let store = make_store();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let _sub = store
            .connect(ConnectOptions::default())
            .subscribe_next(move |changes: ChangeSet<i32, &str>| sink.lock().push(changes.summary()));

        store.publish(ChangeSet::from(vec![Change::remove("a", 1)]));
        store.publish(ChangeSet::new());

        let batches = batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].adds, 2);
        assert_eq!(batches[1].removes, 1);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_store_connect_forwards_empty_when_asked() {
        let store: Arc<CacheStore<i32, &'static str>> = Arc::new(CacheStore::new());
        let seen = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        let _sub = store
            .connect(ConnectOptions::new().suppress_empty_changesets(false))
            .subscribe_next(move |_| *sink.lock() += 1);
        store.publish(ChangeSet::new());
        assert_eq!(*seen.lock(), 2);
    }

    #[test]
    fn test_store_count_changed_and_watch() {
        let store = make_store();
        let counts = Arc::new(Mutex::new(Vec::new()));
        let watched = Arc::new(Mutex::new(Vec::new()));
        let (c, w) = (counts.clone(), watched.clone());
        let _counts = store.count_changed().subscribe_next(move |n| c.lock().push(n));
        let _watch = store.watch("b").subscribe_next(move |change: Change<i32, &str>| w.lock().push(change.reason()));

        store.publish(ChangeSet::from(vec![Change::update("b", 3, 2), Change::add("c", 4)]));

        assert_eq!(*counts.lock(), vec![2, 3]);
        assert_eq!(
            *watched.lock(),
            vec![keyflux_core::ChangeReason::Add, keyflux_core::ChangeReason::Update]
        );
    }
}
