//! A read-only cache materialized from a change-set stream.

use crate::store::{attach, CacheStore};
use crate::ConnectOptions;
use keyflux_core::{CacheItem, CacheKey, Change, ChangeSet};
use keyflux_reactive::{Observable, Subscription};
use parking_lot::Mutex;
use std::sync::Arc;

/// Holds the latest state of an upstream stream and lets any number of
/// subscribers connect to it.
///
/// The upstream subscription lives as long as the cache.
pub struct ObservableCache<T, K> {
    store: Arc<CacheStore<T, K>>,
    upstream: Mutex<Subscription>,
}

impl<T, K> ObservableCache<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    pub(crate) fn new(source: &Observable<ChangeSet<T, K>>) -> Self {
        let store = Arc::new(CacheStore::new());
        let upstream = attach(&store, source);
        Self {
            store,
            upstream: Mutex::new(upstream),
        }
    }

    /// Streams the current contents as one batch, then every later batch.
    pub fn connect(&self) -> Observable<ChangeSet<T, K>> {
        self.store.connect(ConnectOptions::default())
    }

    pub fn connect_with(&self, options: ConnectOptions) -> Observable<ChangeSet<T, K>> {
        self.store.connect(options)
    }

    /// Streams the changes of one key, starting with its current value.
    pub fn watch(&self, key: K) -> Observable<Change<T, K>> {
        self.store.watch(key)
    }

    pub fn count_changed(&self) -> Observable<usize> {
        self.store.count_changed()
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

    /// Returns true once the upstream completed or failed.
    pub fn is_terminated(&self) -> bool {
        self.store.is_terminated()
    }

    /// Detaches from the upstream. Contents stay readable; connected
    /// subscribers receive no further batches.
    pub fn detach(&self) {
        self.upstream.lock().unsubscribe();
    }
}

impl<T, K> std::fmt::Debug for ObservableCache<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableCache")
            .field("count", &self.store.count())
            .field("terminated", &self.store.is_terminated())
            .finish()
    }
}

/// Materializes `source` into an [`ObservableCache`].
pub fn as_observable_cache<T, K>(source: &Observable<ChangeSet<T, K>>) -> ObservableCache<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    ObservableCache::new(source)
}
