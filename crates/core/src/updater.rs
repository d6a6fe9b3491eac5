//! The edit engine.
//!
//! A `CacheUpdater` is the write boundary handed to an edit batch. Every call
//! mutates the underlying `ChangeAwareCache`, which records and reduces the
//! resulting changes until the batch is captured.

use crate::change_aware::ChangeAwareCache;
use crate::{CacheItem, CacheKey};
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;

/// Key selector for cached items.
pub type KeySelector<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;

/// Mutation handle for one edit batch.
pub struct CacheUpdater<'a, T, K> {
    cache: &'a mut ChangeAwareCache<T, K>,
    key_selector: &'a (dyn Fn(&T) -> K + Send + Sync),
}

impl<'a, T, K> CacheUpdater<'a, T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    /// Creates an updater writing into `cache`.
    pub fn new(
        cache: &'a mut ChangeAwareCache<T, K>,
        key_selector: &'a (dyn Fn(&T) -> K + Send + Sync),
    ) -> Self {
        Self {
            cache,
            key_selector,
        }
    }

    /// Returns the key the selector assigns to `item`.
    #[inline]
    pub fn key_of(&self, item: &T) -> K {
        (self.key_selector)(item)
    }

    /// Adds the item, or replaces the value with the same key.
    pub fn add_or_update(&mut self, item: T) {
        let key = self.key_of(&item);
        self.cache.add_or_update(item, key);
    }

    /// Adds the item under an explicit key.
    pub fn add_or_update_with_key(&mut self, item: T, key: K) {
        self.cache.add_or_update(item, key);
    }

    /// Adds or replaces several items.
    pub fn add_or_update_many(&mut self, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.add_or_update(item);
        }
    }

    /// Removes a key. Absent keys are a no-op.
    pub fn remove_key(&mut self, key: &K) {
        self.cache.remove(key);
    }

    /// Removes several keys.
    pub fn remove_keys<'k>(&mut self, keys: impl IntoIterator<Item = &'k K>) {
        for key in keys {
            self.cache.remove(key);
        }
    }

    /// Removes the item with the same key as `item`.
    pub fn remove_item(&mut self, item: &T) {
        let key = self.key_of(item);
        self.cache.remove(&key);
    }

    /// Requests re-evaluation of a present key.
    pub fn refresh(&mut self, key: &K) {
        self.cache.refresh(key);
    }

    /// Requests re-evaluation of several keys.
    pub fn refresh_keys<'k>(&mut self, keys: impl IntoIterator<Item = &'k K>) {
        for key in keys {
            self.cache.refresh(key);
        }
    }

    /// Requests re-evaluation of every item.
    pub fn refresh_all(&mut self) {
        self.cache.refresh_all();
    }

    /// Removes every item.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Replaces the contents with `items`, producing the minimal set of
    /// changes.
    ///
    /// Keys only in the cache are removed, keys only in `items` are added
    /// and keys in both are updated when `are_equal` reports a difference.
    pub fn edit_diff<F>(&mut self, items: impl IntoIterator<Item = T>, are_equal: F)
    where
        F: Fn(&T, &T) -> bool,
    {
        let mut incoming: HashMap<K, T> = HashMap::new();
        for item in items {
            let key = self.key_of(&item);
            incoming.insert(key, item);
        }

        let stale: Vec<K> = self
            .cache
            .keys()
            .filter(|k| !incoming.contains_key(*k))
            .cloned()
            .collect();
        for key in &stale {
            self.cache.remove(key);
        }

        for (key, item) in incoming {
            let unchanged = match self.cache.lookup(&key) {
                Some(existing) => are_equal(existing, &item),
                None => false,
            };
            if !unchanged {
                self.cache.add_or_update(item, key);
            }
        }
    }

    /// Looks up the value for a key, reflecting edits made so far.
    #[inline]
    pub fn lookup(&self, key: &K) -> Option<&T> {
        self.cache.lookup(key)
    }

    /// Returns the number of items, reflecting edits made so far.
    #[inline]
    pub fn count(&self) -> usize {
        self.cache.len()
    }

    /// Returns a snapshot of the keys.
    pub fn keys(&self) -> Vec<K> {
        self.cache.keys().cloned().collect()
    }

    /// Returns a snapshot of the items.
    pub fn items(&self) -> Vec<T> {
        self.cache.iter().map(|(_, v)| v.clone()).collect()
    }
}
