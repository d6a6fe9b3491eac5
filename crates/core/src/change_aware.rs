//! Change-capturing cache.
//!
//! Every mutation is applied to the backing `Cache` immediately and recorded
//! as a pending change. Changes hitting the same key are combined with
//! `reduce`, so a captured batch holds at most one change per key.

use crate::cache::Cache;
use crate::change::{Change, ChangeReason};
use crate::change_set::ChangeSet;
use crate::reducer::reduce;
use crate::{CacheItem, CacheKey};
use alloc::vec::Vec;
use hashbrown::HashMap;

/// A cache that records the changes made to it since the last capture.
#[derive(Clone, Debug)]
pub struct ChangeAwareCache<T, K> {
    data: Cache<T, K>,
    /// Pending changes in first-touched order. Cancelled slots hold `None`.
    pending: Vec<Option<Change<T, K>>>,
    /// Key -> slot in `pending`
    slots: HashMap<K, usize>,
    /// Values before the first change per key since the last capture.
    /// Only kept when built with `with_rollback`.
    origins: Option<HashMap<K, Option<T>>>,
}

impl<T, K> Default for ChangeAwareCache<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K> ChangeAwareCache<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    /// Creates a new empty cache.
    pub fn new() -> Self {
        Self::from_cache(Cache::new())
    }

    /// Wraps an existing cache. Its contents are not reported as changes.
    pub fn from_cache(data: Cache<T, K>) -> Self {
        Self {
            data,
            pending: Vec::new(),
            slots: HashMap::new(),
            origins: None,
        }
    }

    /// Wraps an existing cache and remembers enough to undo uncaptured
    /// changes with [`rollback`](Self::rollback).
    pub fn with_rollback(data: Cache<T, K>) -> Self {
        Self {
            origins: Some(HashMap::new()),
            ..Self::from_cache(data)
        }
    }

    /// Restores the data as it was at the last capture and discards the
    /// pending changes. Does nothing to the data unless built with
    /// `with_rollback`.
    pub fn rollback(&mut self) {
        self.pending.clear();
        self.slots.clear();
        if let Some(origins) = self.origins.as_mut() {
            for (key, origin) in origins.drain() {
                match origin {
                    Some(value) => {
                        self.data.add_or_update(value, key);
                    }
                    None => {
                        self.data.remove(&key);
                    }
                }
            }
        }
    }

    /// Returns the committed data, dropping any uncaptured changes.
    pub fn into_cache(self) -> Cache<T, K> {
        self.data
    }

    /// Returns a view of the current data.
    #[inline]
    pub fn cache(&self) -> &Cache<T, K> {
        &self.data
    }

    /// Returns the number of items.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if there are no items.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true if the key is present.
    #[inline]
    pub fn contains_key(&self, key: &K) -> bool {
        self.data.contains_key(key)
    }

    /// Looks up the value for a key.
    #[inline]
    pub fn lookup(&self, key: &K) -> Option<&T> {
        self.data.lookup(key)
    }

    /// Returns an iterator over the keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.data.keys()
    }

    /// Returns an iterator over keys and values.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &T)> {
        self.data.iter()
    }

    /// Returns true if there are uncaptured changes.
    pub fn has_pending(&self) -> bool {
        self.pending.iter().any(Option::is_some)
    }

    /// Adds the item, or replaces the value already stored under `key`.
    pub fn add_or_update(&mut self, item: T, key: K) {
        let change = match self.data.add_or_update(item.clone(), key.clone()) {
            Some(previous) => Change::update(key, item, previous),
            None => Change::add(key, item),
        };
        self.record(change);
    }

    /// Removes a key. Absent keys are ignored.
    pub fn remove(&mut self, key: &K) {
        if let Some(removed) = self.data.remove(key) {
            self.record(Change::remove(key.clone(), removed));
        }
    }

    /// Removes several keys.
    pub fn remove_many<'a>(&mut self, keys: impl IntoIterator<Item = &'a K>) {
        for key in keys {
            self.remove(key);
        }
    }

    /// Records a refresh for a present key. Absent keys are ignored.
    pub fn refresh(&mut self, key: &K) {
        if let Some(current) = self.data.lookup(key) {
            let change = Change::refresh(key.clone(), current.clone());
            self.record(change);
        }
    }

    /// Records a refresh for every item.
    pub fn refresh_all(&mut self) {
        let all = self.data.key_values();
        for (key, value) in all {
            self.record(Change::refresh(key, value));
        }
    }

    /// Removes every item, recording a removal for each.
    pub fn clear(&mut self) {
        let all = self.data.key_values();
        self.data.clear();
        for (key, value) in all {
            self.record(Change::remove(key, value));
        }
    }

    /// Replays upstream changes so that this cache mirrors the producer.
    ///
    /// Moved changes carry no state and are ignored.
    pub fn clone_changes(&mut self, changes: &ChangeSet<T, K>) {
        for change in changes {
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    self.add_or_update(change.current().clone(), change.key().clone());
                }
                ChangeReason::Remove => self.remove(change.key()),
                ChangeReason::Refresh => self.refresh(change.key()),
                ChangeReason::Moved => {}
            }
        }
    }

    /// Drains the pending changes into a change set and resets the record.
    pub fn capture_changes(&mut self) -> ChangeSet<T, K> {
        if let Some(origins) = self.origins.as_mut() {
            origins.clear();
        }
        self.slots.clear();
        self.pending.drain(..).flatten().collect()
    }

    fn record(&mut self, change: Change<T, K>) {
        if let Some(origins) = self.origins.as_mut() {
            let origin = match change.reason() {
                ChangeReason::Add => Some(None),
                ChangeReason::Update => change.previous().cloned().map(Some),
                ChangeReason::Remove => Some(Some(change.current().clone())),
                ChangeReason::Refresh | ChangeReason::Moved => None,
            };
            if let Some(origin) = origin {
                if !origins.contains_key(change.key()) {
                    origins.insert(change.key().clone(), origin);
                }
            }
        }
        match self.slots.get(change.key()) {
            Some(&slot) => {
                let prior = self.pending[slot].take();
                self.pending[slot] = reduce(prior, change);
            }
            None => {
                self.slots.insert(change.key().clone(), self.pending.len());
                self.pending.push(Some(change));
            }
        }
    }
}
