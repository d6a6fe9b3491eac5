//! Keyed cache storage.
//!
//! `Cache` is the plain keyed store every stage mirrors its state into. It
//! records nothing; see `ChangeAwareCache` for the variant that captures
//! changes.

use crate::change::ChangeReason;
use crate::change_set::ChangeSet;
use crate::{CacheItem, CacheKey};
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::hash::{Hash, Hasher};
use hashbrown::HashMap;

/// A mapping from unique keys to values.
///
/// Key equality is the key type's own `Eq`/`Hash`; wrap keys in a newtype
/// such as [`IgnoreCase`] to change it.
#[derive(Clone, Debug)]
pub struct Cache<T, K> {
    data: HashMap<K, T>,
}

impl<T, K> Default for Cache<T, K> {
    fn default() -> Self {
        Self {
            data: HashMap::new(),
        }
    }
}

impl<T, K> Cache<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    /// Creates a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cache with room for `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: HashMap::with_capacity(capacity),
        }
    }

    /// Returns the number of items.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the cache holds no items.
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
        self.data.get(key)
    }

    /// Inserts or replaces a value, returning the replaced value.
    #[inline]
    pub fn add_or_update(&mut self, item: T, key: K) -> Option<T> {
        self.data.insert(key, item)
    }

    /// Removes a key, returning its value.
    #[inline]
    pub fn remove(&mut self, key: &K) -> Option<T> {
        self.data.remove(key)
    }

    /// Removes every item.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Returns an iterator over keys and values.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &T)> {
        self.data.iter()
    }

    /// Returns an iterator over the keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.data.keys()
    }

    /// Returns an iterator over the values.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.data.values()
    }

    /// Returns a snapshot of all key/value pairs.
    pub fn key_values(&self) -> Vec<(K, T)> {
        self.data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Applies a change set to this cache so that it mirrors the producer.
    ///
    /// Refresh and Moved changes carry no state and are ignored.
    pub fn clone_changes(&mut self, changes: &ChangeSet<T, K>) {
        for change in changes {
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    self.data.insert(change.key().clone(), change.current().clone());
                }
                ChangeReason::Remove => {
                    self.data.remove(change.key());
                }
                ChangeReason::Refresh | ChangeReason::Moved => {}
            }
        }
    }

    /// Reports every item as an addition.
    pub fn as_initial_changes(&self) -> ChangeSet<T, K> {
        ChangeSet::initial(self.key_values())
    }
}

impl<T, K> FromIterator<(K, T)> for Cache<T, K>
where
    K: CacheKey,
{
    fn from_iter<I: IntoIterator<Item = (K, T)>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().collect(),
        }
    }
}

/// A string key compared without regard to ASCII case.
///
/// The original spelling is kept for display.
#[derive(Clone, Debug)]
pub struct IgnoreCase(pub String);

impl IgnoreCase {
    /// Creates a case-insensitive key.
    pub fn new(value: impl Into<String>) -> Self {
        IgnoreCase(value.into())
    }

    /// Returns the key as originally spelled.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for IgnoreCase {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for IgnoreCase {}

impl Hash for IgnoreCase {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.0.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
        state.write_u8(0xff);
    }
}

impl fmt::Display for IgnoreCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IgnoreCase {
    fn from(value: &str) -> Self {
        IgnoreCase::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Change;
    use alloc::vec;

    #[test]
    fn test_cache_add_or_update() {
        let mut cache: Cache<&str, u32> = Cache::new();
        assert!(cache.add_or_update("a", 1).is_none());
        assert_eq!(cache.add_or_update("b", 1), Some("a"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&1), Some(&"b"));
    }

    #[test]
    fn test_cache_remove() {
        let mut cache: Cache<&str, u32> = Cache::new();
        cache.add_or_update("a", 1);
        assert_eq!(cache.remove(&1), Some("a"));
        assert!(cache.remove(&1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_clone_changes() {
        let mut cache: Cache<i32, u32> = Cache::new();
        let changes: ChangeSet<i32, u32> = vec![
            Change::add(1, 10),
            Change::add(2, 20),
            Change::update(1, 11, 10),
            Change::remove(2, 20),
            Change::refresh(1, 11),
        ]
        .into();

        cache.clone_changes(&changes);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&1), Some(&11));
    }

    #[test]
    fn test_ignore_case_keys() {
        let mut cache: Cache<i32, IgnoreCase> = Cache::new();
        cache.add_or_update(1, IgnoreCase::new("Alpha"));
        cache.add_or_update(2, IgnoreCase::new("ALPHA"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&"alpha".into()), Some(&2));
    }
}
