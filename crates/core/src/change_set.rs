//! Change set for describing one atomic batch of mutations.
//!
//! A ChangeSet is an ordered list of changes. Replaying the changes in order
//! against the state before the batch yields the state after the batch.

use crate::change::{Change, ChangeReason};
use alloc::vec::Vec;
use core::slice;

/// Counts of changes per reason.
///
/// Derived from the changes on demand, never stored alongside them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
    pub refreshes: usize,
    pub moves: usize,
}

impl ChangeSummary {
    /// Returns the total number of changes counted.
    #[inline]
    pub fn total(&self) -> usize {
        self.adds + self.updates + self.removes + self.refreshes + self.moves
    }
}

/// A batch of changes produced by one atomic operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeSet<T, K> {
    changes: Vec<Change<T, K>>,
}

impl<T, K> Default for ChangeSet<T, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K> ChangeSet<T, K> {
    /// Creates a new empty change set.
    #[inline]
    pub fn new() -> Self {
        Self { changes: Vec::new() }
    }

    /// Creates an empty change set with room for `capacity` changes.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            changes: Vec::with_capacity(capacity),
        }
    }

    /// Creates a change set reporting every pair as an addition.
    pub fn initial(items: impl IntoIterator<Item = (K, T)>) -> Self {
        items.into_iter().map(|(k, v)| Change::add(k, v)).collect()
    }

    /// Returns true if there are no changes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the total number of changes.
    #[inline]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Appends a change.
    #[inline]
    pub fn push(&mut self, change: Change<T, K>) {
        self.changes.push(change);
    }

    /// Appends all changes from another change set.
    pub fn merge(&mut self, other: ChangeSet<T, K>) {
        self.changes.extend(other.changes);
    }

    /// Clears all changes.
    pub fn clear(&mut self) {
        self.changes.clear();
    }

    /// Returns an iterator over the changes.
    #[inline]
    pub fn iter(&self) -> slice::Iter<'_, Change<T, K>> {
        self.changes.iter()
    }

    /// Returns the changes as a slice.
    #[inline]
    pub fn as_slice(&self) -> &[Change<T, K>] {
        &self.changes
    }

    /// Consumes the change set, returning the underlying changes.
    #[inline]
    pub fn into_vec(self) -> Vec<Change<T, K>> {
        self.changes
    }

    /// Counts changes per reason.
    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        for change in &self.changes {
            match change.reason() {
                ChangeReason::Add => summary.adds += 1,
                ChangeReason::Update => summary.updates += 1,
                ChangeReason::Remove => summary.removes += 1,
                ChangeReason::Refresh => summary.refreshes += 1,
                ChangeReason::Moved => summary.moves += 1,
            }
        }
        summary
    }

    /// Returns the number of additions.
    #[inline]
    pub fn adds(&self) -> usize {
        self.count_reason(ChangeReason::Add)
    }

    /// Returns the number of updates.
    #[inline]
    pub fn updates(&self) -> usize {
        self.count_reason(ChangeReason::Update)
    }

    /// Returns the number of removals.
    #[inline]
    pub fn removes(&self) -> usize {
        self.count_reason(ChangeReason::Remove)
    }

    /// Returns the number of refreshes.
    #[inline]
    pub fn refreshes(&self) -> usize {
        self.count_reason(ChangeReason::Refresh)
    }

    /// Returns the number of moves.
    #[inline]
    pub fn moves(&self) -> usize {
        self.count_reason(ChangeReason::Moved)
    }

    fn count_reason(&self, reason: ChangeReason) -> usize {
        self.changes.iter().filter(|c| c.reason() == reason).count()
    }

    /// Maps every value in the change set.
    pub fn map_values<U, F>(self, mut f: F) -> ChangeSet<U, K>
    where
        F: FnMut(T) -> U,
    {
        self.changes
            .into_iter()
            .map(|c| c.map_value(&mut f))
            .collect()
    }

    /// Keeps only changes matching the predicate.
    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&Change<T, K>) -> bool,
    {
        self.changes.retain(f);
    }
}

impl<T, K> FromIterator<Change<T, K>> for ChangeSet<T, K> {
    fn from_iter<I: IntoIterator<Item = Change<T, K>>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}

impl<T, K> Extend<Change<T, K>> for ChangeSet<T, K> {
    fn extend<I: IntoIterator<Item = Change<T, K>>>(&mut self, iter: I) {
        self.changes.extend(iter);
    }
}

impl<T, K> IntoIterator for ChangeSet<T, K> {
    type Item = Change<T, K>;
    type IntoIter = alloc::vec::IntoIter<Change<T, K>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a, T, K> IntoIterator for &'a ChangeSet<T, K> {
    type Item = &'a Change<T, K>;
    type IntoIter = slice::Iter<'a, Change<T, K>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

impl<T, K> From<Vec<Change<T, K>>> for ChangeSet<T, K> {
    fn from(changes: Vec<Change<T, K>>) -> Self {
        Self { changes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_change_set_new() {
        let cs: ChangeSet<i32, u32> = ChangeSet::new();
        assert!(cs.is_empty());
        assert_eq!(cs.len(), 0);
    }

    #[test]
    fn test_change_set_initial() {
        let cs = ChangeSet::initial(vec![(1, "a"), (2, "b")]);
        assert_eq!(cs.adds(), 2);
        assert_eq!(cs.removes(), 0);
        assert_eq!(cs.len(), 2);
    }

    #[test]
    fn test_change_set_summary() {
        let cs: ChangeSet<i32, u32> = vec![
            Change::add(1, 10),
            Change::update(2, 20, 19),
            Change::remove(3, 30),
            Change::refresh(4, 40),
            Change::moved(5, 50, 0, 1),
            Change::add(6, 60),
        ]
        .into();

        let summary = cs.summary();
        assert_eq!(summary.adds, 2);
        assert_eq!(summary.updates, 1);
        assert_eq!(summary.removes, 1);
        assert_eq!(summary.refreshes, 1);
        assert_eq!(summary.moves, 1);
        assert_eq!(summary.total(), cs.len());
    }

    #[test]
    fn test_change_set_merge() {
        let mut cs1 = ChangeSet::new();
        cs1.push(Change::add(1, 10));

        let mut cs2 = ChangeSet::new();
        cs2.push(Change::add(2, 20));
        cs2.push(Change::remove(3, 30));

        cs1.merge(cs2);

        assert_eq!(cs1.adds(), 2);
        assert_eq!(cs1.removes(), 1);
    }

    #[test]
    fn test_change_set_map_values() {
        let cs: ChangeSet<i32, u32> = vec![Change::update(1, 2, 1)].into();
        let mapped = cs.map_values(|v| v * 10);
        let change = mapped.iter().next().unwrap();
        assert_eq!(*change.current(), 20);
        assert_eq!(change.previous(), Some(&10));
    }

    #[test]
    fn test_change_set_clear() {
        let mut cs = ChangeSet::new();
        cs.push(Change::add(1, 10));
        cs.push(Change::remove(2, 20));

        assert!(!cs.is_empty());
        cs.clear();
        assert!(cs.is_empty());
    }
}
