//! The atomic unit of change.
//!
//! A `Change` describes one mutation of one key: an addition, an update, a
//! removal, a refresh (value unchanged, dependents should re-evaluate) or a
//! move (position changed inside an ordered projection).

use core::fmt;

/// Why a change was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeReason {
    /// The key was not present before.
    Add,
    /// The key was present and its value was replaced.
    Update,
    /// The key was removed.
    Remove,
    /// The value is unchanged but downstream stages should re-evaluate it.
    Refresh,
    /// The item changed position inside an ordered projection.
    Moved,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeReason::Add => "Add",
            ChangeReason::Update => "Update",
            ChangeReason::Remove => "Remove",
            ChangeReason::Refresh => "Refresh",
            ChangeReason::Moved => "Moved",
        };
        f.write_str(name)
    }
}

/// One atomic mutation of a keyed collection.
///
/// The constructors enforce the shape of each reason:
/// - `Update` carries both the current and the previous value
/// - `Remove` carries the removed value as `current` and no previous value
/// - `Refresh` carries the current value only
/// - `Moved` carries the current value plus both positions
///
/// Positions are `None` when the producing stage does not track order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change<T, K> {
    reason: ChangeReason,
    key: K,
    current: T,
    previous: Option<T>,
    current_index: Option<usize>,
    previous_index: Option<usize>,
}

impl<T, K> Change<T, K> {
    /// Creates an addition.
    #[inline]
    pub fn add(key: K, current: T) -> Self {
        Self::build(ChangeReason::Add, key, current, None, None, None)
    }

    /// Creates an addition at a position.
    #[inline]
    pub fn add_at(key: K, current: T, index: usize) -> Self {
        Self::build(ChangeReason::Add, key, current, None, Some(index), None)
    }

    /// Creates an update.
    #[inline]
    pub fn update(key: K, current: T, previous: T) -> Self {
        Self::build(ChangeReason::Update, key, current, Some(previous), None, None)
    }

    /// Creates an update that may also have moved the item.
    #[inline]
    pub fn update_at(key: K, current: T, previous: T, current_index: usize, previous_index: usize) -> Self {
        Self::build(
            ChangeReason::Update,
            key,
            current,
            Some(previous),
            Some(current_index),
            Some(previous_index),
        )
    }

    /// Creates a removal. `current` is the value that was removed.
    #[inline]
    pub fn remove(key: K, current: T) -> Self {
        Self::build(ChangeReason::Remove, key, current, None, None, None)
    }

    /// Creates a removal from a position.
    #[inline]
    pub fn remove_at(key: K, current: T, index: usize) -> Self {
        Self::build(ChangeReason::Remove, key, current, None, Some(index), None)
    }

    /// Creates a refresh.
    #[inline]
    pub fn refresh(key: K, current: T) -> Self {
        Self::build(ChangeReason::Refresh, key, current, None, None, None)
    }

    /// Creates a refresh at a position.
    #[inline]
    pub fn refresh_at(key: K, current: T, index: usize) -> Self {
        Self::build(ChangeReason::Refresh, key, current, None, Some(index), None)
    }

    /// Creates a move from `previous_index` to `current_index`.
    #[inline]
    pub fn moved(key: K, current: T, current_index: usize, previous_index: usize) -> Self {
        Self::build(
            ChangeReason::Moved,
            key,
            current,
            None,
            Some(current_index),
            Some(previous_index),
        )
    }

    fn build(
        reason: ChangeReason,
        key: K,
        current: T,
        previous: Option<T>,
        current_index: Option<usize>,
        previous_index: Option<usize>,
    ) -> Self {
        Self {
            reason,
            key,
            current,
            previous,
            current_index,
            previous_index,
        }
    }

    /// Returns the reason for this change.
    #[inline]
    pub fn reason(&self) -> ChangeReason {
        self.reason
    }

    /// Returns the key.
    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns the value after the change (the removed value for removals).
    #[inline]
    pub fn current(&self) -> &T {
        &self.current
    }

    /// Returns the value before the change, present for updates only.
    #[inline]
    pub fn previous(&self) -> Option<&T> {
        self.previous.as_ref()
    }

    /// Returns the position after the change, if tracked.
    #[inline]
    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    /// Returns the position before the change, if tracked.
    #[inline]
    pub fn previous_index(&self) -> Option<usize> {
        self.previous_index
    }

    /// Consumes the change, returning key, current and previous values.
    #[inline]
    pub fn into_parts(self) -> (K, T, Option<T>) {
        (self.key, self.current, self.previous)
    }

    /// Consumes the change, returning the key and current value.
    #[inline]
    pub fn into_key_value(self) -> (K, T) {
        (self.key, self.current)
    }

    /// Returns a copy of this change with positions cleared.
    #[inline]
    pub fn without_indices(mut self) -> Self {
        self.current_index = None;
        self.previous_index = None;
        self
    }

    /// Replaces both positions.
    #[inline]
    pub fn with_indices(mut self, current_index: Option<usize>, previous_index: Option<usize>) -> Self {
        self.current_index = current_index;
        self.previous_index = previous_index;
        self
    }

    /// Maps the current and previous values, keeping reason, key and positions.
    pub fn map_value<U, F>(self, mut f: F) -> Change<U, K>
    where
        F: FnMut(T) -> U,
    {
        Change {
            reason: self.reason,
            key: self.key,
            current: f(self.current),
            previous: self.previous.map(&mut f),
            current_index: self.current_index,
            previous_index: self.previous_index,
        }
    }

    /// Replaces the key, keeping everything else.
    pub fn with_key<K2>(self, key: K2) -> Change<T, K2> {
        Change {
            reason: self.reason,
            key,
            current: self.current,
            previous: self.previous,
            current_index: self.current_index,
            previous_index: self.previous_index,
        }
    }
}
