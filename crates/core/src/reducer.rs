//! Per-key change reduction.
//!
//! When several operations hit the same key inside one edit batch, only the
//! net effect is published. `reduce` combines the change already recorded for
//! a key with the next one.

use crate::change::{Change, ChangeReason};

/// Combines the change already recorded for a key with the next change for
/// the same key.
///
/// Returns `None` when the two cancel out (an addition followed by a
/// removal inside one batch).
///
/// | prior   | next          | result                                   |
/// |---------|---------------|------------------------------------------|
/// | none    | X             | X                                        |
/// | Add     | Remove        | nothing                                  |
/// | Add     | Update        | Add carrying the new value               |
/// | Remove  | Add           | Update (previous = removed value)        |
/// | Update  | Update        | Update (previous from the first)         |
/// | Remove  | not Add       | Remove                                   |
/// | Refresh | X             | X                                        |
/// | X       | Refresh       | X                                        |
pub fn reduce<T, K>(prior: Option<Change<T, K>>, next: Change<T, K>) -> Option<Change<T, K>> {
    let prior = match prior {
        Some(prior) => prior,
        None => return Some(next),
    };

    match (prior.reason(), next.reason()) {
        (ChangeReason::Add, ChangeReason::Remove) => None,
        (ChangeReason::Remove, ChangeReason::Add) => {
            let previous_index = prior.current_index();
            let current_index = next.current_index();
            let (key, removed, _) = prior.into_parts();
            let (_, current, _) = next.into_parts();
            Some(match (current_index, previous_index) {
                (Some(i), Some(p)) => Change::update_at(key, current, removed, i, p),
                _ => Change::update(key, current, removed),
            })
        }
        (ChangeReason::Remove, _) => Some(prior),
        (_, ChangeReason::Refresh) => Some(prior),
        (ChangeReason::Refresh, _) => Some(next),
        (ChangeReason::Add, _) => {
            let index = next.current_index().or(prior.current_index());
            let (key, current, _) = next.into_parts();
            Some(match index {
                Some(i) => Change::add_at(key, current, i),
                None => Change::add(key, current),
            })
        }
        (ChangeReason::Update, ChangeReason::Update) => {
            let previous_index = prior.previous_index();
            let (_, _, first_previous) = prior.into_parts();
            let current_index = next.current_index();
            let (key, current, next_previous) = next.into_parts();
            let previous = match first_previous.or(next_previous) {
                Some(previous) => previous,
                None => return Some(Change::refresh(key, current)),
            };
            Some(match (current_index, previous_index) {
                (Some(i), Some(p)) => Change::update_at(key, current, previous, i, p),
                _ => Change::update(key, current, previous),
            })
        }
        _ => Some(next),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_first_change() {
        let out = reduce(None, Change::add(1, "a")).unwrap();
        assert_eq!(out.reason(), ChangeReason::Add);
    }

    #[test]
    fn test_reduce_add_remove_cancels() {
        assert!(reduce(Some(Change::add(1, "a")), Change::remove(1, "a")).is_none());
    }

    #[test]
    fn test_reduce_add_update_stays_add() {
        let out = reduce(Some(Change::add(1, "a")), Change::update(1, "b", "a")).unwrap();
        assert_eq!(out.reason(), ChangeReason::Add);
        assert_eq!(*out.current(), "b");
        assert!(out.previous().is_none());
    }

    #[test]
    fn test_reduce_remove_add_becomes_update() {
        let out = reduce(Some(Change::remove(1, "a")), Change::add(1, "b")).unwrap();
        assert_eq!(out.reason(), ChangeReason::Update);
        assert_eq!(*out.current(), "b");
        assert_eq!(out.previous(), Some(&"a"));
    }

    #[test]
    fn test_reduce_update_update_chains_previous() {
        let out = reduce(Some(Change::update(1, "b", "a")), Change::update(1, "c", "b")).unwrap();
        assert_eq!(out.reason(), ChangeReason::Update);
        assert_eq!(*out.current(), "c");
        assert_eq!(out.previous(), Some(&"a"));
    }

    #[test]
    fn test_reduce_remove_wins_over_non_add() {
        let out = reduce(Some(Change::remove(1, "a")), Change::refresh(1, "a")).unwrap();
        assert_eq!(out.reason(), ChangeReason::Remove);

        let out = reduce(Some(Change::remove(1, "a")), Change::update(1, "b", "a")).unwrap();
        assert_eq!(out.reason(), ChangeReason::Remove);
        assert_eq!(*out.current(), "a");
    }

    #[test]
    fn test_reduce_refresh_is_superseded() {
        let out = reduce(Some(Change::refresh(1, "a")), Change::update(1, "b", "a")).unwrap();
        assert_eq!(out.reason(), ChangeReason::Update);

        let out = reduce(Some(Change::refresh(1, "a")), Change::remove(1, "a")).unwrap();
        assert_eq!(out.reason(), ChangeReason::Remove);
    }

    #[test]
    fn test_reduce_refresh_is_absorbed() {
        let out = reduce(Some(Change::add(1, "a")), Change::refresh(1, "a")).unwrap();
        assert_eq!(out.reason(), ChangeReason::Add);

        let out = reduce(Some(Change::update(1, "b", "a")), Change::refresh(1, "b")).unwrap();
        assert_eq!(out.reason(), ChangeReason::Update);
        assert_eq!(out.previous(), Some(&"a"));
    }

    #[test]
    fn test_reduce_refresh_refresh_is_single_refresh() {
        let out = reduce(Some(Change::refresh(1, "a")), Change::refresh(1, "a")).unwrap();
        assert_eq!(out.reason(), ChangeReason::Refresh);
    }

    #[test]
    fn test_reduce_update_remove_is_remove() {
        let out = reduce(Some(Change::update(1, "b", "a")), Change::remove(1, "b")).unwrap();
        assert_eq!(out.reason(), ChangeReason::Remove);
        assert_eq!(*out.current(), "b");
    }
}
