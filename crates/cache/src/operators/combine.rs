//! Set algebra over several change-set streams.
//!
//! Each input is mirrored; a key is in the output when its membership across
//! the inputs satisfies the operation. The value comes from the first input
//! holding the key.

use super::{Driver, Emission, Operator};
use keyflux_core::{Cache, CacheItem, CacheKey, ChangeAwareCache, ChangeReason, ChangeSet, Error, Result};
use keyflux_reactive::{Observable, Subscription};

/// The membership rule of a combination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CombineOperation {
    /// Present in every input.
    And,
    /// Present in at least one input.
    Or,
    /// Present in exactly one input.
    Xor,
    /// Present in the first input and in no other.
    Except,
}

pub(crate) struct CombineState<T, K> {
    operation: CombineOperation,
    inputs: Vec<Cache<T, K>>,
    result: ChangeAwareCache<T, K>,
}

impl<T, K> CombineState<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    pub(crate) fn new(operation: CombineOperation, inputs: usize) -> Self {
        Self {
            operation,
            inputs: (0..inputs).map(|_| Cache::new()).collect(),
            result: ChangeAwareCache::new(),
        }
    }

    fn included(&self, key: &K) -> bool {
        let mut holders = self.inputs.iter().map(|input| input.contains_key(key));
        match self.operation {
            CombineOperation::And => holders.all(|held| held),
            CombineOperation::Or => holders.any(|held| held),
            CombineOperation::Xor => holders.filter(|held| *held).count() == 1,
            CombineOperation::Except => holders.next().unwrap_or(false) && !holders.any(|held| held),
        }
    }

    fn first_holder(&self, key: &K) -> Option<usize> {
        self.inputs.iter().position(|input| input.contains_key(key))
    }

    fn value_of(&self, key: &K) -> Option<T> {
        self.inputs.iter().find_map(|input| input.lookup(key)).cloned()
    }

    /// Applies a batch from input `index`.
    pub(crate) fn apply(&mut self, index: usize, changes: &ChangeSet<T, K>) {
        let Some(input) = self.inputs.get_mut(index) else {
            return;
        };
        input.clone_changes(changes);
        for change in changes {
            let key = change.key();
            let included = self.included(key);
            let present = self.result.contains_key(key);
            match (included, present) {
                (true, _) => {
                    if change.reason() == ChangeReason::Refresh {
                        if present {
                            self.result.refresh(key);
                            continue;
                        }
                    } else if change.reason() == ChangeReason::Moved {
                        continue;
                    }
                    if present && self.first_holder(key).is_some_and(|holder| holder < index) {
                        // Shadowed by an earlier input.
                        continue;
                    }
                    if let Some(value) = self.value_of(key) {
                        self.result.add_or_update(value, key.clone());
                    }
                }
                (false, true) => self.result.remove(key),
                (false, false) => {}
            }
        }
    }

    pub(crate) fn capture(&mut self) -> ChangeSet<T, K> {
        self.result.capture_changes()
    }
}

enum CombineEvent<T, K> {
    Data(usize, ChangeSet<T, K>),
    Completed(usize),
}

struct CombineOperator<T, K> {
    state: CombineState<T, K>,
    completed: Vec<bool>,
}

impl<T, K> Operator for CombineOperator<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    type Event = CombineEvent<T, K>;
    type Output = ChangeSet<T, K>;

    fn apply(&mut self, event: Self::Event) -> Result<()> {
        match event {
            CombineEvent::Data(index, changes) => self.state.apply(index, &changes),
            CombineEvent::Completed(index) => {
                if let Some(done) = self.completed.get_mut(index) {
                    *done = true;
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Emission<ChangeSet<T, K>> {
        let changes = self.state.capture();
        Emission::output((!changes.is_empty()).then_some(changes))
    }

    fn is_completed(&self) -> bool {
        self.completed.iter().all(|done| *done)
    }
}

/// Combines `sources` with `operation`. Fails when `sources` is empty.
pub fn combine<T, K>(sources: &[Observable<ChangeSet<T, K>>], operation: CombineOperation) -> Result<Observable<ChangeSet<T, K>>>
where
    T: CacheItem,
    K: CacheKey,
{
    if sources.is_empty() {
        return Err(Error::invalid_argument("set operations need at least one source"));
    }
    let sources = sources.to_vec();
    Ok(Observable::create(move |subscriber| {
        let operator = CombineOperator {
            state: CombineState::new(operation, sources.len()),
            completed: vec![false; sources.len()],
        };
        let driver = Driver::new(operator, subscriber);
        Subscription::composite(sources.iter().enumerate().map(|(index, source)| {
            driver.subscribe_input(
                source,
                move |changes| CombineEvent::Data(index, changes),
                move || CombineEvent::Completed(index),
            )
        }))
    }))
}

/// Keys present in every source.
pub fn and<T: CacheItem, K: CacheKey>(sources: &[Observable<ChangeSet<T, K>>]) -> Result<Observable<ChangeSet<T, K>>> {
    combine(sources, CombineOperation::And)
}

/// Keys present in any source.
pub fn or<T: CacheItem, K: CacheKey>(sources: &[Observable<ChangeSet<T, K>>]) -> Result<Observable<ChangeSet<T, K>>> {
    combine(sources, CombineOperation::Or)
}

/// Keys present in exactly one source.
pub fn xor<T: CacheItem, K: CacheKey>(sources: &[Observable<ChangeSet<T, K>>]) -> Result<Observable<ChangeSet<T, K>>> {
    combine(sources, CombineOperation::Xor)
}

/// Keys of the first source missing from all others.
pub fn except<T: CacheItem, K: CacheKey>(sources: &[Observable<ChangeSet<T, K>>]) -> Result<Observable<ChangeSet<T, K>>> {
    combine(sources, CombineOperation::Except)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyflux_core::Change;
    use keyflux_reactive::{Observer, Subject};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn make_state(operation: CombineOperation) -> CombineState<&'static str, u32> {
        let mut state = CombineState::new(operation, 2);
        state.apply(0, &ChangeSet::initial(vec![(1, "a1"), (2, "a2")]));
        state.apply(1, &ChangeSet::initial(vec![(2, "b2"), (3, "b3")]));
        state
    }

    fn keys(state: &CombineState<&'static str, u32>) -> Vec<u32> {
        let mut keys: Vec<u32> = state.result.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    #[test]
    fn test_membership_rules() {
        assert_eq!(keys(&make_state(CombineOperation::And)), vec![2]);
        assert_eq!(keys(&make_state(CombineOperation::Or)), vec![1, 2, 3]);
        assert_eq!(keys(&make_state(CombineOperation::Xor)), vec![1, 3]);
        assert_eq!(keys(&make_state(CombineOperation::Except)), vec![1]);
    }

    #[test]
    fn test_value_from_first_holder() {
        let state = make_state(CombineOperation::Or);
        assert_eq!(state.result.lookup(&2), Some(&"a2"));
    }

    #[test]
    fn test_removal_moves_membership() {
        let mut state = make_state(CombineOperation::Xor);
        state.capture();
        state.apply(0, &ChangeSet::from(vec![Change::remove(2, "a2")]));
        let changes = state.capture();
        assert_eq!(changes.adds(), 1);
        assert_eq!(state.result.lookup(&2), Some(&"b2"));

        state.apply(1, &ChangeSet::from(vec![Change::add(1, "b1")]));
        let changes = state.capture();
        assert_eq!(changes.removes(), 1);
        assert!(!state.result.contains_key(&1));
    }

    #[test]
    fn test_shadowed_update_ignored() {
        let mut state = make_state(CombineOperation::Or);
        state.capture();
        state.apply(1, &ChangeSet::from(vec![Change::update(2, "b2'", "b2")]));
        assert!(state.capture().is_empty());
        assert_eq!(state.result.lookup(&2), Some(&"a2"));
    }

    #[test]
    fn test_empty_sources_rejected() {
        let sources: Vec<Observable<ChangeSet<u8, u8>>> = Vec::new();
        assert!(or(&sources).is_err_and(|e| e.is_invalid_argument()));
    }

    #[test]
    fn test_combine_completes_with_all_inputs() {
        let left = Subject::new();
        let right = Subject::new();
        let completed = Arc::new(Mutex::new(false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (flag, sink) = (completed.clone(), seen.clone());
        let _sub = and(&[left.as_observable(), right.as_observable()]).unwrap().subscribe_all(
            move |changes: ChangeSet<char, u32>| sink.lock().push(changes.summary()),
            |_| {},
            move || *flag.lock() = true,
        );

        left.on_next(ChangeSet::initial(vec![(1, 'x')]));
        right.on_next(ChangeSet::initial(vec![(1, 'y')]));
        left.on_completed();
        assert!(!*completed.lock());
        right.on_completed();
        assert!(*completed.lock());
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].adds, 1);
    }
}
