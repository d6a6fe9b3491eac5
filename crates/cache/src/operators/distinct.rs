//! Distinct values derived from the items of a stream.

use super::{Driver, Emission, Operator};
use hashbrown::HashMap;
use keyflux_core::{CacheItem, CacheKey, ChangeAwareCache, ChangeReason, ChangeSet, Result};
use keyflux_reactive::Observable;
use std::sync::Arc;

/// Reference counts of the values selected from each item.
pub(crate) struct DistinctState<K, V> {
    selected: HashMap<K, V>,
    counts: HashMap<V, usize>,
    values: ChangeAwareCache<V, V>,
}

impl<K, V> DistinctState<K, V>
where
    K: CacheKey,
    V: CacheKey,
{
    pub(crate) fn new() -> Self {
        Self {
            selected: HashMap::new(),
            counts: HashMap::new(),
            values: ChangeAwareCache::new(),
        }
    }

    fn acquire(&mut self, value: V) {
        let count = self.counts.entry(value.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.values.add_or_update(value.clone(), value);
        }
    }

    fn release(&mut self, value: &V) {
        let Some(count) = self.counts.get_mut(value) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(value);
            self.values.remove(value);
        }
    }

    fn select(&mut self, key: &K, value: V) {
        match self.selected.insert(key.clone(), value.clone()) {
            Some(previous) if previous == value => {}
            Some(previous) => {
                self.release(&previous);
                self.acquire(value);
            }
            None => self.acquire(value),
        }
    }

    pub(crate) fn apply<T>(&mut self, changes: &ChangeSet<T, K>, selector: &dyn Fn(&T) -> V) {
        for change in changes {
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                    self.select(change.key(), selector(change.current()));
                }
                ChangeReason::Remove => {
                    if let Some(previous) = self.selected.remove(change.key()) {
                        self.release(&previous);
                    }
                }
                ChangeReason::Moved => {}
            }
        }
    }

    pub(crate) fn capture(&mut self) -> ChangeSet<V, V> {
        self.values.capture_changes()
    }
}

enum DistinctEvent<T, K> {
    Data(ChangeSet<T, K>),
    Completed,
}

struct DistinctOperator<T, K, V> {
    state: DistinctState<K, V>,
    selector: Arc<dyn Fn(&T) -> V + Send + Sync>,
    done: bool,
}

impl<T, K, V> Operator for DistinctOperator<T, K, V>
where
    T: CacheItem,
    K: CacheKey,
    V: CacheKey,
{
    type Event = DistinctEvent<T, K>;
    type Output = ChangeSet<V, V>;

    fn apply(&mut self, event: Self::Event) -> Result<()> {
        match event {
            DistinctEvent::Data(changes) => self.state.apply(&changes, &*self.selector),
            DistinctEvent::Completed => self.done = true,
        }
        Ok(())
    }

    fn flush(&mut self) -> Emission<ChangeSet<V, V>> {
        let changes = self.state.capture();
        Emission::output((!changes.is_empty()).then_some(changes))
    }

    fn is_completed(&self) -> bool {
        self.done
    }
}

/// Emits each distinct selected value once, keyed by itself. A value is
/// removed when no item selects it any more.
pub fn distinct_values<T, K, V, F>(source: &Observable<ChangeSet<T, K>>, selector: F) -> Observable<ChangeSet<V, V>>
where
    T: CacheItem,
    K: CacheKey,
    V: CacheKey,
    F: Fn(&T) -> V + Send + Sync + 'static,
{
    let source = source.clone();
    let selector: Arc<dyn Fn(&T) -> V + Send + Sync> = Arc::new(selector);
    Observable::create(move |subscriber| {
        let operator = DistinctOperator {
            state: DistinctState::new(),
            selector: selector.clone(),
            done: false,
        };
        Driver::new(operator, subscriber).subscribe_input(&source, DistinctEvent::Data, || DistinctEvent::Completed)
    })
}
