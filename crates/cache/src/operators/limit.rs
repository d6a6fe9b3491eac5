//! Size limiting by insertion order.

use super::{Driver, Emission, Operator};
use crate::source_cache::{SourceCache, SourceInner};
use crate::ConnectOptions;
use hashbrown::HashMap;
use keyflux_core::{CacheItem, CacheKey, ChangeAwareCache, ChangeReason, ChangeSet, Error, Result};
use keyflux_reactive::{FnObserver, Observable, Observer, Scheduler, Subscriber, Subscription};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Insertion stamps per key.
///
/// Updates keep the stamp of the original insertion. `by_stamp` mirrors
/// `stamps` so the oldest keys come off in stamp order.
pub(crate) struct InsertionOrder<K> {
    stamps: HashMap<K, u64>,
    by_stamp: BTreeMap<u64, K>,
    next: u64,
}

impl<K: CacheKey> InsertionOrder<K> {
    pub(crate) fn new() -> Self {
        Self {
            stamps: HashMap::new(),
            by_stamp: BTreeMap::new(),
            next: 0,
        }
    }

    pub(crate) fn track<T>(&mut self, changes: &ChangeSet<T, K>) {
        for change in changes {
            match change.reason() {
                ChangeReason::Add => {
                    self.forget(change.key());
                    self.stamp(change.key());
                }
                ChangeReason::Update => {
                    if !self.stamps.contains_key(change.key()) {
                        self.stamp(change.key());
                    }
                }
                ChangeReason::Remove => self.forget(change.key()),
                ChangeReason::Refresh | ChangeReason::Moved => {}
            }
        }
    }

    fn stamp(&mut self, key: &K) {
        self.stamps.insert(key.clone(), self.next);
        self.by_stamp.insert(self.next, key.clone());
        self.next += 1;
    }

    pub(crate) fn len(&self) -> usize {
        self.stamps.len()
    }

    /// Returns the `count` oldest keys, oldest first.
    pub(crate) fn oldest(&self, count: usize) -> Vec<K> {
        self.by_stamp.values().take(count).cloned().collect()
    }

    pub(crate) fn forget(&mut self, key: &K) {
        if let Some(stamp) = self.stamps.remove(key) {
            self.by_stamp.remove(&stamp);
        }
    }
}

fn check_size(size: usize) -> Result<()> {
    if size == 0 {
        return Err(Error::invalid_argument("size limit must be greater than zero"));
    }
    Ok(())
}

enum LimitEvent<T, K> {
    Data(ChangeSet<T, K>),
    Completed,
}

struct LimitOperator<T, K> {
    mirror: ChangeAwareCache<T, K>,
    order: InsertionOrder<K>,
    size: usize,
    done: bool,
}

impl<T, K> Operator for LimitOperator<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    type Event = LimitEvent<T, K>;
    type Output = ChangeSet<T, K>;

    fn apply(&mut self, event: Self::Event) -> Result<()> {
        match event {
            LimitEvent::Data(changes) => {
                self.order.track(&changes);
                self.mirror.clone_changes(&changes);
                let excess = self.mirror.len().saturating_sub(self.size);
                if excess > 0 {
                    let evicted = self.order.oldest(excess);
                    tracing::trace!(evicted = evicted.len(), "size limit reached");
                    for key in &evicted {
                        self.order.forget(key);
                        self.mirror.remove(key);
                    }
                }
            }
            LimitEvent::Completed => self.done = true,
        }
        Ok(())
    }

    fn flush(&mut self) -> Emission<ChangeSet<T, K>> {
        let changes = self.mirror.capture_changes();
        Emission::output((!changes.is_empty()).then_some(changes))
    }

    fn is_completed(&self) -> bool {
        self.done
    }
}

/// Keeps at most `size` items, evicting the oldest by insertion order in the
/// same batch that overflowed.
pub fn limit_size_to<T, K>(source: &Observable<ChangeSet<T, K>>, size: usize) -> Result<Observable<ChangeSet<T, K>>>
where
    T: CacheItem,
    K: CacheKey,
{
    check_size(size)?;
    let source = source.clone();
    Ok(Observable::create(move |subscriber| {
        let operator = LimitOperator {
            mirror: ChangeAwareCache::new(),
            order: InsertionOrder::new(),
            size,
            done: false,
        };
        Driver::new(operator, subscriber).subscribe_input(&source, LimitEvent::Data, || LimitEvent::Completed)
    }))
}

struct LimitState<K> {
    order: InsertionOrder<K>,
    pending: Option<Subscription>,
}

/// Size limiting evicting from a source cache.
struct SourceLimit<T, K> {
    source: Weak<SourceInner<T, K>>,
    state: Mutex<LimitState<K>>,
    size: usize,
    scheduler: Arc<dyn Scheduler>,
    subscriber: Subscriber<Vec<(K, T)>>,
}

impl<T, K> SourceLimit<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    fn on_changes(self: &Arc<Self>, changes: &ChangeSet<T, K>) {
        let mut state = self.state.lock();
        state.order.track(changes);
        if state.order.len() > self.size && state.pending.is_none() {
            // Never evict inside the publish that overflowed.
            let limit = Arc::downgrade(self);
            let action = Box::new(move || {
                if let Some(limit) = limit.upgrade() {
                    limit.evict();
                }
            });
            state.pending = Some(self.scheduler.schedule_at(self.scheduler.now(), action));
        }
    }

    fn evict(self: &Arc<Self>) {
        self.state.lock().pending = None;
        let Some(source) = self.source.upgrade() else {
            return;
        };
        let evicted = source.edit(|updater| {
            let excess = updater.count().saturating_sub(self.size);
            let oldest = self.state.lock().order.oldest(excess);
            let mut evicted = Vec::with_capacity(oldest.len());
            for key in oldest {
                if let Some(item) = updater.lookup(&key).cloned() {
                    updater.remove_key(&key);
                    evicted.push((key, item));
                }
            }
            evicted
        });
        match evicted {
            Ok(evicted) => {
                tracing::trace!(evicted = evicted.len(), "source size limit applied");
                if !evicted.is_empty() {
                    self.subscriber.on_next(evicted);
                }
            }
            Err(error) => tracing::debug!(%error, "eviction skipped"),
        }
    }

    fn cancel(&self) {
        self.state.lock().pending = None;
    }
}

pub(crate) fn limit_source<T, K>(
    source: &SourceCache<T, K>,
    size: usize,
    scheduler: Arc<dyn Scheduler>,
) -> Result<Observable<Vec<(K, T)>>>
where
    T: CacheItem,
    K: CacheKey,
{
    check_size(size)?;
    let inner = Arc::downgrade(&source.inner);
    Ok(Observable::create(move |subscriber: Subscriber<Vec<(K, T)>>| {
        let Some(source) = inner.upgrade() else {
            subscriber.on_completed();
            return Subscription::empty();
        };
        let limit = Arc::new(SourceLimit {
            source: inner.clone(),
            state: Mutex::new(LimitState {
                order: InsertionOrder::new(),
                pending: None,
            }),
            size,
            scheduler: scheduler.clone(),
            subscriber: subscriber.clone(),
        });
        let (on_next, on_error, on_completed) = (limit.clone(), subscriber.clone(), limit.clone());
        let connection = source.store.connect(ConnectOptions::default()).subscribe(
            FnObserver::new(move |changes: ChangeSet<T, K>| on_next.on_changes(&changes))
                .with_error(move |error| on_error.on_error(error))
                .with_completed(move || {
                    on_completed.cancel();
                    on_completed.subscriber.on_completed();
                }),
        );
        connection.with(Subscription::new(move || limit.cancel()))
    }))
}
