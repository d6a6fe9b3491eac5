//! Time based expiry.
//!
//! Each item gets an optional lifetime when it is added or updated. A single
//! timer is armed for the earliest due time; when it fires, every item due
//! by then is removed in one batch and the timer is re-armed.

use super::{Driver, Emission, Operator};
use crate::source_cache::{SourceCache, SourceInner};
use crate::ConnectOptions;
use hashbrown::HashMap;
use keyflux_core::{CacheItem, CacheKey, ChangeAwareCache, ChangeReason, ChangeSet, Result};
use keyflux_reactive::{Action, FnObserver, Observable, Observer, Scheduler, Subscriber, Subscription};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

type Lifetime<T> = Arc<dyn Fn(&T) -> Option<Duration> + Send + Sync>;

/// Due times per key plus the one pending timer.
pub(crate) struct DueTimes<K> {
    due: HashMap<K, Duration>,
    timer: Option<(Duration, Subscription)>,
}

impl<K: CacheKey> DueTimes<K> {
    pub(crate) fn new() -> Self {
        Self {
            due: HashMap::new(),
            timer: None,
        }
    }

    /// Records the due times implied by a batch.
    pub(crate) fn track<T>(&mut self, changes: &ChangeSet<T, K>, lifetime: &dyn Fn(&T) -> Option<Duration>, now: Duration) {
        for change in changes {
            match change.reason() {
                // A due time past the end of the clock never comes.
                ChangeReason::Add | ChangeReason::Update => match lifetime(change.current()).and_then(|l| now.checked_add(l)) {
                    Some(due) => {
                        self.due.insert(change.key().clone(), due);
                    }
                    None => {
                        self.due.remove(change.key());
                    }
                },
                ChangeReason::Remove => {
                    self.due.remove(change.key());
                }
                ChangeReason::Refresh | ChangeReason::Moved => {}
            }
        }
    }

    /// Removes and returns every key due at or before `now`.
    pub(crate) fn take_expired(&mut self, now: Duration) -> Vec<K> {
        let expired: Vec<K> = self
            .due
            .iter()
            .filter(|(_, due)| **due <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.due.remove(key);
        }
        expired
    }

    pub(crate) fn next_due(&self) -> Option<Duration> {
        self.due.values().min().copied()
    }

    /// Points the timer at the earliest due time, keeping it when it is
    /// already armed for that time.
    pub(crate) fn rearm(&mut self, scheduler: &dyn Scheduler, action: impl FnOnce() -> Action) {
        let next = self.next_due();
        if self.timer.as_ref().map(|(due, _)| *due) == next {
            return;
        }
        // Dropping the old subscription cancels its timer.
        self.timer = next.map(|due| (due, scheduler.schedule_at(due, action())));
    }

    /// Forgets the pending timer after it fired.
    pub(crate) fn fired(&mut self) {
        if let Some((_, mut timer)) = self.timer.take() {
            timer.unsubscribe();
        }
    }

    pub(crate) fn cancel(&mut self) {
        self.fired();
        self.due.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.due.len()
    }
}

enum ExpireEvent<T, K> {
    Data(ChangeSet<T, K>),
    Tick,
    Completed,
}

struct ExpireOperator<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    mirror: ChangeAwareCache<T, K>,
    schedule: DueTimes<K>,
    lifetime: Lifetime<T>,
    scheduler: Arc<dyn Scheduler>,
    driver: Weak<Driver<Self>>,
    done: bool,
}

impl<T, K> ExpireOperator<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    fn rearm(&mut self) {
        let driver = self.driver.clone();
        self.schedule.rearm(&*self.scheduler, move || {
            Box::new(move || {
                if let Some(driver) = driver.upgrade() {
                    driver.push(ExpireEvent::Tick);
                }
            })
        });
    }
}

impl<T, K> Operator for ExpireOperator<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    type Event = ExpireEvent<T, K>;
    type Output = ChangeSet<T, K>;

    fn apply(&mut self, event: Self::Event) -> Result<()> {
        match event {
            ExpireEvent::Data(changes) => {
                self.schedule.track(&changes, &*self.lifetime, self.scheduler.now());
                self.mirror.clone_changes(&changes);
                self.rearm();
            }
            ExpireEvent::Tick => {
                self.schedule.fired();
                let expired = self.schedule.take_expired(self.scheduler.now());
                tracing::trace!(expired = expired.len(), "expiry sweep");
                self.mirror.remove_many(&expired);
                self.rearm();
            }
            ExpireEvent::Completed => {
                self.schedule.cancel();
                self.done = true;
            }
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

/// Removes items from a stream once their lifetime elapses.
///
/// The output carries the upstream changes plus a removal batch for every
/// timer sweep.
pub fn expire_after<T, K, F>(
    source: &Observable<ChangeSet<T, K>>,
    lifetime: F,
    scheduler: Arc<dyn Scheduler>,
) -> Observable<ChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
    F: Fn(&T) -> Option<Duration> + Send + Sync + 'static,
{
    let source = source.clone();
    let lifetime: Lifetime<T> = Arc::new(lifetime);
    Observable::create(move |subscriber| {
        let operator = ExpireOperator {
            mirror: ChangeAwareCache::new(),
            schedule: DueTimes::new(),
            lifetime: lifetime.clone(),
            scheduler: scheduler.clone(),
            driver: Weak::new(),
            done: false,
        };
        let driver = Driver::new(operator, subscriber);
        driver.state().driver = Arc::downgrade(&driver);
        let teardown = driver.clone();
        driver
            .subscribe_input(&source, ExpireEvent::Data, || ExpireEvent::Completed)
            .with(Subscription::new(move || teardown.state().schedule.cancel()))
    })
}

/// Expiry removing items from a source cache.
struct SourceExpiry<T, K> {
    source: Weak<SourceInner<T, K>>,
    schedule: Mutex<DueTimes<K>>,
    lifetime: Lifetime<T>,
    scheduler: Arc<dyn Scheduler>,
    subscriber: Subscriber<Vec<(K, T)>>,
}

impl<T, K> SourceExpiry<T, K>
where
    T: CacheItem,
    K: CacheKey,
{
    fn on_changes(self: &Arc<Self>, changes: &ChangeSet<T, K>) {
        let mut schedule = self.schedule.lock();
        schedule.track(changes, &*self.lifetime, self.scheduler.now());
        self.rearm(&mut schedule);
    }

    fn rearm(self: &Arc<Self>, schedule: &mut DueTimes<K>) {
        let expiry = Arc::downgrade(self);
        schedule.rearm(&*self.scheduler, move || {
            Box::new(move || {
                if let Some(expiry) = expiry.upgrade() {
                    expiry.sweep();
                }
            })
        });
    }

    fn sweep(self: &Arc<Self>) {
        self.schedule.lock().fired();
        let Some(source) = self.source.upgrade() else {
            return;
        };
        // The writer lock is taken before the schedule lock, as on the
        // publish path.
        let removed = source.edit(|updater| {
            let expired = self.schedule.lock().take_expired(self.scheduler.now());
            let mut removed = Vec::with_capacity(expired.len());
            for key in expired {
                if let Some(item) = updater.lookup(&key).cloned() {
                    updater.remove_key(&key);
                    removed.push((key, item));
                }
            }
            removed
        });
        match removed {
            Ok(removed) => {
                tracing::trace!(expired = removed.len(), "source expiry sweep");
                if !removed.is_empty() {
                    self.subscriber.on_next(removed);
                }
                let mut schedule = self.schedule.lock();
                self.rearm(&mut schedule);
            }
            Err(error) => tracing::debug!(%error, "expiry sweep skipped"),
        }
    }
}

pub(crate) fn expire_source<T, K, F>(
    source: &SourceCache<T, K>,
    lifetime: F,
    scheduler: Arc<dyn Scheduler>,
) -> Observable<Vec<(K, T)>>
where
    T: CacheItem,
    K: CacheKey,
    F: Fn(&T) -> Option<Duration> + Send + Sync + 'static,
{
    let inner = Arc::downgrade(&source.inner);
    let lifetime: Lifetime<T> = Arc::new(lifetime);
    Observable::create(move |subscriber: Subscriber<Vec<(K, T)>>| {
        let Some(source) = inner.upgrade() else {
            subscriber.on_completed();
            return Subscription::empty();
        };
        let expiry = Arc::new(SourceExpiry {
            source: inner.clone(),
            schedule: Mutex::new(DueTimes::new()),
            lifetime: lifetime.clone(),
            scheduler: scheduler.clone(),
            subscriber: subscriber.clone(),
        });
        let (on_next, on_error, on_completed) = (expiry.clone(), subscriber.clone(), expiry.clone());
        let connection = source.store.connect(ConnectOptions::default()).subscribe(
            FnObserver::new(move |changes: ChangeSet<T, K>| on_next.on_changes(&changes))
                .with_error(move |error| on_error.on_error(error))
                .with_completed(move || {
                    on_completed.schedule.lock().cancel();
                    on_completed.subscriber.on_completed();
                }),
        );
        connection.with(Subscription::new(move || expiry.schedule.lock().cancel()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyflux_core::Change;
    use keyflux_reactive::{Subject, TestScheduler};

    fn lifetime_of(v: &u64) -> Option<Duration> {
        (*v > 0).then(|| Duration::from_millis(*v))
    }

    fn make_scheduler() -> (TestScheduler, Arc<dyn Scheduler>) {
        let scheduler = TestScheduler::new();
        let shared: Arc<dyn Scheduler> = Arc::new(scheduler.clone());
        (scheduler, shared)
    }

    #[test]
    fn test_due_times_take_expired() {
        let mut due: DueTimes<u32> = DueTimes::new();
        let changes = ChangeSet::from(vec![Change::add(1, 10u64), Change::add(2, 30), Change::add(3, 0)]);
        due.track(&changes, &lifetime_of, Duration::ZERO);
        assert_eq!(due.len(), 2);
        assert_eq!(due.next_due(), Some(Duration::from_millis(10)));

        let mut expired = due.take_expired(Duration::from_millis(30));
        expired.sort_unstable();
        assert_eq!(expired, vec![1, 2]);
        assert_eq!(due.next_due(), None);
    }

    #[test]
    fn test_due_times_update_reschedules() {
        let mut due: DueTimes<u32> = DueTimes::new();
        due.track(&ChangeSet::from(vec![Change::add(1, 10u64)]), &lifetime_of, Duration::ZERO);
        due.track(&ChangeSet::from(vec![Change::update(1, 50u64, 10)]), &lifetime_of, Duration::from_millis(5));
        assert_eq!(due.next_due(), Some(Duration::from_millis(55)));
    }

    #[test]
    fn test_due_times_unbounded_lifetime_never_expires() {
        let mut due: DueTimes<u32> = DueTimes::new();
        let changes = ChangeSet::from(vec![Change::add(1, 10u64), Change::add(2, 20)]);
        let forever = |v: &u64| if *v == 10 { Some(Duration::MAX) } else { lifetime_of(v) };
        due.track(&changes, &forever, Duration::from_millis(1));
        assert_eq!(due.len(), 1);
        assert_eq!(due.next_due(), Some(Duration::from_millis(21)));
        assert_eq!(due.take_expired(Duration::MAX), vec![2]);
    }

    #[test]
    fn test_expire_stream_batches_same_instant() {
        let (clock, scheduler) = make_scheduler();
        let source = Subject::new();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let _sub = expire_after(&source.as_observable(), lifetime_of, scheduler)
            .subscribe_next(move |changes: ChangeSet<u64, u32>| sink.lock().push(changes.summary()));

        source.on_next(ChangeSet::initial(vec![(1, 10), (2, 10), (3, 20), (4, 0)]));
        assert_eq!(clock.pending_count(), 1);

        clock.advance_to(Duration::from_millis(10));
        clock.advance_to(Duration::from_millis(25));

        let batches = batches.lock();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].removes, 2);
        assert_eq!(batches[2].removes, 1);
        assert_eq!(clock.pending_count(), 0);
    }

    #[test]
    fn test_expire_source_removes_from_cache() {
        let (clock, scheduler) = make_scheduler();
        let cache = SourceCache::new(|item: &(u32, u64)| item.0);
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = removed.clone();
        let _sub = cache
            .expire_after(|item| lifetime_of(&item.1), scheduler)
            .subscribe_next(move |pairs: Vec<(u32, (u32, u64))>| sink.lock().extend(pairs.into_iter().map(|(k, _)| k)));

        cache.add_or_update_many(vec![(1, 10), (2, 0)]).unwrap();
        clock.advance_to(Duration::from_millis(5));
        cache.add_or_update((1, 20)).unwrap();
        clock.advance_to(Duration::from_millis(10));
        assert!(removed.lock().is_empty());

        clock.advance_to(Duration::from_millis(25));
        assert_eq!(*removed.lock(), vec![1]);
        assert_eq!(cache.keys(), vec![2]);
    }
}
