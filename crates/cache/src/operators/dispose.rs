//! Releasing item resources once they leave a stream.
//!
//! Disposal always runs after the batch announcing the removal (or the
//! replacement) has been delivered downstream. Items still present when the
//! stream terminates or is cancelled are disposed then.

use super::{Driver, Effect, Emission, Operator};
use hashbrown::{HashMap, HashSet};
use keyflux_core::{Cache, CacheItem, CacheKey, ChangeReason, ChangeSet, Error, Result};
use keyflux_reactive::{FnObserver, Observable, Observer, Subject, Subscriber, Subscription};
use parking_lot::Mutex;
use std::sync::Arc;

/// How an item releases its resource.
pub enum Disposal {
    /// Nothing to release.
    None,
    /// Releases synchronously.
    Sync(Box<dyn FnOnce() -> Result<()> + Send>),
    /// Starts a release that finishes when the returned stream terminates.
    Async(Box<dyn FnOnce() -> Observable<()> + Send>),
}

impl std::fmt::Debug for Disposal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disposal::None => f.write_str("Disposal::None"),
            Disposal::Sync(_) => f.write_str("Disposal::Sync"),
            Disposal::Async(_) => f.write_str("Disposal::Async"),
        }
    }
}

/// An item owning a releasable resource.
pub trait Disposable {
    /// Returns the release operation for this item.
    fn disposal(&self) -> Disposal;

    /// Returns true when `other` shares this item's resource, in which case
    /// replacing one with the other releases nothing.
    fn is_same_resource(&self, _other: &Self) -> bool {
        false
    }
}

impl<D: Disposable> Disposable for Arc<D> {
    fn disposal(&self) -> Disposal {
        (**self).disposal()
    }

    fn is_same_resource(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

struct TrackerState {
    // Starts at one for the source itself.
    outstanding: usize,
    source_done: bool,
    error: Option<Error>,
    in_flight: HashMap<u64, Subscription>,
    finished_early: HashSet<u64>,
    next_id: u64,
    outcome: Option<Option<Error>>,
}

/// Counts in-flight disposals and signals once all of them and the source
/// have finished.
pub(crate) struct DisposalTracker {
    state: Mutex<TrackerState>,
    finished: Subject<()>,
}

impl DisposalTracker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TrackerState {
                outstanding: 1,
                source_done: false,
                error: None,
                in_flight: HashMap::new(),
                finished_early: HashSet::new(),
                next_id: 0,
                outcome: None,
            }),
            finished: Subject::new(),
        })
    }

    /// Releases one item's resource.
    pub(crate) fn dispose(self: &Arc<Self>, disposal: Disposal) {
        match disposal {
            Disposal::None => {}
            Disposal::Sync(release) => {
                if let Err(error) = release() {
                    tracing::warn!(%error, "disposal failed");
                    self.record(error);
                }
            }
            Disposal::Async(release) => self.start(release()),
        }
    }

    fn start(self: &Arc<Self>, release: Observable<()>) {
        let id = {
            let mut state = self.state.lock();
            state.outstanding += 1;
            state.next_id += 1;
            state.next_id
        };
        let (on_error, on_completed) = (self.clone(), self.clone());
        let subscription = release.subscribe(
            FnObserver::new(|_| {})
                .with_error(move |error| {
                    tracing::warn!(%error, "async disposal failed");
                    on_error.record(error);
                    on_error.finish(id);
                })
                .with_completed(move || on_completed.finish(id)),
        );
        let mut state = self.state.lock();
        if !state.finished_early.remove(&id) {
            state.in_flight.insert(id, subscription);
        }
    }

    fn record(&self, error: Error) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.error = Some(error);
        }
    }

    fn finish(&self, id: u64) {
        let (subscription, done) = {
            let mut state = self.state.lock();
            let subscription = state.in_flight.remove(&id);
            if subscription.is_none() {
                state.finished_early.insert(id);
            }
            (subscription, self.release(&mut state))
        };
        drop(subscription);
        self.signal(done);
    }

    /// Marks the source as terminated. Further calls do nothing.
    pub(crate) fn source_finished(&self) {
        let done = {
            let mut state = self.state.lock();
            if state.source_done {
                return;
            }
            state.source_done = true;
            self.release(&mut state)
        };
        self.signal(done);
    }

    fn release(&self, state: &mut TrackerState) -> Option<Option<Error>> {
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding > 0 || state.outcome.is_some() {
            return None;
        }
        let outcome = state.error.clone();
        state.outcome = Some(outcome.clone());
        Some(outcome)
    }

    fn signal(&self, done: Option<Option<Error>>) {
        match done {
            Some(Some(error)) => self.finished.on_error(error),
            Some(None) => {
                self.finished.on_next(());
                self.finished.on_completed();
            }
            None => {}
        }
    }

    /// Signals `()` and completes once every disposal and the source have
    /// finished, or fails with the first disposal error. Late subscribers
    /// receive the outcome immediately.
    pub(crate) fn completed(self: &Arc<Self>) -> Observable<()> {
        let tracker = self.clone();
        Observable::create(move |subscriber: Subscriber<()>| {
            let state = tracker.state.lock();
            match &state.outcome {
                Some(Some(error)) => {
                    let error = error.clone();
                    drop(state);
                    subscriber.on_error(error);
                    Subscription::empty()
                }
                Some(None) => {
                    drop(state);
                    subscriber.on_next(());
                    subscriber.on_completed();
                    Subscription::empty()
                }
                None => tracker.finished.as_observable().subscribe_with(subscriber),
            }
        })
    }
}

enum DisposeEvent<T, K> {
    Data(ChangeSet<T, K>),
    Failed(Error),
    Completed,
}

struct DisposeOperator<T, K> {
    items: Cache<T, K>,
    released: Vec<T>,
    pending: ChangeSet<T, K>,
    tracker: Arc<DisposalTracker>,
    subscriber: Subscriber<ChangeSet<T, K>>,
    failure: Option<Error>,
    done: bool,
}

impl<T, K> DisposeOperator<T, K>
where
    T: CacheItem + Disposable,
    K: CacheKey,
{
    /// Drains everything still owed a disposal: released items whose flush
    /// never ran plus every item still held.
    fn take_remaining(&mut self) -> Vec<T> {
        let mut remaining = std::mem::take(&mut self.released);
        remaining.extend(self.items.items().cloned());
        self.items.clear();
        remaining
    }
}

impl<T, K> Operator for DisposeOperator<T, K>
where
    T: CacheItem + Disposable,
    K: CacheKey,
{
    type Event = DisposeEvent<T, K>;
    type Output = ChangeSet<T, K>;

    fn apply(&mut self, event: Self::Event) -> Result<()> {
        match event {
            DisposeEvent::Data(changes) => {
                for change in &changes {
                    match change.reason() {
                        ChangeReason::Add | ChangeReason::Update => {
                            let current = change.current().clone();
                            if let Some(previous) = self.items.add_or_update(current, change.key().clone()) {
                                if !previous.is_same_resource(change.current()) {
                                    self.released.push(previous);
                                }
                            }
                        }
                        ChangeReason::Remove => {
                            if let Some(removed) = self.items.remove(change.key()) {
                                self.released.push(removed);
                            }
                        }
                        ChangeReason::Refresh | ChangeReason::Moved => {}
                    }
                }
                self.pending.merge(changes);
            }
            DisposeEvent::Failed(error) => {
                self.failure = Some(error);
                self.done = true;
            }
            DisposeEvent::Completed => self.done = true,
        }
        Ok(())
    }

    fn flush(&mut self) -> Emission<ChangeSet<T, K>> {
        let mut released = std::mem::take(&mut self.released);
        if self.done {
            released.extend(self.take_remaining());
        }
        let mut after: Vec<Effect> = Vec::with_capacity(released.len() + 2);
        for item in released {
            let tracker = self.tracker.clone();
            after.push(Box::new(move || tracker.dispose(item.disposal())));
        }
        if self.done {
            let tracker = self.tracker.clone();
            after.push(Box::new(move || tracker.source_finished()));
            if let Some(error) = self.failure.take() {
                let subscriber = self.subscriber.clone();
                after.push(Box::new(move || subscriber.on_error(error)));
            }
        }
        let changes = std::mem::take(&mut self.pending);
        Emission {
            before: Vec::new(),
            output: (!changes.is_empty()).then_some(changes),
            after,
        }
    }

    fn is_completed(&self) -> bool {
        self.done
    }
}

fn disposing<T, K>(source: &Observable<ChangeSet<T, K>>, subscriber: Subscriber<ChangeSet<T, K>>, tracker: Arc<DisposalTracker>) -> Subscription
where
    T: CacheItem + Disposable,
    K: CacheKey,
{
    let operator = DisposeOperator {
        items: Cache::new(),
        released: Vec::new(),
        pending: ChangeSet::new(),
        tracker: tracker.clone(),
        subscriber: subscriber.clone(),
        failure: None,
        done: false,
    };
    let driver = Driver::new(operator, subscriber);
    let (on_next, on_error, on_completed) = (driver.clone(), driver.clone(), driver.clone());
    let upstream = source.subscribe(
        FnObserver::new(move |changes| on_next.push(DisposeEvent::Data(changes)))
            .with_error(move |error| on_error.push(DisposeEvent::Failed(error)))
            .with_completed(move || on_completed.push(DisposeEvent::Completed)),
    );
    upstream.with(Subscription::new(move || {
        let remaining = driver.state().take_remaining();
        for item in remaining {
            tracker.dispose(item.disposal());
        }
        tracker.source_finished();
    }))
}

/// Disposes items after their removal or replacement has been delivered,
/// and every remaining item when the stream ends.
pub fn dispose_many<T, K>(source: &Observable<ChangeSet<T, K>>) -> Observable<ChangeSet<T, K>>
where
    T: CacheItem + Disposable,
    K: CacheKey,
{
    let source = source.clone();
    Observable::create(move |subscriber| disposing(&source, subscriber, DisposalTracker::new()))
}

/// Like [`dispose_many`], also for items releasing asynchronously.
///
/// For every subscription, `accessor` receives a stream that emits once and
/// completes after the source has terminated and every disposal started so
/// far has finished. A failed disposal fails that stream instead; the data
/// stream is unaffected.
pub fn async_dispose_many<T, K, F>(source: &Observable<ChangeSet<T, K>>, accessor: F) -> Observable<ChangeSet<T, K>>
where
    T: CacheItem + Disposable,
    K: CacheKey,
    F: Fn(Observable<()>) + Send + Sync + 'static,
{
    let source = source.clone();
    Observable::create(move |subscriber| {
        let tracker = DisposalTracker::new();
        accessor(tracker.completed());
        disposing(&source, subscriber, tracker)
    })
}
