//! Cold push streams.
//!
//! An `Observable` is a subscribe function. Every call to `subscribe` runs the
//! function again with a fresh `Subscriber`, so each subscription owns its own
//! pipeline state.

use crate::observer::{FnObserver, Observer};
use crate::subscription::Subscription;
use keyflux_core::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct SubscriberInner<T> {
    observer: Box<dyn Observer<T>>,
    stopped: AtomicBool,
}

/// The observer handed to a subscribe function.
///
/// Enforces the stream grammar: values are dropped after a terminal signal
/// or after the subscription was cancelled, and exactly one terminal signal
/// reaches the wrapped observer.
pub struct Subscriber<T> {
    inner: Arc<SubscriberInner<T>>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Subscriber<T> {
    /// Wraps an observer.
    pub fn new<O>(observer: O) -> Self
    where
        O: Observer<T> + 'static,
    {
        Self {
            inner: Arc::new(SubscriberInner {
                observer: Box::new(observer),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Returns true once no further signal will be delivered.
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stops delivery without sending a terminal signal.
    pub fn unsubscribe(&self) {
        self.inner.stopped.store(true, Ordering::Release);
    }

    fn try_stop(&self) -> bool {
        self.inner
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl<T> Observer<T> for Subscriber<T> {
    fn on_next(&self, value: T) {
        if !self.is_stopped() {
            self.inner.observer.on_next(value);
        }
    }

    fn on_error(&self, error: Error) {
        if self.try_stop() {
            self.inner.observer.on_error(error);
        }
    }

    fn on_completed(&self) {
        if self.try_stop() {
            self.inner.observer.on_completed();
        }
    }
}

type SubscribeFn<T> = dyn Fn(Subscriber<T>) -> Subscription + Send + Sync;

/// A cold stream of values.
pub struct Observable<T> {
    subscribe_fn: Arc<SubscribeFn<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            subscribe_fn: self.subscribe_fn.clone(),
        }
    }
}

impl<T: 'static> Observable<T> {
    /// Creates an observable from a subscribe function.
    ///
    /// The function receives the downstream subscriber and returns the
    /// subscription tearing down whatever it attached upstream.
    pub fn create<F>(subscribe: F) -> Self
    where
        F: Fn(Subscriber<T>) -> Subscription + Send + Sync + 'static,
    {
        Self {
            subscribe_fn: Arc::new(subscribe),
        }
    }

    /// Subscribes an observer.
    ///
    /// Cancelling the returned subscription stops delivery first and then
    /// tears down the upstream.
    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: Observer<T> + 'static,
    {
        self.subscribe_with(Subscriber::new(observer))
    }

    /// Subscribes an existing subscriber.
    pub fn subscribe_with(&self, subscriber: Subscriber<T>) -> Subscription {
        let upstream = (self.subscribe_fn)(subscriber.clone());
        Subscription::new(move || subscriber.unsubscribe()).with(upstream)
    }

    /// Subscribes a value handler. Errors are logged.
    pub fn subscribe_next<F>(&self, next: F) -> Subscription
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe(FnObserver::new(next))
    }

    /// Subscribes handlers for all three signals.
    pub fn subscribe_all<N, E, C>(&self, next: N, error: E, completed: C) -> Subscription
    where
        N: Fn(T) + Send + Sync + 'static,
        E: Fn(Error) + Send + Sync + 'static,
        C: Fn() + Send + Sync + 'static,
    {
        self.subscribe(
            FnObserver::new(next)
                .with_error(error)
                .with_completed(completed),
        )
    }

    /// An observable that completes immediately.
    pub fn empty() -> Self {
        Self::create(|subscriber| {
            subscriber.on_completed();
            Subscription::empty()
        })
    }

    /// An observable that never signals.
    pub fn never() -> Self {
        Self::create(|_| Subscription::empty())
    }

    /// An observable that fails immediately.
    pub fn error(error: Error) -> Self {
        Self::create(move |subscriber| {
            subscriber.on_error(error.clone());
            Subscription::empty()
        })
    }

    /// Maps every value.
    pub fn map<U, F>(&self, f: F) -> Observable<U>
    where
        U: 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Observable::create(move |subscriber: Subscriber<U>| {
            let f = f.clone();
            let (on_error, on_completed) = (subscriber.clone(), subscriber.clone());
            source.subscribe(
                FnObserver::new(move |value| subscriber.on_next(f(value)))
                    .with_error(move |error| on_error.on_error(error))
                    .with_completed(move || on_completed.on_completed()),
            )
        })
    }
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    /// An observable emitting one value and completing.
    pub fn just(value: T) -> Self {
        Self::create(move |subscriber| {
            subscriber.on_next(value.clone());
            subscriber.on_completed();
            Subscription::empty()
        })
    }

    /// An observable emitting each value in order and completing.
    pub fn from_iter(values: impl IntoIterator<Item = T>) -> Self {
        let values: Vec<T> = values.into_iter().collect();
        Self::create(move |subscriber| {
            for value in &values {
                if subscriber.is_stopped() {
                    break;
                }
                subscriber.on_next(value.clone());
            }
            subscriber.on_completed();
            Subscription::empty()
        })
    }
}
