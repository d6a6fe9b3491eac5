//! Hot multicast streams.
//!
//! A `Subject` is both an observer and an observable: values pushed into it
//! are forwarded to every attached subscriber. Subscribers are notified from a
//! snapshot taken under the lock, never while holding it, so an observer may
//! subscribe or unsubscribe from inside a callback.

use crate::observable::{Observable, Subscriber};
use crate::observer::Observer;
use crate::subscription::{Subscription, SubscriptionManager};
use keyflux_core::Error;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone)]
enum Terminal {
    Completed,
    Failed(Error),
}

impl Terminal {
    fn deliver<T>(&self, subscriber: &Subscriber<T>) {
        match self {
            Terminal::Completed => subscriber.on_completed(),
            Terminal::Failed(error) => subscriber.on_error(error.clone()),
        }
    }
}

struct SubjectState<T> {
    observers: SubscriptionManager<T>,
    terminal: Option<Terminal>,
    latest: Option<T>,
}

/// A multicast stream fed by its owner.
///
/// Late subscribers to a terminated subject receive the terminal signal
/// immediately.
pub struct Subject<T> {
    state: Arc<Mutex<SubjectState<T>>>,
    replay_latest: bool,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            replay_latest: self.replay_latest,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Subject<T> {
    /// Creates a subject without observers.
    pub fn new() -> Self {
        Self::with_latest(None, false)
    }

    fn with_latest(latest: Option<T>, replay_latest: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(SubjectState {
                observers: SubscriptionManager::new(),
                terminal: None,
                latest,
            })),
            replay_latest,
        }
    }

    /// Returns an observable attaching to this subject.
    pub fn as_observable(&self) -> Observable<T> {
        let state = self.state.clone();
        let replay_latest = self.replay_latest;
        Observable::create(move |subscriber: Subscriber<T>| {
            let mut guard = state.lock();
            if let Some(terminal) = guard.terminal.clone() {
                drop(guard);
                terminal.deliver(&subscriber);
                return Subscription::empty();
            }
            let latest = if replay_latest {
                guard.latest.clone()
            } else {
                None
            };
            let id = guard.observers.subscribe(subscriber.clone());
            drop(guard);

            if let Some(value) = latest {
                subscriber.on_next(value);
            }

            let weak = Arc::downgrade(&state);
            Subscription::new(move || {
                if let Some(state) = weak.upgrade() {
                    state.lock().observers.unsubscribe(id);
                }
            })
        })
    }

    /// Returns true if at least one subscriber is attached.
    pub fn has_observers(&self) -> bool {
        !self.state.lock().observers.is_empty()
    }

    /// Returns the number of attached subscribers.
    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    /// Returns true once the subject completed or failed.
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    fn terminate(&self, terminal: Terminal) {
        let subscribers = {
            let mut guard = self.state.lock();
            if guard.terminal.is_some() {
                return;
            }
            guard.terminal = Some(terminal.clone());
            guard.observers.drain()
        };
        for subscriber in &subscribers {
            terminal.deliver(subscriber);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Observer<T> for Subject<T> {
    fn on_next(&self, value: T) {
        let subscribers = {
            let mut guard = self.state.lock();
            if guard.terminal.is_some() {
                return;
            }
            if self.replay_latest {
                guard.latest = Some(value.clone());
            }
            guard.observers.snapshot()
        };
        for subscriber in &subscribers {
            subscriber.on_next(value.clone());
        }
    }

    fn on_error(&self, error: Error) {
        self.terminate(Terminal::Failed(error));
    }

    fn on_completed(&self) {
        self.terminate(Terminal::Completed);
    }
}

/// A subject remembering its latest value.
///
/// New subscribers receive the latest value right after attaching.
pub struct BehaviorSubject<T> {
    subject: Subject<T>,
}

impl<T> Clone for BehaviorSubject<T> {
    fn clone(&self) -> Self {
        Self {
            subject: self.subject.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> BehaviorSubject<T> {
    /// Creates a behavior subject holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            subject: Subject::with_latest(Some(initial), true),
        }
    }

    /// Returns the latest value.
    pub fn value(&self) -> Option<T> {
        self.subject.state.lock().latest.clone()
    }

    /// Returns an observable attaching to this subject.
    pub fn as_observable(&self) -> Observable<T> {
        self.subject.as_observable()
    }

    /// Returns true if at least one subscriber is attached.
    pub fn has_observers(&self) -> bool {
        self.subject.has_observers()
    }
}

impl<T: Clone + Send + Sync + 'static> Observer<T> for BehaviorSubject<T> {
    fn on_next(&self, value: T) {
        self.subject.on_next(value);
    }

    fn on_error(&self, error: Error) {
        self.subject.on_error(error);
    }

    fn on_completed(&self) {
        self.subject.on_completed();
    }
}
