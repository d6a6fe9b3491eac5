//! Subscription handles and observer bookkeeping.
//!
//! A `Subscription` is the cancellation handle returned by every subscribe
//! call. Dropping it, or calling `unsubscribe`, runs its teardown exactly
//! once. `SubscriptionManager` tracks the observers attached to a multicast
//! producer.

use crate::observable::Subscriber;

/// Unique identifier for an attached observer.
pub type SubscriptionId = u64;

type Teardown = Box<dyn FnOnce() + Send>;

/// Cancellation handle for a subscription.
///
/// Teardown runs when the handle is unsubscribed or dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    teardown: Option<Teardown>,
    children: Vec<Subscription>,
}

impl Subscription {
    /// Creates a subscription running `teardown` when cancelled.
    pub fn new<F>(teardown: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            teardown: Some(Box::new(teardown)),
            children: Vec::new(),
        }
    }

    /// Creates a subscription with nothing to tear down.
    pub fn empty() -> Self {
        Self {
            teardown: None,
            children: Vec::new(),
        }
    }

    /// Creates a subscription that cancels all of `subscriptions`.
    pub fn composite(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        Self {
            teardown: None,
            children: subscriptions.into_iter().collect(),
        }
    }

    /// Attaches another subscription, cancelled together with this one.
    pub fn add(&mut self, other: Subscription) {
        self.children.push(other);
    }

    /// Returns this subscription with `other` attached.
    pub fn with(mut self, other: Subscription) -> Self {
        self.add(other);
        self
    }

    /// Returns true once there is nothing left to tear down.
    pub fn is_closed(&self) -> bool {
        self.teardown.is_none() && self.children.iter().all(Subscription::is_closed)
    }

    /// Runs the teardown. Further calls do nothing.
    pub fn unsubscribe(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
        for mut child in self.children.drain(..) {
            child.unsubscribe();
        }
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::empty()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Tracks the observers attached to a multicast producer.
///
/// Observers are kept in subscription order so that notification order is
/// deterministic.
pub struct SubscriptionManager<T> {
    /// Active subscribers in subscription order
    subscriptions: Vec<(SubscriptionId, Subscriber<T>)>,
    /// Next subscription ID to assign
    next_id: SubscriptionId,
}

impl<T> Default for SubscriptionManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubscriptionManager<T> {
    /// Creates a new subscription manager.
    pub fn new() -> Self {
        Self {
            subscriptions: Vec::new(),
            next_id: 1,
        }
    }

    /// Attaches a subscriber.
    ///
    /// Returns the subscription ID that can be used to detach it.
    pub fn subscribe(&mut self, subscriber: Subscriber<T>) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscriptions.push((id, subscriber));
        id
    }

    /// Detaches by ID.
    ///
    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        match self.subscriptions.iter().position(|(sid, _)| *sid == id) {
            Some(pos) => {
                self.subscriptions.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Returns a snapshot of the attached subscribers.
    ///
    /// Producers notify the snapshot after releasing their lock so that
    /// observers may subscribe or unsubscribe while being notified.
    pub fn snapshot(&self) -> Vec<Subscriber<T>> {
        self.subscriptions.iter().map(|(_, s)| s.clone()).collect()
    }

    /// Returns the number of attached subscribers.
    #[inline]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Returns true if there are no subscribers.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Returns all subscription IDs.
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.subscriptions.iter().map(|(id, _)| *id).collect()
    }

    /// Detaches every subscriber, returning them.
    pub fn drain(&mut self) -> Vec<Subscriber<T>> {
        self.subscriptions.drain(..).map(|(_, s)| s).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{FnObserver, Observer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_subscription_runs_teardown_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut sub = Subscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!sub.is_closed());

        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_drop_unsubscribes() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        {
            let _sub = Subscription::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_composite() {
        let count = Arc::new(AtomicUsize::new(0));
        let make = |count: &Arc<AtomicUsize>| {
            let c = count.clone();
            Subscription::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        };
        let mut sub = Subscription::composite(vec![make(&count), make(&count)]).with(make(&count));
        sub.unsubscribe();
        assert!(sub.is_closed());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_subscription_manager_subscribe() {
        let mut manager = SubscriptionManager::new();

        let id1 = manager.subscribe(Subscriber::new(FnObserver::new(|_: i32| {})));
        let id2 = manager.subscribe(Subscriber::new(FnObserver::new(|_: i32| {})));

        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.subscription_ids(), vec![1, 2]);
    }

    #[test]
    fn test_subscription_manager_unsubscribe() {
        let mut manager = SubscriptionManager::new();

        let id = manager.subscribe(Subscriber::new(FnObserver::new(|_: i32| {})));
        assert_eq!(manager.len(), 1);

        assert!(manager.unsubscribe(id));
        assert_eq!(manager.len(), 0);

        assert!(!manager.unsubscribe(id)); // Already removed
    }

    #[test]
    fn test_subscription_manager_snapshot_order() {
        let mut manager = SubscriptionManager::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in 0..3 {
            let seen = seen.clone();
            manager.subscribe(Subscriber::new(FnObserver::new(move |_: i32| seen.lock().push(tag))));
        }

        for subscriber in manager.snapshot() {
            subscriber.on_next(0);
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2]);

        assert_eq!(manager.drain().len(), 3);
        assert!(manager.is_empty());
    }
}
