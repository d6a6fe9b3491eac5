//! Small stateless or pass-through operators.

use super::forward;
use keyflux_core::{Cache, CacheItem, CacheKey, ChangeReason, ChangeSet, Error, Result};
use keyflux_reactive::{Observable, Observer, Subscriber, Subscription};
use parking_lot::Mutex;
use std::sync::Arc;

/// Re-keys every change with `selector`.
///
/// The selector must map distinct keys to distinct keys.
pub fn change_key<T, K, K2, F>(source: &Observable<ChangeSet<T, K>>, selector: F) -> Observable<ChangeSet<T, K2>>
where
    T: CacheItem,
    K: CacheKey,
    K2: CacheKey,
    F: Fn(&K, &T) -> K2 + Send + Sync + 'static,
{
    let source = source.clone();
    let selector = Arc::new(selector);
    Observable::create(move |subscriber: Subscriber<ChangeSet<T, K2>>| {
        let selector = selector.clone();
        forward(&source, subscriber, move |subscriber, changes: ChangeSet<T, K>| {
            let out: ChangeSet<T, K2> = changes
                .into_iter()
                .map(|change| {
                    let key = selector(change.key(), change.current());
                    change.with_key(key)
                })
                .collect();
            subscriber.on_next(out);
        })
    })
}

fn reasons_filter<T, K>(
    source: &Observable<ChangeSet<T, K>>,
    reasons: &[ChangeReason],
    keep_listed: bool,
) -> Result<Observable<ChangeSet<T, K>>>
where
    T: CacheItem,
    K: CacheKey,
{
    if reasons.is_empty() {
        return Err(Error::invalid_argument("at least one change reason is required"));
    }
    let source = source.clone();
    let reasons: Arc<[ChangeReason]> = reasons.into();
    Ok(Observable::create(move |subscriber: Subscriber<ChangeSet<T, K>>| {
        let reasons = reasons.clone();
        forward(&source, subscriber, move |subscriber, mut changes: ChangeSet<T, K>| {
            changes.retain(|change| reasons.contains(&change.reason()) == keep_listed);
            if !changes.is_empty() {
                subscriber.on_next(changes);
            }
        })
    }))
}

/// Keeps only changes with one of `reasons`.
pub fn where_reasons_are<T, K>(
    source: &Observable<ChangeSet<T, K>>,
    reasons: &[ChangeReason],
) -> Result<Observable<ChangeSet<T, K>>>
where
    T: CacheItem,
    K: CacheKey,
{
    reasons_filter(source, reasons, true)
}

/// Drops changes with any of `reasons`.
pub fn where_reasons_are_not<T, K>(
    source: &Observable<ChangeSet<T, K>>,
    reasons: &[ChangeReason],
) -> Result<Observable<ChangeSet<T, K>>>
where
    T: CacheItem,
    K: CacheKey,
{
    reasons_filter(source, reasons, false)
}

/// Calls `action` for every added item, then forwards the batch.
pub fn on_item_added<T, K, F>(source: &Observable<ChangeSet<T, K>>, action: F) -> Observable<ChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
    F: Fn(&T) + Send + Sync + 'static,
{
    let source = source.clone();
    let action = Arc::new(action);
    Observable::create(move |subscriber: Subscriber<ChangeSet<T, K>>| {
        let action = action.clone();
        forward(&source, subscriber, move |subscriber, changes: ChangeSet<T, K>| {
            for change in changes.iter().filter(|c| c.reason() == ChangeReason::Add) {
                action(change.current());
            }
            subscriber.on_next(changes);
        })
    })
}

/// Calls `action` for every removed item after the batch was forwarded, and
/// for every item still held when the subscription ends.
pub fn on_item_removed<T, K, F>(source: &Observable<ChangeSet<T, K>>, action: F) -> Observable<ChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
    F: Fn(&T) + Send + Sync + 'static,
{
    let source = source.clone();
    let action = Arc::new(action);
    Observable::create(move |subscriber: Subscriber<ChangeSet<T, K>>| {
        let held: Arc<Mutex<Cache<T, K>>> = Arc::new(Mutex::new(Cache::new()));
        let (tracking, on_remove) = (held.clone(), action.clone());
        let upstream = forward(&source, subscriber, move |subscriber, changes: ChangeSet<T, K>| {
            let removed: Vec<T> = {
                let mut held = tracking.lock();
                let removed = changes
                    .iter()
                    .filter(|c| c.reason() == ChangeReason::Remove)
                    .map(|c| c.current().clone())
                    .collect();
                held.clone_changes(&changes);
                removed
            };
            subscriber.on_next(changes);
            for item in &removed {
                on_remove(item);
            }
        });
        let action = action.clone();
        upstream.with(Subscription::new(move || {
            let remaining: Vec<T> = {
                let mut held = held.lock();
                let remaining = held.items().cloned().collect();
                held.clear();
                remaining
            };
            for item in &remaining {
                action(item);
            }
        }))
    })
}
