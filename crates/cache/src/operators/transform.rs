//! Transform operators.
//!
//! A transform maps every item to a new value under the same key and keeps
//! both the source and the transformed value, so removals, refreshes, moves
//! and forced re-transforms can be reported with the value downstream saw.

use super::{Driver, Emission, Operator};
use crate::TransformOptions;
use hashbrown::HashMap;
use keyflux_core::{CacheItem, CacheKey, Change, ChangeReason, ChangeSet, Error, Result};
use keyflux_reactive::Observable;
use std::sync::Arc;

/// Selects the items a forced re-transform applies to.
pub type ForcePredicate<S, K> = Arc<dyn Fn(&S, &K) -> bool + Send + Sync>;

type TransformFn<S, T, K> = Arc<dyn Fn(&S, &K) -> Result<T> + Send + Sync>;
type ErrorHandler<K> = Arc<dyn Fn(&K, &Error) + Send + Sync>;

/// How a failing transform is handled.
#[derive(Clone)]
pub(crate) enum Failure<K> {
    /// The first failure fails the stream.
    Fatal,
    /// Failing items are dropped from the batch and reported.
    Skip(ErrorHandler<K>),
}

/// Source and transformed values per key.
pub(crate) struct TransformState<S, T, K> {
    items: HashMap<K, (S, T)>,
}

impl<S, T, K> TransformState<S, T, K>
where
    S: CacheItem,
    T: CacheItem,
    K: CacheKey,
{
    pub(crate) fn new() -> Self {
        Self { items: HashMap::new() }
    }

    /// Transforms one upstream batch.
    ///
    /// Every transform runs before any state changes, so a fatal failure
    /// leaves the state as it was.
    pub(crate) fn apply(
        &mut self,
        changes: ChangeSet<S, K>,
        transform: &dyn Fn(&S, &K) -> Result<T>,
        options: TransformOptions,
        failure: &Failure<K>,
    ) -> Result<ChangeSet<T, K>> {
        let mut computed = Vec::with_capacity(changes.len());
        for change in &changes {
            let needs_transform = match change.reason() {
                ChangeReason::Add | ChangeReason::Update => true,
                ChangeReason::Refresh => options.transform_on_refresh,
                ChangeReason::Remove | ChangeReason::Moved => false,
            };
            if !needs_transform {
                computed.push(None);
                continue;
            }
            match transform(change.current(), change.key()) {
                Ok(value) => computed.push(Some(Ok(value))),
                Err(error) => match failure {
                    Failure::Fatal => return Err(error),
                    Failure::Skip(handler) => {
                        tracing::warn!(%error, "transform failed, item skipped");
                        handler(change.key(), &error);
                        computed.push(Some(Err(error)));
                    }
                },
            }
        }

        let mut out = ChangeSet::with_capacity(changes.len());
        for (change, transformed) in changes.into_iter().zip(computed) {
            let indices = (change.current_index(), change.previous_index());
            match (change.reason(), transformed) {
                (_, Some(Err(_))) => {}
                (ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh, Some(Ok(value))) => {
                    let (key, source, _) = change.into_parts();
                    let prior = self.items.insert(key.clone(), (source, value.clone()));
                    let emitted = match prior {
                        Some((_, previous)) => Change::update(key, value, previous),
                        None => Change::add(key, value),
                    };
                    out.push(emitted.with_indices(indices.0, indices.1));
                }
                (ChangeReason::Remove, _) => {
                    if let Some((_, removed)) = self.items.remove(change.key()) {
                        out.push(Change::remove(change.key().clone(), removed).with_indices(indices.0, indices.1));
                    }
                }
                (ChangeReason::Refresh, None) => {
                    if let Some((_, current)) = self.items.get(change.key()) {
                        out.push(Change::refresh(change.key().clone(), current.clone()).with_indices(indices.0, indices.1));
                    }
                }
                (ChangeReason::Moved, _) => {
                    if let Some((_, current)) = self.items.get(change.key()) {
                        let moved = Change::moved(change.key().clone(), current.clone(), 0, 0);
                        out.push(moved.with_indices(indices.0, indices.1));
                    }
                }
                (ChangeReason::Add | ChangeReason::Update, None) => {}
            }
        }
        Ok(out)
    }

    /// Re-transforms every item matching `predicate`, reporting updates.
    pub(crate) fn force(
        &mut self,
        predicate: &dyn Fn(&S, &K) -> bool,
        transform: &dyn Fn(&S, &K) -> Result<T>,
        failure: &Failure<K>,
    ) -> Result<ChangeSet<T, K>> {
        let mut computed = Vec::new();
        for (key, (source, _)) in self.items.iter() {
            if !predicate(source, key) {
                continue;
            }
            match transform(source, key) {
                Ok(value) => computed.push((key.clone(), value)),
                Err(error) => match failure {
                    Failure::Fatal => return Err(error),
                    Failure::Skip(handler) => {
                        tracing::warn!(%error, "forced transform failed, item kept");
                        handler(key, &error);
                    }
                },
            }
        }

        let mut out = ChangeSet::with_capacity(computed.len());
        for (key, value) in computed {
            if let Some(entry) = self.items.get_mut(&key) {
                let previous = std::mem::replace(&mut entry.1, value.clone());
                out.push(Change::update(key, value, previous));
            }
        }
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

enum TransformEvent<S, K> {
    Data(ChangeSet<S, K>),
    Force(ForcePredicate<S, K>),
    ForceCompleted,
    Completed,
}

struct TransformOperator<S, T, K> {
    state: TransformState<S, T, K>,
    transform: TransformFn<S, T, K>,
    options: TransformOptions,
    failure: Failure<K>,
    pending: ChangeSet<T, K>,
    done: bool,
}

impl<S, T, K> Operator for TransformOperator<S, T, K>
where
    S: CacheItem,
    T: CacheItem,
    K: CacheKey,
{
    type Event = TransformEvent<S, K>;
    type Output = ChangeSet<T, K>;

    fn apply(&mut self, event: Self::Event) -> Result<()> {
        let changes = match event {
            TransformEvent::Data(changes) => {
                self.state
                    .apply(changes, &*self.transform, self.options, &self.failure)?
            }
            TransformEvent::Force(predicate) => self.state.force(&*predicate, &*self.transform, &self.failure)?,
            TransformEvent::ForceCompleted => return Ok(()),
            TransformEvent::Completed => {
                self.done = true;
                return Ok(());
            }
        };
        self.pending.merge(changes);
        Ok(())
    }

    fn flush(&mut self) -> Emission<ChangeSet<T, K>> {
        let changes = std::mem::take(&mut self.pending);
        Emission::output((!changes.is_empty()).then_some(changes))
    }

    fn is_completed(&self) -> bool {
        self.done
    }
}

fn build<S, T, K>(
    source: &Observable<ChangeSet<S, K>>,
    transform: TransformFn<S, T, K>,
    options: TransformOptions,
    failure: Failure<K>,
    force: Option<Observable<ForcePredicate<S, K>>>,
) -> Observable<ChangeSet<T, K>>
where
    S: CacheItem,
    T: CacheItem,
    K: CacheKey,
{
    let source = source.clone();
    Observable::create(move |subscriber| {
        let operator = TransformOperator {
            state: TransformState::new(),
            transform: transform.clone(),
            options,
            failure: failure.clone(),
            pending: ChangeSet::new(),
            done: false,
        };
        let driver = Driver::new(operator, subscriber);
        let mut subscription = driver.subscribe_input(&source, TransformEvent::Data, || TransformEvent::Completed);
        if let Some(force) = &force {
            subscription.add(driver.subscribe_input(force, TransformEvent::Force, || TransformEvent::ForceCompleted));
        }
        subscription
    })
}

/// Maps every item through `transform`.
pub fn transform<S, T, K, F>(source: &Observable<ChangeSet<S, K>>, transform: F) -> Observable<ChangeSet<T, K>>
where
    S: CacheItem,
    T: CacheItem,
    K: CacheKey,
    F: Fn(&S) -> T + Send + Sync + 'static,
{
    build(
        source,
        Arc::new(move |item: &S, _: &K| Ok(transform(item))),
        TransformOptions::default(),
        Failure::Fatal,
        None,
    )
}

/// Maps every item through `transform`, which also receives the key.
pub fn transform_with_options<S, T, K, F>(
    source: &Observable<ChangeSet<S, K>>,
    transform: F,
    options: TransformOptions,
) -> Observable<ChangeSet<T, K>>
where
    S: CacheItem,
    T: CacheItem,
    K: CacheKey,
    F: Fn(&S, &K) -> T + Send + Sync + 'static,
{
    build(
        source,
        Arc::new(move |item: &S, key: &K| Ok(transform(item, key))),
        options,
        Failure::Fatal,
        None,
    )
}

/// Maps every item and re-transforms matching items whenever `force` emits.
///
/// Forced items are reported as updates carrying the new value.
pub fn transform_with_force<S, T, K, F>(
    source: &Observable<ChangeSet<S, K>>,
    transform: F,
    force: &Observable<ForcePredicate<S, K>>,
) -> Observable<ChangeSet<T, K>>
where
    S: CacheItem,
    T: CacheItem,
    K: CacheKey,
    F: Fn(&S, &K) -> T + Send + Sync + 'static,
{
    build(
        source,
        Arc::new(move |item: &S, key: &K| Ok(transform(item, key))),
        TransformOptions::default(),
        Failure::Fatal,
        Some(force.clone()),
    )
}

/// Maps every item through a fallible transform. The first error fails the
/// stream; the batch it occurred in is not emitted.
pub fn try_transform<S, T, K, F>(source: &Observable<ChangeSet<S, K>>, transform: F) -> Observable<ChangeSet<T, K>>
where
    S: CacheItem,
    T: CacheItem,
    K: CacheKey,
    F: Fn(&S, &K) -> Result<T> + Send + Sync + 'static,
{
    build(source, Arc::new(transform), TransformOptions::default(), Failure::Fatal, None)
}

/// Maps every item through a fallible transform, isolating failures.
///
/// A failing item's change is dropped from its batch and passed to
/// `on_error`; the stream continues.
pub fn transform_safe<S, T, K, F, E>(
    source: &Observable<ChangeSet<S, K>>,
    transform: F,
    on_error: E,
) -> Observable<ChangeSet<T, K>>
where
    S: CacheItem,
    T: CacheItem,
    K: CacheKey,
    F: Fn(&S, &K) -> Result<T> + Send + Sync + 'static,
    E: Fn(&K, &Error) + Send + Sync + 'static,
{
    build(
        source,
        Arc::new(transform),
        TransformOptions::default(),
        Failure::Skip(Arc::new(on_error)),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyflux_reactive::{Observer, Subject};
    use parking_lot::Mutex;

    fn double(v: &i32, _: &u32) -> Result<i32> {
        Ok(v * 2)
    }

    fn reject_odd(v: &i32, _: &u32) -> Result<i32> {
        if v % 2 == 0 {
            Ok(*v)
        } else {
            Err(Error::operator("transform", format!("odd {}", v)))
        }
    }

    fn make_changes(changes: Vec<Change<i32, u32>>) -> ChangeSet<i32, u32> {
        ChangeSet::from(changes)
    }

    #[test]
    fn test_transform_state_tracks_previous_transformed_value() {
        let mut state = TransformState::new();
        let options = TransformOptions::default();
        state
            .apply(make_changes(vec![Change::add(1, 1)]), &double, options, &Failure::Fatal)
            .unwrap();
        let out = state
            .apply(make_changes(vec![Change::update(1, 5, 1)]), &double, options, &Failure::Fatal)
            .unwrap();

        let change = out.iter().next().unwrap();
        assert_eq!(change.reason(), ChangeReason::Update);
        assert_eq!(*change.current(), 10);
        assert_eq!(change.previous(), Some(&2));

        let out = state
            .apply(make_changes(vec![Change::remove(1, 5)]), &double, options, &Failure::Fatal)
            .unwrap();
        assert_eq!(*out.iter().next().unwrap().current(), 10);
        assert_eq!(state.len(), 0);
    }

    #[test]
    fn test_transform_refresh_policy() {
        let mut state = TransformState::new();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let counting = move |v: &i32, _: &u32| -> Result<i32> {
            *counter.lock() += 1;
            Ok(*v)
        };

        let plain = TransformOptions::default();
        state
            .apply(make_changes(vec![Change::add(1, 1)]), &counting, plain, &Failure::Fatal)
            .unwrap();
        let out = state
            .apply(make_changes(vec![Change::refresh(1, 1)]), &counting, plain, &Failure::Fatal)
            .unwrap();
        assert_eq!(out.refreshes(), 1);
        assert_eq!(*calls.lock(), 1);

        let eager = TransformOptions::new().transform_on_refresh(true);
        let out = state
            .apply(make_changes(vec![Change::refresh(1, 1)]), &counting, eager, &Failure::Fatal)
            .unwrap();
        assert_eq!(out.updates(), 1);
        assert_eq!(*calls.lock(), 2);
    }

    #[test]
    fn test_transform_fatal_failure_leaves_state_untouched() {
        let mut state = TransformState::new();
        let result = state.apply(
            make_changes(vec![Change::add(1, 2), Change::add(2, 3)]),
            &reject_odd,
            TransformOptions::default(),
            &Failure::Fatal,
        );
        assert!(result.is_err());
        assert_eq!(state.len(), 0);
    }

    #[test]
    fn test_transform_safe_skips_failing_items() {
        let mut state = TransformState::new();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        let failure = Failure::Skip(Arc::new(move |key: &u32, _: &Error| sink.lock().push(*key)));
        let out = state
            .apply(
                make_changes(vec![Change::add(1, 2), Change::add(2, 3)]),
                &reject_odd,
                TransformOptions::default(),
                &failure,
            )
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(*failures.lock(), vec![2]);
    }

    #[test]
    fn test_transform_preserves_indices() {
        let mut state = TransformState::new();
        let out = state
            .apply(
                make_changes(vec![Change::add_at(1, 1, 0), Change::add_at(2, 2, 1)]),
                &double,
                TransformOptions::default(),
                &Failure::Fatal,
            )
            .unwrap();
        let indices: Vec<_> = out.iter().map(|c| c.current_index()).collect();
        assert_eq!(indices, vec![Some(0), Some(1)]);
    }

    #[test]
    fn test_transform_with_force_emits_updates() {
        let source = Subject::new();
        let force: Subject<ForcePredicate<i32, u32>> = Subject::new();
        let generation = Arc::new(Mutex::new(0));
        let g = generation.clone();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let _sub = transform_with_force(
            &source.as_observable(),
            move |v: &i32, _: &u32| (*v, *g.lock()),
            &force.as_observable(),
        )
        .subscribe_next(move |changes: ChangeSet<(i32, i32), u32>| sink.lock().push(changes));

        source.on_next(make_changes(vec![Change::add(1, 1), Change::add(2, 2)]));
        *generation.lock() = 1;
        force.on_next(Arc::new(|v: &i32, _: &u32| *v > 1));

        let batches = batches.lock();
        assert_eq!(batches.len(), 2);
        let forced = batches[1].iter().next().unwrap();
        assert_eq!(forced.reason(), ChangeReason::Update);
        assert_eq!(*forced.current(), (2, 1));
        assert_eq!(forced.previous(), Some(&(2, 0)));
    }

    #[test]
    fn test_try_transform_fails_stream() {
        let source = Subject::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let _sub = try_transform(&source.as_observable(), reject_odd).subscribe_all(
            |_| {},
            move |e| sink.lock().push(e),
            || {},
        );
        source.on_next(make_changes(vec![Change::add(1, 3)]));
        assert_eq!(errors.lock().len(), 1);
    }
}
