//! Join operators.
//!
//! Every join pairs a left stream with a right stream through a selector
//! mapping each right item to the key of the left item it belongs to. The
//! joins differ only in which rows exist and how they are keyed:
//!
//! | join              | row key    | a row exists when                    |
//! |-------------------|------------|--------------------------------------|
//! | `inner_join`      | `(LK, RK)` | both sides of the pair are present   |
//! | `left_join`       | `LK`       | the left item is present             |
//! | `right_join`      | `RK`       | the right item is present            |
//! | `full_join`       | `LK`       | either side is present               |
//! | `inner_join_many` | `LK`       | the left item has at least one match |
//! | `left_join_many`  | `LK`       | the left item is present             |
//! | `right_join_many` | `LK`       | at least one right item matches      |
//! | `full_join_many`  | `LK`       | either side is present               |
//!
//! Scalar joins keyed by the left key pair with the most recently matched
//! right item. The initial rows of both sides are emitted as one batch.

use super::group::Grouping;
use super::{Driver, Emission, Operator};
use hashbrown::HashMap;
use keyflux_core::{Cache, CacheItem, CacheKey, Change, ChangeAwareCache, ChangeReason, ChangeSet, Result};
use keyflux_reactive::{Observable, Subscription};
use std::sync::Arc;

type ForeignKeySelector<R, LK> = Arc<dyn Fn(&R) -> LK + Send + Sync>;

/// Both sides of a join plus the index pairing them.
pub(crate) struct JoinState<L, LK, R, RK> {
    left: Cache<L, LK>,
    right: Cache<R, RK>,
    foreign: HashMap<RK, LK>,
    matches: HashMap<LK, Vec<RK>>,
}

impl<L, LK, R, RK> JoinState<L, LK, R, RK>
where
    L: CacheItem,
    LK: CacheKey,
    R: CacheItem,
    RK: CacheKey,
{
    pub(crate) fn new() -> Self {
        Self {
            left: Cache::new(),
            right: Cache::new(),
            foreign: HashMap::new(),
            matches: HashMap::new(),
        }
    }

    /// Applies a left change, returning the affected left key.
    pub(crate) fn apply_left(&mut self, change: Change<L, LK>) -> Option<LK> {
        match change.reason() {
            ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                let (key, item) = change.into_key_value();
                self.left.add_or_update(item, key.clone());
                Some(key)
            }
            ChangeReason::Remove => {
                self.left.remove(change.key());
                Some(change.key().clone())
            }
            ChangeReason::Moved => None,
        }
    }

    /// Applies a right change, returning the right key with the left keys
    /// it was paired with before and after.
    pub(crate) fn apply_right(
        &mut self,
        change: Change<R, RK>,
        selector: &dyn Fn(&R) -> LK,
    ) -> Option<(RK, Option<LK>, Option<LK>)> {
        match change.reason() {
            ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                let (key, item) = change.into_key_value();
                let foreign = selector(&item);
                let previous = self.foreign.get(&key).cloned();
                if previous.as_ref() != Some(&foreign) {
                    if let Some(previous) = &previous {
                        self.unpair(previous, &key);
                    }
                    self.matches.entry(foreign.clone()).or_default().push(key.clone());
                    self.foreign.insert(key.clone(), foreign.clone());
                }
                self.right.add_or_update(item, key.clone());
                Some((key, previous, Some(foreign)))
            }
            ChangeReason::Remove => {
                self.right.remove(change.key());
                let previous = self.foreign.remove(change.key());
                if let Some(previous) = &previous {
                    self.unpair(previous, change.key());
                }
                Some((change.key().clone(), previous, None))
            }
            ChangeReason::Moved => None,
        }
    }

    fn unpair(&mut self, foreign: &LK, key: &RK) {
        if let Some(keys) = self.matches.get_mut(foreign) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.matches.remove(foreign);
            }
        }
    }

    /// Right keys paired with a left key, oldest pairing first.
    pub(crate) fn matching(&self, key: &LK) -> &[RK] {
        self.matches.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn grouping(&self, key: &LK) -> Grouping<R, RK, LK> {
        let items = self
            .matching(key)
            .iter()
            .filter_map(|rk| self.right.lookup(rk).map(|r| (rk.clone(), r.clone())))
            .collect();
        Grouping::new(key.clone(), items)
    }
}

/// Decides which rows a join produces.
trait Projection<L, LK, R, RK>: Send + 'static {
    type Key: CacheKey;
    type Row: CacheItem;

    fn from_left(&self, state: &JoinState<L, LK, R, RK>, key: &LK, out: &mut Vec<Self::Key>);

    fn from_right(&self, state: &JoinState<L, LK, R, RK>, key: &RK, foreign: &[&LK], out: &mut Vec<Self::Key>);

    fn project(&self, state: &JoinState<L, LK, R, RK>, key: &Self::Key) -> Option<Self::Row>;
}

type PairFn<L, LK, R, RK, D> = Arc<dyn Fn(&(LK, RK), &L, &R) -> D + Send + Sync>;
type RightFn<L, R, RK, D> = Arc<dyn Fn(&RK, Option<&L>, &R) -> D + Send + Sync>;
type LeftFn<L, LK, R, RK, D> = Arc<dyn Fn(&LK, Option<&L>, &Grouping<R, RK, LK>) -> Option<D> + Send + Sync>;

struct ByPair<L, LK, R, RK, D>(PairFn<L, LK, R, RK, D>);

impl<L, LK, R, RK, D> Projection<L, LK, R, RK> for ByPair<L, LK, R, RK, D>
where
    L: CacheItem,
    LK: CacheKey,
    R: CacheItem,
    RK: CacheKey,
    D: CacheItem,
{
    type Key = (LK, RK);
    type Row = D;

    fn from_left(&self, state: &JoinState<L, LK, R, RK>, key: &LK, out: &mut Vec<(LK, RK)>) {
        out.extend(state.matching(key).iter().map(|rk| (key.clone(), rk.clone())));
    }

    fn from_right(&self, _: &JoinState<L, LK, R, RK>, key: &RK, foreign: &[&LK], out: &mut Vec<(LK, RK)>) {
        out.extend(foreign.iter().map(|lk| ((*lk).clone(), key.clone())));
    }

    fn project(&self, state: &JoinState<L, LK, R, RK>, key: &(LK, RK)) -> Option<D> {
        let (lk, rk) = key;
        if state.foreign.get(rk) != Some(lk) {
            return None;
        }
        let left = state.left.lookup(lk)?;
        let right = state.right.lookup(rk)?;
        Some((self.0)(key, left, right))
    }
}

struct ByRightKey<L, R, RK, D>(RightFn<L, R, RK, D>);

impl<L, LK, R, RK, D> Projection<L, LK, R, RK> for ByRightKey<L, R, RK, D>
where
    L: CacheItem,
    LK: CacheKey,
    R: CacheItem,
    RK: CacheKey,
    D: CacheItem,
{
    type Key = RK;
    type Row = D;

    fn from_left(&self, state: &JoinState<L, LK, R, RK>, key: &LK, out: &mut Vec<RK>) {
        out.extend(state.matching(key).iter().cloned());
    }

    fn from_right(&self, _: &JoinState<L, LK, R, RK>, key: &RK, _: &[&LK], out: &mut Vec<RK>) {
        out.push(key.clone());
    }

    fn project(&self, state: &JoinState<L, LK, R, RK>, key: &RK) -> Option<D> {
        let right = state.right.lookup(key)?;
        let left = state.foreign.get(key).and_then(|lk| state.left.lookup(lk));
        Some((self.0)(key, left, right))
    }
}

struct ByLeftKey<L, LK, R, RK, D>(LeftFn<L, LK, R, RK, D>);

impl<L, LK, R, RK, D> Projection<L, LK, R, RK> for ByLeftKey<L, LK, R, RK, D>
where
    L: CacheItem,
    LK: CacheKey,
    R: CacheItem,
    RK: CacheKey,
    D: CacheItem,
{
    type Key = LK;
    type Row = D;

    fn from_left(&self, _: &JoinState<L, LK, R, RK>, key: &LK, out: &mut Vec<LK>) {
        out.push(key.clone());
    }

    fn from_right(&self, _: &JoinState<L, LK, R, RK>, _: &RK, foreign: &[&LK], out: &mut Vec<LK>) {
        out.extend(foreign.iter().map(|lk| (*lk).clone()));
    }

    fn project(&self, state: &JoinState<L, LK, R, RK>, key: &LK) -> Option<D> {
        (self.0)(key, state.left.lookup(key), &state.grouping(key))
    }
}

enum JoinEvent<L, LK, R, RK> {
    Left(ChangeSet<L, LK>),
    Right(ChangeSet<R, RK>),
    LeftCompleted,
    RightCompleted,
    Ready,
}

struct JoinOperator<L, LK, R, RK, P>
where
    P: Projection<L, LK, R, RK>,
{
    state: JoinState<L, LK, R, RK>,
    projection: P,
    selector: ForeignKeySelector<R, LK>,
    output: ChangeAwareCache<P::Row, P::Key>,
    ready: bool,
    left_done: bool,
    right_done: bool,
}

impl<L, LK, R, RK, P> JoinOperator<L, LK, R, RK, P>
where
    L: CacheItem,
    LK: CacheKey,
    R: CacheItem,
    RK: CacheKey,
    P: Projection<L, LK, R, RK>,
{
    fn resolve(&mut self, affected: HashMap<P::Key, bool>) {
        for (key, refresh_only) in affected {
            if refresh_only && self.output.contains_key(&key) {
                self.output.refresh(&key);
                continue;
            }
            match self.projection.project(&self.state, &key) {
                Some(row) => self.output.add_or_update(row, key),
                None => self.output.remove(&key),
            }
        }
    }
}

fn mark<Q: CacheKey>(affected: &mut HashMap<Q, bool>, keys: Vec<Q>, refresh: bool) {
    for key in keys {
        let entry = affected.entry(key).or_insert(true);
        *entry &= refresh;
    }
}

impl<L, LK, R, RK, P> Operator for JoinOperator<L, LK, R, RK, P>
where
    L: CacheItem,
    LK: CacheKey,
    R: CacheItem,
    RK: CacheKey,
    P: Projection<L, LK, R, RK>,
{
    type Event = JoinEvent<L, LK, R, RK>;
    type Output = ChangeSet<P::Row, P::Key>;

    fn apply(&mut self, event: Self::Event) -> Result<()> {
        let mut affected = HashMap::new();
        match event {
            JoinEvent::Left(changes) => {
                for change in changes {
                    let refresh = change.reason() == ChangeReason::Refresh;
                    if let Some(key) = self.state.apply_left(change) {
                        let mut keys = Vec::new();
                        self.projection.from_left(&self.state, &key, &mut keys);
                        mark(&mut affected, keys, refresh);
                    }
                }
            }
            JoinEvent::Right(changes) => {
                for change in changes {
                    let refresh = change.reason() == ChangeReason::Refresh;
                    if let Some((key, before, after)) = self.state.apply_right(change, &*self.selector) {
                        let moved = before != after;
                        let foreign: Vec<&LK> = before.iter().chain(after.iter()).collect();
                        let mut keys = Vec::new();
                        self.projection.from_right(&self.state, &key, &foreign, &mut keys);
                        mark(&mut affected, keys, refresh && !moved);
                    }
                }
            }
            JoinEvent::LeftCompleted => self.left_done = true,
            JoinEvent::RightCompleted => self.right_done = true,
            JoinEvent::Ready => self.ready = true,
        }
        self.resolve(affected);
        Ok(())
    }

    fn flush(&mut self) -> Emission<Self::Output> {
        if !self.ready {
            return Emission::none();
        }
        let changes = self.output.capture_changes();
        Emission::output((!changes.is_empty()).then_some(changes))
    }

    fn is_completed(&self) -> bool {
        self.ready && self.left_done && self.right_done
    }
}

fn build<L, LK, R, RK, P>(
    left: &Observable<ChangeSet<L, LK>>,
    right: &Observable<ChangeSet<R, RK>>,
    selector: ForeignKeySelector<R, LK>,
    projection: impl Fn() -> P + Send + Sync + 'static,
) -> Observable<ChangeSet<P::Row, P::Key>>
where
    L: CacheItem,
    LK: CacheKey,
    R: CacheItem,
    RK: CacheKey,
    P: Projection<L, LK, R, RK>,
{
    let (left, right) = (left.clone(), right.clone());
    Observable::create(move |subscriber| {
        let operator = JoinOperator {
            state: JoinState::new(),
            projection: projection(),
            selector: selector.clone(),
            output: ChangeAwareCache::new(),
            ready: false,
            left_done: false,
            right_done: false,
        };
        let driver = Driver::new(operator, subscriber);
        let subscription = Subscription::composite([
            driver.subscribe_input(&left, JoinEvent::Left, || JoinEvent::LeftCompleted),
            driver.subscribe_input(&right, JoinEvent::Right, || JoinEvent::RightCompleted),
        ]);
        driver.push(JoinEvent::Ready);
        subscription
    })
}

/// Joins each left item with every right item pointing at it, one row per
/// pair.
pub fn inner_join<L, LK, R, RK, D, S, F>(
    left: &Observable<ChangeSet<L, LK>>,
    right: &Observable<ChangeSet<R, RK>>,
    right_key_selector: S,
    result: F,
) -> Observable<ChangeSet<D, (LK, RK)>>
where
    L: CacheItem,
    LK: CacheKey,
    R: CacheItem,
    RK: CacheKey,
    D: CacheItem,
    S: Fn(&R) -> LK + Send + Sync + 'static,
    F: Fn(&(LK, RK), &L, &R) -> D + Send + Sync + 'static,
{
    let result: PairFn<L, LK, R, RK, D> = Arc::new(result);
    build(left, right, Arc::new(right_key_selector), move || ByPair(result.clone()))
}

/// One row per left item, with its matching right item if any.
pub fn left_join<L, LK, R, RK, D, S, F>(
    left: &Observable<ChangeSet<L, LK>>,
    right: &Observable<ChangeSet<R, RK>>,
    right_key_selector: S,
    result: F,
) -> Observable<ChangeSet<D, LK>>
where
    L: CacheItem,
    LK: CacheKey,
    R: CacheItem,
    RK: CacheKey,
    D: CacheItem,
    S: Fn(&R) -> LK + Send + Sync + 'static,
    F: Fn(&LK, &L, Option<&R>) -> D + Send + Sync + 'static,
{
    let project: LeftFn<L, LK, R, RK, D> = Arc::new(move |key: &LK, left: Option<&L>, group: &Grouping<R, RK, LK>| {
        left.map(|left| result(key, left, group.items().last().map(|(_, r)| r)))
    });
    build(left, right, Arc::new(right_key_selector), move || ByLeftKey(project.clone()))
}

/// One row per right item, with the left item it points at if present.
pub fn right_join<L, LK, R, RK, D, S, F>(
    left: &Observable<ChangeSet<L, LK>>,
    right: &Observable<ChangeSet<R, RK>>,
    right_key_selector: S,
    result: F,
) -> Observable<ChangeSet<D, RK>>
where
    L: CacheItem,
    LK: CacheKey,
    R: CacheItem,
    RK: CacheKey,
    D: CacheItem,
    S: Fn(&R) -> LK + Send + Sync + 'static,
    F: Fn(&RK, Option<&L>, &R) -> D + Send + Sync + 'static,
{
    let result: RightFn<L, R, RK, D> = Arc::new(result);
    build(left, right, Arc::new(right_key_selector), move || ByRightKey(result.clone()))
}

/// One row per left key present on either side.
pub fn full_join<L, LK, R, RK, D, S, F>(
    left: &Observable<ChangeSet<L, LK>>,
    right: &Observable<ChangeSet<R, RK>>,
    right_key_selector: S,
    result: F,
) -> Observable<ChangeSet<D, LK>>
where
    L: CacheItem,
    LK: CacheKey,
    R: CacheItem,
    RK: CacheKey,
    D: CacheItem,
    S: Fn(&R) -> LK + Send + Sync + 'static,
    F: Fn(&LK, Option<&L>, Option<&R>) -> D + Send + Sync + 'static,
{
    let project: LeftFn<L, LK, R, RK, D> = Arc::new(move |key: &LK, left: Option<&L>, group: &Grouping<R, RK, LK>| {
        let right = group.items().last().map(|(_, r)| r);
        (left.is_some() || right.is_some()).then(|| result(key, left, right))
    });
    build(left, right, Arc::new(right_key_selector), move || ByLeftKey(project.clone()))
}

/// One row per left item having at least one match, with all its matches.
pub fn inner_join_many<L, LK, R, RK, D, S, F>(
    left: &Observable<ChangeSet<L, LK>>,
    right: &Observable<ChangeSet<R, RK>>,
    right_key_selector: S,
    result: F,
) -> Observable<ChangeSet<D, LK>>
where
    L: CacheItem,
    LK: CacheKey,
    R: CacheItem,
    RK: CacheKey,
    D: CacheItem,
    S: Fn(&R) -> LK + Send + Sync + 'static,
    F: Fn(&LK, &L, &Grouping<R, RK, LK>) -> D + Send + Sync + 'static,
{
    let project: LeftFn<L, LK, R, RK, D> = Arc::new(move |key: &LK, left: Option<&L>, group: &Grouping<R, RK, LK>| match left {
        Some(left) if !group.is_empty() => Some(result(key, left, group)),
        _ => None,
    });
    build(left, right, Arc::new(right_key_selector), move || ByLeftKey(project.clone()))
}

/// One row per left item with all its matches, possibly none.
pub fn left_join_many<L, LK, R, RK, D, S, F>(
    left: &Observable<ChangeSet<L, LK>>,
    right: &Observable<ChangeSet<R, RK>>,
    right_key_selector: S,
    result: F,
) -> Observable<ChangeSet<D, LK>>
where
    L: CacheItem,
    LK: CacheKey,
    R: CacheItem,
    RK: CacheKey,
    D: CacheItem,
    S: Fn(&R) -> LK + Send + Sync + 'static,
    F: Fn(&LK, &L, &Grouping<R, RK, LK>) -> D + Send + Sync + 'static,
{
    let project: LeftFn<L, LK, R, RK, D> = Arc::new(move |key: &LK, left: Option<&L>, group: &Grouping<R, RK, LK>| {
        left.map(|left| result(key, left, group))
    });
    build(left, right, Arc::new(right_key_selector), move || ByLeftKey(project.clone()))
}

/// One row per left key that right items point at, with the left item if
/// present.
pub fn right_join_many<L, LK, R, RK, D, S, F>(
    left: &Observable<ChangeSet<L, LK>>,
    right: &Observable<ChangeSet<R, RK>>,
    right_key_selector: S,
    result: F,
) -> Observable<ChangeSet<D, LK>>
where
    L: CacheItem,
    LK: CacheKey,
    R: CacheItem,
    RK: CacheKey,
    D: CacheItem,
    S: Fn(&R) -> LK + Send + Sync + 'static,
    F: Fn(&LK, Option<&L>, &Grouping<R, RK, LK>) -> D + Send + Sync + 'static,
{
    let project: LeftFn<L, LK, R, RK, D> = Arc::new(move |key: &LK, left: Option<&L>, group: &Grouping<R, RK, LK>| {
        (!group.is_empty()).then(|| result(key, left, group))
    });
    build(left, right, Arc::new(right_key_selector), move || ByLeftKey(project.clone()))
}

/// One row per left key present on either side, with all matches.
pub fn full_join_many<L, LK, R, RK, D, S, F>(
    left: &Observable<ChangeSet<L, LK>>,
    right: &Observable<ChangeSet<R, RK>>,
    right_key_selector: S,
    result: F,
) -> Observable<ChangeSet<D, LK>>
where
    L: CacheItem,
    LK: CacheKey,
    R: CacheItem,
    RK: CacheKey,
    D: CacheItem,
    S: Fn(&R) -> LK + Send + Sync + 'static,
    F: Fn(&LK, Option<&L>, &Grouping<R, RK, LK>) -> D + Send + Sync + 'static,
{
    let project: LeftFn<L, LK, R, RK, D> = Arc::new(move |key: &LK, left: Option<&L>, group: &Grouping<R, RK, LK>| {
        (left.is_some() || !group.is_empty()).then(|| result(key, left, group))
    });
    build(left, right, Arc::new(right_key_selector), move || ByLeftKey(project.clone()))
}
