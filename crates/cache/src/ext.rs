//! Method-call syntax for the operator library.
//!
//! Every method forwards to the free function of the same name in
//! [`crate::operators`]; operators taking several inputs (joins, set
//! algebra) are only available as free functions.

use crate::binding::{self, BoundList};
use crate::observable_cache::{as_observable_cache, ObservableCache};
use crate::operators::dispose::{self, Disposable};
use crate::operators::filter::{self, Predicate};
use crate::operators::group::{self, Group};
use crate::operators::page::{self, PageRequest, PagedChangeSet, VirtualChangeSet, VirtualRequest};
use crate::operators::sort::{self, SortComparer, SortedChangeSet};
use crate::operators::{distinct, expire, limit, misc, transform};
use crate::{BindingOptions, FilterOptions, SortOptions, TransformOptions};
use keyflux_core::{CacheItem, CacheKey, ChangeReason, ChangeSet, Error, Result};
use keyflux_reactive::{Observable, Scheduler};
use std::sync::Arc;
use std::time::Duration;

/// Operators on a stream of change sets.
pub trait ChangeSetStreamExt<T, K> {
    fn filter<P>(&self, predicate: P) -> Observable<ChangeSet<T, K>>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static;

    fn filter_with<P>(&self, predicate: P, options: FilterOptions) -> Observable<ChangeSet<T, K>>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static;

    fn filter_immutable<P>(&self, predicate: P) -> Observable<ChangeSet<T, K>>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static;

    fn filter_dynamic(&self, predicates: &Observable<Predicate<T>>, reapply: Option<&Observable<()>>) -> Observable<ChangeSet<T, K>>;

    fn filter_on_state<S, P>(&self, state: &Observable<S>, predicate: P) -> Observable<ChangeSet<T, K>>
    where
        S: Clone + Send + Sync + 'static,
        P: Fn(&S, &T) -> bool + Send + Sync + 'static;

    fn filter_on_observable<F>(&self, selector: F) -> Observable<ChangeSet<T, K>>
    where
        F: Fn(&T, &K) -> Observable<bool> + Send + Sync + 'static;

    fn transform<U, F>(&self, f: F) -> Observable<ChangeSet<U, K>>
    where
        U: CacheItem,
        F: Fn(&T) -> U + Send + Sync + 'static;

    fn transform_with_options<U, F>(&self, f: F, options: TransformOptions) -> Observable<ChangeSet<U, K>>
    where
        U: CacheItem,
        F: Fn(&T, &K) -> U + Send + Sync + 'static;

    fn try_transform<U, F>(&self, f: F) -> Observable<ChangeSet<U, K>>
    where
        U: CacheItem,
        F: Fn(&T, &K) -> Result<U> + Send + Sync + 'static;

    fn transform_safe<U, F, E>(&self, f: F, on_error: E) -> Observable<ChangeSet<U, K>>
    where
        U: CacheItem,
        F: Fn(&T, &K) -> Result<U> + Send + Sync + 'static,
        E: Fn(&K, &Error) + Send + Sync + 'static;

    fn sort(&self, comparer: SortComparer<T>) -> Observable<SortedChangeSet<T, K>>;

    fn sort_with_options(&self, comparer: SortComparer<T>, options: SortOptions) -> Observable<SortedChangeSet<T, K>>;

    fn group_on<G, F>(&self, selector: F) -> Observable<ChangeSet<Group<T, K, G>, G>>
    where
        G: CacheKey,
        F: Fn(&T) -> G + Send + Sync + 'static;

    fn group_on_observable<G, F>(&self, selector: F) -> Observable<ChangeSet<Group<T, K, G>, G>>
    where
        G: CacheKey,
        F: Fn(&T, &K) -> Observable<G> + Send + Sync + 'static;

    fn expire_after<F>(&self, lifetime: F, scheduler: Arc<dyn Scheduler>) -> Observable<ChangeSet<T, K>>
    where
        F: Fn(&T) -> Option<Duration> + Send + Sync + 'static;

    fn limit_size_to(&self, size: usize) -> Result<Observable<ChangeSet<T, K>>>;

    fn dispose_many(&self) -> Observable<ChangeSet<T, K>>
    where
        T: Disposable;

    fn distinct_values<V, F>(&self, selector: F) -> Observable<ChangeSet<V, V>>
    where
        V: CacheKey,
        F: Fn(&T) -> V + Send + Sync + 'static;

    fn change_key<K2, F>(&self, selector: F) -> Observable<ChangeSet<T, K2>>
    where
        K2: CacheKey,
        F: Fn(&K, &T) -> K2 + Send + Sync + 'static;

    fn where_reasons_are(&self, reasons: &[ChangeReason]) -> Result<Observable<ChangeSet<T, K>>>;

    fn where_reasons_are_not(&self, reasons: &[ChangeReason]) -> Result<Observable<ChangeSet<T, K>>>;

    fn on_item_added<F>(&self, action: F) -> Observable<ChangeSet<T, K>>
    where
        F: Fn(&T) + Send + Sync + 'static;

    fn on_item_removed<F>(&self, action: F) -> Observable<ChangeSet<T, K>>
    where
        F: Fn(&T) + Send + Sync + 'static;

    fn bind(&self, target: BoundList<T>) -> Observable<ChangeSet<T, K>>;

    fn as_observable_cache(&self) -> ObservableCache<T, K>;
}

impl<T, K> ChangeSetStreamExt<T, K> for Observable<ChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
{
    fn filter<P>(&self, predicate: P) -> Observable<ChangeSet<T, K>>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        filter::filter(self, predicate)
    }

    fn filter_with<P>(&self, predicate: P, options: FilterOptions) -> Observable<ChangeSet<T, K>>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        filter::filter_with(self, predicate, options)
    }

    fn filter_immutable<P>(&self, predicate: P) -> Observable<ChangeSet<T, K>>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        filter::filter_immutable(self, predicate)
    }

    fn filter_dynamic(&self, predicates: &Observable<Predicate<T>>, reapply: Option<&Observable<()>>) -> Observable<ChangeSet<T, K>> {
        filter::filter_dynamic(self, predicates, reapply)
    }

    fn filter_on_state<S, P>(&self, state: &Observable<S>, predicate: P) -> Observable<ChangeSet<T, K>>
    where
        S: Clone + Send + Sync + 'static,
        P: Fn(&S, &T) -> bool + Send + Sync + 'static,
    {
        filter::filter_on_state(self, state, predicate)
    }

    fn filter_on_observable<F>(&self, selector: F) -> Observable<ChangeSet<T, K>>
    where
        F: Fn(&T, &K) -> Observable<bool> + Send + Sync + 'static,
    {
        filter::filter_on_observable(self, selector)
    }

    fn transform<U, F>(&self, f: F) -> Observable<ChangeSet<U, K>>
    where
        U: CacheItem,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        transform::transform(self, f)
    }

    fn transform_with_options<U, F>(&self, f: F, options: TransformOptions) -> Observable<ChangeSet<U, K>>
    where
        U: CacheItem,
        F: Fn(&T, &K) -> U + Send + Sync + 'static,
    {
        transform::transform_with_options(self, f, options)
    }

    fn try_transform<U, F>(&self, f: F) -> Observable<ChangeSet<U, K>>
    where
        U: CacheItem,
        F: Fn(&T, &K) -> Result<U> + Send + Sync + 'static,
    {
        transform::try_transform(self, f)
    }

    fn transform_safe<U, F, E>(&self, f: F, on_error: E) -> Observable<ChangeSet<U, K>>
    where
        U: CacheItem,
        F: Fn(&T, &K) -> Result<U> + Send + Sync + 'static,
        E: Fn(&K, &Error) + Send + Sync + 'static,
    {
        transform::transform_safe(self, f, on_error)
    }

    fn sort(&self, comparer: SortComparer<T>) -> Observable<SortedChangeSet<T, K>> {
        sort::sort(self, comparer)
    }

    fn sort_with_options(&self, comparer: SortComparer<T>, options: SortOptions) -> Observable<SortedChangeSet<T, K>> {
        sort::sort_with_options(self, comparer, options)
    }

    fn group_on<G, F>(&self, selector: F) -> Observable<ChangeSet<Group<T, K, G>, G>>
    where
        G: CacheKey,
        F: Fn(&T) -> G + Send + Sync + 'static,
    {
        group::group_on(self, selector)
    }

    fn group_on_observable<G, F>(&self, selector: F) -> Observable<ChangeSet<Group<T, K, G>, G>>
    where
        G: CacheKey,
        F: Fn(&T, &K) -> Observable<G> + Send + Sync + 'static,
    {
        group::group_on_observable(self, selector)
    }

    fn expire_after<F>(&self, lifetime: F, scheduler: Arc<dyn Scheduler>) -> Observable<ChangeSet<T, K>>
    where
        F: Fn(&T) -> Option<Duration> + Send + Sync + 'static,
    {
        expire::expire_after(self, lifetime, scheduler)
    }

    fn limit_size_to(&self, size: usize) -> Result<Observable<ChangeSet<T, K>>> {
        limit::limit_size_to(self, size)
    }

    fn dispose_many(&self) -> Observable<ChangeSet<T, K>>
    where
        T: Disposable,
    {
        dispose::dispose_many(self)
    }

    fn distinct_values<V, F>(&self, selector: F) -> Observable<ChangeSet<V, V>>
    where
        V: CacheKey,
        F: Fn(&T) -> V + Send + Sync + 'static,
    {
        distinct::distinct_values(self, selector)
    }

    fn change_key<K2, F>(&self, selector: F) -> Observable<ChangeSet<T, K2>>
    where
        K2: CacheKey,
        F: Fn(&K, &T) -> K2 + Send + Sync + 'static,
    {
        misc::change_key(self, selector)
    }

    fn where_reasons_are(&self, reasons: &[ChangeReason]) -> Result<Observable<ChangeSet<T, K>>> {
        misc::where_reasons_are(self, reasons)
    }

    fn where_reasons_are_not(&self, reasons: &[ChangeReason]) -> Result<Observable<ChangeSet<T, K>>> {
        misc::where_reasons_are_not(self, reasons)
    }

    fn on_item_added<F>(&self, action: F) -> Observable<ChangeSet<T, K>>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        misc::on_item_added(self, action)
    }

    fn on_item_removed<F>(&self, action: F) -> Observable<ChangeSet<T, K>>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        misc::on_item_removed(self, action)
    }

    fn bind(&self, target: BoundList<T>) -> Observable<ChangeSet<T, K>> {
        binding::bind(self, target)
    }

    fn as_observable_cache(&self) -> ObservableCache<T, K> {
        as_observable_cache(self)
    }
}

/// Operators on a stream of sorted change sets.
pub trait SortedStreamExt<T, K> {
    fn page(&self, requests: &Observable<PageRequest>) -> Observable<PagedChangeSet<T, K>>;

    fn virtualise(&self, requests: &Observable<VirtualRequest>) -> Observable<VirtualChangeSet<T, K>>;

    fn top(&self, size: usize) -> Result<Observable<VirtualChangeSet<T, K>>>;

    fn bind_sorted(&self, target: BoundList<T>, options: BindingOptions) -> Observable<SortedChangeSet<T, K>>;
}

impl<T, K> SortedStreamExt<T, K> for Observable<SortedChangeSet<T, K>>
where
    T: CacheItem,
    K: CacheKey,
{
    fn page(&self, requests: &Observable<PageRequest>) -> Observable<PagedChangeSet<T, K>> {
        page::page(self, requests)
    }

    fn virtualise(&self, requests: &Observable<VirtualRequest>) -> Observable<VirtualChangeSet<T, K>> {
        page::virtualise(self, requests)
    }

    fn top(&self, size: usize) -> Result<Observable<VirtualChangeSet<T, K>>> {
        page::top(self, size)
    }

    fn bind_sorted(&self, target: BoundList<T>, options: BindingOptions) -> Observable<SortedChangeSet<T, K>> {
        binding::bind_sorted(self, target, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceCache;
    use parking_lot::{Mutex, RwLock};

    #[derive(Clone, Debug, PartialEq)]
    struct Trade {
        id: u32,
        symbol: &'static str,
        price: u32,
    }

    fn make_trade(id: u32, symbol: &'static str, price: u32) -> Trade {
        Trade { id, symbol, price }
    }

    #[test]
    fn test_chained_pipeline() {
        let cache = SourceCache::new(|t: &Trade| t.id);
        cache
            .add_or_update_many(vec![make_trade(1, "ABC", 30), make_trade(2, "XYZ", 10), make_trade(3, "ABC", 20)])
            .unwrap();

        let list: BoundList<u32> = Arc::new(RwLock::new(Vec::new()));
        let _sub = cache
            .connect()
            .filter(|t| t.symbol == "ABC")
            .transform(|t| t.price)
            .sort(SortComparer::ascending(|p: &u32| *p))
            .bind_sorted(list.clone(), BindingOptions::default())
            .subscribe_next(|_| {});
        assert_eq!(*list.read(), vec![20, 30]);

        cache.add_or_update(make_trade(2, "ABC", 5)).unwrap();
        assert_eq!(*list.read(), vec![5, 20, 30]);
    }

    #[test]
    fn test_distinct_symbols() {
        let cache = SourceCache::new(|t: &Trade| t.id);
        let symbols = Arc::new(Mutex::new(Vec::new()));
        let sink = symbols.clone();
        let _sub = cache
            .connect()
            .distinct_values(|t| t.symbol)
            .subscribe_next(move |changes: ChangeSet<&str, &str>| sink.lock().push(changes.summary()));

        cache
            .add_or_update_many(vec![make_trade(1, "ABC", 1), make_trade(2, "ABC", 2), make_trade(3, "XYZ", 3)])
            .unwrap();
        cache.remove_key(&1).unwrap();
        cache.remove_key(&3).unwrap();

        let symbols = symbols.lock();
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].adds, 2);
        assert_eq!(symbols[1].removes, 1);
    }
}
