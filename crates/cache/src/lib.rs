//! keyflux - reactive keyed collection caches.
//!
//! Items enter through a [`SourceCache`]. Every edit batch is reduced per
//! key and published as one [`ChangeSet`]; downstream operators consume
//! change sets and maintain their own state incrementally, so no stage ever
//! recomputes its output from scratch.
//!
//! # Core Concepts
//!
//! - `SourceCache`: the writable root of a pipeline
//! - `ChangeSet`: the net changes of one batch, one change per key
//! - Operators: filter, transform, sort, page, group, join, set algebra,
//!   expiry, size limiting and disposal, all in [`operators`]
//! - `ObservableCache`: a read-only cache materialized from any stream
//! - Binding adaptors: keep a plain `Vec` in step with a stream
//!
//! # Example
//!
//! ```rust
//! use keyflux::{ChangeSetStreamExt, SourceCache};
//! use std::sync::{Arc, Mutex};
//!
//! let cache = SourceCache::new(|name: &&str| *name);
//! cache.add_or_update("one").unwrap();
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//! let _subscription = cache
//!     .connect()
//!     .filter(|name| name.starts_with('t'))
//!     .subscribe_next(move |changes| sink.lock().unwrap().push(changes.len()));
//!
//! cache.add_or_update_many(vec!["two", "three"]).unwrap();
//! assert_eq!(*seen.lock().unwrap(), vec![2]);
//! ```

pub mod binding;
pub mod ext;
pub mod observable_cache;
pub mod operators;
pub mod options;
pub mod source_cache;
mod store;

pub use binding::{bind, bind_sorted, BoundList, ListAdaptor, SortedListAdaptor};
pub use ext::{ChangeSetStreamExt, SortedStreamExt};
pub use observable_cache::{as_observable_cache, ObservableCache};
pub use operators::combine::{and, except, or, xor, CombineOperation};
pub use operators::dispose::{Disposable, Disposal};
pub use operators::group::{Group, Grouping};
pub use operators::page::{PageRequest, PageResponse, PagedChangeSet, VirtualChangeSet, VirtualRequest, VirtualResponse};
pub use operators::sort::{SortComparer, SortReason, SortedChangeSet};
pub use options::{BindingOptions, ConnectOptions, FilterOptions, SortOptions, TransformOptions};
pub use source_cache::SourceCache;

pub use keyflux_core::{
    Cache, CacheItem, CacheKey, CacheUpdater, Change, ChangeAwareCache, ChangeReason, ChangeSet, ChangeSummary, Error,
    IgnoreCase, Result,
};
pub use keyflux_reactive::{
    BehaviorSubject, FnObserver, Observable, Observer, Scheduler, Subject, Subscription, TestScheduler, ThreadScheduler,
};
