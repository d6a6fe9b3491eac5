//! keyflux core - change model and keyed cache storage.
//!
//! This crate provides the leaf data structures of the keyflux change-set
//! pipeline:
//!
//! - `Change` / `ChangeReason`: one atomic mutation of one key
//! - `ChangeSet`: an ordered batch of changes produced by one edit
//! - `reduce`: the per-key combination rules applied inside a batch
//! - `Cache`: the plain keyed store every stage mirrors its state into
//! - `ChangeAwareCache`: a cache that records and reduces its own changes
//! - `CacheUpdater`: the write boundary handed to an edit batch, including
//!   the `edit_diff` replacement algorithm
//! - `Error`: error types shared by every crate in the workspace
//!
//! # Example
//!
//! ```rust
//! use keyflux_core::{CacheUpdater, ChangeAwareCache};
//!
//! let mut cache = ChangeAwareCache::new();
//! let key_of = |item: &(u32, &'static str)| item.0;
//!
//! let mut updater = CacheUpdater::new(&mut cache, &key_of);
//! updater.add_or_update((1, "one"));
//! updater.add_or_update((2, "two"));
//! updater.remove_key(&1);
//!
//! let changes = cache.capture_changes();
//! assert_eq!(changes.adds(), 1);
//! assert_eq!(changes.len(), 1);
//! ```

#![no_std]

extern crate alloc;

mod cache;
mod change;
mod change_aware;
mod change_set;
mod error;
mod reducer;
mod updater;

pub use cache::{Cache, IgnoreCase};
pub use change::{Change, ChangeReason};
pub use change_aware::ChangeAwareCache;
pub use change_set::{ChangeSet, ChangeSummary};
pub use error::{Error, Result};
pub use reducer::reduce;
pub use updater::{CacheUpdater, KeySelector};

use core::hash::Hash;

/// Values that can be stored in a keyed cache and pushed through pipelines.
pub trait CacheItem: Clone + Send + Sync + 'static {}

impl<T> CacheItem for T where T: Clone + Send + Sync + 'static {}

/// Keys identifying cached values.
pub trait CacheKey: Clone + Eq + Hash + Send + Sync + 'static {}

impl<K> CacheKey for K where K: Clone + Eq + Hash + Send + Sync + 'static {}
