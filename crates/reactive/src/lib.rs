//! keyflux reactive - push-stream primitives.
//!
//! This crate provides the small push-based stream model every keyflux
//! operator is built on.
//!
//! # Core Concepts
//!
//! - `Observer`: receives `on_next`, `on_error` and `on_completed`
//! - `Observable`: a cold stream; each subscription runs its own pipeline
//! - `Subscription`: the RAII cancellation handle returned by `subscribe`
//! - `Subject` / `BehaviorSubject`: hot multicast streams fed by their owner
//! - `SerialQueue`: serializes events merged from several upstreams
//! - `Scheduler`: the time source used by timed operators
//!
//! # Example
//!
//! ```rust
//! use keyflux_reactive::{Observer, Subject};
//! use std::sync::{Arc, Mutex};
//!
//! let subject = Subject::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//!
//! let subscription = subject
//!     .as_observable()
//!     .map(|v: i32| v * 2)
//!     .subscribe_next(move |v| sink.lock().unwrap().push(v));
//!
//! subject.on_next(1);
//! drop(subscription);
//! subject.on_next(2);
//!
//! assert_eq!(*seen.lock().unwrap(), vec![2]);
//! ```

pub mod observable;
pub mod observer;
pub mod scheduler;
pub mod serial;
pub mod subject;
pub mod subscription;

pub use observable::{Observable, Subscriber};
pub use observer::{FnObserver, Observer};
pub use scheduler::{Action, Scheduler, TestScheduler, ThreadScheduler};
pub use serial::SerialQueue;
pub use subject::{BehaviorSubject, Subject};
pub use subscription::{Subscription, SubscriptionId, SubscriptionManager};

// Re-export the error model shared with the core crate
pub use keyflux_core::{Error, Result};
