//! Time sources for timed operators.
//!
//! Time is a `Duration` measured from the scheduler's own epoch. The
//! `TestScheduler` is a virtual clock advanced by hand; the `ThreadScheduler`
//! runs actions on a dedicated timer thread.

use crate::subscription::Subscription;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// A scheduled unit of work.
pub type Action = Box<dyn FnOnce() + Send>;

/// Runs actions at points in time.
pub trait Scheduler: Send + Sync {
    /// Returns the current time since the scheduler's epoch.
    fn now(&self) -> Duration;

    /// Runs `action` once `due` is reached. Cancelling the returned
    /// subscription before then drops the action unrun.
    fn schedule_at(&self, due: Duration, action: Action) -> Subscription;

    /// Runs `action` after `delay`.
    fn schedule_after(&self, delay: Duration, action: Action) -> Subscription {
        self.schedule_at(self.now().saturating_add(delay), action)
    }
}

type Timeline = BTreeMap<(Duration, u64), Action>;

struct VirtualClock {
    now: Duration,
    queue: Timeline,
    next_id: u64,
}

/// A virtual-time scheduler for tests.
///
/// Actions run only from `advance_to`, `advance_by` or `start`, on the
/// calling thread, in due-time order. Actions scheduled for the same instant
/// run in scheduling order.
#[derive(Clone)]
pub struct TestScheduler {
    clock: Arc<Mutex<VirtualClock>>,
}

impl Default for TestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TestScheduler {
    /// Creates a scheduler at time zero.
    pub fn new() -> Self {
        Self {
            clock: Arc::new(Mutex::new(VirtualClock {
                now: Duration::ZERO,
                queue: BTreeMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Advances the clock to `target`, running every action due until then.
    pub fn advance_to(&self, target: Duration) {
        loop {
            let action = {
                let mut clock = self.clock.lock();
                let due = match clock.queue.keys().next() {
                    Some(&(due, id)) if due <= target => (due, id),
                    _ => break,
                };
                if due.0 > clock.now {
                    clock.now = due.0;
                }
                clock.queue.remove(&due)
            };
            if let Some(action) = action {
                action();
            }
        }
        let mut clock = self.clock.lock();
        if target > clock.now {
            clock.now = target;
        }
    }

    /// Advances the clock by `delta`.
    pub fn advance_by(&self, delta: Duration) {
        let target = self.now().saturating_add(delta);
        self.advance_to(target);
    }

    /// Runs every pending action, including actions scheduled while running.
    pub fn start(&self) {
        loop {
            let last = self.clock.lock().queue.keys().next_back().map(|&(due, _)| due);
            match last {
                Some(due) => self.advance_to(due),
                None => break,
            }
        }
    }

    /// Returns the number of actions waiting to run.
    pub fn pending_count(&self) -> usize {
        self.clock.lock().queue.len()
    }
}

impl Scheduler for TestScheduler {
    fn now(&self) -> Duration {
        self.clock.lock().now
    }

    fn schedule_at(&self, due: Duration, action: Action) -> Subscription {
        let slot = {
            let mut clock = self.clock.lock();
            let due = due.max(clock.now);
            let id = clock.next_id;
            clock.next_id += 1;
            clock.queue.insert((due, id), action);
            (due, id)
        };
        let weak: Weak<Mutex<VirtualClock>> = Arc::downgrade(&self.clock);
        Subscription::new(move || {
            if let Some(clock) = weak.upgrade() {
                clock.lock().queue.remove(&slot);
            }
        })
    }
}

struct TimerState {
    queue: Timeline,
    next_id: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    signal: Condvar,
    epoch: Instant,
}

struct TimerShutdown {
    shared: Arc<TimerShared>,
}

impl Drop for TimerShutdown {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.signal.notify_all();
    }
}

/// A wall-clock scheduler backed by one timer thread.
///
/// The thread stops once every clone of the scheduler has been dropped.
/// Actions run on the timer thread, one at a time.
#[derive(Clone)]
pub struct ThreadScheduler {
    shared: Arc<TimerShared>,
    _shutdown: Arc<TimerShutdown>,
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadScheduler {
    /// Starts the timer thread.
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                queue: BTreeMap::new(),
                next_id: 0,
                shutdown: false,
            }),
            signal: Condvar::new(),
            epoch: Instant::now(),
        });
        let worker = shared.clone();
        thread::spawn(move || run_timer(&worker));
        tracing::debug!("timer thread started");
        Self {
            _shutdown: Arc::new(TimerShutdown {
                shared: shared.clone(),
            }),
            shared,
        }
    }
}

fn run_timer(shared: &TimerShared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            tracing::debug!(pending = state.queue.len(), "timer thread stopped");
            return;
        }
        let next = state.queue.keys().next().copied();
        match next {
            None => shared.signal.wait(&mut state),
            Some(slot) => {
                let now = shared.epoch.elapsed();
                if slot.0 <= now {
                    if let Some(action) = state.queue.remove(&slot) {
                        MutexGuard::unlocked(&mut state, action);
                    }
                } else {
                    shared.signal.wait_for(&mut state, slot.0 - now);
                }
            }
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn now(&self) -> Duration {
        self.shared.epoch.elapsed()
    }

    fn schedule_at(&self, due: Duration, action: Action) -> Subscription {
        let slot = {
            let mut state = self.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.queue.insert((due, id), action);
            (due, id)
        };
        self.shared.signal.notify_all();

        let weak = Arc::downgrade(&self.shared);
        Subscription::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.state.lock().queue.remove(&slot);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn make_log() -> Arc<Mutex<Vec<u64>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push_action(log: &Arc<Mutex<Vec<u64>>>, tag: u64) -> Action {
        let log = log.clone();
        Box::new(move || log.lock().push(tag))
    }

    #[test]
    fn test_scheduler_runs_in_due_order() {
        let scheduler = TestScheduler::new();
        let log = make_log();
        let _a = scheduler.schedule_at(Duration::from_secs(3), push_action(&log, 3));
        let _b = scheduler.schedule_at(Duration::from_secs(1), push_action(&log, 1));
        let _c = scheduler.schedule_at(Duration::from_secs(1), push_action(&log, 11));

        scheduler.advance_to(Duration::from_secs(2));
        assert_eq!(*log.lock(), vec![1, 11]);
        assert_eq!(scheduler.now(), Duration::from_secs(2));

        scheduler.advance_by(Duration::from_secs(1));
        assert_eq!(*log.lock(), vec![1, 11, 3]);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_scheduler_cancel() {
        let scheduler = TestScheduler::new();
        let log = make_log();
        let sub = scheduler.schedule_after(Duration::from_secs(1), push_action(&log, 1));
        drop(sub);
        scheduler.start();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_scheduler_far_future_saturates() {
        let scheduler = TestScheduler::new();
        let log = make_log();
        scheduler.advance_to(Duration::from_millis(1));
        let _far = scheduler.schedule_after(Duration::MAX, push_action(&log, 1));

        scheduler.advance_by(Duration::MAX);
        assert_eq!(scheduler.now(), Duration::MAX);
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn test_scheduler_actions_scheduling_actions() {
        let scheduler = TestScheduler::new();
        let log = make_log();
        let (s, l) = (scheduler.clone(), log.clone());
        let _sub = scheduler.schedule_at(
            Duration::from_secs(1),
            Box::new(move || {
                l.lock().push(1);
                std::mem::forget(s.schedule_after(Duration::from_secs(1), push_action(&l, 2)));
            }),
        );

        scheduler.start();
        assert_eq!(*log.lock(), vec![1, 2]);
        assert_eq!(scheduler.now(), Duration::from_secs(2));
    }

    #[test]
    fn test_thread_scheduler_runs_action() {
        let scheduler = ThreadScheduler::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let _sub = scheduler.schedule_after(
            Duration::from_millis(5),
            Box::new(move || {
                let _ = tx.lock().send(7);
            }),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }
}
