//! Serialized delivery of events raised by several producers.
//!
//! Operators merging more than one upstream feed their events through a
//! `SerialQueue`. Whichever caller finds the queue idle becomes the drainer
//! and applies every queued event, including events raised re-entrantly from
//! inside `apply` or concurrently from other threads. The other callers only
//! enqueue and return.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A work-in-progress drain queue.
pub struct SerialQueue<E> {
    queue: Mutex<VecDeque<E>>,
    wip: AtomicUsize,
}

impl<E> Default for SerialQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> SerialQueue<E> {
    /// Creates an idle queue.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            wip: AtomicUsize::new(0),
        }
    }

    /// Enqueues `event` and drains the queue if no other caller is draining.
    ///
    /// `apply` is called for each event in arrival order. `flush` is called
    /// each time the drainer empties the queue after applying at least one
    /// event, so events raised while applying are folded into the same
    /// flush. Every caller must pass handlers with the same behavior, since
    /// any of them may end up applying another caller's event.
    pub fn run<A, F>(&self, event: E, mut apply: A, mut flush: F)
    where
        A: FnMut(E),
        F: FnMut(),
    {
        self.queue.lock().push_back(event);
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        let mut missed = 1;
        loop {
            let mut applied = false;
            loop {
                let next = self.queue.lock().pop_front();
                match next {
                    Some(event) => {
                        apply(event);
                        applied = true;
                    }
                    None => break,
                }
            }
            if applied {
                flush();
            }

            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }

    /// Returns true while a drainer is active.
    pub fn is_draining(&self) -> bool {
        self.wip.load(Ordering::Acquire) != 0
    }
}
