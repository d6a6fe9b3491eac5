//! Change-set operators.
//!
//! Every stateful operator is a plain state machine implementing
//! [`Operator`], driven by a [`Driver`] that serializes the events of all its
//! inputs (upstream batches, trigger streams, timers) and emits what the
//! state machine produced once the queue is drained. The state machines are
//! unit tested directly; the wiring functions only connect inputs.

pub mod combine;
pub mod dispose;
pub mod distinct;
pub mod expire;
pub mod filter;
pub mod group;
pub mod join;
pub mod limit;
pub mod misc;
pub mod page;
pub mod sort;
pub mod transform;

use keyflux_core::{Error, Result};
use keyflux_reactive::{FnObserver, Observable, Observer, SerialQueue, Subscriber, Subscription};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// A side effect run around an emission.
pub(crate) type Effect = Box<dyn FnOnce() + Send>;

/// What an operator releases when its queue drains.
pub(crate) struct Emission<O> {
    pub(crate) before: Vec<Effect>,
    pub(crate) output: Option<O>,
    pub(crate) after: Vec<Effect>,
}

impl<O> Emission<O> {
    pub(crate) fn none() -> Self {
        Self {
            before: Vec::new(),
            output: None,
            after: Vec::new(),
        }
    }

    pub(crate) fn output(output: Option<O>) -> Self {
        Self {
            before: Vec::new(),
            output,
            after: Vec::new(),
        }
    }
}

/// A state machine consuming serialized events.
pub(crate) trait Operator: Send + 'static {
    type Event: Send + 'static;
    type Output: 'static;

    /// Applies one event. An error is terminal for the output stream.
    fn apply(&mut self, event: Self::Event) -> Result<()>;

    /// Releases everything produced since the last flush.
    fn flush(&mut self) -> Emission<Self::Output>;

    /// Returns true once the output stream should complete.
    fn is_completed(&self) -> bool;
}

enum Input<E> {
    Event(E),
    Failed(Error),
}

/// Serializes the inputs of one operator instance.
pub(crate) struct Driver<O: Operator> {
    queue: SerialQueue<Input<O::Event>>,
    state: Mutex<O>,
    failure: Mutex<Option<Error>>,
    subscriber: Subscriber<O::Output>,
}

impl<O: Operator> Driver<O> {
    pub(crate) fn new(operator: O, subscriber: Subscriber<O::Output>) -> Arc<Self> {
        Arc::new(Self {
            queue: SerialQueue::new(),
            state: Mutex::new(operator),
            failure: Mutex::new(None),
            subscriber,
        })
    }

    /// Locks the state for setup outside the event flow.
    pub(crate) fn state(&self) -> MutexGuard<'_, O> {
        self.state.lock()
    }

    pub(crate) fn push(&self, event: O::Event) {
        self.run(Input::Event(event));
    }

    pub(crate) fn fail(&self, error: Error) {
        self.run(Input::Failed(error));
    }

    fn run(&self, input: Input<O::Event>) {
        self.queue.run(input, |input| self.apply(input), || self.flush());
    }

    fn apply(&self, input: Input<O::Event>) {
        if self.subscriber.is_stopped() {
            return;
        }
        let result = match input {
            Input::Event(event) => self.state.lock().apply(event),
            Input::Failed(error) => Err(error),
        };
        if let Err(error) = result {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(error);
            }
        }
    }

    fn flush(&self) {
        if self.subscriber.is_stopped() {
            return;
        }
        let failure = self.failure.lock().take();
        if let Some(error) = failure {
            tracing::debug!(%error, "operator failed");
            self.subscriber.on_error(error);
            return;
        }

        let (emission, completed) = {
            let mut state = self.state.lock();
            (state.flush(), state.is_completed())
        };
        for effect in emission.before {
            effect();
        }
        if let Some(output) = emission.output {
            self.subscriber.on_next(output);
        }
        for effect in emission.after {
            effect();
        }
        if completed {
            self.subscriber.on_completed();
        }
    }

    /// Feeds an input stream into the queue.
    pub(crate) fn subscribe_input<I, N, C>(self: &Arc<Self>, source: &Observable<I>, next: N, completed: C) -> Subscription
    where
        I: 'static,
        N: Fn(I) -> O::Event + Send + Sync + 'static,
        C: Fn() -> O::Event + Send + Sync + 'static,
    {
        let (on_next, on_error, on_completed) = (self.clone(), self.clone(), self.clone());
        source.subscribe(
            FnObserver::new(move |value| on_next.push(next(value)))
                .with_error(move |error| on_error.fail(error))
                .with_completed(move || on_completed.push(completed())),
        )
    }
}

/// Forwards errors and completion of `source` while `next` handles values.
pub(crate) fn forward<I, O, N>(source: &Observable<I>, subscriber: Subscriber<O>, next: N) -> Subscription
where
    I: 'static,
    O: 'static,
    N: Fn(&Subscriber<O>, I) + Send + Sync + 'static,
{
    let (on_error, on_completed) = (subscriber.clone(), subscriber.clone());
    source.subscribe(
        FnObserver::new(move |value| next(&subscriber, value))
            .with_error(move |error| on_error.on_error(error))
            .with_completed(move || on_completed.on_completed()),
    )
}
