//! Observer side of the push protocol.

use keyflux_core::Error;

/// Receives the three signals of a push stream.
///
/// After `on_error` or `on_completed` no further signal is delivered.
pub trait Observer<T>: Send + Sync {
    /// Delivers the next value.
    fn on_next(&self, value: T);

    /// Terminates the stream with an error.
    fn on_error(&self, error: Error);

    /// Terminates the stream normally.
    fn on_completed(&self);
}

type NextFn<T> = Box<dyn Fn(T) + Send + Sync>;
type ErrorFn = Box<dyn Fn(Error) + Send + Sync>;
type CompletedFn = Box<dyn Fn() + Send + Sync>;

/// An observer assembled from closures.
///
/// A missing error handler logs the error; a missing completion handler
/// ignores completion.
pub struct FnObserver<T> {
    next: NextFn<T>,
    error: Option<ErrorFn>,
    completed: Option<CompletedFn>,
}

impl<T> FnObserver<T> {
    /// Creates an observer handling values only.
    pub fn new<F>(next: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            next: Box::new(next),
            error: None,
            completed: None,
        }
    }

    /// Sets the error handler.
    pub fn with_error<F>(mut self, error: F) -> Self
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        self.error = Some(Box::new(error));
        self
    }

    /// Sets the completion handler.
    pub fn with_completed<F>(mut self, completed: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.completed = Some(Box::new(completed));
        self
    }
}

impl<T> Observer<T> for FnObserver<T> {
    fn on_next(&self, value: T) {
        (self.next)(value);
    }

    fn on_error(&self, error: Error) {
        match &self.error {
            Some(handler) => handler(error),
            None => tracing::warn!(%error, "unhandled stream error"),
        }
    }

    fn on_completed(&self) {
        if let Some(handler) = &self.completed {
            handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_fn_observer_routes_signals() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (l1, l2, l3) = (log.clone(), log.clone(), log.clone());

        let observer = FnObserver::new(move |v: i32| l1.lock().push(format!("next {}", v)))
            .with_error(move |e| l2.lock().push(format!("error {}", e)))
            .with_completed(move || l3.lock().push("done".to_string()));

        observer.on_next(1);
        observer.on_error(Error::source("x"));
        observer.on_completed();

        assert_eq!(
            *log.lock(),
            vec!["next 1".to_string(), "error Source error: x".to_string(), "done".to_string()]
        );
    }

    #[test]
    fn test_fn_observer_without_handlers() {
        let observer = FnObserver::new(|_: i32| {});
        observer.on_error(Error::source("ignored"));
        observer.on_completed();
    }
}
