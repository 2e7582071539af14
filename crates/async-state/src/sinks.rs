//! Observers for errors raised by background work
//!
//! Components that refresh or fetch in the background have no caller to hand
//! an error back to. They report through an `ErrorSinks` handle instead. When
//! nothing is registered the error is logged.

use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::error;

use crate::listeners::Listeners;
use crate::subscription::Subscription;

/// Receives `(location, error)` for each captured error.
pub type ErrorSink = dyn Fn(&str, &(dyn std::error::Error + 'static)) + Send + Sync;

/// Shared registry of error observers. Clones share registrations.
#[derive(Clone)]
pub struct ErrorSinks {
    sinks: Arc<Mutex<Listeners<ErrorSink>>>,
}

impl Default for ErrorSinks {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorSinks {
    pub fn new() -> Self {
        Self {
            sinks: Arc::new(Mutex::new(Listeners::new())),
        }
    }

    pub fn register(
        &self,
        sink: impl Fn(&str, &(dyn std::error::Error + 'static)) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.sinks.lock().insert(Arc::new(sink), false);
        let weak: Weak<Mutex<Listeners<ErrorSink>>> = Arc::downgrade(&self.sinks);
        Subscription::new(move || {
            if let Some(sinks) = weak.upgrade() {
                sinks.lock().remove(id);
            }
        })
    }

    /// Report `err` to every sink, or log it when there are none.
    pub fn capture(&self, location: &str, err: &(dyn std::error::Error + 'static)) {
        let sinks = self.sinks.lock().snapshot();
        if sinks.is_empty() {
            error!(location, error = %err, "unhandled background error");
            return;
        }
        for sink in sinks {
            sink(location, err);
        }
    }

    /// Spawn `future` and capture its error, if any.
    pub fn run_asynchronously<F, T, E>(&self, location: &'static str, future: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let sinks = self.clone();
        tokio::spawn(async move {
            if let Err(err) = future.await {
                sinks.capture(location, &err);
            }
        });
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ErrorSinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorSinks").field("sinks", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn collecting(sinks: &ErrorSinks) -> (Arc<Mutex<Vec<String>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription =
            sinks.register(move |location, err| sink.lock().push(format!("{location}: {err}")));
        (seen, subscription)
    }

    #[test]
    fn capture_reaches_registered_sinks() {
        let sinks = ErrorSinks::new();
        let (seen, _sub) = collecting(&sinks);

        sinks.capture("cache.refresh", &Error::SchedulerStopped);

        assert_eq!(
            *seen.lock(),
            vec!["cache.refresh: scheduler stopped before the call was serviced".to_string()]
        );
    }

    #[test]
    fn capture_without_sinks_only_logs() {
        let sinks = ErrorSinks::new();
        assert!(sinks.is_empty());
        sinks.capture("nowhere", &Error::fetch("ignored"));
    }

    #[test]
    fn unsubscribed_sink_is_removed() {
        let sinks = ErrorSinks::new();
        let (seen, sub) = collecting(&sinks);
        assert_eq!(sinks.len(), 1);

        sub.unsubscribe();
        sinks.capture("x", &Error::SchedulerStopped);

        assert!(seen.lock().is_empty());
        assert!(sinks.is_empty());
    }

    #[tokio::test]
    async fn run_asynchronously_reports_failures() {
        let sinks = ErrorSinks::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let _sub = sinks.register(move |location, err| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(format!("{location}: {err}"));
            }
        });

        sinks.run_asynchronously("job", async { Err::<(), _>(Error::fetch("late")) });

        assert_eq!(rx.await.unwrap(), "job: fetch failed: late");
    }
}
