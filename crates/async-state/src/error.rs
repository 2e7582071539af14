//! Error types for async-state operations
//!
//! Errors are `Clone` because one outcome is routinely fanned out to many
//! waiters (batched scheduler calls, `get_or_wait` callers, cache readers).

use std::sync::Arc;

use crate::retry::RetryError;

/// Errors surfaced by stores, schedulers and fetch callbacks.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("fetch failed: {0}")]
    Fetch(#[source] Arc<dyn std::error::Error + Send + Sync>),

    #[error("scheduler stopped before the call was serviced")]
    SchedulerStopped,

    /// Every attempt failed; one message per attempt, oldest first.
    #[error("{0}")]
    Retry(Arc<RetryError<String>>),
}

impl Error {
    /// Wrap any error (or message) produced by a fetch callback.
    pub fn fetch(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Fetch(Arc::from(error.into()))
    }
}

impl<E: std::fmt::Display> From<RetryError<E>> for Error {
    fn from(err: RetryError<E>) -> Self {
        Error::Retry(Arc::new(err.map(|e| e.to_string())))
    }
}

/// Result alias for async-state operations.
pub type Result<T> = std::result::Result<T, Error>;
