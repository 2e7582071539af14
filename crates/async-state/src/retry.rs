//! Retry with jittered exponential backoff
//!
//! Attempt `n` (zero-based) that fails before the last attempt is followed by
//! a sleep of `random(0, 1) * base * 2^n`. Every failure is kept so the final
//! error can explain all of them.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Backoff settings for [`retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    pub exponential_delay_base: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            exponential_delay_base: Duration::from_millis(2000),
        }
    }
}

/// Every attempt of a [`retry`] call failed.
#[derive(Debug, Clone)]
pub struct RetryError<E> {
    errors: Vec<E>,
}

impl<E> RetryError<E> {
    /// All attempt errors, oldest first.
    pub fn errors(&self) -> &[E] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<E> {
        self.errors
    }

    /// Number of attempts that were made.
    pub fn retries(&self) -> usize {
        self.errors.len()
    }

    pub fn last(&self) -> Option<&E> {
        self.errors.last()
    }

    /// Convert every attempt error, keeping their order.
    pub fn map<F>(self, f: impl FnMut(E) -> F) -> RetryError<F> {
        RetryError {
            errors: self.errors.into_iter().map(f).collect(),
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        write!(f, "Error after retrying {} times.", messages.len())?;

        let all_same = messages.len() > 1 && messages.iter().all(|m| *m == messages[0]);
        if all_same {
            write!(f, "\n\nAttempts 1-{}:\n  {}", messages.len(), messages[0])
        } else {
            for (i, message) in messages.iter().enumerate() {
                write!(f, "\n\nAttempt {}:\n  {}", i + 1, message)?;
            }
            Ok(())
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors
            .last()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Run `f` up to `max_attempts` times, returning the first success.
///
/// Abandoned attempts are not cleaned up; callers whose operation has side
/// effects must make it idempotent. `max_attempts == 0` returns an empty
/// `RetryError` without calling `f`.
pub async fn retry<T, E, F, Fut>(
    mut f: F,
    max_attempts: u32,
    options: RetryOptions,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut errors = Vec::with_capacity(max_attempts as usize);
    for attempt in 0..max_attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!(attempt = attempt + 1, max_attempts, error = %e, "attempt failed");
                errors.push(e);
                if attempt + 1 < max_attempts {
                    tokio::time::sleep(backoff_delay(options.exponential_delay_base, attempt)).await;
                }
            }
        }
    }
    Err(RetryError { errors })
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2f64.powi(attempt.min(30) as i32);
    base.mul_f64(rand::random::<f64>() * factor)
}
