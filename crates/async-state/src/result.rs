//! Three-way outcome type for values that may not exist yet
//!
//! `std::result::Result` already covers ok/error. `AsyncResult` adds a third
//! `Pending` branch so "not known yet" is never confused with "known to have
//! failed". Stores and caches return it from their synchronous getters.

use std::future::Future;

/// Outcome of an operation that may still be running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncResult<T, E, P = ()> {
    Ok(T),
    Error(E),
    Pending(P),
}

impl<T, E> AsyncResult<T, E, ()> {
    /// Pending without progress information.
    pub fn pending() -> Self {
        AsyncResult::Pending(())
    }
}

impl<T, E, P> AsyncResult<T, E, P> {
    /// Capture the outcome of a fallible future.
    pub async fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>>,
    {
        future.await.into()
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, AsyncResult::Ok(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, AsyncResult::Error(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, AsyncResult::Pending(_))
    }

    /// Map the ok branch; error and pending pass through unchanged.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> AsyncResult<U, E, P> {
        match self {
            AsyncResult::Ok(data) => AsyncResult::Ok(f(data)),
            AsyncResult::Error(error) => AsyncResult::Error(error),
            AsyncResult::Pending(progress) => AsyncResult::Pending(progress),
        }
    }

    /// Map the error branch; ok and pending pass through unchanged.
    pub fn map_err<F>(self, f: impl FnOnce(E) -> F) -> AsyncResult<T, F, P> {
        match self {
            AsyncResult::Ok(data) => AsyncResult::Ok(data),
            AsyncResult::Error(error) => AsyncResult::Error(f(error)),
            AsyncResult::Pending(progress) => AsyncResult::Pending(progress),
        }
    }

    /// The ok value, or `fallback` for both error and pending.
    pub fn or(self, fallback: T) -> T {
        match self {
            AsyncResult::Ok(data) => data,
            _ => fallback,
        }
    }

    pub fn ok(self) -> Option<T> {
        match self {
            AsyncResult::Ok(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> AsyncResult<&T, &E, &P> {
        match self {
            AsyncResult::Ok(data) => AsyncResult::Ok(data),
            AsyncResult::Error(error) => AsyncResult::Error(error),
            AsyncResult::Pending(progress) => AsyncResult::Pending(progress),
        }
    }

    /// Convert a settled outcome into a `Result`, handing pending back.
    pub fn try_into_result(self) -> Result<Result<T, E>, Self> {
        match self {
            AsyncResult::Ok(data) => Ok(Ok(data)),
            AsyncResult::Error(error) => Ok(Err(error)),
            pending @ AsyncResult::Pending(_) => Err(pending),
        }
    }

    /// Convert a settled outcome into a `Result`.
    ///
    /// # Panics
    ///
    /// Panics if the outcome is still pending. Callers must only unwrap
    /// outcomes they know to be settled.
    pub fn into_result(self) -> Result<T, E> {
        match self.try_into_result() {
            Ok(result) => result,
            Err(_) => panic!("result still pending"),
        }
    }
}

impl<T, E, P> From<Result<T, E>> for AsyncResult<T, E, P> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => AsyncResult::Ok(data),
            Err(error) => AsyncResult::Error(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Outcome = AsyncResult<u32, String, u8>;

    #[test]
    fn map_touches_only_ok() {
        assert_eq!(Outcome::Ok(2).map(|v| v * 10), AsyncResult::Ok(20));
        assert_eq!(
            Outcome::Error("bad".into()).map(|v| v * 10),
            AsyncResult::Error("bad".into())
        );
        assert_eq!(Outcome::Pending(40).map(|v| v * 10), AsyncResult::Pending(40));
    }

    #[test]
    fn or_falls_back_for_error_and_pending() {
        assert_eq!(Outcome::Ok(1).or(9), 1);
        assert_eq!(Outcome::Error("x".into()).or(9), 9);
        assert_eq!(Outcome::Pending(0).or(9), 9);
    }

    #[test]
    fn into_result_unwraps_settled_values() {
        assert_eq!(Outcome::Ok(5).into_result(), Ok(5));
        assert_eq!(
            Outcome::Error("nope".into()).into_result(),
            Err("nope".to_string())
        );
    }

    #[test]
    #[should_panic(expected = "result still pending")]
    fn into_result_on_pending_fails_loudly() {
        let _ = Outcome::Pending(3).into_result();
    }

    #[test]
    fn try_into_result_hands_pending_back() {
        assert_eq!(Outcome::Pending(7).try_into_result(), Err(AsyncResult::Pending(7)));
    }

    #[test]
    fn converts_from_std_result() {
        let ok: AsyncResult<u32, String> = Ok(3).into();
        let err: AsyncResult<u32, String> = Err("e".to_string()).into();
        assert!(ok.is_ok());
        assert!(err.is_error());
        assert!(AsyncResult::<u32, String>::pending().is_pending());
    }

    #[tokio::test]
    async fn from_future_captures_failure() {
        let outcome: AsyncResult<u32, &str> =
            AsyncResult::from_future(async { Err::<u32, _>("rejected") }).await;
        assert_eq!(outcome, AsyncResult::Error("rejected"));
    }
}
