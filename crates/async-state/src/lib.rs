//! Reactive state primitives for asynchronously produced values
//!
//! - [`AsyncResult`]: ok / error / pending outcome
//! - [`retry`]: jittered exponential backoff
//! - [`Store`] and [`AsyncStore`]: value containers with change callbacks;
//!   `AsyncStore` orders asynchronous writes by ticket
//! - [`RateLimited`] and [`Throttled`]: pacing for a zero-argument operation
//! - [`ErrorSinks`]: observers for errors raised by background work
//! - [`Lazy`]: value built on first access

pub mod async_store;
pub mod error;
pub mod lazy;
mod listeners;
pub mod result;
pub mod retry;
pub mod schedule;
pub mod sinks;
pub mod store;
pub mod subscription;

pub use async_store::{AsyncStore, StateCallback, Ticket, ValueCallback};
pub use error::{Error, Result};
pub use lazy::Lazy;
pub use result::AsyncResult;
pub use retry::{RetryError, RetryOptions, retry};
pub use schedule::{RateLimitOptions, RateLimited, Throttled};
pub use sinks::{ErrorSink, ErrorSinks};
pub use store::{ChangeCallback, Store};
pub use subscription::Subscription;
