//! Rate-limited caches over `async_state::AsyncStore`
//!
//! [`AsyncValueCache`] caches one value; [`AsyncCache`] keeps one
//! `AsyncValueCache` per key. [`spawn_refresh_task`] refreshes a keyed cache
//! in the background.

pub mod keyed;
pub mod metrics;
pub mod refresh;
pub mod value_cache;

pub use keyed::{AsyncCache, KeyedFetchFn, KeyedOnSubscribeFn};
pub use refresh::spawn_refresh_task;
pub use value_cache::{
    AsyncValueCache, CacheOptions, CacheStrategy, FetchFn, OnSubscribeFn, RefreshHandle,
};
