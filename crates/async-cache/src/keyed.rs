//! Keyed cache: one `AsyncValueCache` per key
//!
//! Entries are created on first touch and live in a `moka` cache. With
//! `CacheOptions::max_capacity` unset every key is kept for the life of the
//! cache; with it set, moka evicts by its size-bounded policy and the eviction
//! is counted. Composite keys are tuples.
//!
//! A keyed subscribe hook runs per key, from the key's first subscriber to
//! its last.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use async_state::{AsyncResult, Error, ErrorSinks, Result, Subscription};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use moka::notification::RemovalCause;
use moka::sync::Cache;

use crate::metrics;
use crate::value_cache::{
    AsyncValueCache, CacheOptions, CacheStrategy, OnSubscribeFn, RefreshHandle,
};

/// Keyed fetch callback; the flag is `true` for a key's first fetch.
pub type KeyedFetchFn<K, T> = dyn Fn(K, bool) -> BoxFuture<'static, Result<T>> + Send + Sync;

/// Per-key subscribe hook; see [`CacheOptions::on_subscribe`].
pub type KeyedOnSubscribeFn<K> = dyn Fn(&K, RefreshHandle) -> Subscription + Send + Sync;

pub struct AsyncCache<K, T> {
    entries: Cache<K, AsyncValueCache<T>>,
    fetch: Arc<KeyedFetchFn<K, T>>,
    on_subscribe: Option<Arc<KeyedOnSubscribeFn<K>>>,
    options: CacheOptions,
    sinks: ErrorSinks,
}

impl<K, T> Clone for AsyncCache<K, T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            fetch: self.fetch.clone(),
            on_subscribe: self.on_subscribe.clone(),
            options: self.options.clone(),
            sinks: self.sinks.clone(),
        }
    }
}

impl<K, T> AsyncCache<K, T>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(fetch: F, options: CacheOptions, sinks: ErrorSinks) -> Self
    where
        F: Fn(K, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut builder = Cache::builder().eviction_listener(
            |_key: Arc<K>, _value: AsyncValueCache<T>, cause: RemovalCause| {
                if cause.was_evicted() {
                    metrics::record_eviction();
                }
            },
        );
        if let Some(capacity) = options.max_capacity {
            builder = builder.max_capacity(capacity);
        }

        Self {
            entries: builder.build(),
            fetch: Arc::new(move |key, first| fetch(key, first).boxed()),
            on_subscribe: None,
            options,
            sinks,
        }
    }

    /// Run `hook` for a key while that key has state subscribers. Takes
    /// precedence over `CacheOptions::on_subscribe`. Set it before touching
    /// any key; existing entries keep their hook.
    pub fn with_on_subscribe(
        mut self,
        hook: impl Fn(&K, RefreshHandle) -> Subscription + Send + Sync + 'static,
    ) -> Self {
        self.on_subscribe = Some(Arc::new(hook));
        self
    }

    /// The per-key cache, created (and its first fetch started) on first touch.
    pub fn entry(&self, key: &K) -> AsyncValueCache<T> {
        self.entries.get_with_by_ref(key, || {
            let fetch = self.fetch.clone();
            let mut options = self.options.clone();
            if let Some(hook) = self.on_subscribe.clone() {
                let key = key.clone();
                let per_key: Arc<OnSubscribeFn> = Arc::new(move |refresh: RefreshHandle| hook(&key, refresh));
                options.on_subscribe = Some(per_key);
            }
            let key = key.clone();
            AsyncValueCache::from_fetch_fn(
                Arc::new(move |first| fetch(key.clone(), first)),
                options,
                self.sinks.clone(),
            )
        })
    }

    pub fn is_cache_available(&self, key: &K) -> bool {
        self.entry(key).is_cache_available()
    }

    pub fn get_if_cached(&self, key: &K) -> AsyncResult<T, Error> {
        self.entry(key).get_if_cached()
    }

    pub async fn get_or_wait(&self, key: &K, strategy: CacheStrategy) -> Result<T> {
        self.entry(key).get_or_wait(strategy).await
    }

    pub fn force_set_cached_value(&self, key: &K, value: T) {
        self.entry(key).force_set_cached_value(value);
    }

    pub fn force_set_cached_value_async<F>(&self, key: &K, value: F) -> BoxFuture<'static, bool>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.entry(key).force_set_cached_value_async(value)
    }

    pub async fn refresh(&self, key: &K) -> Result<T> {
        self.entry(key).refresh().await
    }

    pub async fn invalidate(&self, key: &K) -> Result<T> {
        self.entry(key).invalidate().await
    }

    pub fn on_change(
        &self,
        key: &K,
        callback: impl Fn(&T, Option<&T>) + Send + Sync + 'static,
    ) -> Subscription {
        self.entry(key).on_change(callback)
    }

    pub fn on_state_change(
        &self,
        key: &K,
        callback: impl Fn(&AsyncResult<T, Error>) + Send + Sync + 'static,
    ) -> Subscription {
        self.entry(key).on_state_change(callback)
    }

    /// Refresh every existing key matching `predicate`, concurrently.
    pub async fn refresh_where(&self, predicate: impl Fn(&K) -> bool) -> Vec<(K, Result<T>)> {
        let matching: Vec<(K, AsyncValueCache<T>)> = self
            .entries
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, cache)| ((*key).clone(), cache))
            .collect();

        join_all(matching.into_iter().map(|(key, cache)| async move {
            let outcome = cache.refresh().await;
            (key, outcome)
        }))
        .await
    }

    /// Keys currently held. Order is unspecified.
    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|(key, _)| (*key).clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget `key`. The next touch creates a fresh entry.
    pub fn remove(&self, key: &K) {
        self.entries.invalidate(key);
    }

    /// Apply moka's pending maintenance (evictions, listener calls) now.
    pub fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks();
    }
}

impl<K, T> std::fmt::Debug for AsyncCache<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCache")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
