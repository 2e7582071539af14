//! Single-value cache over an `AsyncStore`
//!
//! Construction starts the first fetch right away, outside the rate limiter.
//! A failed first fetch leaves the cache unavailable rather than rejected, so
//! the next read simply fetches again. Every later fetch (`refresh`,
//! `invalidate`, cache misses) goes through a batching `RateLimited`, so a
//! burst of refreshes costs one upstream call.
//!
//! `CacheOptions::on_subscribe` is started when the first state subscriber
//! arrives and torn down when the last one unsubscribes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_state::{
    AsyncResult, AsyncStore, Error, ErrorSinks, RateLimitOptions, RateLimited, Result,
    Subscription,
};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::metrics::{self, FetchKind};

/// Fetch callback; the flag is `true` for the first fetch only.
pub type FetchFn<T> = dyn Fn(bool) -> BoxFuture<'static, Result<T>> + Send + Sync;

/// A fetch plus its commit; resolves to the outcome and whether it landed.
type SharedWrite<T> = Shared<BoxFuture<'static, (Result<T>, bool)>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    FirstFetch,
    LaterFetch,
    Forced,
}

/// How `get_or_wait` treats the cached value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Use the cached value or join the in-flight fetch; fetch otherwise.
    #[default]
    ReadWrite,
    /// Always fetch and store the result.
    WriteOnly,
    /// Fetch without reading or writing the cache.
    Never,
}

/// Starts a background refresh of the cache that handed it out.
pub type RefreshHandle = Arc<dyn Fn() + Send + Sync>;

/// Hook run when a cache gains its first subscriber. The returned
/// subscription is released when the last subscriber leaves.
pub type OnSubscribeFn = dyn Fn(RefreshHandle) -> Subscription + Send + Sync;

/// Cache construction options.
#[derive(Clone)]
pub struct CacheOptions {
    /// Pacing for later fetches. `batch_calls` is always forced on.
    pub rate_limit: RateLimitOptions,
    /// Upper bound on keyed entries. `None` keeps every key.
    pub max_capacity: Option<u64>,
    pub on_subscribe: Option<Arc<OnSubscribeFn>>,
}

impl std::fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheOptions")
            .field("rate_limit", &self.rate_limit)
            .field("max_capacity", &self.max_capacity)
            .field("on_subscribe", &self.on_subscribe.is_some())
            .finish()
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitOptions {
                batch_calls: true,
                throttle: Duration::from_millis(300),
                ..Default::default()
            },
            max_capacity: None,
            on_subscribe: None,
        }
    }
}

#[derive(Default)]
struct Subscribers {
    count: usize,
    /// Bumped on every 0 -> 1 transition.
    epoch: u64,
    teardown: Vec<Subscription>,
}

struct Inner<T> {
    store: AsyncStore<T>,
    later_fetch: RateLimited<T>,
    in_flight: Mutex<Option<SharedWrite<T>>>,
    sinks: ErrorSinks,
    on_subscribe: Option<Arc<OnSubscribeFn>>,
    subscribers: Mutex<Subscribers>,
}

/// A cached value with rate-limited refresh. Clones share the cache.
pub struct AsyncValueCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for AsyncValueCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> AsyncValueCache<T> {
    /// Create the cache and start the first fetch. Must be called inside a
    /// tokio runtime.
    pub fn new<F, Fut>(fetch: F, options: CacheOptions, sinks: ErrorSinks) -> Self
    where
        F: Fn(bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let fetch: Arc<FetchFn<T>> = Arc::new(move |first| fetch(first).boxed());
        Self::from_fetch_fn(fetch, options, sinks)
    }

    pub(crate) fn from_fetch_fn(
        fetch: Arc<FetchFn<T>>,
        options: CacheOptions,
        sinks: ErrorSinks,
    ) -> Self {
        let later_fetch = {
            let fetch = fetch.clone();
            RateLimited::new(
                move || {
                    let call = fetch(false);
                    async move {
                        let outcome = call.await;
                        metrics::record_fetch(FetchKind::Refresh, outcome.is_ok());
                        outcome
                    }
                },
                RateLimitOptions {
                    batch_calls: true,
                    ..options.rate_limit
                },
            )
        };

        let cache = Self {
            inner: Arc::new(Inner {
                store: AsyncStore::new(),
                later_fetch,
                in_flight: Mutex::new(None),
                sinks,
                on_subscribe: options.on_subscribe,
                subscribers: Mutex::new(Subscribers::default()),
            }),
        };
        cache.start_write(fetch(true), Origin::FirstFetch);
        cache
    }

    /// Issue a ticket for `call`, make it the fetch readers join, and drive
    /// it to completion in the background. The shared future resolves after
    /// the outcome has been committed (or discarded as stale).
    fn start_write(&self, call: BoxFuture<'static, Result<T>>, origin: Origin) -> SharedWrite<T> {
        let ticket = self.inner.store.issue_ticket();
        let store = self.inner.store.clone();
        let write = async move {
            let outcome = call.await;
            let landed = match &outcome {
                Ok(value) => AsyncResult::Ok(value.clone()),
                Err(e) if origin == Origin::FirstFetch => {
                    warn!(error = %e, "first fetch failed, cache stays unavailable");
                    AsyncResult::pending()
                }
                Err(e) => AsyncResult::Error(e.clone()),
            };
            if origin == Origin::FirstFetch {
                metrics::record_fetch(FetchKind::First, outcome.is_ok());
            }
            let won = store.set_if_latest(ticket, landed);
            (outcome, won)
        }
        .boxed()
        .shared();

        *self.inner.in_flight.lock() = Some(write.clone());
        tokio::spawn(write.clone());
        write
    }

    fn joinable(&self) -> Option<SharedWrite<T>> {
        self.inner
            .in_flight
            .lock()
            .as_ref()
            .filter(|write| write.peek().is_none())
            .cloned()
    }

    pub fn is_cache_available(&self) -> bool {
        self.inner.store.is_available()
    }

    pub fn get_if_cached(&self) -> AsyncResult<T, Error> {
        self.inner.store.get()
    }

    pub async fn get_or_wait(&self, strategy: CacheStrategy) -> Result<T> {
        if strategy == CacheStrategy::ReadWrite
            && let AsyncResult::Ok(value) = self.get_if_cached()
        {
            return Ok(value);
        }
        self.refetch(strategy).await
    }

    async fn refetch(&self, strategy: CacheStrategy) -> Result<T> {
        if strategy == CacheStrategy::ReadWrite
            && let Some(write) = self.joinable()
        {
            debug!("joining in-flight fetch");
            return write.await.0;
        }

        let call = self.inner.later_fetch.call();
        if strategy == CacheStrategy::Never {
            return call.await;
        }
        let (outcome, _) = self.start_write(call, Origin::LaterFetch).await;
        outcome
    }

    pub fn force_set_cached_value(&self, value: T) {
        self.inner.store.set(value);
    }

    /// Commit the outcome of `value` unless a newer write lands first.
    /// Resolves to whether the write won.
    pub fn force_set_cached_value_async<F>(&self, value: F) -> BoxFuture<'static, bool>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let write = self.start_write(value.boxed(), Origin::Forced);
        async move { write.await.1 }.boxed()
    }

    /// Fetch a fresh value through the rate limiter and store it.
    pub async fn refresh(&self) -> Result<T> {
        self.get_or_wait(CacheStrategy::WriteOnly).await
    }

    /// Drop the cached value, then refresh. Readers see pending meanwhile.
    pub async fn invalidate(&self) -> Result<T> {
        self.inner.store.set_unavailable();
        *self.inner.in_flight.lock() = None;
        self.refresh().await
    }

    pub fn on_change(
        &self,
        callback: impl Fn(&T, Option<&T>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.store.on_change(callback)
    }

    /// Subscribe to every state transition and kick off a background refresh.
    pub fn on_state_change(
        &self,
        callback: impl Fn(&AsyncResult<T, Error>) + Send + Sync + 'static,
    ) -> Subscription {
        let subscription = self.inner.store.on_state_change(callback);
        self.add_subscriber();
        self.refresh_in_background();

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            subscription.unsubscribe();
            if let Some(inner) = inner.upgrade() {
                remove_subscriber(&inner);
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().count
    }

    fn refresh_in_background(&self) {
        let cache = self.clone();
        self.inner
            .sinks
            .run_asynchronously("async_cache.refresh", async move { cache.refresh().await });
    }

    fn add_subscriber(&self) {
        let Some(hook) = self.inner.on_subscribe.clone() else {
            self.inner.subscribers.lock().count += 1;
            return;
        };
        let epoch = {
            let mut subscribers = self.inner.subscribers.lock();
            subscribers.count += 1;
            if subscribers.count > 1 {
                return;
            }
            subscribers.epoch += 1;
            subscribers.epoch
        };

        let weak = Arc::downgrade(&self.inner);
        let handle: RefreshHandle = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                AsyncValueCache { inner }.refresh_in_background();
            }
        });
        let teardown = hook(handle);

        let mut subscribers = self.inner.subscribers.lock();
        if subscribers.count > 0 && subscribers.epoch == epoch {
            subscribers.teardown.push(teardown);
        } else {
            // Every subscriber left while the hook was starting.
            drop(subscribers);
            teardown.unsubscribe();
        }
    }
}

fn remove_subscriber<T>(inner: &Inner<T>) {
    let teardown = {
        let mut subscribers = inner.subscribers.lock();
        subscribers.count = subscribers.count.saturating_sub(1);
        if subscribers.count > 0 {
            return;
        }
        std::mem::take(&mut subscribers.teardown)
    };
    if !teardown.is_empty() {
        debug!("last subscriber left, tearing down subscribe hook");
    }
    for subscription in teardown {
        subscription.unsubscribe();
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for AsyncValueCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncValueCache")
            .field("store", &self.inner.store)
            .finish_non_exhaustive()
    }
}
