//! Periodic background refresh
//!
//! Spawns a task that refreshes every key of an `AsyncCache` on a fixed
//! interval, so readers rarely pay refresh latency on the request path.

use std::hash::Hash;
use std::time::Duration;

use tracing::{debug, warn};

use crate::keyed::AsyncCache;

/// Spawn a background task that refreshes every cached key each `interval`.
///
/// The first tick is skipped since entries were just fetched. Failed
/// refreshes are logged and retried on the next cycle. Abort the returned
/// handle to stop the task.
pub fn spawn_refresh_task<K, T>(
    cache: AsyncCache<K, T>,
    interval: Duration,
) -> tokio::task::JoinHandle<()>
where
    K: Hash + Eq + Clone + std::fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&cache).await;
        }
    })
}

/// Refresh every key once. Returns how many refreshes failed.
async fn refresh_cycle<K, T>(cache: &AsyncCache<K, T>) -> usize
where
    K: Hash + Eq + Clone + std::fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    let outcomes = cache.refresh_where(|_| true).await;
    let mut failed = 0;
    for (key, outcome) in &outcomes {
        if let Err(e) = outcome {
            failed += 1;
            warn!(key = ?key, error = %e, "background refresh failed, will retry next cycle");
        }
    }
    debug!(refreshed = outcomes.len(), failed, "background refresh cycle finished");
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_cache::{CacheOptions, CacheStrategy};
    use async_state::{AsyncResult, Error, ErrorSinks};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_cache() -> (Arc<AtomicUsize>, AsyncCache<&'static str, usize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = AsyncCache::new(
            move |_key, _first| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(n) }
            },
            CacheOptions::default(),
            ErrorSinks::new(),
        );
        (calls, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_cycle_updates_every_key() {
        let (calls, cache) = counting_cache();
        cache.get_or_wait(&"a", CacheStrategy::ReadWrite).await.unwrap();
        cache.get_or_wait(&"b", CacheStrategy::ReadWrite).await.unwrap();

        assert_eq!(refresh_cycle(&cache).await, 0);

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(cache.get_if_cached(&"a"), AsyncResult::Ok(n) if n > 2));
        assert!(matches!(cache.get_if_cached(&"b"), AsyncResult::Ok(n) if n > 2));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_cycle_counts_failures() {
        let cache: AsyncCache<u8, u8> = AsyncCache::new(
            |key: u8, first: bool| async move {
                if first || key != 0 {
                    Ok(key)
                } else {
                    Err(Error::fetch("flaky"))
                }
            },
            CacheOptions::default(),
            ErrorSinks::new(),
        );
        cache.get_or_wait(&0, CacheStrategy::ReadWrite).await.unwrap();
        cache.get_or_wait(&1, CacheStrategy::ReadWrite).await.unwrap();

        assert_eq!(refresh_cycle(&cache).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_task_skips_the_first_tick() {
        let (calls, cache) = counting_cache();
        cache.get_or_wait(&"a", CacheStrategy::ReadWrite).await.unwrap();

        let handle = spawn_refresh_task(cache.clone(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        handle.abort();
    }
}
