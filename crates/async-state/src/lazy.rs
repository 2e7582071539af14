//! Asynchronously initialized holder

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::OnceCell;

type Init<T, E> = dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync;

/// A value built on first access. Concurrent first accesses share one
/// initialization; a failed initialization is retried on the next access.
pub struct Lazy<T, E = crate::Error> {
    cell: Arc<OnceCell<T>>,
    init: Arc<Init<T, E>>,
}

impl<T, E> Clone for Lazy<T, E> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            init: self.init.clone(),
        }
    }
}

impl<T, E> Lazy<T, E>
where
    T: Send + Sync + 'static,
    E: Send + 'static,
{
    pub fn new<F, Fut>(init: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            cell: Arc::new(OnceCell::new()),
            init: Arc::new(move || init().boxed()),
        }
    }

    pub async fn get(&self) -> Result<&T, E> {
        self.cell.get_or_try_init(|| (self.init)()).await
    }

    /// The value if initialization already succeeded.
    pub fn get_if_initialized(&self) -> Option<&T> {
        self.cell.get()
    }
}
