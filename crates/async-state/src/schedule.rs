//! Pacing wrappers around a zero-argument async operation
//!
//! `RateLimited` services calls one physical invocation at a time through a
//! single background task, honouring throttle (start-to-start), gap
//! (end-to-start) and debounce (quiet period after the last enqueue) floors.
//! All three feed one `wait_until` instant, which only ever moves forward: the
//! next invocation starts at the max of every floor computed so far.
//!
//! `Throttled` is the lighter variant: callers that arrive while a call is
//! scheduled join it instead of scheduling their own.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Pacing policy for [`RateLimited`]. Concurrency is always 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitOptions {
    /// Service every queued caller with one physical invocation.
    pub batch_calls: bool,
    /// Minimum spacing between the starts of consecutive invocations.
    pub throttle: Duration,
    /// Minimum spacing between the end of one invocation and the next start.
    pub gap: Duration,
    /// Every enqueue pushes the next start to at least `now + debounce`.
    pub debounce: Duration,
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// Handle to a rate-limited operation. Clones share one queue and one
/// background task; the task exits once every handle is dropped and the
/// queue has drained.
pub struct RateLimited<T> {
    queue: mpsc::UnboundedSender<Reply<T>>,
    wait_until: Arc<Mutex<Instant>>,
    debounce: Duration,
}

impl<T> Clone for RateLimited<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            wait_until: self.wait_until.clone(),
            debounce: self.debounce,
        }
    }
}

impl<T: Clone + Send + 'static> RateLimited<T> {
    /// Wrap `func` and spawn the servicing task on the current tokio runtime.
    pub fn new<F, Fut>(func: F, options: RateLimitOptions) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (queue, incoming) = mpsc::unbounded_channel();
        let wait_until = Arc::new(Mutex::new(Instant::now()));
        tokio::spawn(service_queue(func, options, incoming, wait_until.clone()));
        Self {
            queue,
            wait_until,
            debounce: options.debounce,
        }
    }

    /// Enqueue a call. The call is queued immediately; the returned future
    /// resolves once an invocation has serviced it.
    pub fn call(&self) -> BoxFuture<'static, Result<T>> {
        {
            let mut wait_until = self.wait_until.lock();
            *wait_until = (*wait_until).max(Instant::now() + self.debounce);
        }
        let (reply, receiver) = oneshot::channel();
        let queued = self.queue.send(reply).is_ok();
        async move {
            if !queued {
                return Err(Error::SchedulerStopped);
            }
            receiver.await.unwrap_or(Err(Error::SchedulerStopped))
        }
        .boxed()
    }
}

async fn service_queue<T, F, Fut>(
    func: F,
    options: RateLimitOptions,
    mut incoming: mpsc::UnboundedReceiver<Reply<T>>,
    wait_until: Arc<Mutex<Instant>>,
) where
    T: Clone + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let mut queue: VecDeque<Reply<T>> = VecDeque::new();
    loop {
        if queue.is_empty() {
            match incoming.recv().await {
                Some(reply) => queue.push_back(reply),
                None => break,
            }
        }
        while let Ok(reply) = incoming.try_recv() {
            queue.push_back(reply);
        }

        let deadline = *wait_until.lock();
        if deadline > Instant::now() {
            tokio::time::sleep_until(deadline).await;
            continue;
        }

        let batch: Vec<Reply<T>> = if options.batch_calls {
            queue.drain(..).collect()
        } else {
            queue.pop_front().into_iter().collect()
        };
        trace!(callers = batch.len(), queued = queue.len(), "servicing rate-limited call");

        let start = Instant::now();
        let outcome = func().await;
        let end = Instant::now();
        {
            let mut wait_until = wait_until.lock();
            *wait_until = (*wait_until)
                .max(start + options.throttle)
                .max(end + options.gap);
        }

        for reply in batch {
            let _ = reply.send(outcome.clone());
        }
    }
    debug!("rate limiter handles dropped, stopping queue");
}

type SharedCall<T> = Shared<BoxFuture<'static, Result<T>>>;

struct Slot<T> {
    generation: u64,
    pending: Option<SharedCall<T>>,
}

struct ThrottledInner<T> {
    func: Box<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>,
    delay: Duration,
    slot: Mutex<Slot<T>>,
}

/// Collapses concurrent calls into the next call scheduled `delay` ahead.
pub struct Throttled<T> {
    inner: Arc<ThrottledInner<T>>,
}

impl<T> Clone for Throttled<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Throttled<T> {
    pub fn new<F, Fut>(func: F, delay: Duration) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            inner: Arc::new(ThrottledInner {
                func: Box::new(move || func().boxed()),
                delay,
                slot: Mutex::new(Slot {
                    generation: 0,
                    pending: None,
                }),
            }),
        }
    }

    /// Join the scheduled call, or schedule one `delay` from now.
    pub fn call(&self) -> BoxFuture<'static, Result<T>> {
        let (generation, call) = {
            let mut slot = self.inner.slot.lock();
            match &slot.pending {
                Some(call) if call.peek().is_none() => (slot.generation, call.clone()),
                _ => {
                    slot.generation += 1;
                    let delay = self.inner.delay;
                    let inner = Arc::downgrade(&self.inner);
                    let call = async move {
                        tokio::time::sleep(delay).await;
                        match inner.upgrade() {
                            Some(inner) => (inner.func)().await,
                            None => Err(Error::SchedulerStopped),
                        }
                    }
                    .boxed()
                    .shared();
                    slot.pending = Some(call.clone());
                    (slot.generation, call)
                }
            }
        };

        let inner = self.inner.clone();
        async move {
            let outcome = call.await;
            let mut slot = inner.slot.lock();
            if slot.generation == generation {
                slot.pending = None;
            }
            outcome
        }
        .boxed()
    }
}
