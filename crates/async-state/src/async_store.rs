//! Reactive container for asynchronously produced values
//!
//! An `AsyncStore` is pending, available, or rejected. Asynchronous writes are
//! ordered by ticket: each `set_async` call takes the next ticket when it is
//! called, and its outcome commits only if no write with a newer ticket has
//! committed in the meantime. A slow superseded fetch therefore can never
//! clobber a newer value, regardless of completion order.
//!
//! Bookkeeping sits behind a readers-writer lock that is never held across an
//! await point or while callbacks run.

use std::future::Future;
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::Error;
use crate::listeners::{Listeners, once1};
use crate::result::AsyncResult;
use crate::subscription::Subscription;

/// Callback for successful transitions: `(new_value, previous_value)`.
pub type ValueCallback<T> = dyn Fn(&T, Option<&T>) + Send + Sync;

/// Callback for every transition, including pending and rejected.
pub type StateCallback<T, E> = dyn Fn(&AsyncResult<T, E>) + Send + Sync;

/// Position of a write in issuance order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

struct State<T, E> {
    value: Option<T>,
    rejection: Option<E>,
    update_counter: u64,
    last_successful_update: Option<u64>,
    waiters: Vec<oneshot::Sender<Result<T, E>>>,
    value_listeners: Listeners<ValueCallback<T>>,
    state_listeners: Listeners<StateCallback<T, E>>,
}

/// Notifications collected under the lock and delivered after it is released.
struct Fanout<T, E> {
    outcome: AsyncResult<T, E>,
    previous: Option<T>,
    value_callbacks: Vec<Arc<ValueCallback<T>>>,
    state_callbacks: Vec<Arc<StateCallback<T, E>>>,
}

impl<T, E> Fanout<T, E> {
    fn deliver(self) {
        if let AsyncResult::Ok(value) = &self.outcome {
            for callback in &self.value_callbacks {
                callback(value, self.previous.as_ref());
            }
        }
        for callback in &self.state_callbacks {
            callback(&self.outcome);
        }
    }
}

impl<T: Clone, E: Clone> State<T, E> {
    fn is_latest(&self, ticket: Ticket) -> bool {
        self.last_successful_update
            .is_none_or(|last| ticket.0 > last)
    }

    fn commit_value(&mut self, value: T) -> Fanout<T, E> {
        let previous = self.value.replace(value.clone());
        self.rejection = None;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(value.clone()));
        }
        Fanout {
            outcome: AsyncResult::Ok(value),
            previous,
            value_callbacks: self.value_listeners.snapshot(),
            state_callbacks: self.state_listeners.snapshot(),
        }
    }

    fn commit_rejection(&mut self, error: E) -> Fanout<T, E> {
        let previous = self.value.take();
        self.rejection = Some(error.clone());
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        Fanout {
            outcome: AsyncResult::Error(error),
            previous,
            value_callbacks: Vec::new(),
            state_callbacks: self.state_listeners.snapshot(),
        }
    }

    fn commit_unavailable(&mut self) -> Fanout<T, E> {
        let previous = self.value.take();
        self.rejection = None;
        Fanout {
            outcome: AsyncResult::pending(),
            previous,
            value_callbacks: Vec::new(),
            state_callbacks: self.state_listeners.snapshot(),
        }
    }
}

/// Pending/available/rejected value with ticket-ordered asynchronous writes.
pub struct AsyncStore<T, E = Error> {
    state: Arc<RwLock<State<T, E>>>,
}

impl<T, E> Clone for AsyncStore<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T, E> Default for AsyncStore<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> AsyncStore<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// A store with no value yet.
    pub fn new() -> Self {
        Self::from_value(None)
    }

    /// A store that starts out available.
    pub fn with_value(value: T) -> Self {
        Self::from_value(Some(value))
    }

    fn from_value(value: Option<T>) -> Self {
        Self {
            state: Arc::new(RwLock::new(State {
                value,
                rejection: None,
                update_counter: 0,
                last_successful_update: None,
                waiters: Vec::new(),
                value_listeners: Listeners::new(),
                state_listeners: Listeners::new(),
            })),
        }
    }

    pub fn is_available(&self) -> bool {
        self.state.read().value.is_some()
    }

    pub fn is_rejected(&self) -> bool {
        self.state.read().rejection.is_some()
    }

    /// Current state without waiting.
    pub fn get(&self) -> AsyncResult<T, E> {
        let state = self.state.read();
        if let Some(error) = &state.rejection {
            AsyncResult::Error(error.clone())
        } else if let Some(value) = &state.value {
            AsyncResult::Ok(value.clone())
        } else {
            AsyncResult::pending()
        }
    }

    /// Resolve with the current value, or wait for the next success or
    /// rejection. A rejected store fails immediately.
    pub async fn get_or_wait(&self) -> Result<T, E> {
        loop {
            let receiver = {
                let mut state = self.state.write();
                if let Some(error) = &state.rejection {
                    return Err(error.clone());
                }
                if let Some(value) = &state.value {
                    return Ok(value.clone());
                }
                let (sender, receiver) = oneshot::channel();
                state.waiters.retain(|waiter| !waiter.is_closed());
                state.waiters.push(sender);
                receiver
            };
            // Waiters are only dropped after being resolved, so a closed
            // channel just means "look again".
            if let Ok(outcome) = receiver.await {
                return outcome;
            }
        }
    }

    /// Take the next ticket. Tickets order writes by issuance.
    pub fn issue_ticket(&self) -> Ticket {
        let mut state = self.state.write();
        state.update_counter += 1;
        Ticket(state.update_counter)
    }

    /// Commit `outcome` if no newer ticket has committed.
    ///
    /// `Ok` makes the value available, `Error` rejects the store, `Pending`
    /// makes it unavailable. Returns whether the write won.
    pub fn set_if_latest(&self, ticket: Ticket, outcome: AsyncResult<T, E>) -> bool {
        let fanout = {
            let mut state = self.state.write();
            if !state.is_latest(ticket) {
                trace!(
                    ticket = ticket.0,
                    latest = state.last_successful_update,
                    "discarding stale write"
                );
                return false;
            }
            state.last_successful_update = Some(ticket.0);
            match outcome {
                AsyncResult::Ok(value) => state.commit_value(value),
                AsyncResult::Error(error) => state.commit_rejection(error),
                AsyncResult::Pending(()) => state.commit_unavailable(),
            }
        };
        fanout.deliver();
        true
    }

    pub fn set(&self, value: T) {
        let ticket = self.issue_ticket();
        self.set_if_latest(ticket, AsyncResult::Ok(value));
    }

    /// Set the value to `f(current)` and return it.
    pub fn update(&self, f: impl FnOnce(Option<&T>) -> T) -> T {
        let (value, fanout) = {
            let mut state = self.state.write();
            let value = f(state.value.as_ref());
            state.update_counter += 1;
            state.last_successful_update = Some(state.update_counter);
            (value.clone(), state.commit_value(value))
        };
        fanout.deliver();
        value
    }

    /// Write the outcome of `future` once it settles, unless a newer write
    /// has committed first.
    ///
    /// The ticket is taken when this method is called, not when the returned
    /// future is first polled. The future resolves to whether the write won.
    pub fn set_async<F>(&self, future: F) -> BoxFuture<'static, bool>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let ticket = self.issue_ticket();
        let store = self.clone();
        async move {
            let outcome = future.await;
            store.set_if_latest(ticket, outcome.into())
        }
        .boxed()
    }

    /// Forget the current value. Waiters keep waiting.
    pub fn set_unavailable(&self) {
        let fanout = self.state.write().commit_unavailable();
        fanout.deliver();
    }

    /// Reject the store and fail every waiter with `error`.
    pub fn set_rejected(&self, error: E) {
        let fanout = self.state.write().commit_rejection(error);
        fanout.deliver();
    }

    /// Subscribe to successful transitions.
    pub fn on_change(
        &self,
        callback: impl Fn(&T, Option<&T>) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self
            .state
            .write()
            .value_listeners
            .insert(Arc::new(callback), false);
        self.unsubscriber(move |state| {
            state.value_listeners.remove(id);
        })
    }

    /// Subscribe to the next successful transition only.
    pub fn once_change(
        &self,
        callback: impl FnOnce(&T, Option<&T>) + Send + 'static,
    ) -> Subscription {
        let slot = Mutex::new(Some(callback));
        let id = self.state.write().value_listeners.insert(
            Arc::new(move |value: &T, previous: Option<&T>| {
                if let Some(callback) = slot.lock().take() {
                    callback(value, previous);
                }
            }),
            true,
        );
        self.unsubscriber(move |state| {
            state.value_listeners.remove(id);
        })
    }

    /// Subscribe to every transition: ok, error, and pending.
    pub fn on_state_change(
        &self,
        callback: impl Fn(&AsyncResult<T, E>) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self
            .state
            .write()
            .state_listeners
            .insert(Arc::new(callback), false);
        self.unsubscriber(move |state| {
            state.state_listeners.remove(id);
        })
    }

    /// Subscribe to the next transition of any kind.
    pub fn once_state_change(
        &self,
        callback: impl FnOnce(&AsyncResult<T, E>) + Send + 'static,
    ) -> Subscription {
        let id = self
            .state
            .write()
            .state_listeners
            .insert(Arc::new(once1(callback)), true);
        self.unsubscriber(move |state| {
            state.state_listeners.remove(id);
        })
    }

    /// A derived store holding `f(value)`, updated on every successful change.
    pub fn map<U>(&self, f: impl Fn(&T) -> U + Send + Sync + 'static) -> AsyncStore<U, E>
    where
        U: Clone + Send + Sync + 'static,
    {
        let derived = match self.get() {
            AsyncResult::Ok(value) => AsyncStore::with_value(f(&value)),
            _ => AsyncStore::new(),
        };
        let target = derived.clone();
        // Lives as long as the source store.
        let _subscription = self.on_change(move |value, _| target.set(f(value)));
        derived
    }

    fn unsubscriber(
        &self,
        remove: impl FnOnce(&mut State<T, E>) + Send + Sync + 'static,
    ) -> Subscription {
        let weak: Weak<RwLock<State<T, E>>> = Arc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                remove(&mut state.write());
            }
        })
    }
}

impl<T: std::fmt::Debug, E: std::fmt::Debug> std::fmt::Debug for AsyncStore<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("AsyncStore")
            .field("value", &state.value)
            .field("rejection", &state.rejection)
            .field("update_counter", &state.update_counter)
            .field("last_successful_update", &state.last_successful_update)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type TestStore = AsyncStore<u32, String>;

    #[test]
    fn starts_pending_or_available() {
        let empty = TestStore::new();
        assert!(!empty.is_available());
        assert!(empty.get().is_pending());

        let full = TestStore::with_value(3);
        assert!(full.is_available());
        assert_eq!(full.get(), AsyncResult::Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn newer_ticket_wins_even_when_it_finishes_first() {
        let store = TestStore::new();

        let slow = store.set_async(async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(1)
        });
        let fast = store.set_async(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(2)
        });

        let (slow_won, fast_won) = tokio::join!(slow, fast);

        assert!(fast_won);
        assert!(!slow_won);
        assert_eq!(store.get(), AsyncResult::Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn older_write_commits_when_newer_is_still_running() {
        let store = TestStore::new();
        let first = store.set_async(async { Ok(1) });
        let second = store.set_async(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(2)
        });

        assert!(first.await);
        assert_eq!(store.get(), AsyncResult::Ok(1));
        assert!(second.await);
        assert_eq!(store.get(), AsyncResult::Ok(2));
    }

    #[tokio::test]
    async fn get_or_wait_resolves_with_next_set() {
        let store = TestStore::new();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.get_or_wait().await })
        };
        tokio::task::yield_now().await;

        store.set(7);

        assert_eq!(waiter.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn get_or_wait_returns_immediately_when_available() {
        let store = TestStore::with_value(5);
        assert_eq!(store.get_or_wait().await, Ok(5));
    }

    #[tokio::test]
    async fn get_or_wait_fails_fast_when_rejected() {
        let store = TestStore::new();
        store.set_rejected("down".into());
        assert_eq!(store.get_or_wait().await, Err("down".to_string()));
        assert!(store.is_rejected());
        assert!(!store.is_available());
    }

    #[tokio::test]
    async fn rejection_fails_pending_waiters() {
        let store = TestStore::new();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.get_or_wait().await })
        };
        tokio::task::yield_now().await;

        store.set_rejected("boom".into());

        assert_eq!(waiter.await.unwrap(), Err("boom".to_string()));
    }

    #[tokio::test]
    async fn failed_async_write_rejects_store() {
        let store = TestStore::with_value(1);
        let won = store.set_async(async { Err("timeout".to_string()) }).await;

        assert!(won);
        assert_eq!(store.get(), AsyncResult::Error("timeout".to_string()));
    }

    #[tokio::test]
    async fn set_after_rejection_recovers() {
        let store = TestStore::new();
        store.set_rejected("x".into());
        store.set(4);
        assert_eq!(store.get(), AsyncResult::Ok(4));
        assert!(!store.is_rejected());
    }

    #[test]
    fn set_unavailable_returns_to_pending() {
        let store = TestStore::with_value(1);
        store.set_unavailable();
        assert!(store.get().is_pending());
    }

    #[test]
    fn on_change_sees_only_successes() {
        let store = TestStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = store.on_change(move |value, previous| {
            sink.lock().push((*value, previous.copied()));
        });

        store.set(1);
        store.set_rejected("e".into());
        store.set_unavailable();
        store.set(2);

        assert_eq!(*seen.lock(), vec![(1, None), (2, None)]);
    }

    #[test]
    fn on_state_change_sees_all_states() {
        let store = TestStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = store.on_state_change(move |outcome| sink.lock().push(outcome.clone()));

        store.set(1);
        store.set_rejected("e".into());
        store.set_unavailable();

        assert_eq!(
            *seen.lock(),
            vec![
                AsyncResult::Ok(1),
                AsyncResult::Error("e".to_string()),
                AsyncResult::pending(),
            ]
        );
    }

    #[test]
    fn once_variants_fire_once() {
        let store = TestStore::new();
        let values = Arc::new(Mutex::new(Vec::new()));
        let states = Arc::new(Mutex::new(0usize));
        let (v, s) = (values.clone(), states.clone());
        let _a = store.once_change(move |value, _| v.lock().push(*value));
        let _b = store.once_state_change(move |_| *s.lock() += 1);

        store.set(1);
        store.set(2);

        assert_eq!(*values.lock(), vec![1]);
        assert_eq!(*states.lock(), 1);
    }

    #[test]
    fn unsubscribed_callbacks_stay_quiet() {
        let store = TestStore::new();
        let hits = Arc::new(Mutex::new(0usize));
        let sink = hits.clone();
        let sub = store.on_change(move |_, _| *sink.lock() += 1);
        sub.unsubscribe();

        store.set(1);
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn update_passes_previous_value() {
        let store = TestStore::new();
        assert_eq!(store.update(|prev| prev.copied().unwrap_or(0) + 1), 1);
        assert_eq!(store.update(|prev| prev.copied().unwrap_or(0) + 1), 2);
    }

    #[test]
    fn update_supersedes_outstanding_tickets() {
        let store = TestStore::new();
        let ticket = store.issue_ticket();
        store.update(|_| 9);
        assert!(!store.set_if_latest(ticket, AsyncResult::Ok(1)));
        assert_eq!(store.get(), AsyncResult::Ok(9));
    }

    #[test]
    fn pending_outcome_marks_unavailable() {
        let store = TestStore::with_value(1);
        let ticket = store.issue_ticket();
        assert!(store.set_if_latest(ticket, AsyncResult::pending()));
        assert!(!store.is_available());
    }

    #[test]
    fn map_follows_source() {
        let store = TestStore::with_value(2);
        let doubled = store.map(|v| v * 2);
        assert_eq!(doubled.get(), AsyncResult::Ok(4));

        store.set(5);
        assert_eq!(doubled.get(), AsyncResult::Ok(10));
    }
}
