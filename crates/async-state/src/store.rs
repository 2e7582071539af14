//! Synchronous reactive container
//!
//! A `Store` owns one value and a set of change callbacks. Every `set` runs
//! each registered callback once with `(new, old)`. Callbacks run after the
//! internal lock is released, so they are free to read or write the store.
//! Cloning a `Store` clones the handle; all clones share the value.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::listeners::{Listeners, once2};
use crate::subscription::Subscription;

/// Callback invoked with `(new_value, old_value)`.
pub type ChangeCallback<T> = dyn Fn(&T, &T) + Send + Sync;

struct Inner<T> {
    value: T,
    listeners: Listeners<ChangeCallback<T>>,
}

/// A value plus change subscribers.
pub struct Store<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Default + Clone + Send + Sync + 'static> Default for Store<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + Send + Sync + 'static> Store<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                value,
                listeners: Listeners::new(),
            })),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.inner.lock().value.clone()
    }

    /// Borrow the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.lock().value)
    }

    /// Replace the value and notify every subscriber.
    pub fn set(&self, value: T) {
        let (new, old, callbacks) = {
            let mut inner = self.inner.lock();
            let old = std::mem::replace(&mut inner.value, value);
            (inner.value.clone(), old, inner.listeners.snapshot())
        };
        for callback in callbacks {
            callback(&new, &old);
        }
    }

    /// Set the value to `f(current)` and return it.
    ///
    /// `f` runs under the store lock and must not touch this store.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> T {
        let (new, old, callbacks) = {
            let mut inner = self.inner.lock();
            let next = f(&inner.value);
            let old = std::mem::replace(&mut inner.value, next);
            (inner.value.clone(), old, inner.listeners.snapshot())
        };
        for callback in callbacks {
            callback(&new, &old);
        }
        new
    }

    /// Atomically replace the value if `predicate(current)` holds.
    ///
    /// Subscribers are notified only when the value was replaced.
    pub fn replace_if(&self, predicate: impl FnOnce(&T) -> bool, value: T) -> bool {
        let (new, old, callbacks) = {
            let mut inner = self.inner.lock();
            if !predicate(&inner.value) {
                return false;
            }
            let old = std::mem::replace(&mut inner.value, value);
            (inner.value.clone(), old, inner.listeners.snapshot())
        };
        for callback in callbacks {
            callback(&new, &old);
        }
        true
    }

    /// Subscribe to every change.
    pub fn on_change(&self, callback: impl Fn(&T, &T) + Send + Sync + 'static) -> Subscription {
        self.subscribe(Arc::new(callback), false)
    }

    /// Subscribe to the next change only.
    pub fn once_change(&self, callback: impl FnOnce(&T, &T) + Send + 'static) -> Subscription {
        self.subscribe(Arc::new(once2(callback)), true)
    }

    /// Number of registered callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    fn subscribe(&self, callback: Arc<ChangeCallback<T>>, once: bool) -> Subscription {
        let id = self.inner.lock().listeners.insert(callback, once);
        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().listeners.remove(id);
            }
        })
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Store")
            .field("value", &inner.value)
            .field("subscribers", &inner.listeners.len())
            .finish()
    }
}
