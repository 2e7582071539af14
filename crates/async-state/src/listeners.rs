//! Callback registry shared by `Store` and `AsyncStore`

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::subscription::SubscriptionId;

struct Entry<F: ?Sized> {
    callback: Arc<F>,
    once: bool,
}

/// Id-keyed callbacks. Always accessed under the owning store's lock; the
/// snapshot is invoked after that lock is released.
pub(crate) struct Listeners<F: ?Sized> {
    next_id: SubscriptionId,
    entries: BTreeMap<SubscriptionId, Entry<F>>,
}

impl<F: ?Sized> Listeners<F> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, callback: Arc<F>, once: bool) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, Entry { callback, once });
        id
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Clone out every callback, dropping once-callbacks from the registry so
    /// they can never fire twice.
    pub(crate) fn snapshot(&mut self) -> Vec<Arc<F>> {
        let mut out = Vec::with_capacity(self.entries.len());
        self.entries.retain(|_, entry| {
            out.push(entry.callback.clone());
            !entry.once
        });
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Adapt an `FnOnce(A, B)` into a callable that runs at most once.
pub(crate) fn once2<A: ?Sized + 'static, B: ?Sized + 'static>(
    f: impl FnOnce(&A, &B) + Send + 'static,
) -> impl Fn(&A, &B) + Send + Sync + 'static {
    let slot = Mutex::new(Some(f));
    move |a: &A, b: &B| {
        if let Some(f) = slot.lock().take() {
            f(a, b);
        }
    }
}

/// Adapt an `FnOnce(A)` into a callable that runs at most once.
pub(crate) fn once1<A: ?Sized + 'static>(
    f: impl FnOnce(&A) + Send + 'static,
) -> impl Fn(&A) + Send + Sync + 'static {
    let slot = Mutex::new(Some(f));
    move |a: &A| {
        if let Some(f) = slot.lock().take() {
            f(a);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Cb = dyn Fn(&u32) + Send + Sync;

    #[test]
    fn snapshot_drops_once_entries() {
        let mut listeners: Listeners<Cb> = Listeners::new();
        listeners.insert(Arc::new(|_: &u32| {}), false);
        listeners.insert(Arc::new(|_: &u32| {}), true);

        assert_eq!(listeners.snapshot().len(), 2);
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners.snapshot().len(), 1);
    }

    #[test]
    fn remove_reports_presence() {
        let mut listeners: Listeners<Cb> = Listeners::new();
        let id = listeners.insert(Arc::new(|_: &u32| {}), false);
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
    }

    #[test]
    fn once_adapter_runs_a_single_time() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let f = once1(move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        f(&1);
        f(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
