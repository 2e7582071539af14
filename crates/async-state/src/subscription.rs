//! Handles returned by `on_change`-style registrations

use std::fmt;

/// A registered callback. Dropping the handle keeps the callback registered;
/// call [`Subscription::unsubscribe`] to remove it.
#[must_use = "dropping a Subscription leaves the callback registered forever"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wrap the teardown that removes a registration.
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Combine several subscriptions into one handle.
    pub fn all(subscriptions: Vec<Subscription>) -> Self {
        Self::new(move || {
            for subscription in subscriptions {
                subscription.unsubscribe();
            }
        })
    }

    /// Remove the callback. Idempotent with respect to once-callbacks that
    /// already fired.
    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Monotonic id for callback maps.
pub(crate) type SubscriptionId = u64;
