//! Reference-counted subscription multiplexing shared by subscribable clients.
//!
//! Many local callers may subscribe to the same transport subscription key.
//! The table keeps one count per key and reports the 0→1 and 1→0 edges as
//! [`Transition`]s so the owning client touches the transport exactly once
//! per edge. Counts and handlers change together under one lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::{ProtocolSubscription, SubscriptionHandler};
use crate::payload::Payload;

/// Identifies one local registration on one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Effect of a registration change on the transport subscription for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First subscriber for the key: the transport must subscribe.
    Activated,
    /// The key was already (or is still) subscribed by someone else.
    Retained,
    /// Last subscriber left: the transport must unsubscribe.
    Deactivated,
    /// The handler id was not registered.
    Unknown,
}

struct Registration {
    subscription: ProtocolSubscription,
    handler: Arc<dyn SubscriptionHandler>,
}

#[derive(Default)]
struct Inner {
    counts: HashMap<String, usize>,
    handlers: HashMap<HandlerId, Registration>,
}

#[derive(Default)]
pub struct SubscriptionTable {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler and bumps the count for its subscription key.
    pub fn add(
        &self,
        subscription: &ProtocolSubscription,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> (HandlerId, Transition) {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock();
        let count = inner
            .counts
            .entry(subscription.key().to_string())
            .or_insert(0);
        *count += 1;
        let transition = if *count == 1 {
            Transition::Activated
        } else {
            Transition::Retained
        };
        debug!(
            "Subscription '{}' now has {} local subscriber(s)",
            subscription.key(),
            count
        );
        inner.handlers.insert(
            id,
            Registration {
                subscription: subscription.clone(),
                handler,
            },
        );
        (id, transition)
    }

    /// Removes a handler and drops the count for its key. Returns the removed
    /// subscription so the caller can address the transport.
    pub fn remove(&self, id: HandlerId) -> (Option<ProtocolSubscription>, Transition) {
        let mut inner = self.inner.lock();
        let Some(registration) = inner.handlers.remove(&id) else {
            return (None, Transition::Unknown);
        };
        let key = registration.subscription.key().to_string();
        let remaining = match inner.counts.get_mut(&key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        let transition = if remaining == 0 {
            inner.counts.remove(&key);
            Transition::Deactivated
        } else {
            Transition::Retained
        };
        (Some(registration.subscription), transition)
    }

    /// The subscription a handler id is registered for.
    pub fn subscription(&self, id: HandlerId) -> Option<ProtocolSubscription> {
        self.inner
            .lock()
            .handlers
            .get(&id)
            .map(|r| r.subscription.clone())
    }

    /// Number of local subscribers sharing `key`.
    pub fn count(&self, key: &str) -> usize {
        self.inner.lock().counts.get(key).copied().unwrap_or(0)
    }

    /// Keys with at least one subscriber, taken under the lock so a reconnect
    /// can resubscribe without racing concurrent unsubscribes.
    pub fn snapshot(&self) -> Vec<(ProtocolSubscription, usize)> {
        let inner = self.inner.lock();
        let mut seen: HashMap<&str, (ProtocolSubscription, usize)> = HashMap::new();
        for registration in inner.handlers.values() {
            let key = registration.subscription.key();
            if let Some(count) = inner.counts.get(key) {
                seen.entry(key)
                    .or_insert_with(|| (registration.subscription.clone(), *count));
            }
        }
        seen.into_values().collect()
    }

    /// Fans `payload` out to every handler whose subscription key equals
    /// `key`. Handlers run outside the lock. Returns how many were invoked.
    pub fn dispatch(&self, key: &str, payload: &Payload) -> usize {
        let handlers: Vec<Arc<dyn SubscriptionHandler>> = {
            let inner = self.inner.lock();
            let mut matching: Vec<_> = inner
                .handlers
                .iter()
                .filter(|(_, r)| r.subscription.key() == key)
                .collect();
            matching.sort_by_key(|(id, _)| **id);
            matching
                .into_iter()
                .map(|(_, r)| Arc::clone(&r.handler))
                .collect()
        };
        for handler in &handlers {
            handler.on_message(key, payload);
        }
        handlers.len()
    }
}
