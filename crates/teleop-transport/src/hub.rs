//! In-process fan-out of decoded point-cloud frames.
//!
//! [`FrameHub`] keeps an ordered list of callbacks.  Each
//! [`FrameHub::subscribe`] call adds a distinct registration, even when the
//! same callback is registered twice, and the returned [`Subscription`]
//! removes exactly that registration.
//!
//! Callbacks run on the task that publishes the frame, in registration
//! order.  They must return quickly; anything heavy should be handed off to
//! a channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use teleop_types::DecodedFrame;

/// Listener invoked once per decoded frame.
pub type FrameCallback = Arc<dyn Fn(Arc<DecodedFrame>) + Send + Sync>;

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, FrameCallback)>>,
}

impl HubInner {
    fn subscribers(&self) -> MutexGuard<'_, Vec<(u64, FrameCallback)>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared frame fan-out. Clones share the same subscriber list.
#[derive(Clone, Default)]
pub struct FrameHub {
    inner: Arc<HubInner>,
}

impl FrameHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback`.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Arc<DecodedFrame>) + Send + Sync + 'static,
    {
        self.subscribe_shared(Arc::new(callback))
    }

    /// Register an already shared callback.  Registering the same `Arc`
    /// twice yields two independent registrations.
    pub fn subscribe_shared(&self, callback: FrameCallback) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers().push((id, callback));
        Subscription {
            id,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `frame` to every current subscriber.
    ///
    /// Returns how many callbacks were invoked.
    pub fn publish(&self, frame: Arc<DecodedFrame>) -> usize {
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<FrameCallback> = self
            .inner
            .subscribers()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in &callbacks {
            cb(Arc::clone(&frame));
        }
        callbacks.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }
}

impl std::fmt::Debug for FrameHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle to one registration on a [`FrameHub`].
///
/// Dropping the handle leaves the callback registered.
#[must_use = "dropping a Subscription makes it impossible to unsubscribe"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove this registration.  Returns `false` if the hub is gone.
    pub fn unsubscribe(self) -> bool {
        let Some(hub) = self.hub.upgrade() else {
            return false;
        };
        let mut subscribers = hub.subscribers();
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != self.id);
        subscribers.len() != before
    }
}
