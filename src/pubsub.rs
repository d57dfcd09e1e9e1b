//! Generic fan-out registry shared by every subsystem that publishes updates.
//!
//! ```text
//!                       ┌──▶ bounded(depth) ──▶ Subscription #0
//!   broadcast(v) ──▶ [map]──▶ bounded(depth) ──▶ Subscription #1
//!                       └──▶ bounded(depth) ──▶ Subscription #2
//! ```
//!
//! ## Delivery policy
//!
//! Each subscriber owns a bounded channel.  `broadcast` uses a non-blocking
//! `try_send`; when a subscriber's buffer is full the value is dropped for
//! that subscriber only, counted in [`SubscriptionRegistry::dropped`], and
//! logged.  A subscriber whose receiver is gone is pruned on the next
//! broadcast.  A stalled consumer therefore never stalls the publisher.
//!
//! The subscriber map is guarded by one mutex held for the whole fan-out,
//! so a broadcast sees a consistent snapshot: everyone registered before
//! the call gets the value, nobody cancelled before it does.
//!
//! Ids are assigned from a per-registry counter and never reused.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use log::{debug, warn};

pub type SubscriberId = u64;

struct Inner<T> {
    next_id: SubscriberId,
    subscribers: BTreeMap<SubscriberId, Sender<T>>,
}

struct Shared<T> {
    name: &'static str,
    depth: usize,
    inner: Mutex<Inner<T>>,
    dropped: AtomicU64,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: SubscriberId) -> bool {
        // Dropping the Sender closes the subscriber's channel.
        self.lock().subscribers.remove(&id).is_some()
    }
}

// ───────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────

/// Fan-out of `T` values to any number of subscribers.
///
/// Cloning the registry yields another handle to the same subscriber set.
pub struct SubscriptionRegistry<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SubscriptionRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send> SubscriptionRegistry<T> {
    /// `name` tags log lines; `depth` is the per-subscriber buffer (min 1).
    pub fn new(name: &'static str, depth: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                depth: depth.max(1),
                inner: Mutex::new(Inner {
                    next_id: 0,
                    subscribers: BTreeMap::new(),
                }),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register a new subscriber with a fresh bounded channel.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = bounded(self.shared.depth);
        let id = {
            let mut inner = self.shared.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.insert(id, tx);
            id
        };
        debug!("PubSub[{}]: subscriber {} registered", self.shared.name, id);
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.shared),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Deliver `value` to every currently registered subscriber.
    ///
    /// Returns the number of subscribers that accepted the value.
    pub fn broadcast(&self, value: T) -> usize {
        let mut inner = self.shared.lock();
        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, tx) in &inner.subscribers {
            match tx.try_send(value.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "PubSub[{}]: subscriber {} is full, dropping update",
                        self.shared.name, id
                    );
                }
                Err(TrySendError::Disconnected(_)) => gone.push(*id),
            }
        }
        for id in gone {
            inner.subscribers.remove(&id);
            debug!("PubSub[{}]: pruned disconnected subscriber {}", self.shared.name, id);
        }
        delivered
    }

    /// Remove a subscriber and close its channel.  Unknown or already
    /// cancelled ids are ignored; returns whether anything was removed.
    pub fn cancel(&self, id: SubscriberId) -> bool {
        let removed = self.shared.remove(id);
        if removed {
            debug!("PubSub[{}]: subscriber {} cancelled", self.shared.name, id);
        }
        removed
    }

    /// Cancel every remaining subscriber.  Used during owner teardown.
    ///
    /// The registry stays usable afterwards; later subscribers get fresh ids.
    pub fn shutdown(&self) {
        let drained = std::mem::take(&mut self.shared.lock().subscribers);
        if !drained.is_empty() {
            debug!(
                "PubSub[{}]: shutdown closed {} subscriber(s)",
                self.shared.name,
                drained.len()
            );
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }

    /// Total values dropped because a subscriber's buffer was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }
}

// ───────────────────────────────────────────────────────────────
// Subscription handle
// ───────────────────────────────────────────────────────────────

/// One registered listener.  Dropping it cancels the subscription.
pub struct Subscription<T> {
    id: SubscriberId,
    rx: Receiver<T>,
    registry: Weak<Shared<T>>,
    cancelled: AtomicBool,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Block for the next value.  `None` once the subscription is closed
    /// and its buffer drained.
    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Raw receiver, for use in `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }

    /// Unregister from the owning registry.  Idempotent.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.registry.upgrade() {
            shared.remove(self.id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Blocking iterator over received values; ends when the channel closes.
    pub fn iter(&self) -> crossbeam_channel::Iter<'_, T> {
        self.rx.iter()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
