//! Topic → subscription table.
//!
//! Registration is split in two phases so that broker I/O never runs under
//! the table lock:
//!
//! 1. [`SubscriptionRegistry::reserve`] claims the topic atomically
//!    (check-then-insert under the shard lock).
//! 2. The caller talks to the broker unlocked, then either
//!    [`Reservation::commit`]s or drops the reservation, which rolls the
//!    claim back.
//!
//! Teardown mirrors this: [`SubscriptionRegistry::begin_teardown`] marks the
//! slot draining and hands out its broker handles; the slot is removed when
//! the [`Teardown`] finishes or drops.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use smallvec::SmallVec;

use crate::broker::BrokerSubscription;
use crate::error::PubSubError;
use crate::subscriber::Subscriber;

/// Broker-side handles backing one topic. Usually exactly one.
pub type Handles = SmallVec<[Box<dyn BrokerSubscription>; 1]>;

enum Slot {
    /// Claimed; broker subscribe in progress.
    Reserved,
    Active {
        subscriber: Arc<Subscriber>,
        handles: Handles,
    },
    /// Broker handles being torn down.
    Draining,
}

/// Table of registered subscriptions, keyed by topic.
#[derive(Default)]
pub struct SubscriptionRegistry {
    slots: DashMap<String, Slot>,
    closed: AtomicBool,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `topic` for a new subscription.
    ///
    /// Fails with `AlreadyExists` if the topic is registered, reserved or
    /// draining, and with `ShuttingDown` once the registry is closed.
    pub fn reserve(&self, topic: &str) -> Result<Reservation<'_>, PubSubError> {
        if self.is_closed() {
            return Err(PubSubError::ShuttingDown {
                topic: topic.to_string(),
            });
        }

        match self.slots.entry(topic.to_string()) {
            Entry::Occupied(_) => Err(PubSubError::AlreadyExists {
                topic: topic.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Slot::Reserved);
                Ok(Reservation {
                    registry: self,
                    topic: topic.to_string(),
                    committed: false,
                })
            }
        }
    }

    /// Start removing `topic`.
    ///
    /// Only registered topics can be torn down; reserved or draining ones
    /// are `NotFound`.
    pub fn begin_teardown(&self, topic: &str) -> Result<Teardown<'_>, PubSubError> {
        let not_found = || PubSubError::NotFound {
            topic: topic.to_string(),
        };

        let mut slot = self.slots.get_mut(topic).ok_or_else(not_found)?;
        if !matches!(*slot, Slot::Active { .. }) {
            return Err(not_found());
        }

        match mem::replace(&mut *slot, Slot::Draining) {
            Slot::Active {
                subscriber,
                handles,
            } => Ok(Teardown {
                registry: self,
                topic: topic.to_string(),
                subscriber,
                handles,
            }),
            // Checked above while holding the shard lock.
            _ => Err(not_found()),
        }
    }

    /// Returns true if `topic` has a slot in any state.
    pub fn contains(&self, topic: &str) -> bool {
        self.slots.contains_key(topic)
    }

    /// Returns true if `topic` is fully registered.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.slots
            .get(topic)
            .is_some_and(|slot| matches!(*slot, Slot::Active { .. }))
    }

    /// The registered subscriber for `topic`.
    pub fn get(&self, topic: &str) -> Option<Arc<Subscriber>> {
        self.slots.get(topic).and_then(|slot| match &*slot {
            Slot::Active { subscriber, .. } => Some(subscriber.clone()),
            _ => None,
        })
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Active { .. }))
            .map(|slot| slot.key().clone())
            .collect();
        topics.sort_unstable();
        topics
    }

    /// Number of registered topics.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Active { .. }))
            .count()
    }

    /// Returns true if no topic is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting registrations.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn release(&self, topic: &str, from: fn(&Slot) -> bool) {
        self.slots.remove_if(topic, |_, slot| from(slot));
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.topics())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// Reservation
// =============================================================================

/// A claimed topic. Dropping it without [`commit`](Self::commit) rolls the
/// claim back.
#[must_use = "dropping a reservation releases the topic"]
pub struct Reservation<'a> {
    registry: &'a SubscriptionRegistry,
    topic: String,
    committed: bool,
}

impl Reservation<'_> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Make the subscription live.
    ///
    /// If the registry was closed meanwhile, the claim is released and the
    /// handles are given back so the caller can tear them down.
    pub fn commit(mut self, subscriber: Arc<Subscriber>, handles: Handles) -> Result<(), Handles> {
        let Some(mut slot) = self.registry.slots.get_mut(&self.topic) else {
            return Err(handles);
        };
        // Checked under the shard lock so a concurrent close + snapshot of
        // topics either sees this slot active or makes us back off.
        if self.registry.is_closed() {
            drop(slot);
            return Err(handles);
        }
        *slot = Slot::Active {
            subscriber,
            handles,
        };
        self.committed = true;
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry
                .release(&self.topic, |slot| matches!(slot, Slot::Reserved));
        }
    }
}

// =============================================================================
// Teardown
// =============================================================================

/// A topic being removed. The slot is deleted when this drops.
pub struct Teardown<'a> {
    registry: &'a SubscriptionRegistry,
    topic: String,
    subscriber: Arc<Subscriber>,
    handles: Handles,
}

impl Teardown<'_> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    /// Take the broker handles to unsubscribe.
    pub fn take_handles(&mut self) -> Handles {
        mem::take(&mut self.handles)
    }

    /// Remove the slot.
    pub fn finish(self) {}
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        self.registry
            .release(&self.topic, |slot| matches!(slot, Slot::Draining));
    }
}
