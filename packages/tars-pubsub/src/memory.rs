//! In-process broker.
//!
//! Delivers envelopes to subscriptions in the same process. `publish` awaits
//! every callback it triggers, so callers observe handler completion
//! when it returns.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: failed deliveries are logged and recorded,
//!   never retried
//! - **In-memory only**: nothing is persisted
//! - **Queue groups**: within one queue group, each envelope goes to one
//!   randomly chosen member; subscriptions without a queue all receive it

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::bail;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::broker::{
    Broker, BrokerOptions, BrokerSubscription, Delivery, Event, EventHandler, SubscribeOptions,
};
use crate::envelope::Envelope;

/// A delivery whose callback returned an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDelivery {
    pub topic: String,
    pub error: String,
}

#[derive(Clone)]
struct Entry {
    id: u64,
    options: SubscribeOptions,
    handler: EventHandler,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inner {
    connected: AtomicBool,
    options: RwLock<BrokerOptions>,
    next_id: AtomicU64,
    subscriptions: DashMap<String, Vec<Entry>>,
    failed: RwLock<Vec<FailedDelivery>>,
    acked: AtomicUsize,
}

/// In-process [`Broker`].
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true between `connect` and `disconnect`.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Options passed to the last `init`.
    pub fn options(&self) -> BrokerOptions {
        self.inner
            .options
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.inner
            .subscriptions
            .get(topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Deliveries whose callback failed, oldest first.
    pub fn failed_deliveries(&self) -> Vec<FailedDelivery> {
        self.inner
            .failed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of deliveries acknowledged automatically.
    pub fn acked_count(&self) -> usize {
        self.inner.acked.load(Ordering::Acquire)
    }

    /// Pick the entries that receive one envelope.
    fn targets(&self, topic: &str) -> Vec<Entry> {
        let Some(entries) = self.inner.subscriptions.get(topic) else {
            return Vec::new();
        };

        let mut targets = Vec::with_capacity(entries.len());
        let mut groups: HashMap<&str, Vec<&Entry>> = HashMap::new();
        for entry in entries.iter() {
            match entry.options.queue.as_deref() {
                Some(queue) => groups.entry(queue).or_default().push(entry),
                None => targets.push(entry.clone()),
            }
        }
        for members in groups.into_values() {
            let pick = fastrand::usize(..members.len());
            targets.push(members[pick].clone());
        }
        targets
    }

    async fn deliver(&self, topic: &str, entry: Entry, envelope: Envelope) {
        if !entry.active.load(Ordering::Acquire) {
            return;
        }

        let delivery = Arc::new(Delivery::new(topic, envelope));
        let event: Arc<dyn Event> = delivery.clone();

        match (entry.handler)(event).await {
            Ok(()) => {
                if entry.options.auto_ack && delivery.ack().is_ok() {
                    self.inner.acked.fetch_add(1, Ordering::AcqRel);
                }
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "delivery failed");
                self.inner
                    .failed
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(FailedDelivery {
                        topic: topic.to_string(),
                        error: e.to_string(),
                    });
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn init(&self, options: BrokerOptions) -> anyhow::Result<()> {
        *self
            .inner
            .options
            .write()
            .unwrap_or_else(|e| e.into_inner()) = options;
        Ok(())
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.inner.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.inner.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> anyhow::Result<()> {
        if !self.is_connected() {
            bail!("memory broker not connected");
        }

        let targets = self.targets(topic);
        debug!(topic = %topic, subscribers = targets.len(), "memory publish");

        join_all(
            targets
                .into_iter()
                .map(|entry| self.deliver(topic, entry, envelope.clone())),
        )
        .await;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> anyhow::Result<Box<dyn BrokerSubscription>> {
        if !self.is_connected() {
            bail!("memory broker not connected");
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel);
        let active = Arc::new(AtomicBool::new(true));
        self.inner
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(Entry {
                id,
                options: options.clone(),
                handler,
                active: active.clone(),
            });

        Ok(Box::new(MemorySubscription {
            topic: topic.to_string(),
            id,
            options,
            active,
            inner: self.inner.clone(),
        }))
    }
}

struct MemorySubscription {
    topic: String,
    id: u64,
    options: SubscribeOptions,
    active: Arc<AtomicBool>,
    inner: Arc<Inner>,
}

#[async_trait]
impl BrokerSubscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    async fn unsubscribe(&self) -> anyhow::Result<()> {
        self.active.store(false, Ordering::Release);
        if let Some(mut entries) = self.inner.subscriptions.get_mut(&self.topic) {
            entries.retain(|entry| entry.id != self.id);
        }
        self.inner
            .subscriptions
            .remove_if(&self.topic, |_, entries| entries.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Header;
    use crate::error::PubSubError;
    use futures::future::BoxFuture;
    use futures::FutureExt;

    fn counting_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        Arc::new(move |_event: Arc<dyn Event>| -> BoxFuture<'static, Result<(), PubSubError>> {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
    }

    fn envelope() -> Envelope {
        Envelope::new(Header::new(), &b"hi"[..])
    }

    async fn connected() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let broker = MemoryBroker::new();
        assert!(broker.publish("t", envelope()).await.is_err());

        let counter = Arc::new(AtomicUsize::new(0));
        assert!(broker
            .subscribe("t", counting_handler(counter), SubscribeOptions::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_fan_out_and_auto_ack() {
        let broker = connected().await;
        let counter = Arc::new(AtomicUsize::new(0));

        let _a = broker
            .subscribe("t", counting_handler(counter.clone()), SubscribeOptions::default())
            .await
            .unwrap();
        let _b = broker
            .subscribe("t", counting_handler(counter.clone()), SubscribeOptions::default())
            .await
            .unwrap();

        broker.publish("t", envelope()).await.unwrap();
        broker.publish("other", envelope()).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(broker.acked_count(), 2);
    }

    #[tokio::test]
    async fn test_disabled_auto_ack() {
        let broker = connected().await;
        let counter = Arc::new(AtomicUsize::new(0));
        let opts = SubscribeOptions {
            queue: None,
            auto_ack: false,
        };
        let _sub = broker
            .subscribe("t", counting_handler(counter.clone()), opts)
            .await
            .unwrap();

        broker.publish("t", envelope()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(broker.acked_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_group_delivers_once() {
        let broker = connected().await;
        let counter = Arc::new(AtomicUsize::new(0));
        let opts = SubscribeOptions {
            queue: Some("workers".into()),
            auto_ack: true,
        };

        let mut subs = Vec::new();
        for _ in 0..3 {
            subs.push(
                broker
                    .subscribe("jobs", counting_handler(counter.clone()), opts.clone())
                    .await
                    .unwrap(),
            );
        }

        for _ in 0..10 {
            broker.publish("jobs", envelope()).await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let broker = connected().await;
        let counter = Arc::new(AtomicUsize::new(0));
        let sub = broker
            .subscribe("t", counting_handler(counter.clone()), SubscribeOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.subscription_count("t"), 1);

        sub.unsubscribe().await.unwrap();
        assert_eq!(broker.subscription_count("t"), 0);

        broker.publish("t", envelope()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_delivery_recorded() {
        let broker = connected().await;
        let handler: EventHandler = Arc::new(|event: Arc<dyn Event>| -> BoxFuture<'static, Result<(), PubSubError>> {
            let topic = event.topic().to_string();
            async move {
                Err(PubSubError::HandlerFailed {
                    topic,
                    errors: vec!["nope".into()],
                })
            }
            .boxed()
        });
        let _sub = broker
            .subscribe("t", handler, SubscribeOptions::default())
            .await
            .unwrap();

        broker.publish("t", envelope()).await.unwrap();

        let failed = broker.failed_deliveries();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error, "subscriber error: nope");
        assert_eq!(broker.acked_count(), 0);
    }
}
