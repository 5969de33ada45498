//! Test doubles for code built on the engine.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! tars-pubsub = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tars_pubsub::testing::RecordingBroker;
//!
//! let broker = Arc::new(RecordingBroker::new());
//! let engine = Engine::builder(broker.clone()).build();
//! engine.start().await?;
//!
//! engine.register_subscriber("orders.created", handler_fn(on_created), Default::default()).await?;
//! assert!(broker.was_subscribed_to("orders.created"));
//!
//! // Drive a delivery as if it came off the wire.
//! broker.deliver("orders.created", envelope).await?;
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::broker::{
    Broker, BrokerOptions, BrokerSubscription, Delivery, Event, EventHandler, SubscribeOptions,
};
use crate::envelope::Envelope;
use crate::error::PubSubError;

/// A published message.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    /// Routing target the message was published to.
    pub topic: String,
    pub envelope: Envelope,
}

impl PublishedMessage {
    pub fn body(&self) -> &Bytes {
        &self.envelope.body
    }
}

/// A subscription that was created.
#[derive(Clone)]
struct Recorded {
    topic: String,
    options: SubscribeOptions,
    handler: EventHandler,
}

#[derive(Default)]
struct State {
    options: Option<BrokerOptions>,
    published: Vec<PublishedMessage>,
    subscriptions: Vec<Recorded>,
    unsubscribed: Vec<String>,
    fail_publish: Option<String>,
    fail_subscribe: Option<String>,
    fail_unsubscribe: Option<String>,
}

/// Mock broker that records every call for inspection.
///
/// Nothing is delivered on `publish`; tests drive deliveries explicitly with
/// [`deliver`](Self::deliver).
#[derive(Default)]
pub struct RecordingBroker {
    state: Arc<RwLock<State>>,
    init_calls: AtomicUsize,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
}

impl RecordingBroker {
    /// Create a new recording broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        f(&self.state.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn write<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.write().unwrap_or_else(|e| e.into_inner()))
    }

    /// Make every following `publish` fail with `message`.
    pub fn fail_publish(&self, message: impl Into<String>) {
        let message = message.into();
        self.write(|s| s.fail_publish = Some(message));
    }

    /// Make every following `subscribe` fail with `message`.
    pub fn fail_subscribe(&self, message: impl Into<String>) {
        let message = message.into();
        self.write(|s| s.fail_subscribe = Some(message));
    }

    /// Make every following `unsubscribe` fail with `message`.
    pub fn fail_unsubscribe(&self, message: impl Into<String>) {
        let message = message.into();
        self.write(|s| s.fail_unsubscribe = Some(message));
    }

    /// Clear all injected failures.
    pub fn heal(&self) {
        self.write(|s| {
            s.fail_publish = None;
            s.fail_subscribe = None;
            s.fail_unsubscribe = None;
        });
    }

    /// Get all published messages.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.read(|s| s.published.clone())
    }

    /// Get published messages for a specific topic.
    pub fn messages_for_topic(&self, topic: &str) -> Vec<PublishedMessage> {
        self.read(|s| {
            s.published
                .iter()
                .filter(|m| m.topic == topic)
                .cloned()
                .collect()
        })
    }

    /// Get all live subscribed topics, in subscription order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.read(|s| s.subscriptions.iter().map(|r| r.topic.clone()).collect())
    }

    /// Check if a live subscription exists for a topic.
    pub fn was_subscribed_to(&self, topic: &str) -> bool {
        self.read(|s| s.subscriptions.iter().any(|r| r.topic == topic))
    }

    /// Options of the live subscription for a topic.
    pub fn subscribe_options(&self, topic: &str) -> Option<SubscribeOptions> {
        self.read(|s| {
            s.subscriptions
                .iter()
                .find(|r| r.topic == topic)
                .map(|r| r.options.clone())
        })
    }

    /// Topics unsubscribed so far, in order.
    pub fn unsubscribed(&self) -> Vec<String> {
        self.read(|s| s.unsubscribed.clone())
    }

    /// Options passed to the last `init`.
    pub fn init_options(&self) -> Option<BrokerOptions> {
        self.read(|s| s.options.clone())
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::Acquire)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::Acquire)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::Acquire)
    }

    /// Deliver an envelope to the live subscription on `topic`, returning
    /// the callback's outcome.
    pub async fn deliver(&self, topic: &str, envelope: Envelope) -> Result<(), PubSubError> {
        let handler = self
            .read(|s| {
                s.subscriptions
                    .iter()
                    .find(|r| r.topic == topic)
                    .map(|r| r.handler.clone())
            })
            .ok_or_else(|| PubSubError::NotFound {
                topic: topic.to_string(),
            })?;

        let event: Arc<dyn Event> = Arc::new(Delivery::new(topic, envelope));
        handler(event).await
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    fn name(&self) -> &str {
        "recording"
    }

    async fn init(&self, options: BrokerOptions) -> anyhow::Result<()> {
        self.init_calls.fetch_add(1, Ordering::AcqRel);
        self.write(|s| s.options = Some(options));
        Ok(())
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.connect_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> anyhow::Result<()> {
        self.write(|s| {
            if let Some(message) = &s.fail_publish {
                anyhow::bail!("{message}");
            }
            s.published.push(PublishedMessage {
                topic: topic.to_string(),
                envelope,
            });
            Ok(())
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> anyhow::Result<Box<dyn BrokerSubscription>> {
        self.write(|s| {
            if let Some(message) = &s.fail_subscribe {
                anyhow::bail!("{message}");
            }
            s.subscriptions.push(Recorded {
                topic: topic.to_string(),
                options: options.clone(),
                handler,
            });
            Ok(())
        })?;

        Ok(Box::new(RecordingSubscription {
            topic: topic.to_string(),
            options,
            state: self.state.clone(),
        }))
    }
}

struct RecordingSubscription {
    topic: String,
    options: SubscribeOptions,
    state: Arc<RwLock<State>>,
}

#[async_trait]
impl BrokerSubscription for RecordingSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    async fn unsubscribe(&self) -> anyhow::Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(message) = &state.fail_unsubscribe {
            anyhow::bail!("{message}");
        }
        if let Some(pos) = state.subscriptions.iter().position(|r| r.topic == self.topic) {
            state.subscriptions.remove(pos);
        }
        state.unsubscribed.push(self.topic.clone());
        Ok(())
    }
}
