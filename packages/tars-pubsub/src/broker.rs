//! Broker collaborator abstraction.
//!
//! The engine never talks to a transport directly. A [`Broker`] moves
//! [`Envelope`]s between processes; the engine adds codecs, handler binding
//! and subscription bookkeeping on top.
//!
//! Brokers speak `anyhow`; the engine wraps their failures in
//! [`PubSubError::Transport`] without changing the text.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::envelope::Envelope;
use crate::error::PubSubError;
use crate::subscriber::SubscriberOptions;

/// Connection settings passed to [`Broker::init`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerOptions {
    /// Broker endpoints.
    pub addrs: Vec<String>,
}

impl BrokerOptions {
    pub fn new(addrs: Vec<String>) -> Self {
        Self { addrs }
    }
}

/// Broker-native subscription options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Consumer group name.
    pub queue: Option<String>,
    /// Acknowledge after a successful callback.
    pub auto_ack: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            queue: None,
            auto_ack: true,
        }
    }
}

impl From<&SubscriberOptions> for SubscribeOptions {
    fn from(opts: &SubscriberOptions) -> Self {
        Self {
            queue: opts.queue.clone().filter(|q| !q.is_empty()),
            auto_ack: opts.auto_ack,
        }
    }
}

// =============================================================================
// Event
// =============================================================================

/// One delivery handed to a subscription callback.
pub trait Event: Send + Sync {
    /// Topic the delivery arrived on.
    fn topic(&self) -> &str;

    /// The delivered envelope. Read-only.
    fn message(&self) -> &Envelope;

    /// Acknowledge the delivery.
    fn ack(&self) -> anyhow::Result<()>;
}

/// Plain [`Event`] implementation that remembers whether it was acked.
#[derive(Debug)]
pub struct Delivery {
    topic: String,
    envelope: Envelope,
    acked: AtomicBool,
}

impl Delivery {
    pub fn new(topic: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            topic: topic.into(),
            envelope,
            acked: AtomicBool::new(false),
        }
    }

    /// Returns true once [`Event::ack`] has been called.
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }
}

impl Event for Delivery {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn message(&self) -> &Envelope {
        &self.envelope
    }

    fn ack(&self) -> anyhow::Result<()> {
        self.acked.store(true, Ordering::Release);
        Ok(())
    }
}

/// Callback a broker invokes for each delivery.
///
/// The returned future resolves once every handler has finished; its outcome
/// drives ack/nack decisions.
pub type EventHandler =
    Arc<dyn Fn(Arc<dyn Event>) -> BoxFuture<'static, Result<(), PubSubError>> + Send + Sync>;

// =============================================================================
// Broker
// =============================================================================

/// Handle to a live broker-side subscription.
#[async_trait]
pub trait BrokerSubscription: Send + Sync {
    /// Subscribed topic.
    fn topic(&self) -> &str;

    /// Options the subscription was created with.
    fn options(&self) -> &SubscribeOptions;

    /// Stop deliveries. No new callback starts after this returns.
    async fn unsubscribe(&self) -> anyhow::Result<()>;
}

/// A pub/sub transport.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short broker name, for logs.
    fn name(&self) -> &str;

    /// Apply connection settings.
    async fn init(&self, options: BrokerOptions) -> anyhow::Result<()>;

    /// Open the connection.
    async fn connect(&self) -> anyhow::Result<()>;

    /// Close the connection.
    async fn disconnect(&self) -> anyhow::Result<()>;

    /// Send an envelope to `topic`.
    async fn publish(&self, topic: &str, envelope: Envelope) -> anyhow::Result<()>;

    /// Start delivering `topic` to `handler`.
    async fn subscribe(
        &self,
        topic: &str,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> anyhow::Result<Box<dyn BrokerSubscription>>;
}

impl fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker").field("name", &self.name()).finish()
    }
}

impl fmt::Debug for dyn BrokerSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSubscription")
            .field("topic", &self.topic())
            .field("options", self.options())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Header;

    #[test]
    fn test_subscribe_options_from_subscriber_options() {
        let opts = SubscribeOptions::from(&SubscriberOptions::default());
        assert_eq!(opts, SubscribeOptions::default());

        let opts = SubscribeOptions::from(
            &SubscriberOptions::default().queue("workers").disable_auto_ack(),
        );
        assert_eq!(opts.queue.as_deref(), Some("workers"));
        assert!(!opts.auto_ack);

        let opts = SubscribeOptions::from(&SubscriberOptions::default().queue(""));
        assert!(opts.queue.is_none());
    }

    #[test]
    fn test_delivery_ack() {
        let delivery = Delivery::new("orders", Envelope::new(Header::new(), Vec::new()));
        assert!(!delivery.is_acked());
        delivery.ack().unwrap();
        assert!(delivery.is_acked());
        assert_eq!(delivery.topic(), "orders");
    }
}
