//! Engine: the explicitly constructed entry point tying broker, codecs,
//! subscription registry and publisher together.
//!
//! # Lifecycle
//!
//! ```text
//! builder ──► build ──► start (init + connect) ──► register / publish ... ──► shutdown
//!                                                                          │
//!        close registry ◄───────────────────────────────────────────────────┘
//!        unsubscribe every topic
//!        wait for in-flight handlers (bounded)
//!        disconnect
//! ```
//!
//! # Example
//!
//! ```ignore
//! let engine = Engine::builder(Arc::new(MemoryBroker::new()))
//!     .with_config(Config::from_env()?)
//!     .build();
//! engine.start().await?;
//!
//! engine
//!     .register_subscriber("orders.created", handler_fn(on_created), SubscriberOptions::default())
//!     .await?;
//!
//! engine
//!     .publish(&Context::background(), "orders.created", &order, PublishOptions::default().with_content_type(JSON))
//!     .await?;
//!
//! engine.shutdown().await?;
//! ```

use std::sync::Arc;

use smallvec::smallvec;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerOptions, SubscribeOptions};
use crate::codec::{CodecRegistry, NewCodec, Payload};
use crate::config::Config;
use crate::context::Context;
use crate::dispatch::{DispatchAdapter, SubscriberWrapper};
use crate::envelope::MessageId;
use crate::error::PubSubError;
use crate::handler::IntoHandlers;
use crate::inflight::InflightTracker;
use crate::publisher::{PublishOptions, Publisher};
use crate::registry::SubscriptionRegistry;
use crate::subscriber::{Subscriber, SubscriberOptions};

// =============================================================================
// Engine Builder
// =============================================================================

/// Builder for constructing an [`Engine`].
pub struct EngineBuilder {
    broker: Arc<dyn Broker>,
    config: Config,
    codecs: CodecRegistry,
    wrappers: Vec<SubscriberWrapper>,
    inflight: Arc<InflightTracker>,
}

impl EngineBuilder {
    /// Create a new engine builder around `broker`, with default config and
    /// the built-in codecs.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            config: Config::default(),
            codecs: CodecRegistry::default(),
            wrappers: Vec::new(),
            inflight: Arc::new(InflightTracker::new()),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Register (or replace) a codec.
    pub fn with_codec(mut self, content_type: &str, codec: NewCodec) -> Self {
        self.codecs.register(content_type, codec);
        self
    }

    /// Replace the whole codec table.
    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Add middleware around every handler invocation.
    ///
    /// Wrappers added first run outermost.
    pub fn wrap_subscriber(mut self, wrapper: SubscriberWrapper) -> Self {
        self.wrappers.push(wrapper);
        self
    }

    /// Use an existing inflight tracker instead of creating a new one.
    pub fn with_inflight(mut self, inflight: Arc<InflightTracker>) -> Self {
        self.inflight = inflight;
        self
    }

    pub fn build(self) -> Engine {
        let codecs = Arc::new(self.codecs);
        let publisher = Publisher::new(
            self.broker.clone(),
            codecs.clone(),
            self.config.default_content_type.as_str(),
            self.config.proxy.clone(),
        );

        Engine {
            broker: self.broker,
            codecs,
            config: self.config,
            registry: SubscriptionRegistry::new(),
            inflight: self.inflight,
            wrappers: self.wrappers,
            publisher,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Pub/sub engine.
pub struct Engine {
    broker: Arc<dyn Broker>,
    codecs: Arc<CodecRegistry>,
    config: Config,
    registry: SubscriptionRegistry,
    inflight: Arc<InflightTracker>,
    wrappers: Vec<SubscriberWrapper>,
    publisher: Publisher,
}

impl Engine {
    /// Start building an engine around `broker`.
    pub fn builder(broker: Arc<dyn Broker>) -> EngineBuilder {
        EngineBuilder::new(broker)
    }

    /// Initialize and connect the broker.
    pub async fn start(&self) -> Result<(), PubSubError> {
        info!(broker = %self.broker.name(), "starting pubsub engine");

        let options = BrokerOptions::new(self.config.broker_addrs.clone());
        if let Err(e) = self.broker.init(options).await {
            warn!(broker = %self.broker.name(), error = %e, "broker init failed");
            return Err(PubSubError::transport(e));
        }
        debug!(broker = %self.broker.name(), "broker initialized");

        if let Err(e) = self.broker.connect().await {
            warn!(broker = %self.broker.name(), error = %e, "broker connect failed");
            return Err(PubSubError::transport(e));
        }
        info!(broker = %self.broker.name(), "broker connected");
        Ok(())
    }

    /// Build a validated subscriber without registering it.
    pub fn new_subscriber(
        &self,
        topic: &str,
        handlers: impl IntoHandlers,
        options: SubscriberOptions,
    ) -> Result<Subscriber, PubSubError> {
        Subscriber::new(topic, handlers, options)
    }

    /// Bind `handlers` and subscribe them to `topic`.
    ///
    /// Fails with `AlreadyExists` before binding if the topic is taken.
    pub async fn register_subscriber(
        &self,
        topic: &str,
        handlers: impl IntoHandlers,
        options: SubscriberOptions,
    ) -> Result<(), PubSubError> {
        if self.registry.contains(topic) {
            return Err(PubSubError::AlreadyExists {
                topic: topic.to_string(),
            });
        }
        let subscriber = self.new_subscriber(topic, handlers, options)?;
        self.subscribe(subscriber).await
    }

    /// Register a subscriber built with [`new_subscriber`](Self::new_subscriber).
    ///
    /// The topic is claimed before the broker is called; if the broker
    /// rejects the subscription the claim is released.
    pub async fn subscribe(&self, subscriber: Subscriber) -> Result<(), PubSubError> {
        let reservation = self.registry.reserve(subscriber.topic())?;
        let topic = reservation.topic().to_string();
        let subscriber = Arc::new(subscriber);

        let adapter = Arc::new(DispatchAdapter::new(
            subscriber.clone(),
            self.codecs.clone(),
            self.config.default_content_type.as_str(),
            self.inflight.clone(),
            &self.wrappers,
        ));
        let options = SubscribeOptions::from(subscriber.options());

        let handle = match self
            .broker
            .subscribe(&topic, adapter.into_event_handler(), options)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(topic = %topic, error = %e, "broker subscribe failed");
                return Err(PubSubError::transport(e));
            }
        };

        if let Err(handles) = reservation.commit(subscriber, smallvec![handle]) {
            for handle in handles {
                if let Err(e) = handle.unsubscribe().await {
                    warn!(topic = %topic, error = %e, "failed to release subscription");
                }
            }
            return Err(PubSubError::ShuttingDown { topic });
        }

        debug!(topic = %topic, "subscribed");
        Ok(())
    }

    /// Tear down the subscription on `topic`.
    ///
    /// Every broker handle is unsubscribed even if one fails; the first
    /// failure is returned. The topic is free again either way.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), PubSubError> {
        let mut teardown = self.registry.begin_teardown(topic)?;
        let handlers = teardown.subscriber().handlers().len();

        let mut first_err = None;
        for handle in teardown.take_handles() {
            if let Err(e) = handle.unsubscribe().await {
                warn!(topic = %topic, error = %e, "broker unsubscribe failed");
                first_err.get_or_insert(e);
            }
        }
        teardown.finish();

        match first_err {
            Some(e) => Err(PubSubError::transport(e)),
            None => {
                debug!(topic = %topic, handlers, "unsubscribed");
                Ok(())
            }
        }
    }

    /// Tear down every registered topic, returning the first failure.
    pub async fn unsubscribe_all(&self) -> Result<(), PubSubError> {
        let mut first_err = None;
        for topic in self.registry.topics() {
            match self.unsubscribe(&topic).await {
                Ok(()) | Err(PubSubError::NotFound { .. }) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Encode `msg` and publish it on `topic`.
    pub async fn publish<T: Payload>(
        &self,
        ctx: &Context,
        topic: &str,
        msg: &T,
        options: PublishOptions,
    ) -> Result<MessageId, PubSubError> {
        self.publisher.publish(ctx, topic, msg, options).await
    }

    /// Graceful shutdown.
    ///
    /// Stops accepting registrations, unsubscribes every topic, waits up to
    /// the configured timeout for running handlers, then disconnects the
    /// broker. The broker is disconnected even if an earlier step failed.
    pub async fn shutdown(&self) -> Result<(), PubSubError> {
        info!(topics = self.registry.len(), "shutting down pubsub engine");
        self.registry.close();

        let mut first_err = self.unsubscribe_all().await.err();

        let timeout = self.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.inflight.wait_zero())
            .await
            .is_err()
        {
            let remaining = self.inflight.count();
            warn!(?timeout, remaining, "in-flight handlers did not drain");
            first_err.get_or_insert(PubSubError::DrainTimeout { timeout, remaining });
        }

        if let Err(e) = self.broker.disconnect().await {
            warn!(broker = %self.broker.name(), error = %e, "broker disconnect failed");
            first_err.get_or_insert(PubSubError::transport(e));
        }

        info!("pubsub engine stopped");
        first_err.map_or(Ok(()), Err)
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.registry.topics()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.registry.is_subscribed(topic)
    }

    /// Number of registered topics.
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn inflight(&self) -> &Arc<InflightTracker> {
        &self.inflight
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("broker", &self.broker.name())
            .field("registry", &self.registry)
            .field("inflight", &self.inflight)
            .finish_non_exhaustive()
    }
}
