//! # Tars PubSub
//!
//! Topic-based publish/subscribe dispatch over a pluggable broker.
//!
//! ## Core Concepts
//!
//! - A **subscriber** is a topic plus one or more typed handlers. Handlers
//!   are plain async functions taking an optional [`Context`] and a payload.
//! - A **codec** turns bytes into payloads and back, chosen per message by
//!   its `content-type` header. JSON, raw bytes and (feature `proto`)
//!   protobuf are built in.
//! - A **broker** moves [`Envelope`]s. The engine never talks to a wire
//!   protocol directly; it only sees the [`Broker`] trait.
//!
//! ## Architecture
//!
//! ```text
//!  publish(ctx, topic, msg)                           Broker
//!      │                                                │
//!      ▼                                                │ inbound Event
//!  Publisher ── codec.write ──► Envelope ── publish ───►│
//!                                                       ▼
//!                                              DispatchAdapter
//!                                                       │
//!                               header copy, default content-type
//!                               codec lookup, decode per handler
//!                                                       │
//!                        ┌──────────────────────────────┼──────────────┐
//!                        ▼                              ▼              ▼
//!                   handler A                      handler B       handler C
//!                 (own task, wrapped)                  ...            ...
//!                        └──────────────── join ────────┴──────────────┘
//!                                                       │
//!                                        Ok / aggregated HandlerFailed
//! ```
//!
//! ## Guarantees
//!
//! - At most one live subscription per topic. A second registration fails
//!   with [`PubSubError::AlreadyExists`] and leaves the first untouched.
//! - A failed broker subscribe leaves no trace in the registry.
//! - Every handler of a subscriber sees every event; one failing or
//!   panicking handler does not stop the others.
//! - Nothing reaches a handler unless every handler's payload decoded.
//! - Shutdown stops new registrations, tears down existing ones and waits
//!   (bounded) for running handlers.
//!
//! ## Example
//!
//! ```ignore
//! use tars_pubsub::{handler_fn, Context, Engine, MemoryBroker, PublishOptions, SubscriberOptions};
//! use tars_pubsub::codec::JSON;
//!
//! #[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
//! struct OrderCreated {
//!     id: String,
//! }
//!
//! async fn on_created(ctx: Context, order: OrderCreated) -> anyhow::Result<()> {
//!     tracing::info!(id = %order.id, topic = ?ctx.topic(), "order created");
//!     Ok(())
//! }
//!
//! let engine = Engine::builder(Arc::new(MemoryBroker::new())).build();
//! engine.start().await?;
//!
//! engine
//!     .register_subscriber("orders.created", handler_fn(on_created), SubscriberOptions::default())
//!     .await?;
//!
//! engine
//!     .publish(
//!         &Context::background(),
//!         "orders.created",
//!         &OrderCreated { id: "42".into() },
//!         PublishOptions::default().with_content_type(JSON),
//!     )
//!     .await?;
//!
//! engine.shutdown().await?;
//! ```

// Core modules
mod broker;
mod config;
mod context;
mod dispatch;
mod engine;
mod envelope;
mod error;
mod handler;
mod inflight;
mod memory;
mod publisher;
mod registry;
mod subscriber;

// Codec interfaces and built-in codecs
pub mod codec;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export broker seam
pub use broker::{
    Broker, BrokerOptions, BrokerSubscription, Delivery, Event, EventHandler, SubscribeOptions,
};

// Re-export engine
pub use config::Config;
pub use engine::{Engine, EngineBuilder};
pub use registry::{Handles, SubscriptionRegistry};

// Re-export message model
pub use context::Context;
pub use envelope::{Envelope, Header, MessageId, CONTENT_TYPE, MESSAGE_ID, TOPIC};

// Re-export error types
pub use error::{ErrorKind, PubSubError};

// Re-export handler binding
pub use handler::{
    bind, handler_fn, Handler, HandlerFn, HandlerFuture, HandlerSpec, IntoHandlers, InvokeFn,
    Methods, Output, Param, PayloadFactory, PayloadOnly, Signature, WithContext, FUNC_NAME,
    HANDLER_SIGNATURE,
};
pub use subscriber::{Subscriber, SubscriberOptions};

// Re-export dispatch
pub use dispatch::{DispatchAdapter, SubscriberFunc, SubscriberWrapper};
pub use inflight::{InflightGuard, InflightTracker};

// Re-export publishing
pub use publisher::{PublishOptions, Publisher};

// Re-export in-process broker
pub use memory::{FailedDelivery, MemoryBroker};
