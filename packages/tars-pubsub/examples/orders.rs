//! Publish one order through the in-process broker and handle it.
//!
//! ```text
//! RUST_LOG=debug cargo run -p tars-pubsub --example orders
//! ```

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tars_pubsub::codec::JSON;
use tars_pubsub::{
    handler_fn, Config, Context, Engine, MemoryBroker, PublishOptions, SubscriberOptions,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OrderEvent {
    id: String,
}

async fn on_order_created(ctx: Context, order: OrderEvent) -> Result<()> {
    tracing::info!(
        order_id = %order.id,
        topic = ?ctx.topic(),
        message_id = ?ctx.message_id(),
        "order created"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tars_pubsub=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = Config::from_env()?;
    let broker = Arc::new(MemoryBroker::new());
    let engine = Engine::builder(broker.clone()).with_config(config).build();
    engine.start().await?;

    engine
        .register_subscriber(
            "orders.created",
            handler_fn(on_order_created),
            SubscriberOptions::default(),
        )
        .await?;

    let id = engine
        .publish(
            &Context::background().with_value("x-request-id", "demo"),
            "orders.created",
            &OrderEvent { id: "42".into() },
            PublishOptions::default().with_content_type(JSON),
        )
        .await?;
    tracing::info!(message_id = %id, "published");

    for failed in broker.failed_deliveries() {
        tracing::warn!(topic = %failed.topic, error = %failed.error, "delivery failed");
    }

    engine.shutdown().await?;
    Ok(())
}
