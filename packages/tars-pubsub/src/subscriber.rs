//! Validated subscriber values.

use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::error::PubSubError;
use crate::handler::{bind, Handler, IntoHandlers};

/// Options for a subscription.
#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    /// Consumer group. Within a group, each message goes to one member.
    pub queue: Option<String>,
    /// Acknowledge automatically after a successful dispatch.
    pub auto_ack: bool,
    /// Base context for handler invocations. Each event replaces its
    /// metadata; a timeout set with [`Context::with_timeout`] restarts per
    /// event.
    pub context: Context,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            queue: None,
            auto_ack: true,
            context: Context::background(),
        }
    }
}

impl SubscriberOptions {
    /// Join the named consumer group.
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = Some(name.into());
        self
    }

    /// Leave acknowledgement to the handlers.
    pub fn disable_auto_ack(mut self) -> Self {
        self.auto_ack = false;
        self
    }

    /// Use `ctx` as the base context.
    pub fn with_context(mut self, ctx: Context) -> Self {
        self.context = ctx;
        self
    }
}

/// A topic bound to a non-empty, validated handler list.
///
/// The handler set is fixed once built.
#[derive(Clone)]
pub struct Subscriber {
    topic: String,
    handlers: Arc<[Handler]>,
    options: SubscriberOptions,
}

impl Subscriber {
    /// Bind and validate `handlers` for `topic`.
    ///
    /// No broker I/O happens here.
    pub fn new(
        topic: impl Into<String>,
        handlers: impl IntoHandlers,
        options: SubscriberOptions,
    ) -> Result<Self, PubSubError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(PubSubError::EmptyTopic);
        }
        let handlers = bind(&topic, handlers)?;
        Ok(Self {
            topic,
            handlers,
            options,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    pub fn options(&self) -> &SubscriberOptions {
        &self.options
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic)
            .field("handlers", &self.handlers.len())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    #[test]
    fn test_options_defaults() {
        let opts = SubscriberOptions::default();
        assert!(opts.auto_ack);
        assert!(opts.queue.is_none());

        let opts = opts.queue("workers").disable_auto_ack();
        assert_eq!(opts.queue.as_deref(), Some("workers"));
        assert!(!opts.auto_ack);
    }

    #[test]
    fn test_empty_topic_rejected() {
        let err = Subscriber::new(
            "",
            handler_fn(|_: String| async { Ok(()) }),
            SubscriberOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PubSubError::EmptyTopic));
    }

    #[test]
    fn test_new_binds_handlers() {
        let sub = Subscriber::new(
            "orders.created",
            handler_fn(|_: String| async { Ok(()) }),
            SubscriberOptions::default(),
        )
        .unwrap();
        assert_eq!(sub.topic(), "orders.created");
        assert_eq!(sub.handlers().len(), 1);
    }
}
