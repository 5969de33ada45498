//! Execution context handed to handlers.
//!
//! A [`Context`] is immutable and cheap to clone: metadata sits behind an
//! `Arc`, and every `with_*` method returns a new context. On the publish
//! side its metadata is copied into the outgoing header; on the dispatch
//! side the adapter builds one context per event from the copied inbound
//! header and shares it read-only with every handler.
//!
//! # Example
//!
//! ```ignore
//! async fn on_order(ctx: Context, order: OrderEvent) -> anyhow::Result<()> {
//!     let trace = ctx.get("trace-id").unwrap_or("-");
//!     tracing::info!(%trace, order_id = %order.id, "order received");
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::envelope::{Header, MessageId};
use crate::inflight::InflightTracker;

/// Immutable execution context.
#[derive(Clone, Default)]
pub struct Context {
    metadata: Arc<Header>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    inflight: Option<Arc<InflightTracker>>,
}

impl Context {
    /// An empty context: no metadata, no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Replace the metadata.
    pub fn with_metadata(&self, metadata: Header) -> Self {
        Self {
            metadata: Arc::new(metadata),
            ..self.clone()
        }
    }

    /// Add one metadata entry.
    pub fn with_value(&self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        let mut metadata = (*self.metadata).clone();
        metadata.insert(key, value);
        self.with_metadata(metadata)
    }

    /// Metadata carried by this context.
    pub fn metadata(&self) -> &Header {
        &self.metadata
    }

    /// Look up one metadata entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key)
    }

    /// Logical topic of the event being handled, if any.
    pub fn topic(&self) -> Option<&str> {
        self.metadata.topic()
    }

    /// Identifier of the event being handled, if any.
    pub fn message_id(&self) -> Option<MessageId> {
        self.metadata.message_id()
    }

    /// Set an absolute deadline.
    ///
    /// Absolute deadlines stay with this context only; they are not carried
    /// into per-event contexts.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            timeout: None,
            ..self.clone()
        }
    }

    /// Set a deadline `timeout` from now.
    ///
    /// Used as a subscriber's base context, every event gets a fresh
    /// deadline `timeout` from the moment it is dispatched.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            timeout: Some(timeout),
            ..self.clone()
        }
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Returns true once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Shared in-flight tracker, when running under an engine.
    pub fn inflight(&self) -> Option<&Arc<InflightTracker>> {
        self.inflight.as_ref()
    }

    /// Derive the per-event context: the inbound header as metadata and,
    /// if the subscriber's context has a timeout, a deadline counted from now.
    pub(crate) fn for_event(&self, header: Header, inflight: &Arc<InflightTracker>) -> Self {
        Self {
            metadata: Arc::new(header),
            deadline: self.timeout.map(|t| Instant::now() + t),
            timeout: self.timeout,
            inflight: Some(inflight.clone()),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("metadata", &self.metadata)
            .field("deadline", &self.deadline)
            .field("timeout", &self.timeout)
            .field("tracked", &self.inflight.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::TOPIC;

    #[test]
    fn test_with_value_does_not_mutate_original() {
        let base = Context::background().with_value("trace-id", "abc");
        let child = base.with_value("tenant", "mn");

        assert_eq!(base.get("tenant"), None);
        assert_eq!(child.get("Trace-Id"), Some("abc"));
        assert_eq!(child.get("tenant"), Some("mn"));
    }

    #[test]
    fn test_deadline_helpers() {
        let ctx = Context::background();
        assert!(ctx.remaining().is_none());
        assert!(!ctx.is_expired());

        let ctx = ctx.with_timeout(Duration::from_secs(60));
        assert!(ctx.remaining().unwrap() > Duration::from_secs(30));
        assert!(!ctx.is_expired());

        let past = Context::background().with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(past.is_expired());
        assert_eq!(past.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_for_event_replaces_metadata() {
        let tracker = Arc::new(InflightTracker::new());
        let base = Context::background().with_value("stale", "1");

        let ctx = base.for_event(Header::new().with(TOPIC, "orders.created"), &tracker);

        assert_eq!(ctx.topic(), Some("orders.created"));
        assert_eq!(ctx.get("stale"), None);
        assert!(ctx.deadline().is_none());
        assert!(ctx.inflight().is_some());
    }

    #[tokio::test]
    async fn test_for_event_restarts_timeout() {
        let tracker = Arc::new(InflightTracker::new());
        let base = Context::background().with_timeout(Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(base.is_expired());

        let ctx = base.for_event(Header::new(), &tracker);
        assert!(!ctx.is_expired());
        assert!(ctx.deadline() > base.deadline());
        assert!(ctx.remaining().unwrap() <= Duration::from_millis(10));
    }

    #[test]
    fn test_absolute_deadline_not_carried_into_events() {
        let tracker = Arc::new(InflightTracker::new());
        let base = Context::background().with_deadline(Instant::now() + Duration::from_secs(5));

        let ctx = base.for_event(Header::new(), &tracker);
        assert!(ctx.deadline().is_none());
    }
}
