//! Structured error types for registration, transport, decoding and dispatch.
//!
//! `PubSubError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//! Every variant belongs to exactly one [`ErrorKind`], so callers that only care
//! about the failure class (e.g. a broker deciding between nack and dead-letter)
//! can match on `err.kind()`.
//!
//! # The Error Boundary Rule
//!
//! > **Handlers and brokers speak `anyhow`; the engine speaks `PubSubError`.**
//!
//! - `anyhow` is internal transport (ergonomic for handlers and broker impls)
//! - `PubSubError` is what every public engine operation returns
//!
//! # Example
//!
//! ```ignore
//! use tars_pubsub::{ErrorKind, PubSubError};
//!
//! match engine.register_subscriber("orders.created", handler_fn(on_order), opts).await {
//!     Ok(()) => {}
//!     Err(PubSubError::AlreadyExists { topic }) => {
//!         tracing::warn!(%topic, "already subscribed");
//!     }
//!     Err(e) if e.kind() == ErrorKind::Transport => return Err(e.into()),
//!     Err(e) => panic!("bad handler: {e}"),
//! }
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

// =============================================================================
// Error Kind
// =============================================================================

/// Coarse failure class of a [`PubSubError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Subscription setup was rejected before any broker I/O.
    Registration,
    /// The topic has no live subscription.
    NotFound,
    /// The broker collaborator failed; its error is carried verbatim.
    Transport,
    /// A content type could not be resolved, or a body could not be
    /// encoded/decoded.
    Decode,
    /// One or more bound handlers returned an error.
    Handler,
    /// Graceful shutdown could not drain in-flight work in time.
    Shutdown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Registration => write!(f, "registration_error"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Transport => write!(f, "transport_error"),
            ErrorKind::Decode => write!(f, "decode_error"),
            ErrorKind::Handler => write!(f, "handler_error"),
            ErrorKind::Shutdown => write!(f, "shutdown_error"),
        }
    }
}

// =============================================================================
// PubSub Error
// =============================================================================

/// Structured error type for engine operations.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// The topic already has a live (or in-progress) subscription.
    #[error("topic exists: {topic}")]
    AlreadyExists {
        /// The contested topic.
        topic: String,
    },

    /// Unsubscribe was called for a topic with no live subscription.
    #[error("subscriber {topic} not exists")]
    NotFound {
        /// The requested topic.
        topic: String,
    },

    /// Topics must be non-empty.
    #[error("invalid subscriber: empty topic")]
    EmptyTopic,

    /// The handler value bound zero callables.
    #[error("invalid subscriber {topic}: no handler functions")]
    NoHandlers {
        /// The topic being registered.
        topic: String,
    },

    /// A callable failed signature validation.
    ///
    /// `reason` is the full human-readable rule violation and already names
    /// the offending callable.
    #[error("{reason}")]
    InvalidHandler {
        /// Qualified handler name (`Func` or `Owner.method`).
        handler: String,
        /// Rule violation text.
        reason: String,
    },

    /// The engine is shutting down and no longer accepts subscriptions.
    #[error("engine is shutting down: rejected subscriber for {topic}")]
    ShuttingDown {
        /// The rejected topic.
        topic: String,
    },

    /// Publish was asked to use a content type with no registered codec.
    #[error("Unsupported Content-Type: {content_type}")]
    UnsupportedContentType {
        /// The requested content type.
        content_type: String,
    },

    /// An inbound body could not be turned into handler payloads.
    #[error("failed to decode {content_type} message: {reason}")]
    Decode {
        /// Content type of the inbound envelope (after defaulting).
        content_type: String,
        /// Why decoding failed.
        reason: String,
    },

    /// An outbound payload could not be encoded.
    #[error("failed to encode {type_name} as {content_type}: {reason}")]
    Encode {
        /// Content type requested for the envelope.
        content_type: String,
        /// Rust type name of the payload.
        type_name: &'static str,
        /// Why encoding failed.
        reason: String,
    },

    /// A decoded payload did not have the type its handler was bound with
    /// (internal error).
    #[error("payload type mismatch: expected {expected}, got {actual}")]
    PayloadMismatch {
        /// Type the handler was registered for.
        expected: &'static str,
        /// Type actually handed over.
        actual: &'static str,
    },

    /// One or more handlers failed for a single event.
    ///
    /// There is exactly one of these per failed event, however many handlers
    /// failed.
    #[error("subscriber error: {}", errors.join("\n"))]
    HandlerFailed {
        /// Topic the event was delivered on.
        topic: String,
        /// Error text of each failed handler, in handler order.
        errors: Vec<String>,
    },

    /// In-flight handler tasks did not finish within the shutdown budget.
    #[error("timed out after {timeout:?} waiting for {remaining} in-flight handler(s)")]
    DrainTimeout {
        /// How long we waited.
        timeout: Duration,
        /// Tasks still running when we gave up.
        remaining: usize,
    },

    /// The broker collaborator failed.
    #[error(transparent)]
    Transport(anyhow::Error),
}

impl PubSubError {
    /// Wrap a broker failure.
    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        PubSubError::Transport(err.into())
    }

    /// Return the failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PubSubError::AlreadyExists { .. }
            | PubSubError::EmptyTopic
            | PubSubError::NoHandlers { .. }
            | PubSubError::InvalidHandler { .. }
            | PubSubError::ShuttingDown { .. } => ErrorKind::Registration,
            PubSubError::NotFound { .. } => ErrorKind::NotFound,
            PubSubError::UnsupportedContentType { .. }
            | PubSubError::Decode { .. }
            | PubSubError::Encode { .. }
            | PubSubError::PayloadMismatch { .. } => ErrorKind::Decode,
            PubSubError::HandlerFailed { .. } => ErrorKind::Handler,
            PubSubError::DrainTimeout { .. } => ErrorKind::Shutdown,
            PubSubError::Transport(_) => ErrorKind::Transport,
        }
    }

    /// Returns true for errors raised while setting up a subscription.
    pub fn is_registration(&self) -> bool {
        self.kind() == ErrorKind::Registration
    }
}
