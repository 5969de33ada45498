//! Outbound path: encode a payload and hand the envelope to the broker.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::broker::Broker;
use crate::codec::{Buffer, CodecRegistry, Message, Payload};
use crate::context::Context;
use crate::envelope::{Envelope, Header, MessageId, CONTENT_TYPE, MESSAGE_ID, TOPIC};
use crate::error::PubSubError;

/// Per-call publish options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Physical routing target. The logical topic stays in the header.
    pub exchange: Option<String>,
    /// Content type for this message, overriding the configured default.
    pub content_type: Option<String>,
}

impl PublishOptions {
    /// Route the message through `exchange`.
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Encode the message as `content_type`.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Encodes payloads and publishes them through a broker.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    codecs: Arc<CodecRegistry>,
    default_content_type: Arc<str>,
    proxy: Option<Arc<str>>,
}

impl Publisher {
    /// `proxy`, when set, replaces the routing target of every message.
    pub fn new(
        broker: Arc<dyn Broker>,
        codecs: Arc<CodecRegistry>,
        default_content_type: impl Into<Arc<str>>,
        proxy: Option<String>,
    ) -> Self {
        Self {
            broker,
            codecs,
            default_content_type: default_content_type.into(),
            proxy: proxy.filter(|p| !p.is_empty()).map(Arc::from),
        }
    }

    /// Publish `msg` on `topic`.
    ///
    /// The header carries the context's metadata, then `content-type`,
    /// `tars-topic` (always the logical topic) and a fresh `tars-id`. An
    /// unknown content type fails before the broker is called.
    pub async fn publish<T: Payload>(
        &self,
        ctx: &Context,
        topic: &str,
        msg: &T,
        opts: PublishOptions,
    ) -> Result<MessageId, PubSubError> {
        if topic.is_empty() {
            return Err(PubSubError::EmptyTopic);
        }

        let content_type = opts
            .content_type
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| self.default_content_type.to_string());
        let new_codec = self.codecs.get(&content_type)?;

        let id = MessageId::new();
        let mut header: Header = ctx.metadata().clone();
        header.insert(CONTENT_TYPE, content_type.as_str());
        header.insert(TOPIC, topic);
        header.insert(MESSAGE_ID, id.to_string());

        let target = match (&self.proxy, opts.exchange.filter(|e| !e.is_empty())) {
            (Some(proxy), _) => proxy.to_string(),
            (None, Some(exchange)) => exchange,
            (None, None) => topic.to_string(),
        };

        let mut message = Message::publication(target.as_str());
        message.id = Some(id);
        message.header = Header::new()
            .with(MESSAGE_ID, id.to_string())
            .with(TOPIC, topic);

        let mut buf = Buffer::new();
        new_codec(&mut buf)
            .write(&message, msg)
            .map_err(|e| PubSubError::Encode {
                content_type: content_type.clone(),
                type_name: msg.type_name(),
                reason: e.to_string(),
            })?;

        let envelope = Envelope::new(header, buf.freeze());
        debug!(
            topic = %topic,
            target = %target,
            content_type = %content_type,
            message_id = %id,
            "publishing message"
        );

        self.broker
            .publish(&target, envelope)
            .await
            .map_err(|e| {
                warn!(topic = %topic, target = %target, error = %e, "publish failed");
                PubSubError::transport(e)
            })?;

        Ok(id)
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("broker", &self.broker.name())
            .field("default_content_type", &self.default_content_type)
            .field("proxy", &self.proxy)
            .finish()
    }
}
