//! Envelope model: the header-plus-body unit exchanged with the broker.
//!
//! # Header keys
//!
//! Header keys are case-insensitive. They are stored lower-cased, so
//! `Content-Type` and `content-type` address the same entry. Iteration is
//! ordered by key.
//!
//! The engine stamps three keys on every published envelope:
//! - [`CONTENT_TYPE`]: codec used for the body
//! - [`TOPIC`]: the logical topic, kept even when the message is physically
//!   routed through an exchange
//! - [`MESSAGE_ID`]: a fresh [`MessageId`]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header key carrying the body's content type.
pub const CONTENT_TYPE: &str = "content-type";

/// Header key carrying the logical topic.
pub const TOPIC: &str = "tars-topic";

/// Header key carrying the message identifier.
pub const MESSAGE_ID: &str = "tars-id";

/// Unique identifier stamped on every published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Create a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<MessageId> for Uuid {
    fn from(id: MessageId) -> Uuid {
        id.0
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered, case-insensitive string→string mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>")]
pub struct Header(BTreeMap<String, String>);

impl Header {
    /// Create an empty header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one for that key.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.as_ref().to_ascii_lowercase(), value.into())
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(&key.to_ascii_lowercase())
    }

    /// Check whether a key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_ascii_lowercase())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the header has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The `content-type` value, if present and non-empty.
    pub fn content_type(&self) -> Option<&str> {
        self.get(CONTENT_TYPE).filter(|ct| !ct.is_empty())
    }

    /// The logical topic (`tars-topic`).
    pub fn topic(&self) -> Option<&str> {
        self.get(TOPIC)
    }

    /// The message identifier (`tars-id`), if present and well-formed.
    pub fn message_id(&self) -> Option<MessageId> {
        self.get(MESSAGE_ID).and_then(|id| id.parse().ok())
    }
}

impl From<BTreeMap<String, String>> for Header {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Header {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut header = Header::new();
        header.extend(iter);
        header
    }
}

impl<K: AsRef<str>, V: Into<String>> Extend<(K, V)> for Header {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

/// Header plus raw body bytes.
///
/// Envelopes are cheap to clone (`Bytes` is reference counted). Consumers
/// must treat a received envelope as read-only; the dispatch adapter copies
/// the header before touching it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Message metadata.
    pub header: Header,
    /// Encoded payload.
    pub body: Bytes,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(header: Header, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    /// Shortcut for `self.header.content_type()`.
    pub fn content_type(&self) -> Option<&str> {
        self.header.content_type()
    }

    /// Shortcut for `self.header.topic()`.
    pub fn topic(&self) -> Option<&str> {
        self.header.topic()
    }

    /// Shortcut for `self.header.message_id()`.
    pub fn message_id(&self) -> Option<MessageId> {
        self.header.message_id()
    }
}
