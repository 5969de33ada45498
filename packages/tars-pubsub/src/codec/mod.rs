//! Content-type keyed codecs.
//!
//! A [`Codec`] is an encode/decode strategy bound to one [`Buffer`]. The
//! [`CodecRegistry`] maps a content-type string to the constructor
//! ([`NewCodec`]) that builds such a codec. Both the publish path and the
//! dispatch path resolve codecs through the registry, purely by string key:
//! an unknown key is a runtime configuration error, never a type error.
//!
//! # Payloads
//!
//! Codecs are object safe, so they cannot be generic over the value they
//! decode into. Values cross the codec boundary as `&mut dyn Payload`, which
//! exposes these capabilities:
//! - `erased_serde` (de)serialization, used by structured codecs such as JSON
//! - a protobuf view, used by the protobuf codec (feature `proto`)
//! - `Any` downcasting, used by codecs that only accept specific types
//!   (the raw bytes codec accepts `Vec<u8>` and [`Frame`])
//!
//! Every `Serialize + DeserializeOwned + Send + Sync + 'static` type is a
//! `Payload` through a blanket impl. Protobuf messages become payloads by
//! wrapping them in `Proto`.
//!
//! # Example
//!
//! ```ignore
//! let registry = CodecRegistry::default();
//! let new_codec = registry.get("application/json")?;
//!
//! let mut buf = Buffer::new();
//! new_codec(&mut buf).write(&Message::publication("orders"), &order)?;
//!
//! let mut decoded = OrderEvent::default();
//! new_codec(&mut buf).read_body(&mut decoded)?;
//! ```

mod json;
mod octet;
#[cfg(feature = "proto")]
mod proto;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;

use bytes::{Buf, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::{Header, MessageId};
use crate::error::PubSubError;

pub use self::json::JsonCodec;
pub use self::octet::BytesCodec;
#[cfg(feature = "proto")]
pub use self::proto::{Proto, ProtoCodec, ProtoMessage};

/// Content type of the JSON codec.
pub const JSON: &str = "application/json";

/// Content type of the protobuf codec.
pub const PROTOBUF: &str = "application/protobuf";

/// Content type of the raw bytes codec.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Content type used when neither the caller nor the envelope names one.
pub const DEFAULT_CONTENT_TYPE: &str = OCTET_STREAM;

// =============================================================================
// Codec Error
// =============================================================================

/// Errors raised by codec implementations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Reading from or writing to the buffer failed.
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// JSON syntax or trailing-data error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Type-erased (de)serialization failed.
    #[error("{0}")]
    Serde(#[from] erased_serde::Error),

    /// Protobuf decoding failed.
    #[cfg(feature = "proto")]
    #[error("proto: {0}")]
    Proto(#[from] prost::DecodeError),

    /// The codec cannot carry this payload type.
    #[error("{codec} codec cannot carry {type_name}")]
    UnsupportedPayload {
        /// Codec name.
        codec: &'static str,
        /// Rust type name of the rejected payload.
        type_name: &'static str,
    },
}

// =============================================================================
// Payload
// =============================================================================

/// A value that can cross the codec boundary.
///
/// Each codec asks for the capability it needs and rejects payloads that
/// lack it:
/// - serde types get the serde view through a blanket impl
/// - protobuf messages are wrapped in [`Proto`] (feature `proto`)
/// - every payload can be downcast through `Any`
pub trait Payload: Any + Send + Sync {
    /// Rust type name of the concrete value.
    fn type_name(&self) -> &'static str;

    /// Type-erased serializer input, if the payload is a serde type.
    fn as_serialize(&self) -> Option<&dyn erased_serde::Serialize> {
        None
    }

    /// In-place deserialization target, if the payload is a serde type.
    fn as_deserialize(&mut self) -> Option<&mut dyn DeserializeInPlace> {
        None
    }

    /// Protobuf view, if the payload is a protobuf message.
    #[cfg(feature = "proto")]
    fn as_proto(&self) -> Option<&dyn ProtoMessage> {
        None
    }

    /// Mutable protobuf view, if the payload is a protobuf message.
    #[cfg(feature = "proto")]
    fn as_proto_mut(&mut self) -> Option<&mut dyn ProtoMessage> {
        None
    }

    /// Borrow as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Mutably borrow as `Any` for downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Convert into a boxed `Any` for by-value downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

/// Replace a value with one read from a type-erased deserializer.
pub trait DeserializeInPlace {
    fn deserialize_in_place(
        &mut self,
        de: &mut dyn erased_serde::Deserializer<'_>,
    ) -> Result<(), erased_serde::Error>;
}

impl<T: DeserializeOwned> DeserializeInPlace for T {
    fn deserialize_in_place(
        &mut self,
        de: &mut dyn erased_serde::Deserializer<'_>,
    ) -> Result<(), erased_serde::Error> {
        *self = erased_serde::deserialize::<T>(de)?;
        Ok(())
    }
}

impl<T> Payload for T
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_serialize(&self) -> Option<&dyn erased_serde::Serialize> {
        Some(self)
    }

    fn as_deserialize(&mut self) -> Option<&mut dyn DeserializeInPlace> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

/// Raw data carried as-is by the bytes codec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// The raw body.
    pub data: Vec<u8>,
}

impl From<Vec<u8>> for Frame {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

// =============================================================================
// Message
// =============================================================================

/// Which side of the wire a [`Message`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Outbound, being encoded by a publisher.
    Publication,
    /// Inbound, being decoded for subscribers.
    Event,
}

/// Codec-level view of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message identifier, when known.
    pub id: Option<MessageId>,
    /// Physical routing target.
    pub target: String,
    /// Direction.
    pub kind: MessageKind,
    /// Codec-visible header entries.
    pub header: Header,
}

impl Message {
    /// An outbound message for `target`.
    pub fn publication(target: impl Into<String>) -> Self {
        Self {
            id: None,
            target: target.into(),
            kind: MessageKind::Publication,
            header: Header::new(),
        }
    }

    /// An empty inbound message, to be filled by `read_header`.
    pub fn event() -> Self {
        Self {
            id: None,
            target: String::new(),
            kind: MessageKind::Event,
            header: Header::new(),
        }
    }
}

// =============================================================================
// Buffer
// =============================================================================

/// Byte stream a codec is bound to.
///
/// Writes append; reads consume from the front.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    inner: BytesMut,
}

impl Buffer {
    /// An empty buffer, ready for encoding.
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer holding `data`, ready for decoding.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            inner: BytesMut::from(data),
        }
    }

    /// Take every unread byte.
    pub fn take_all(&mut self) -> Bytes {
        self.inner.split().freeze()
    }

    /// Discard every unread byte.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if nothing is left to read.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Consume the buffer, returning its bytes.
    pub fn freeze(self) -> Bytes {
        self.inner.freeze()
    }
}

impl io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for Buffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.inner.len());
        buf[..n].copy_from_slice(&self.inner[..n]);
        self.inner.advance(n);
        Ok(n)
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Encode/decode strategy bound to a [`Buffer`].
pub trait Codec {
    /// Read framing metadata preceding the body.
    fn read_header(&mut self, msg: &mut Message, kind: MessageKind) -> Result<(), CodecError>;

    /// Decode the body into `body`.
    fn read_body(&mut self, body: &mut dyn Payload) -> Result<(), CodecError>;

    /// Encode `body` (and any framing derived from `msg`) into the buffer.
    fn write(&mut self, msg: &Message, body: &dyn Payload) -> Result<(), CodecError>;

    /// Release the stream. Unread input is discarded.
    fn close(&mut self) -> Result<(), CodecError>;

    /// Short codec name, for logs.
    fn name(&self) -> &'static str;
}

/// Constructor binding a codec to a buffer.
pub type NewCodec = for<'a> fn(&'a mut Buffer) -> Box<dyn Codec + 'a>;

// =============================================================================
// Codec Registry
// =============================================================================

/// Content-type → codec constructor table.
///
/// Keys are normalized: lower-cased, trimmed, and stripped of parameters, so
/// `Application/JSON; charset=utf-8` resolves the `application/json` entry.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, NewCodec>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// A registry holding the built-in codecs: JSON, raw bytes and, with the
    /// `proto` feature, protobuf.
    pub fn new() -> Self {
        let registry = Self::empty()
            .with_codec(JSON, json::new_codec)
            .with_codec(OCTET_STREAM, octet::new_codec);
        #[cfg(feature = "proto")]
        let registry = registry.with_codec(PROTOBUF, proto::new_codec);
        registry
    }

    /// Register a codec, replacing any existing entry for that content type.
    ///
    /// Returns the replaced constructor.
    pub fn register(&mut self, content_type: &str, codec: NewCodec) -> Option<NewCodec> {
        self.codecs.insert(normalize(content_type), codec)
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_codec(mut self, content_type: &str, codec: NewCodec) -> Self {
        self.register(content_type, codec);
        self
    }

    /// Resolve a codec constructor.
    pub fn get(&self, content_type: &str) -> Result<NewCodec, PubSubError> {
        self.codecs
            .get(&normalize(content_type))
            .copied()
            .ok_or_else(|| PubSubError::UnsupportedContentType {
                content_type: content_type.to_string(),
            })
    }

    /// Check whether a content type resolves.
    pub fn contains(&self, content_type: &str) -> bool {
        self.codecs.contains_key(&normalize(content_type))
    }

    /// Registered content types, sorted.
    pub fn content_types(&self) -> Vec<&str> {
        let mut keys: Vec<_> = self.codecs.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Number of registered codecs.
    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    /// Returns true if no codecs are registered.
    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("content_types", &self.content_types())
            .finish()
    }
}

fn normalize(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct OrderEvent {
        id: String,
        quantity: u32,
        tags: Vec<String>,
    }

    fn encode(registry: &CodecRegistry, ct: &str, value: &dyn Payload) -> Bytes {
        let new_codec = registry.get(ct).unwrap();
        let mut buf = Buffer::new();
        new_codec(&mut buf)
            .write(&Message::publication("t"), value)
            .unwrap();
        buf.freeze()
    }

    fn decode<T: Payload + Default>(registry: &CodecRegistry, ct: &str, data: &[u8]) -> T {
        let new_codec = registry.get(ct).unwrap();
        let mut buf = Buffer::from_slice(data);
        let mut value = T::default();
        let mut codec = new_codec(&mut buf);
        codec.read_header(&mut Message::event(), MessageKind::Event).unwrap();
        codec.read_body(&mut value).unwrap();
        codec.close().unwrap();
        value
    }

    #[test]
    fn test_default_registry_has_builtin_codecs() {
        let registry = CodecRegistry::default();
        #[cfg(feature = "proto")]
        assert_eq!(registry.content_types(), vec![JSON, OCTET_STREAM, PROTOBUF]);
        #[cfg(not(feature = "proto"))]
        assert_eq!(registry.content_types(), vec![JSON, OCTET_STREAM]);
        assert_eq!(DEFAULT_CONTENT_TYPE, OCTET_STREAM);
    }

    #[test]
    fn test_unknown_content_type_is_unsupported() {
        let registry = CodecRegistry::default();
        let err = registry.get("application/x-yaml").err().unwrap();
        assert!(matches!(
            err,
            PubSubError::UnsupportedContentType { ref content_type } if content_type == "application/x-yaml"
        ));
    }

    #[test]
    fn test_content_type_lookup_is_normalized() {
        let registry = CodecRegistry::default();
        assert!(registry.contains("Application/JSON; charset=utf-8"));
        assert!(registry.contains(" application/octet-stream "));
    }

    #[test]
    fn test_register_replaces_existing() {
        let mut registry = CodecRegistry::empty();
        assert!(registry.register(JSON, json::new_codec).is_none());
        assert!(registry.register(JSON, json::new_codec).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_json_round_trip_struct() {
        let registry = CodecRegistry::default();
        let order = OrderEvent {
            id: "42".into(),
            quantity: 3,
            tags: vec!["rush".into()],
        };
        let data = encode(&registry, JSON, &order);
        let decoded: OrderEvent = decode(&registry, JSON, &data);
        assert_eq!(decoded, order);
    }

    #[test]
    fn test_json_round_trip_builtin_types() {
        let registry = CodecRegistry::default();

        let data = encode(&registry, JSON, &"hello".to_string());
        assert_eq!(decode::<String>(&registry, JSON, &data), "hello");

        let data = encode(&registry, JSON, &-7_i64);
        assert_eq!(decode::<i64>(&registry, JSON, &data), -7);

        let data = encode(&registry, JSON, &vec![1_u8, 2, 3]);
        assert_eq!(decode::<Vec<u8>>(&registry, JSON, &data), vec![1, 2, 3]);
    }

    #[test]
    fn test_bytes_round_trip() {
        let registry = CodecRegistry::default();

        let data = encode(&registry, OCTET_STREAM, &vec![0_u8, 159, 255]);
        assert_eq!(&data[..], &[0, 159, 255]);
        assert_eq!(decode::<Vec<u8>>(&registry, OCTET_STREAM, &data), vec![0, 159, 255]);

        let frame = Frame::from(b"raw".to_vec());
        let data = encode(&registry, OCTET_STREAM, &frame);
        assert_eq!(decode::<Frame>(&registry, OCTET_STREAM, &data), frame);
    }

    #[test]
    fn test_buffer_reads_consume_front() {
        let mut buf = Buffer::new();
        buf.write_all(b"abcdef").unwrap();

        let mut head = [0_u8; 2];
        buf.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"ab");
        assert_eq!(buf.len(), 4);
        assert_eq!(&buf.take_all()[..], b"cdef");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_payload_reports_type_name() {
        let order = OrderEvent::default();
        let payload: &dyn Payload = &order;
        assert!(payload.type_name().ends_with("OrderEvent"));
        assert!(payload.as_any().downcast_ref::<OrderEvent>().is_some());
    }
}
