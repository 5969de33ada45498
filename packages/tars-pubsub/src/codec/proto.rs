//! Protobuf codec (`application/protobuf`).
//!
//! Protobuf messages are not serde types, so they travel wrapped in
//! [`Proto`], which exposes them to the codec through
//! [`Payload::as_proto`]. Every other payload is rejected with
//! [`CodecError::UnsupportedPayload`].

use std::any::Any;
use std::io::Write;
use std::ops::{Deref, DerefMut};

use super::{Buffer, Codec, CodecError, Message, MessageKind, Payload};

const NAME: &str = "proto";

/// Object-safe view of a `prost` message.
pub trait ProtoMessage: Send + Sync {
    /// Encode to the protobuf wire format.
    fn encode_proto(&self) -> Vec<u8>;

    /// Replace `self` with the message decoded from `data`.
    fn decode_proto(&mut self, data: &[u8]) -> Result<(), prost::DecodeError>;
}

impl<M> ProtoMessage for M
where
    M: prost::Message + Default,
{
    fn encode_proto(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    fn decode_proto(&mut self, data: &[u8]) -> Result<(), prost::DecodeError> {
        *self = M::decode(data)?;
        Ok(())
    }
}

/// A protobuf message carried as a payload.
///
/// Handlers take `Proto<M>` as their payload argument and publishers pass
/// `&Proto<M>`; the inner message is reachable through `Deref` or `.0`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Proto<M>(pub M);

impl<M> Proto<M> {
    pub fn into_inner(self) -> M {
        self.0
    }
}

impl<M> From<M> for Proto<M> {
    fn from(message: M) -> Self {
        Self(message)
    }
}

impl<M> Deref for Proto<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.0
    }
}

impl<M> DerefMut for Proto<M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut self.0
    }
}

impl<M> Payload for Proto<M>
where
    M: prost::Message + Default + 'static,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    fn as_proto(&self) -> Option<&dyn ProtoMessage> {
        Some(&self.0)
    }

    fn as_proto_mut(&mut self) -> Option<&mut dyn ProtoMessage> {
        Some(&mut self.0)
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

/// Encodes [`Proto`] payloads in the protobuf wire format.
pub struct ProtoCodec<'a> {
    buf: &'a mut Buffer,
}

impl<'a> ProtoCodec<'a> {
    /// Bind a protobuf codec to `buf`.
    pub fn new(buf: &'a mut Buffer) -> Self {
        Self { buf }
    }
}

pub(super) fn new_codec(buf: &mut Buffer) -> Box<dyn Codec + '_> {
    Box::new(ProtoCodec::new(buf))
}

impl Codec for ProtoCodec<'_> {
    fn read_header(&mut self, _msg: &mut Message, _kind: MessageKind) -> Result<(), CodecError> {
        Ok(())
    }

    fn read_body(&mut self, body: &mut dyn Payload) -> Result<(), CodecError> {
        let type_name = body.type_name();
        let target = body.as_proto_mut().ok_or(CodecError::UnsupportedPayload {
            codec: NAME,
            type_name,
        })?;

        let data = self.buf.take_all();
        target.decode_proto(&data)?;
        Ok(())
    }

    fn write(&mut self, _msg: &Message, body: &dyn Payload) -> Result<(), CodecError> {
        let message = body.as_proto().ok_or(CodecError::UnsupportedPayload {
            codec: NAME,
            type_name: body.type_name(),
        })?;

        self.buf.write_all(&message.encode_proto())?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), CodecError> {
        self.buf.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        NAME
    }
}
