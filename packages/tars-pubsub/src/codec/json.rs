//! JSON codec (`application/json`).

use std::io::Write;

use super::{Buffer, Codec, CodecError, Message, MessageKind, Payload};

const NAME: &str = "json";

/// Encodes payloads as a single JSON document.
pub struct JsonCodec<'a> {
    buf: &'a mut Buffer,
}

impl<'a> JsonCodec<'a> {
    /// Bind a JSON codec to `buf`.
    pub fn new(buf: &'a mut Buffer) -> Self {
        Self { buf }
    }
}

pub(super) fn new_codec(buf: &mut Buffer) -> Box<dyn Codec + '_> {
    Box::new(JsonCodec::new(buf))
}

impl Codec for JsonCodec<'_> {
    fn read_header(&mut self, _msg: &mut Message, _kind: MessageKind) -> Result<(), CodecError> {
        Ok(())
    }

    fn read_body(&mut self, body: &mut dyn Payload) -> Result<(), CodecError> {
        let type_name = body.type_name();
        let target = body.as_deserialize().ok_or(CodecError::UnsupportedPayload {
            codec: NAME,
            type_name,
        })?;

        let data = self.buf.take_all();
        let mut de = serde_json::Deserializer::from_slice(&data);
        {
            let mut erased = <dyn erased_serde::Deserializer>::erase(&mut de);
            target.deserialize_in_place(&mut erased)?;
        }
        // Reject trailing garbage after the document.
        de.end()?;
        Ok(())
    }

    fn write(&mut self, _msg: &Message, body: &dyn Payload) -> Result<(), CodecError> {
        let value = body.as_serialize().ok_or(CodecError::UnsupportedPayload {
            codec: NAME,
            type_name: body.type_name(),
        })?;
        serde_json::to_writer(&mut *self.buf, value)?;
        self.buf.flush()?;
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
