//! Raw bytes codec (`application/octet-stream`).
//!
//! Carries the body verbatim. Only `Vec<u8>` and [`Frame`] payloads are
//! accepted; anything else is rejected with
//! [`CodecError::UnsupportedPayload`].

use std::io::Write;

use super::{Buffer, Codec, CodecError, Frame, Message, MessageKind, Payload};

const NAME: &str = "bytes";

/// Passes body bytes through untouched.
pub struct BytesCodec<'a> {
    buf: &'a mut Buffer,
}

impl<'a> BytesCodec<'a> {
    /// Bind a bytes codec to `buf`.
    pub fn new(buf: &'a mut Buffer) -> Self {
        Self { buf }
    }
}

pub(super) fn new_codec(buf: &mut Buffer) -> Box<dyn Codec + '_> {
    Box::new(BytesCodec::new(buf))
}

impl Codec for BytesCodec<'_> {
    fn read_header(&mut self, _msg: &mut Message, _kind: MessageKind) -> Result<(), CodecError> {
        Ok(())
    }

    fn read_body(&mut self, body: &mut dyn Payload) -> Result<(), CodecError> {
        let type_name = body.type_name();
        let any = body.as_any_mut();

        if let Some(raw) = any.downcast_mut::<Vec<u8>>() {
            *raw = self.buf.take_all().to_vec();
            return Ok(());
        }
        if let Some(frame) = any.downcast_mut::<Frame>() {
            frame.data = self.buf.take_all().to_vec();
            return Ok(());
        }

        Err(CodecError::UnsupportedPayload {
            codec: NAME,
            type_name,
        })
    }

    fn write(&mut self, _msg: &Message, body: &dyn Payload) -> Result<(), CodecError> {
        let any = body.as_any();
        let data = if let Some(raw) = any.downcast_ref::<Vec<u8>>() {
            raw.as_slice()
        } else if let Some(frame) = any.downcast_ref::<Frame>() {
            frame.data.as_slice()
        } else {
            return Err(CodecError::UnsupportedPayload {
                codec: NAME,
                type_name: body.type_name(),
            });
        };

        self.buf.write_all(data)?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_structured_payloads() {
        let mut buf = Buffer::new();
        let err = BytesCodec::new(&mut buf)
            .write(&Message::publication("t"), &"text".to_string())
            .unwrap_err();
        match err {
            CodecError::UnsupportedPayload { codec, type_name } => {
                assert_eq!(codec, "bytes");
                assert!(type_name.contains("String"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_into_unsupported_type_fails() {
        let mut buf = Buffer::from_slice(b"12");
        let mut n = 0_u32;
        assert!(BytesCodec::new(&mut buf).read_body(&mut n).is_err());
    }

    #[test]
    fn test_empty_body_decodes_to_empty_vec() {
        let mut buf = Buffer::new();
        let mut raw = vec![9_u8];
        BytesCodec::new(&mut buf).read_body(&mut raw).unwrap();
        assert!(raw.is_empty());
    }
}
