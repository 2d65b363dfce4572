//! Frame codec shared by both ends of a stream
//!
//! A frame is a 4-byte big-endian length, one protocol version byte, then the
//! bincode body. Every frame carries the version, so a peer built from a
//! different release is rejected on the first frame it sends instead of
//! being misread.

use crate::common::{Error, Result};
use crate::rpc::protocol::PROTOCOL_VERSION;
use bincode::Options;
use bytes::{BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame either side accepts.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

fn body_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_LENGTH as u64)
}

/// Versioned bincode frames of type `T`
#[derive(Debug)]
pub struct FrameCodec<T> {
    framing: LengthDelimitedCodec,
    _frame: PhantomData<fn() -> T>,
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self {
            framing: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _frame: PhantomData,
        }
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>> {
        let Some(frame) = self.framing.decode(src)? else {
            return Ok(None);
        };
        match frame.split_first() {
            Some((&PROTOCOL_VERSION, body)) => Ok(Some(body_options().deserialize(body)?)),
            Some((&version, _)) => Err(Error::Protocol(format!(
                "peer speaks protocol {}, we speak {}",
                version, PROTOCOL_VERSION
            ))),
            None => Err(Error::Protocol("empty frame".into())),
        }
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<()> {
        let size = body_options().serialized_size(&item)? as usize;
        let mut frame = BytesMut::with_capacity(1 + size);
        frame.put_u8(PROTOCOL_VERSION);
        body_options().serialize_into((&mut frame).writer(), &item)?;
        self.framing.encode(frame.freeze(), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::{CallFrame, Request};
    use bytes::Bytes;

    fn delete(id: u64) -> CallFrame {
        CallFrame {
            id,
            request: Request::Delete { key: b"k".to_vec() },
        }
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let mut codec = FrameCodec::<CallFrame>::new();
        let mut buf = BytesMut::new();
        codec.encode(delete(7), &mut buf).unwrap();

        let mut head = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut head).unwrap().is_none());

        head.unsplit(buf);
        let frame = codec.decode(&mut head).unwrap().unwrap();
        assert_eq!(frame.id, 7);
        assert_eq!(frame.request, Request::Delete { key: b"k".to_vec() });
    }

    #[test]
    fn test_frame_starts_with_version() {
        let mut buf = BytesMut::new();
        FrameCodec::<CallFrame>::new()
            .encode(delete(1), &mut buf)
            .unwrap();
        assert_eq!(buf[4], PROTOCOL_VERSION);
    }

    #[test]
    fn test_other_version_is_rejected() {
        let mut buf = BytesMut::new();
        FrameCodec::<CallFrame>::new()
            .encode(delete(1), &mut buf)
            .unwrap();
        buf[4] = PROTOCOL_VERSION.wrapping_add(1);

        let err = FrameCodec::<CallFrame>::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "unexpected error: {}", err);
    }

    #[test]
    fn test_garbage_body_is_a_codec_error() {
        let mut raw = LengthDelimitedCodec::new();
        let mut buf = BytesMut::new();
        raw.encode(Bytes::from_static(&[PROTOCOL_VERSION, 0xff, 0xff, 0xff]), &mut buf)
            .unwrap();

        let err = FrameCodec::<CallFrame>::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Codec(_)), "unexpected error: {}", err);
    }

    #[test]
    fn test_empty_frame_is_rejected() {
        let mut raw = LengthDelimitedCodec::new();
        let mut buf = BytesMut::new();
        raw.encode(Bytes::new(), &mut buf).unwrap();

        let err = FrameCodec::<CallFrame>::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
