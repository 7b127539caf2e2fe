//! Resumable frame encoding and decoding.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WireError;
use crate::frame::{Frame, FrameFlags, FrameKind};

/// Maximum frame payload size accepted by default (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame header size:
/// 4 bytes length + 1 byte kind + 1 byte flags + 4 bytes stream id + 8 bytes sequence.
pub const FRAME_HEADER_SIZE: usize = 18;

/// Codec for encoding/decoding frames on an ordered byte transport.
///
/// Decoding is resumable: until a full frame is buffered it returns
/// `Ok(None)` without consuming anything. Malformed input (oversized
/// declared length, unknown kind byte) surfaces as an error and must be
/// treated as connection-fatal by the owner.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the default maximum frame size.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom maximum frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid_data(err: WireError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the header without consuming it.
        let mut header = &buf[..FRAME_HEADER_SIZE];
        let payload_len = header.get_u32() as usize;
        let kind_byte = header.get_u8();
        let flag_bits = header.get_u8();
        let stream_id = header.get_u32();
        let sequence = header.get_u64();

        if payload_len > self.max_frame_size {
            return Err(invalid_data(WireError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            }));
        }

        let frame_len = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let kind = FrameKind::try_from(kind_byte).map_err(invalid_data)?;

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Frame {
            stream_id,
            kind,
            sequence,
            flags: FrameFlags::from_bits(flag_bits),
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), io::Error> {
        let payload_len = frame.payload.len();

        if payload_len > self.max_frame_size {
            return Err(invalid_data(WireError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            }));
        }

        buf.reserve(FRAME_HEADER_SIZE + payload_len);

        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(payload_len as u32);
        buf.put_u8(frame.kind as u8);
        buf.put_u8(frame.flags.bits());
        buf.put_u32(frame.stream_id);
        buf.put_u64(frame.sequence);
        buf.put(frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    #[test]
    fn roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = Frame::data(
            7,
            3,
            FrameFlags::END_STREAM,
            Bytes::from_static(b"hello, weft"),
        );

        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_consumes_nothing() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = Frame::data(1, 0, FrameFlags::EMPTY, Bytes::from_static(b"payload"));
        codec.encode(frame.clone(), &mut buf).unwrap();

        let encoded = buf.clone();
        for cut in 0..encoded.len() {
            let mut partial = BytesMut::from(&encoded[..cut]);
            let before = partial.len();
            assert!(codec.decode(&mut partial).unwrap().is_none());
            assert_eq!(partial.len(), before, "partial input must not be consumed");
        }

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame);
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let a = Frame::open(1);
        let b = Frame::data(1, 0, FrameFlags::EMPTY, Bytes::from_static(b"x"));
        let c = Frame::close(1);
        for frame in [&a, &b, &c] {
            codec.encode(frame.clone(), &mut buf).unwrap();
        }

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), c);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_declared_length_is_malformed() {
        let mut codec = FrameCodec::new().with_max_frame_size(16);
        let mut buf = BytesMut::new();
        buf.put_u32(17);
        buf.put_u8(FrameKind::Data as u8);
        buf.put_u8(0);
        buf.put_u32(1);
        buf.put_u64(0);

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u8(0xEE);
        buf.put_u8(0);
        buf.put_u32(1);
        buf.put_u64(0);

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let mut codec = FrameCodec::new().with_max_frame_size(4);
        let mut buf = BytesMut::new();
        let frame = Frame::data(1, 0, FrameFlags::EMPTY, Bytes::from_static(b"too big"));
        assert!(codec.encode(frame, &mut buf).is_err());
    }

    fn arb_kind() -> impl Strategy<Value = FrameKind> {
        prop_oneof![
            Just(FrameKind::Open),
            Just(FrameKind::Data),
            Just(FrameKind::WindowUpdate),
            Just(FrameKind::Close),
            Just(FrameKind::Reset),
            Just(FrameKind::Ping),
            Just(FrameKind::Pong),
        ]
    }

    proptest! {
        #[test]
        fn roundtrip_identity(
            stream_id in any::<u32>(),
            kind in arb_kind(),
            sequence in any::<u64>(),
            flags in 0u8..=3,
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let frame = Frame {
                stream_id,
                kind,
                sequence,
                flags: FrameFlags::from_bits(flags),
                payload: Bytes::from(payload),
            };

            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::new();
            codec.encode(frame.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();

            prop_assert_eq!(decoded, frame);
            prop_assert!(buf.is_empty());
        }
    }
}
