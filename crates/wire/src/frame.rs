//! The atomic unit of wire-level data.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::error::WireError;

/// Kind of a protocol frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Opens a new stream.
    Open = 0x01,
    /// Carries a payload chunk for an open stream.
    Data = 0x02,
    /// Replenishes the peer's send window.
    WindowUpdate = 0x03,
    /// Graceful half-close of the sender's direction.
    Close = 0x04,
    /// Immediate abort of a stream, carrying a reason code.
    Reset = 0x05,
    /// Liveness probe.
    Ping = 0x06,
    /// Answer to a liveness probe.
    Pong = 0x07,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(Self::Open),
            0x02 => Ok(Self::Data),
            0x03 => Ok(Self::WindowUpdate),
            0x04 => Ok(Self::Close),
            0x05 => Ok(Self::Reset),
            0x06 => Ok(Self::Ping),
            0x07 => Ok(Self::Pong),
            other => Err(WireError::UnknownFrameKind(other)),
        }
    }
}

/// Per-frame flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags set.
    pub const EMPTY: Self = Self(0);
    /// The sender will transmit no further payload on this stream.
    pub const END_STREAM: Self = Self(0x01);
    /// The frame should be scheduled ahead of non-priority traffic.
    pub const PRIORITY: Self = Self(0x02);

    /// Construct from the raw bit field.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// The raw bit field.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FrameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FrameFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::END_STREAM) {
            names.push("END_STREAM");
        }
        if self.contains(Self::PRIORITY) {
            names.push("PRIORITY");
        }
        if names.is_empty() {
            write!(f, "FrameFlags(empty)")
        } else {
            write!(f, "FrameFlags({})", names.join("|"))
        }
    }
}

/// A frame in the wire protocol.
///
/// `sequence` is stamped only on [`FrameKind::Data`] frames, where it is
/// strictly increasing and gapless per stream; control frames carry zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream this frame belongs to.
    pub stream_id: u32,
    /// Kind of this frame.
    pub kind: FrameKind,
    /// Per-stream sequence number for `Data` frames.
    pub sequence: u64,
    /// Flag bits.
    pub flags: FrameFlags,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame with explicit fields.
    #[must_use]
    pub const fn new(
        stream_id: u32,
        kind: FrameKind,
        sequence: u64,
        flags: FrameFlags,
        payload: Bytes,
    ) -> Self {
        Self {
            stream_id,
            kind,
            sequence,
            flags,
            payload,
        }
    }

    /// An `Open` frame for a new stream.
    #[must_use]
    pub const fn open(stream_id: u32) -> Self {
        Self::new(
            stream_id,
            FrameKind::Open,
            0,
            FrameFlags::EMPTY,
            Bytes::new(),
        )
    }

    /// A `Data` frame carrying one payload chunk.
    #[must_use]
    pub const fn data(stream_id: u32, sequence: u64, flags: FrameFlags, payload: Bytes) -> Self {
        Self::new(stream_id, FrameKind::Data, sequence, flags, payload)
    }

    /// A `WindowUpdate` frame granting `credit` further payload bytes.
    #[must_use]
    pub fn window_update(stream_id: u32, credit: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(credit);
        Self::new(
            stream_id,
            FrameKind::WindowUpdate,
            0,
            FrameFlags::EMPTY,
            payload.freeze(),
        )
    }

    /// A `Close` frame ending the sender's direction of the stream.
    #[must_use]
    pub const fn close(stream_id: u32) -> Self {
        Self::new(
            stream_id,
            FrameKind::Close,
            0,
            FrameFlags::END_STREAM,
            Bytes::new(),
        )
    }

    /// A `Reset` frame aborting the stream with a reason code.
    #[must_use]
    pub fn reset(stream_id: u32, code: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(code);
        Self::new(
            stream_id,
            FrameKind::Reset,
            0,
            FrameFlags::EMPTY,
            payload.freeze(),
        )
    }

    /// A `Ping` frame carrying an opaque probe token.
    #[must_use]
    pub fn ping(token: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(token);
        Self::new(0, FrameKind::Ping, 0, FrameFlags::EMPTY, payload.freeze())
    }

    /// A `Pong` frame echoing a probe token.
    #[must_use]
    pub fn pong(token: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(token);
        Self::new(0, FrameKind::Pong, 0, FrameFlags::EMPTY, payload.freeze())
    }

    /// Whether the `END_STREAM` flag is set.
    #[must_use]
    pub const fn is_end_stream(&self) -> bool {
        self.flags.contains(FrameFlags::END_STREAM)
    }

    /// Credit carried by a `WindowUpdate` frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not exactly four bytes.
    pub fn window_increment(&self) -> Result<u32, WireError> {
        Self::fixed_payload::<4>("WindowUpdate", &self.payload).map(u32::from_be_bytes)
    }

    /// Reason code carried by a `Reset` frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not exactly four bytes.
    pub fn reset_code(&self) -> Result<u32, WireError> {
        Self::fixed_payload::<4>("Reset", &self.payload).map(u32::from_be_bytes)
    }

    /// Probe token carried by a `Ping` or `Pong` frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not exactly eight bytes.
    pub fn ping_token(&self) -> Result<u64, WireError> {
        Self::fixed_payload::<8>("Ping", &self.payload).map(u64::from_be_bytes)
    }

    fn fixed_payload<const N: usize>(
        kind: &'static str,
        payload: &Bytes,
    ) -> Result<[u8; N], WireError> {
        let bytes: &[u8] = payload;
        bytes
            .try_into()
            .map_err(|_| WireError::InvalidControlPayload {
                kind,
                expected: N,
                actual: payload.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    #[test]
    fn control_payload_accessors() {
        assert_eq!(Frame::window_update(3, 4096).window_increment().unwrap(), 4096);
        assert_eq!(Frame::reset(3, 7).reset_code().unwrap(), 7);
        assert_eq!(Frame::ping(42).ping_token().unwrap(), 42);
        assert_eq!(Frame::pong(42).ping_token().unwrap(), 42);
    }

    #[test]
    fn malformed_control_payload_is_rejected() {
        let frame = Frame::new(
            1,
            FrameKind::WindowUpdate,
            0,
            FrameFlags::EMPTY,
            Bytes::from_static(b"xx"),
        );
        assert!(matches!(
            frame.window_increment(),
            Err(WireError::InvalidControlPayload { expected: 4, actual: 2, .. })
        ));
    }

    #[test]
    fn unknown_kind_byte_is_rejected() {
        assert!(matches!(
            FrameKind::try_from(0x7F),
            Err(WireError::UnknownFrameKind(0x7F))
        ));
    }

    #[test]
    fn end_stream_flag() {
        assert!(Frame::close(1).is_end_stream());
        assert!(!Frame::open(1).is_end_stream());
        let flags = FrameFlags::END_STREAM | FrameFlags::PRIORITY;
        assert!(flags.contains(FrameFlags::END_STREAM));
        assert!(flags.contains(FrameFlags::PRIORITY));
    }

    #[test]
    fn buf_accessor_consistency() {
        // Reset codes travel big-endian like every other header field.
        let frame = Frame::reset(9, 0x0102_0304);
        let mut buf = frame.payload.clone();
        assert_eq!(buf.get_u32(), 0x0102_0304);
    }
}
