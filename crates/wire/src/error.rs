//! Wire-level error types.

use thiserror::Error;

/// Errors raised while encoding or decoding frames.
///
/// Any of these on the inbound path means the byte stream can no longer be
/// trusted; the owning session must treat them as connection-fatal.
#[derive(Debug, Error)]
pub enum WireError {
    /// A frame declared a payload larger than the configured maximum.
    #[error("frame payload {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The kind byte does not name a known frame kind.
    #[error("unknown frame kind: {0:#04x}")]
    UnknownFrameKind(u8),

    /// A control frame carried a payload of the wrong shape.
    #[error("invalid {kind} payload: expected {expected} bytes, got {actual}")]
    InvalidControlPayload {
        /// Frame kind whose payload was malformed.
        kind: &'static str,
        /// Expected payload length.
        expected: usize,
        /// Actual payload length.
        actual: usize,
    },
}
