//! Error types for the session layer.

use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for session operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer (or this side) violated the protocol. Connection-fatal: the
    /// transport is torn down and every owned stream is reset.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// One stream was reset; the session keeps operating.
    #[error("stream {stream_id} reset: {reason}")]
    StreamReset {
        /// The stream that was reset.
        stream_id: u32,
        /// Why it was reset.
        reason: ResetReason,
    },

    /// The local half of a stream is already closed for writing.
    #[error("stream {stream_id} is closed for writing")]
    StreamClosed {
        /// The stream that was written after close.
        stream_id: u32,
    },

    /// A pending call did not resolve before its deadline.
    #[error("call {call_id} timed out after {after:?}")]
    CallTimeout {
        /// The call that timed out.
        call_id: u64,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// A pending call was cancelled before resolution.
    #[error("call {call_id} cancelled")]
    CallCancelled {
        /// The call that was cancelled.
        call_id: u64,
    },

    /// The peer resolved a call with an application error payload.
    #[error("call {call_id} failed")]
    CallFailed {
        /// The call that failed.
        call_id: u64,
        /// Opaque application error payload.
        error: Bytes,
    },

    /// The underlying connection broke.
    #[error("transport failure: {0}")]
    Transport(#[source] std::io::Error),

    /// The session has already closed.
    #[error("session closed")]
    SessionClosed,
}

/// Protocol violations. All of these are connection-fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// The byte stream could not be decoded into a frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The peer sent more payload bytes than it had receive credit for.
    #[error("receive window overrun on stream {stream_id}")]
    WindowOverrun {
        /// The offending stream.
        stream_id: u32,
    },

    /// A `Data` frame arrived out of sequence.
    #[error("sequence gap on stream {stream_id}: expected {expected}, got {actual}")]
    SequenceGap {
        /// The offending stream.
        stream_id: u32,
        /// The next expected sequence number.
        expected: u64,
        /// The sequence number actually received.
        actual: u64,
    },

    /// A frame referenced a stream id that was never assigned.
    #[error("frame for unknown stream {stream_id}")]
    UnknownStream {
        /// The unassigned stream id.
        stream_id: u32,
    },

    /// The peer opened a stream using this side's id parity.
    #[error("peer opened stream {stream_id} with the wrong parity")]
    WrongParity {
        /// The offending stream id.
        stream_id: u32,
    },

    /// The peer re-opened an id that was already used.
    #[error("duplicate open for stream {stream_id}")]
    DuplicateOpen {
        /// The reused stream id.
        stream_id: u32,
    },

    /// This side ran out of stream identifiers. Ids are never reused, so
    /// exhaustion closes the session.
    #[error("stream identifier space exhausted")]
    StreamIdsExhausted,
}

/// Why a stream was reset. Carried on the wire as a `u32` code so callers
/// can distinguish logical closure from connection loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// The stream was aborted by the application.
    Cancelled,
    /// The peer refused a new stream (admission limit or draining).
    RefusedStream,
    /// The stream was torn down because of a protocol violation.
    ProtocolViolation,
    /// The underlying connection broke.
    TransportFailure,
    /// An application-defined reason code (values below 0x10 are reserved).
    Application(u32),
}

impl ResetReason {
    /// The wire code for this reason.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Cancelled => 0x01,
            Self::RefusedStream => 0x02,
            Self::ProtocolViolation => 0x03,
            Self::TransportFailure => 0x04,
            Self::Application(code) => code,
        }
    }

    /// Decode a wire code into a reason.
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        match code {
            0x01 => Self::Cancelled,
            0x02 => Self::RefusedStream,
            0x03 => Self::ProtocolViolation,
            0x04 => Self::TransportFailure,
            other => Self::Application(other),
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::RefusedStream => write!(f, "refused"),
            Self::ProtocolViolation => write!(f, "protocol violation"),
            Self::TransportFailure => write!(f, "transport failure"),
            Self::Application(code) => write!(f, "application code {code}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_reason_codes_roundtrip() {
        for reason in [
            ResetReason::Cancelled,
            ResetReason::RefusedStream,
            ResetReason::ProtocolViolation,
            ResetReason::TransportFailure,
            ResetReason::Application(0x4242),
        ] {
            assert_eq!(ResetReason::from_code(reason.code()), reason);
        }
    }
}
