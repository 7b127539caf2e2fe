//! Wire-level frame model and codec for the weft protocol.
//!
//! Everything a session exchanges with its peer travels as [`Frame`]s over
//! an ordered byte transport. The [`FrameCodec`] is resumable: it decodes
//! nothing until a whole frame is buffered, and reports malformed input as
//! an error rather than dropping it, leaving the connection-fatal decision
//! to the owning session.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod codec;
mod error;
mod frame;

pub use codec::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, FrameCodec};
pub use error::WireError;
pub use frame::{Frame, FrameFlags, FrameKind};

pub use bytes::Bytes;
