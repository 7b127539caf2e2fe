//! Lifecycle notifications for external observers.
//!
//! The core does not perform logging or metrics itself; it publishes typed
//! events on a broadcast channel for a collaborator to consume.

use crate::error::ResetReason;
use crate::session::SessionState;

/// A lifecycle notification emitted by a session or its call correlator.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session transitioned to a new state.
    StateChanged(SessionState),
    /// A stream was opened.
    StreamOpened {
        /// The new stream's id.
        stream_id: u32,
        /// Whether the peer initiated it.
        remote: bool,
    },
    /// A stream reached the `Closed` state gracefully.
    StreamClosed {
        /// The closed stream's id.
        stream_id: u32,
    },
    /// A stream was reset.
    StreamReset {
        /// The reset stream's id.
        stream_id: u32,
        /// Why it was reset.
        reason: ResetReason,
    },
    /// A pending call resolved with a response or application error.
    CallResolved {
        /// The resolved call's id.
        call_id: u64,
    },
    /// A pending call expired before the peer responded.
    CallTimedOut {
        /// The expired call's id.
        call_id: u64,
    },
}
