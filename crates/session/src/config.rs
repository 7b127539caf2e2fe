//! Session configuration.

use std::time::Duration;

/// Configuration for a session and the streams it multiplexes.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Initial flow-control window per stream direction, in bytes.
    pub initial_window: u32,
    /// Consumed bytes accumulated before a `WindowUpdate` is issued.
    /// Defaults to half the initial window.
    pub window_update_threshold: u32,
    /// Maximum encoded frame payload accepted from the wire.
    pub max_frame_size: usize,
    /// Maximum payload carried by a single `Data` frame; larger writes are
    /// chunked. Must not exceed `max_frame_size`.
    pub max_payload_size: usize,
    /// Admission limit on concurrently open streams. Remote opens past the
    /// limit are refused with a reset, not a session failure.
    pub max_concurrent_streams: usize,
    /// Interval between liveness probes.
    pub ping_interval: Duration,
    /// How long to wait for a `Pong` before declaring the transport dead.
    pub ping_timeout: Duration,
    /// How long draining waits for open streams to finish before severing
    /// the transport.
    pub drain_timeout: Duration,
    /// Capacity of the shared outbound frame queue.
    pub outbound_queue: usize,
    /// Capacity of the queue of remotely initiated streams awaiting accept.
    pub accept_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_window: 64 * 1024,
            window_update_threshold: 32 * 1024,
            max_frame_size: 1024 * 1024,
            max_payload_size: 16 * 1024,
            max_concurrent_streams: 256,
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
            outbound_queue: 64,
            accept_queue: 32,
        }
    }
}
