//! A single logical, flow-controlled, bidirectional stream.
//!
//! Streams never touch the transport directly: the session communicates
//! with them through explicit queues. Writers push frames onto the shared
//! outbound queue after acquiring send credit; the session's demultiplexer
//! pushes payload chunks onto the stream's private inbound queue.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use weft_wire::{Frame, FrameFlags};

use crate::config::SessionConfig;
use crate::error::{Error, ResetReason, Result};
use crate::flow::FlowController;

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created but not yet opened.
    Idle,
    /// Open in both directions.
    Open,
    /// This side sent end-of-stream; the peer may still send.
    HalfClosedLocal,
    /// The peer sent end-of-stream; this side may still send.
    HalfClosedRemote,
    /// Both directions are closed.
    Closed,
    /// Aborted; buffered data was discarded. Terminal.
    Reset,
}

impl StreamState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Reset)
    }
}

/// A chunk delivered to a stream's inbound queue.
#[derive(Debug)]
pub(crate) enum InboundChunk {
    /// An in-order payload chunk.
    Data(Bytes),
    /// End of stream; no further payload will arrive.
    End,
}

/// State shared between a stream's handle halves and the session driver.
#[derive(Debug)]
pub(crate) struct StreamShared {
    id: u32,
    state: Mutex<StreamState>,
    pub(crate) flow: FlowController,
    reset_reason: Mutex<Option<ResetReason>>,
    window_update_threshold: u32,
    max_payload_size: usize,
}

impl StreamShared {
    pub(crate) fn new(id: u32, config: &SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(StreamState::Idle),
            flow: FlowController::new(config.initial_window),
            reset_reason: Mutex::new(None),
            window_update_threshold: config.window_update_threshold,
            max_payload_size: config.max_payload_size,
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn state(&self) -> StreamState {
        *self.state.lock()
    }

    pub(crate) fn reset_reason(&self) -> Option<ResetReason> {
        *self.reset_reason.lock()
    }

    /// Idle → Open, on sending or receiving the stream's `Open` frame.
    pub(crate) fn mark_open(&self) {
        let mut state = self.state.lock();
        if *state == StreamState::Idle {
            *state = StreamState::Open;
        }
    }

    /// Close the local direction. Returns `true` once both directions are
    /// closed.
    pub(crate) fn close_local(&self) -> bool {
        let mut state = self.state.lock();
        *state = match *state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
        *state == StreamState::Closed
    }

    /// Close the remote direction. Returns `true` once both directions are
    /// closed.
    pub(crate) fn close_remote(&self) -> bool {
        let mut state = self.state.lock();
        *state = match *state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
        *state == StreamState::Closed
    }

    /// Transition to `Reset`, recording the reason and failing suspended
    /// senders. Returns `false` if the stream was already terminal, making
    /// reset idempotent.
    pub(crate) fn mark_reset(&self, reason: ResetReason) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = StreamState::Reset;
        drop(state);

        *self.reset_reason.lock() = Some(reason);
        self.flow.close();
        true
    }

    fn reset_error(&self, fallback: ResetReason) -> Error {
        Error::StreamReset {
            stream_id: self.id,
            reason: self.reset_reason().unwrap_or(fallback),
        }
    }
}

/// Create the inbound queue and handle for a freshly opened stream.
pub(crate) fn stream_pair(
    shared: Arc<StreamShared>,
    outbound: mpsc::Sender<Frame>,
) -> (mpsc::UnboundedSender<InboundChunk>, StreamHandle) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let handle = StreamHandle {
        writer: StreamWriter {
            shared: Arc::clone(&shared),
            outbound: outbound.clone(),
            sequence: 0,
        },
        reader: StreamReader {
            shared,
            outbound,
            inbound: inbound_rx,
            unacked: 0,
            eof: false,
        },
    };
    (inbound_tx, handle)
}

/// The write side of a stream.
pub struct StreamWriter {
    shared: Arc<StreamShared>,
    outbound: mpsc::Sender<Frame>,
    sequence: u64,
}

impl StreamWriter {
    /// The stream's id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.shared.id()
    }

    /// The stream's current state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Write a payload, chunking it into `Data` frames.
    ///
    /// Suspends while the send window is exhausted; credit is acquired
    /// before each chunk is enqueued, so no frame ever exceeds remaining
    /// credit. Sequence numbers are stamped in enqueue order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamClosed`] after a local close,
    /// [`Error::StreamReset`] if the stream was reset, and
    /// [`Error::SessionClosed`] if the session is gone.
    pub async fn write(&mut self, data: Bytes) -> Result<()> {
        match self.shared.state() {
            StreamState::Open | StreamState::HalfClosedRemote | StreamState::Idle => {}
            StreamState::Reset => return Err(self.shared.reset_error(ResetReason::Cancelled)),
            StreamState::HalfClosedLocal | StreamState::Closed => {
                return Err(Error::StreamClosed {
                    stream_id: self.id(),
                });
            }
        }

        let mut remaining = data;
        while !remaining.is_empty() {
            let len = remaining.len().min(self.shared.max_payload_size);
            let chunk = remaining.split_to(len);

            #[allow(clippy::cast_possible_truncation)]
            if !self.shared.flow.acquire(len as u32).await {
                return match self.shared.reset_reason() {
                    Some(_) => Err(self.shared.reset_error(ResetReason::Cancelled)),
                    None => Err(Error::SessionClosed),
                };
            }

            let frame = Frame::data(self.id(), self.sequence, FrameFlags::EMPTY, chunk);
            self.sequence += 1;
            self.outbound
                .send(frame)
                .await
                .map_err(|_| Error::SessionClosed)?;
        }

        Ok(())
    }

    /// Gracefully close the local direction with a `Close` frame.
    ///
    /// Idempotent: closing an already-closed direction does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamReset`] if the stream was already reset.
    pub async fn close(&mut self) -> Result<()> {
        match self.shared.state() {
            StreamState::HalfClosedLocal | StreamState::Closed => return Ok(()),
            StreamState::Reset => return Err(self.shared.reset_error(ResetReason::Cancelled)),
            _ => {}
        }

        self.shared.close_local();
        self.outbound
            .send(Frame::close(self.id()))
            .await
            .map_err(|_| Error::SessionClosed)?;
        Ok(())
    }

    /// Abort the stream immediately, discarding unacknowledged data.
    ///
    /// Idempotent: resetting an already-terminal stream has no further
    /// observable effect.
    pub async fn reset(&mut self, reason: ResetReason) {
        if !self.shared.mark_reset(reason) {
            return;
        }
        debug!(stream_id = self.id(), %reason, "resetting stream");
        // Best effort; the session may already be gone.
        let _ = self
            .outbound
            .send(Frame::reset(self.id(), reason.code()))
            .await;
    }
}

/// The read side of a stream.
pub struct StreamReader {
    shared: Arc<StreamShared>,
    outbound: mpsc::Sender<Frame>,
    inbound: mpsc::UnboundedReceiver<InboundChunk>,
    unacked: u32,
    eof: bool,
}

impl StreamReader {
    /// The stream's id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.shared.id()
    }

    /// The stream's current state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Read the next payload chunk, in the exact order it was sent.
    ///
    /// Suspends while nothing is queued. `Ok(None)` means end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamReset`] if the stream was reset (buffered but
    /// unread chunks are discarded) and [`Error::SessionClosed`] if the
    /// session went away without resetting the stream first.
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        if let Some(reason) = self.shared.reset_reason() {
            return Err(Error::StreamReset {
                stream_id: self.id(),
                reason,
            });
        }
        if self.eof {
            return Ok(None);
        }

        match self.inbound.recv().await {
            Some(InboundChunk::Data(chunk)) => {
                // A reset that raced the read discards buffered data.
                if let Some(reason) = self.shared.reset_reason() {
                    return Err(Error::StreamReset {
                        stream_id: self.id(),
                        reason,
                    });
                }
                self.acknowledge(chunk.len()).await;
                Ok(Some(chunk))
            }
            Some(InboundChunk::End) => {
                self.eof = true;
                Ok(None)
            }
            None => match self.shared.reset_reason() {
                Some(reason) => Err(Error::StreamReset {
                    stream_id: self.id(),
                    reason,
                }),
                None => Err(Error::SessionClosed),
            },
        }
    }

    /// Track consumed bytes and issue a `WindowUpdate` once the configured
    /// threshold is crossed, bounding peer-side buffering for lagging
    /// consumers.
    async fn acknowledge(&mut self, len: usize) {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.unacked += len as u32;
        }
        if self.unacked >= self.shared.window_update_threshold {
            let credit = self.unacked;
            self.unacked = 0;
            self.shared.flow.credit_recv(credit);
            let _ = self
                .outbound
                .send(Frame::window_update(self.id(), credit))
                .await;
        }
    }
}

/// A bidirectional stream handle: one writer half, one reader half.
pub struct StreamHandle {
    writer: StreamWriter,
    reader: StreamReader,
}

impl StreamHandle {
    /// The stream's id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.writer.id()
    }

    /// The stream's current state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.writer.state()
    }

    /// Write a payload chunk. See [`StreamWriter::write`].
    ///
    /// # Errors
    ///
    /// See [`StreamWriter::write`].
    pub async fn write(&mut self, data: Bytes) -> Result<()> {
        self.writer.write(data).await
    }

    /// Read the next payload chunk. See [`StreamReader::read`].
    ///
    /// # Errors
    ///
    /// See [`StreamReader::read`].
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        self.reader.read().await
    }

    /// Gracefully close the local direction. See [`StreamWriter::close`].
    ///
    /// # Errors
    ///
    /// See [`StreamWriter::close`].
    pub async fn close(&mut self) -> Result<()> {
        self.writer.close().await
    }

    /// Abort the stream. See [`StreamWriter::reset`].
    pub async fn reset(&mut self, reason: ResetReason) {
        self.writer.reset(reason).await;
    }

    /// Split into independently owned writer and reader halves.
    #[must_use]
    pub fn split(self) -> (StreamWriter, StreamReader) {
        (self.writer, self.reader)
    }
}
