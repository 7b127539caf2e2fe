//! Session: owner of one transport connection and every stream
//! multiplexed over it.
//!
//! A single driver task owns the framed transport. It demultiplexes
//! inbound frames into per-stream queues without blocking the read loop,
//! and is the sole writer of outbound frames: stream writers and the call
//! correlator enqueue onto one shared channel, which also gives FIFO
//! fairness across streams.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, interval, sleep_until};
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};
use weft_wire::{Frame, FrameCodec, FrameKind, WireError};

use crate::config::SessionConfig;
use crate::error::{Error, ProtocolViolation, ResetReason, Result};
use crate::events::SessionEvent;
use crate::rpc::CallClient;
use crate::stream::{InboundChunk, StreamHandle, StreamShared, StreamState, stream_pair};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The transport is being set up.
    Connecting,
    /// Streams may be opened and accepted.
    Established,
    /// No new streams are admitted; existing streams are finishing.
    Draining,
    /// Terminal. Every owned stream has been invalidated.
    Closed,
}

/// Which side of the connection this session is, determining the parity of
/// locally initiated stream ids so both sides can allocate without
/// coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Initiated the connection; opens odd stream ids.
    Client,
    /// Accepted the connection; opens even stream ids.
    Server,
}

impl SessionRole {
    const fn first_stream_id(self) -> u32 {
        match self {
            Self::Client => 1,
            Self::Server => 2,
        }
    }

    /// Whether `id` belongs to this side's parity. Id zero is reserved for
    /// connection-level frames and belongs to neither side.
    const fn is_local_id(self, id: u32) -> bool {
        match self {
            Self::Client => id % 2 == 1,
            Self::Server => id % 2 == 0 && id != 0,
        }
    }
}

enum Command {
    OpenStream {
        reply: oneshot::Sender<Result<StreamHandle>>,
    },
    Shutdown,
}

/// Handle to a running session.
///
/// Dropping the handle initiates a graceful drain; use
/// [`Session::shutdown`] to drain and wait for closure explicitly.
pub struct Session {
    cmd_tx: mpsc::Sender<Command>,
    incoming_rx: mpsc::Receiver<StreamHandle>,
    events_tx: broadcast::Sender<SessionEvent>,
    state_rx: watch::Receiver<SessionState>,
}

impl Session {
    /// Spawn a session driver over an ordered, reliable byte transport.
    pub fn spawn<T>(transport: T, role: SessionRole, config: SessionConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let codec = FrameCodec::new().with_max_frame_size(config.max_frame_size);
        let (sink, frames) = Framed::new(transport, codec).split();

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.accept_queue);
        let (events_tx, _) = broadcast::channel(64);
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        let driver = Driver {
            sink,
            streams: HashMap::new(),
            role,
            next_local_id: role.first_stream_id(),
            highest_remote_id: 0,
            config,
            outbound_tx,
            incoming_tx,
            events_tx: events_tx.clone(),
            state_tx,
            outstanding_ping: None,
            next_ping_token: 0,
            draining: false,
            drain_deadline: None,
        };

        tokio::spawn(run(frames, driver, outbound_rx, cmd_rx));

        Self {
            cmd_tx,
            incoming_rx,
            events_tx,
            state_rx,
        }
    }

    /// Open a new locally initiated stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] once the session is draining or
    /// closed, or a protocol error if the stream id space is exhausted.
    pub async fn open_stream(&self) -> Result<StreamHandle> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::OpenStream { reply })
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Accept the next remotely initiated stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] once the session is gone.
    pub async fn accept_stream(&mut self) -> Result<StreamHandle> {
        self.incoming_rx.recv().await.ok_or(Error::SessionClosed)
    }

    /// Open a stream and build a call correlator client on top of it.
    ///
    /// # Errors
    ///
    /// Propagates [`Session::open_stream`] errors.
    pub async fn open_call_client(&self) -> Result<CallClient> {
        let stream = self.open_stream().await?;
        Ok(CallClient::new(stream, self.events_tx.clone()))
    }

    /// Request a graceful drain and wait until the session is closed.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        self.closed().await;
    }

    /// Wait until the session reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state_rx.clone();
        // A dropped sender also means the driver is gone.
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// The session's current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to lifecycle notifications.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}

struct StreamEntry {
    shared: Arc<StreamShared>,
    /// Dropped once the remote direction ends; `None` thereafter.
    inbound: Option<mpsc::UnboundedSender<InboundChunk>>,
    next_recv_seq: u64,
}

enum Teardown {
    Graceful,
    Failed(Error),
}

struct Driver<T> {
    sink: SplitSink<Framed<T, FrameCodec>, Frame>,
    streams: HashMap<u32, StreamEntry>,
    role: SessionRole,
    next_local_id: u32,
    highest_remote_id: u32,
    config: SessionConfig,
    outbound_tx: mpsc::Sender<Frame>,
    incoming_tx: mpsc::Sender<StreamHandle>,
    events_tx: broadcast::Sender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
    outstanding_ping: Option<(u64, Instant)>,
    next_ping_token: u64,
    draining: bool,
    drain_deadline: Option<Instant>,
}

async fn run<T>(
    mut frames: SplitStream<Framed<T, FrameCodec>>,
    mut driver: Driver<T>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    mut cmd_rx: mpsc::Receiver<Command>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    driver.set_state(SessionState::Established);

    let mut ping = interval(driver.config.ping_interval);
    let mut cmd_open = true;

    let teardown = loop {
        let pong_at = driver.outstanding_ping.map(|(_, at)| at);
        let drain_at = driver.drain_deadline;

        let step: Result<()> = tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(frame)) => driver.on_frame(frame).await,
                Some(Err(err)) => Err(read_error(err)),
                None if driver.draining => break Teardown::Graceful,
                None => Err(Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection lost",
                ))),
            },
            Some(frame) = outbound_rx.recv() => driver.write_outbound(frame).await,
            cmd = cmd_rx.recv(), if cmd_open => match cmd {
                Some(cmd) => driver.on_command(cmd).await,
                None => {
                    // All handles dropped; nobody can open or accept.
                    cmd_open = false;
                    driver.begin_drain();
                    Ok(())
                }
            },
            _ = ping.tick() => driver.on_ping_tick().await,
            () = deadline(pong_at) => Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "liveness probe timed out",
            ))),
            () = deadline(drain_at) => break Teardown::Graceful,
        };

        if let Err(err) = step {
            break Teardown::Failed(err);
        }
        if driver.draining && driver.streams.is_empty() {
            break Teardown::Graceful;
        }
    };

    driver.teardown(teardown).await;
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn read_error(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::InvalidData {
        Error::Protocol(ProtocolViolation::MalformedFrame(err.to_string()))
    } else {
        Error::Transport(err)
    }
}

impl<T> Driver<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
        self.emit(SessionEvent::StateChanged(state));
    }

    /// Whether `id` was ever assigned, by either side. Late frames for
    /// since-closed streams are tolerated; frames for never-assigned ids
    /// are a protocol violation.
    fn was_assigned(&self, id: u32) -> bool {
        if self.role.is_local_id(id) {
            id < self.next_local_id
        } else {
            id != 0 && id <= self.highest_remote_id
        }
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        self.sink.send(frame).await.map_err(Error::Transport)
    }

    /// Forward a frame enqueued by a stream writer or the correlator,
    /// maintaining the stream map along the way.
    async fn write_outbound(&mut self, frame: Frame) -> Result<()> {
        match frame.kind {
            FrameKind::Reset => {
                let Some(_entry) = self.streams.remove(&frame.stream_id) else {
                    // Remote reset or close already removed it.
                    return Ok(());
                };
                let reason = frame
                    .reset_code()
                    .map_or(ResetReason::Cancelled, ResetReason::from_code);
                self.emit(SessionEvent::StreamReset {
                    stream_id: frame.stream_id,
                    reason,
                });
            }
            FrameKind::Close => {
                let Some(entry) = self.streams.get(&frame.stream_id) else {
                    return Ok(());
                };
                if entry.shared.state() == StreamState::Closed {
                    self.streams.remove(&frame.stream_id);
                    self.emit(SessionEvent::StreamClosed {
                        stream_id: frame.stream_id,
                    });
                }
            }
            FrameKind::Data | FrameKind::WindowUpdate => {
                // The stream was reset while this frame sat in the queue;
                // unacknowledged data is discarded.
                if !self.streams.contains_key(&frame.stream_id) {
                    return Ok(());
                }
            }
            _ => {}
        }
        self.send_frame(frame).await
    }

    async fn on_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::OpenStream { reply } => self.open_local_stream(reply).await,
            Command::Shutdown => {
                self.begin_drain();
                Ok(())
            }
        }
    }

    async fn open_local_stream(
        &mut self,
        reply: oneshot::Sender<Result<StreamHandle>>,
    ) -> Result<()> {
        if self.draining {
            let _ = reply.send(Err(Error::SessionClosed));
            return Ok(());
        }
        if self.next_local_id > u32::MAX - 2 {
            // Ids are never reused; exhaustion is session-fatal.
            let _ = reply.send(Err(ProtocolViolation::StreamIdsExhausted.into()));
            return Err(ProtocolViolation::StreamIdsExhausted.into());
        }

        let id = self.next_local_id;
        self.next_local_id += 2;

        let shared = StreamShared::new(id, &self.config);
        shared.mark_open();
        let (inbound_tx, handle) = stream_pair(Arc::clone(&shared), self.outbound_tx.clone());
        self.streams.insert(
            id,
            StreamEntry {
                shared,
                inbound: Some(inbound_tx),
                next_recv_seq: 0,
            },
        );

        self.send_frame(Frame::open(id)).await?;
        debug!(stream_id = id, "opened local stream");
        self.emit(SessionEvent::StreamOpened {
            stream_id: id,
            remote: false,
        });
        let _ = reply.send(Ok(handle));
        Ok(())
    }

    fn begin_drain(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        self.drain_deadline = Some(Instant::now() + self.config.drain_timeout);
        debug!(
            open_streams = self.streams.len(),
            "draining session, no new streams admitted"
        );
        self.set_state(SessionState::Draining);
    }

    async fn on_ping_tick(&mut self) -> Result<()> {
        let token = self.next_ping_token;
        self.next_ping_token += 1;
        self.send_frame(Frame::ping(token)).await?;
        if self.outstanding_ping.is_none() {
            self.outstanding_ping = Some((token, Instant::now() + self.config.ping_timeout));
        }
        Ok(())
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<()> {
        match frame.kind {
            FrameKind::Open => self.on_open(frame).await,
            FrameKind::Data => self.on_data(frame),
            FrameKind::WindowUpdate => self.on_window_update(&frame),
            FrameKind::Close => self.on_remote_end(frame.stream_id),
            FrameKind::Reset => self.on_reset(&frame),
            FrameKind::Ping => {
                let token = frame.ping_token().map_err(malformed)?;
                self.send_frame(Frame::pong(token)).await
            }
            FrameKind::Pong => {
                let token = frame.ping_token().map_err(malformed)?;
                if self
                    .outstanding_ping
                    .is_some_and(|(expected, _)| token == expected)
                {
                    self.outstanding_ping = None;
                }
                Ok(())
            }
        }
    }

    async fn on_open(&mut self, frame: Frame) -> Result<()> {
        let id = frame.stream_id;
        if self.role.is_local_id(id) || id == 0 {
            return Err(ProtocolViolation::WrongParity { stream_id: id }.into());
        }
        if id <= self.highest_remote_id {
            return Err(ProtocolViolation::DuplicateOpen { stream_id: id }.into());
        }
        self.highest_remote_id = id;

        if self.draining || self.streams.len() >= self.config.max_concurrent_streams {
            debug!(stream_id = id, "refusing remote stream");
            return self
                .send_frame(Frame::reset(id, ResetReason::RefusedStream.code()))
                .await;
        }

        let shared = StreamShared::new(id, &self.config);
        shared.mark_open();
        let (inbound_tx, handle) = stream_pair(Arc::clone(&shared), self.outbound_tx.clone());

        // The accept queue is part of the admission limit: if the
        // application is not keeping up, refuse rather than buffer.
        if self.incoming_tx.try_send(handle).is_err() {
            debug!(stream_id = id, "accept queue full, refusing remote stream");
            return self
                .send_frame(Frame::reset(id, ResetReason::RefusedStream.code()))
                .await;
        }

        self.streams.insert(
            id,
            StreamEntry {
                shared,
                inbound: Some(inbound_tx),
                next_recv_seq: 0,
            },
        );
        debug!(stream_id = id, "accepted remote stream");
        self.emit(SessionEvent::StreamOpened {
            stream_id: id,
            remote: true,
        });
        Ok(())
    }

    fn on_data(&mut self, frame: Frame) -> Result<()> {
        let id = frame.stream_id;
        let end = frame.is_end_stream();

        let Some(entry) = self.streams.get_mut(&id) else {
            if self.was_assigned(id) {
                debug!(stream_id = id, "dropping data for closed stream");
                return Ok(());
            }
            return Err(ProtocolViolation::UnknownStream { stream_id: id }.into());
        };

        if frame.sequence != entry.next_recv_seq {
            return Err(ProtocolViolation::SequenceGap {
                stream_id: id,
                expected: entry.next_recv_seq,
                actual: frame.sequence,
            }
            .into());
        }
        entry.next_recv_seq += 1;

        #[allow(clippy::cast_possible_truncation)]
        if !entry.shared.flow.charge_recv(frame.payload.len() as u32) {
            return Err(ProtocolViolation::WindowOverrun { stream_id: id }.into());
        }

        if let Some(tx) = &entry.inbound {
            // Receiver gone means the application dropped its handle; the
            // data is discarded but window accounting already happened.
            let _ = tx.send(InboundChunk::Data(frame.payload));
        } else {
            debug!(stream_id = id, "dropping data past end of stream");
        }

        if end {
            return self.on_remote_end(id);
        }
        Ok(())
    }

    fn on_window_update(&mut self, frame: &Frame) -> Result<()> {
        let id = frame.stream_id;
        let increment = frame.window_increment().map_err(malformed)?;
        if let Some(entry) = self.streams.get(&id) {
            entry.shared.flow.replenish_send(increment);
            Ok(())
        } else if self.was_assigned(id) {
            Ok(())
        } else {
            Err(ProtocolViolation::UnknownStream { stream_id: id }.into())
        }
    }

    fn on_remote_end(&mut self, id: u32) -> Result<()> {
        let Some(entry) = self.streams.get_mut(&id) else {
            if self.was_assigned(id) {
                return Ok(());
            }
            return Err(ProtocolViolation::UnknownStream { stream_id: id }.into());
        };

        if let Some(tx) = entry.inbound.take() {
            let _ = tx.send(InboundChunk::End);
        }
        if entry.shared.close_remote() {
            self.streams.remove(&id);
            debug!(stream_id = id, "stream closed");
            self.emit(SessionEvent::StreamClosed { stream_id: id });
        }
        Ok(())
    }

    fn on_reset(&mut self, frame: &Frame) -> Result<()> {
        let code = frame.reset_code().map_err(malformed)?;
        // A reset for an unknown id raced our own close or reset; resets
        // are idempotent, so it is ignored.
        if let Some(entry) = self.streams.remove(&frame.stream_id) {
            let reason = ResetReason::from_code(code);
            entry.shared.mark_reset(reason);
            warn!(stream_id = frame.stream_id, %reason, "stream reset by peer");
            self.emit(SessionEvent::StreamReset {
                stream_id: frame.stream_id,
                reason,
            });
        }
        Ok(())
    }

    async fn teardown(mut self, outcome: Teardown) {
        let reason = match &outcome {
            Teardown::Graceful => ResetReason::Cancelled,
            Teardown::Failed(Error::Protocol(_)) => ResetReason::ProtocolViolation,
            Teardown::Failed(_) => ResetReason::TransportFailure,
        };
        match &outcome {
            Teardown::Graceful => debug!("session closed"),
            Teardown::Failed(err) => error!(%err, "session failed"),
        }

        // Invalidate every owned stream: suspended reads and writes
        // resolve with a reason callers can distinguish from a logical
        // peer close.
        for (id, entry) in self.streams.drain() {
            if entry.shared.mark_reset(reason) {
                let _ = self.events_tx.send(SessionEvent::StreamReset {
                    stream_id: id,
                    reason,
                });
            }
        }

        let _ = self.sink.close().await;
        self.set_state(SessionState::Closed);
    }
}

fn malformed(err: WireError) -> Error {
    Error::Protocol(ProtocolViolation::MalformedFrame(err.to_string()))
}
