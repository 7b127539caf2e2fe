//! Call correlation: matching asynchronous responses to their requests.
//!
//! The correlator runs atop one bidirectional stream. Requests and
//! responses travel as length-prefixed envelopes (`u32` body length, `u8`
//! kind, `u64` call id, opaque payload), reassembled from stream chunks on
//! the read side since the stream fragments large writes; a per-client map
//! of pending calls resolves each exactly once with a response, an
//! application error, or a timeout.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::SessionEvent;
use crate::stream::{StreamHandle, StreamReader, StreamWriter};

const KIND_REQUEST: u8 = 0x01;
const KIND_RESPONSE: u8 = 0x02;
const KIND_ERROR: u8 = 0x03;
const KIND_CANCEL: u8 = 0x04;

const ENVELOPE_HEADER_SIZE: usize = 9;
const LENGTH_PREFIX_SIZE: usize = 4;

/// One call message carried on the correlator's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CallEnvelope {
    kind: u8,
    call_id: u64,
    payload: Bytes,
}

impl CallEnvelope {
    fn new(kind: u8, call_id: u64, payload: Bytes) -> Self {
        Self {
            kind,
            call_id,
            payload,
        }
    }

    /// Encode with a length prefix. Envelopes larger than a stream's data
    /// chunk arrive fragmented, so the prefix is what lets the reader
    /// reassemble them.
    #[allow(clippy::cast_possible_truncation)]
    fn encode(&self) -> Bytes {
        let body_len = ENVELOPE_HEADER_SIZE + self.payload.len();
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body_len);
        buf.put_u32(body_len as u32);
        buf.put_u8(self.kind);
        buf.put_u64(self.call_id);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    fn decode(mut bytes: Bytes) -> Option<Self> {
        if bytes.len() < ENVELOPE_HEADER_SIZE {
            return None;
        }
        let kind = bytes.get_u8();
        let call_id = bytes.get_u64();
        matches!(
            kind,
            KIND_REQUEST | KIND_RESPONSE | KIND_ERROR | KIND_CANCEL
        )
        .then(|| Self::new(kind, call_id, bytes))
    }
}

/// Reassembles length-prefixed envelopes from stream chunks.
///
/// Chunk boundaries carry no meaning: a large envelope spans several
/// chunks and a small one may share a chunk with its neighbor. Decoding is
/// resumable, yielding nothing until a whole envelope is buffered.
#[derive(Debug, Default)]
struct EnvelopeAssembler {
    buf: BytesMut,
}

impl EnvelopeAssembler {
    fn push(&mut self, chunk: &Bytes) {
        self.buf.extend_from_slice(chunk);
    }

    /// The next complete envelope, or `None` until more chunks arrive.
    /// `Some(None)` means a complete body failed to decode; its bytes are
    /// discarded and reassembly continues at the next prefix.
    fn next(&mut self) -> Option<Option<CallEnvelope>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return None;
        }
        let mut prefix = &self.buf[..LENGTH_PREFIX_SIZE];
        let body_len = prefix.get_u32() as usize;
        if self.buf.len() < LENGTH_PREFIX_SIZE + body_len {
            self.buf.reserve(LENGTH_PREFIX_SIZE + body_len - self.buf.len());
            return None;
        }
        self.buf.advance(LENGTH_PREFIX_SIZE);
        let body = self.buf.split_to(body_len).freeze();
        Some(CallEnvelope::decode(body))
    }
}

type PendingCalls = Arc<DashMap<u64, oneshot::Sender<Result<Bytes>>>>;

/// Client side of the call correlator.
///
/// Cheap to share behind a reference; concurrent [`invoke`] calls are
/// serialized onto the underlying stream.
///
/// [`invoke`]: CallClient::invoke
pub struct CallClient {
    writer: Arc<Mutex<StreamWriter>>,
    pending: PendingCalls,
    next_call_id: AtomicU64,
    events_tx: broadcast::Sender<SessionEvent>,
    dispatch: JoinHandle<()>,
}

impl CallClient {
    /// Build a correlator client over an open stream, spawning the
    /// dispatch task that resolves responses.
    #[must_use]
    pub fn new(stream: StreamHandle, events_tx: broadcast::Sender<SessionEvent>) -> Self {
        let (writer, reader) = stream.split();
        let pending: PendingCalls = Arc::new(DashMap::new());
        let dispatch = tokio::spawn(dispatch_responses(reader, Arc::clone(&pending)));
        Self {
            writer: Arc::new(Mutex::new(writer)),
            pending,
            next_call_id: AtomicU64::new(0),
            events_tx,
            dispatch,
        }
    }

    /// Number of calls currently awaiting resolution.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and resolve exactly once with the response, an
    /// application error, or a timeout.
    ///
    /// The deadline is enforced by a timer independent of the transport;
    /// on expiry the pending call is released, a best-effort cancellation
    /// is sent to the peer, and a late response is discarded rather than
    /// resolving anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallTimeout`] on deadline expiry,
    /// [`Error::CallFailed`] for an application error from the peer,
    /// [`Error::CallCancelled`] if the correlator shut down mid-call, and
    /// stream errors if the request could not be sent.
    pub async fn invoke(&self, payload: Bytes, deadline: Option<Duration>) -> Result<Bytes> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, tx);

        let request = CallEnvelope::new(KIND_REQUEST, call_id, payload).encode();
        if let Err(err) = self.writer.lock().await.write(request).await {
            self.pending.remove(&call_id);
            return Err(err);
        }

        let resolution = match deadline {
            Some(after) => match timeout(after, rx).await {
                Ok(resolution) => resolution,
                Err(_) => {
                    self.pending.remove(&call_id);
                    debug!(call_id, ?after, "call timed out");
                    let _ = self.events_tx.send(SessionEvent::CallTimedOut { call_id });
                    let cancel = CallEnvelope::new(KIND_CANCEL, call_id, Bytes::new()).encode();
                    let _ = self.writer.lock().await.write(cancel).await;
                    return Err(Error::CallTimeout { call_id, after });
                }
            },
            None => rx.await,
        };

        match resolution {
            Ok(result) => {
                let _ = self.events_tx.send(SessionEvent::CallResolved { call_id });
                result
            }
            Err(_) => Err(Error::CallCancelled { call_id }),
        }
    }
}

impl Drop for CallClient {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

/// Reads envelopes off the stream and resolves pending calls. Resolving an
/// unknown or already-resolved call id is reported but non-fatal.
async fn dispatch_responses(mut reader: StreamReader, pending: PendingCalls) {
    let mut assembler = EnvelopeAssembler::default();
    loop {
        match reader.read().await {
            Ok(Some(chunk)) => {
                assembler.push(&chunk);
                while let Some(decoded) = assembler.next() {
                    let Some(envelope) = decoded else {
                        warn!("discarding malformed call envelope");
                        continue;
                    };
                    match envelope.kind {
                        KIND_RESPONSE => resolve(&pending, envelope.call_id, Ok(envelope.payload)),
                        KIND_ERROR => resolve(
                            &pending,
                            envelope.call_id,
                            Err(Error::CallFailed {
                                call_id: envelope.call_id,
                                error: envelope.payload,
                            }),
                        ),
                        other => {
                            warn!(
                                call_id = envelope.call_id,
                                kind = other,
                                "unexpected call envelope kind"
                            );
                        }
                    }
                }
            }
            Ok(None) => {
                debug!("call stream ended");
                break;
            }
            Err(err) => {
                debug!(%err, "call stream failed");
                break;
            }
        }
    }
    // Dropping the senders resolves every remaining call as cancelled.
    pending.clear();
}

fn resolve(pending: &PendingCalls, call_id: u64, result: Result<Bytes>) {
    if let Some((_, slot)) = pending.remove(&call_id) {
        let _ = slot.send(result);
    } else {
        // Either resolved twice by a misbehaving peer or a late response
        // after a local timeout; both are discarded.
        warn!(call_id, "response for unknown or already-resolved call");
    }
}

/// Application handler for incoming calls.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    /// Handle one request payload. `Err` resolves the caller's handle with
    /// an application error carrying the returned payload.
    async fn handle(&self, payload: Bytes) -> std::result::Result<Bytes, Bytes>;
}

/// Serves the peer side of the correlator: reads requests off a stream,
/// runs the handler, and writes back responses or errors. Cancellation
/// envelopes abort the matching in-flight handler.
pub struct CallResponder;

impl CallResponder {
    /// Spawn the serving loop. The returned task finishes when the stream
    /// ends or fails.
    pub fn spawn<H: CallHandler>(stream: StreamHandle, handler: Arc<H>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (writer, mut reader) = stream.split();
            let writer = Arc::new(Mutex::new(writer));
            let in_flight: Arc<DashMap<u64, JoinHandle<()>>> = Arc::new(DashMap::new());
            let mut assembler = EnvelopeAssembler::default();

            loop {
                match reader.read().await {
                    Ok(Some(chunk)) => {
                        assembler.push(&chunk);
                        while let Some(decoded) = assembler.next() {
                            let Some(envelope) = decoded else {
                                warn!("discarding malformed call envelope");
                                continue;
                            };
                            serve_envelope(envelope, &handler, &writer, &in_flight);
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }

            for entry in in_flight.iter() {
                entry.value().abort();
            }
        })
    }
}

fn serve_envelope<H: CallHandler>(
    envelope: CallEnvelope,
    handler: &Arc<H>,
    writer: &Arc<Mutex<StreamWriter>>,
    in_flight: &Arc<DashMap<u64, JoinHandle<()>>>,
) {
    match envelope.kind {
        KIND_REQUEST => {
            let call_id = envelope.call_id;
            let handler = Arc::clone(handler);
            let writer = Arc::clone(writer);
            let in_flight_done = Arc::clone(in_flight);
            let task = tokio::spawn(async move {
                let (kind, payload) = match handler.handle(envelope.payload).await {
                    Ok(response) => (KIND_RESPONSE, response),
                    Err(error) => (KIND_ERROR, error),
                };
                let reply = CallEnvelope::new(kind, call_id, payload).encode();
                let _ = writer.lock().await.write(reply).await;
                in_flight_done.remove(&call_id);
            });
            in_flight.insert(call_id, task);
        }
        KIND_CANCEL => {
            if let Some((_, task)) = in_flight.remove(&envelope.call_id) {
                debug!(call_id = envelope.call_id, "cancelling in-flight call");
                task.abort();
            }
        }
        other => {
            warn!(kind = other, "unexpected call envelope kind");
        }
    }
}
