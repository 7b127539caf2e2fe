//! Integration tests driving two sessions over an in-memory duplex pipe.

use bytes::Bytes;
use futures::SinkExt;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use weft_session::{
    Error, ResetReason, Session, SessionConfig, SessionRole, SessionState, StreamState,
};
use weft_wire::{Frame, FrameCodec, FrameFlags};

fn session_pair(config: SessionConfig) -> (Session, Session) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let client = Session::spawn(a, SessionRole::Client, config.clone());
    let server = Session::spawn(b, SessionRole::Server, config);
    (client, server)
}

fn quiet_pings() -> SessionConfig {
    SessionConfig {
        ping_interval: Duration::from_secs(60),
        ping_timeout: Duration::from_secs(60),
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn open_data_close_scenario() {
    let (client, mut server) = session_pair(quiet_pings());

    let mut local = client.open_stream().await.unwrap();
    assert_eq!(local.id(), 1, "client-initiated streams use odd ids");

    local.write(Bytes::from_static(b"hello")).await.unwrap();
    local.close().await.unwrap();
    assert_eq!(local.state(), StreamState::HalfClosedLocal);

    let mut mirrored = timeout(Duration::from_secs(1), server.accept_stream())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mirrored.id(), 1);

    let chunk = mirrored.read().await.unwrap().unwrap();
    assert_eq!(chunk, Bytes::from_static(b"hello"));
    assert!(mirrored.read().await.unwrap().is_none(), "end of stream");
    assert_eq!(mirrored.state(), StreamState::HalfClosedRemote);
}

#[tokio::test]
async fn payloads_arrive_in_order_across_window_replenishment() {
    let (client, mut server) = session_pair(quiet_pings());

    // 200 KiB in 1 KiB chunks: several times the 64 KiB initial window,
    // so delivery depends on WindowUpdate frames flowing back.
    let chunks: Vec<Bytes> = (0..200u32)
        .map(|i| {
            let mut chunk = vec![0u8; 1024];
            chunk[..4].copy_from_slice(&i.to_be_bytes());
            Bytes::from(chunk)
        })
        .collect();
    let sent: Vec<Bytes> = chunks.clone();

    let writer = tokio::spawn(async move {
        let mut stream = client.open_stream().await.unwrap();
        for chunk in chunks {
            stream.write(chunk).await.unwrap();
        }
        stream.close().await.unwrap();
        client
    });

    let mut stream = server.accept_stream().await.unwrap();
    let mut received = Vec::new();
    while let Some(chunk) = timeout(Duration::from_secs(5), stream.read())
        .await
        .unwrap()
        .unwrap()
    {
        received.extend_from_slice(&chunk);
    }

    writer.await.unwrap();

    let expected: Vec<u8> = sent.iter().flat_map(|c| c.to_vec()).collect();
    assert_eq!(received.len(), expected.len());
    assert_eq!(received, expected, "no reordering, no duplication");
}

#[tokio::test]
async fn write_suspends_on_exhausted_window_and_resumes() {
    let config = SessionConfig {
        initial_window: 1024,
        window_update_threshold: 512,
        max_payload_size: 512,
        ..quiet_pings()
    };
    let (client, mut server) = session_pair(config);

    let stream = client.open_stream().await.unwrap();
    let writer = tokio::spawn(async move {
        let mut stream = stream;
        // Needs 2 KiB of credit against a 1 KiB window.
        stream.write(Bytes::from(vec![7u8; 2048])).await.unwrap();
        stream
    });

    let mut mirrored = server.accept_stream().await.unwrap();

    // With the peer not consuming, the writer must stay suspended.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!writer.is_finished(), "write must block past the window");

    // Consuming replenishes credit and unblocks the writer.
    let mut consumed = 0;
    while consumed < 2048 {
        let chunk = timeout(Duration::from_secs(1), mirrored.read())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        consumed += chunk.len();
    }
    writer.await.unwrap();
    assert_eq!(consumed, 2048);
}

#[tokio::test]
async fn reset_is_idempotent_and_discards_buffered_data() {
    let (client, mut server) = session_pair(quiet_pings());

    let mut local = client.open_stream().await.unwrap();
    local.write(Bytes::from_static(b"doomed")).await.unwrap();
    local.reset(ResetReason::Application(0x42)).await;
    assert_eq!(local.state(), StreamState::Reset);

    // Second reset: no additional observable effect.
    local.reset(ResetReason::Cancelled).await;
    assert_eq!(local.state(), StreamState::Reset);

    // Writing after a reset reports the original reason.
    let err = local.write(Bytes::from_static(b"x")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::StreamReset {
            stream_id: 1,
            reason: ResetReason::Application(0x42)
        }
    ));

    // The mirrored stream eventually observes the reset; data that was
    // still buffered is discarded rather than delivered after it.
    let mut mirrored = server.accept_stream().await.unwrap();
    let observed = loop {
        match timeout(Duration::from_secs(1), mirrored.read())
            .await
            .unwrap()
        {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("expected reset, got end of stream"),
            Err(err) => break err,
        }
    };
    assert!(matches!(
        observed,
        Error::StreamReset {
            reason: ResetReason::Application(0x42),
            ..
        }
    ));
    assert_eq!(mirrored.state(), StreamState::Reset);
}

#[tokio::test]
async fn remote_opens_past_admission_limit_are_refused() {
    let config = SessionConfig {
        max_concurrent_streams: 2,
        ..quiet_pings()
    };
    let (client, mut server) = session_pair(config);

    let mut first = client.open_stream().await.unwrap();
    let _second = client.open_stream().await.unwrap();
    let mut third = client.open_stream().await.unwrap();

    // The refused stream resolves reads with a refusal, not a session
    // failure.
    let err = timeout(Duration::from_secs(1), third.read())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        Error::StreamReset {
            reason: ResetReason::RefusedStream,
            ..
        }
    ));

    // Admitted streams keep working.
    first.write(Bytes::from_static(b"still fine")).await.unwrap();
    let mut mirrored = server.accept_stream().await.unwrap();
    let chunk = timeout(Duration::from_secs(1), mirrored.read())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(chunk, Bytes::from_static(b"still fine"));
    assert_eq!(client.state(), SessionState::Established);
}

#[tokio::test]
async fn graceful_drain_closes_after_streams_finish() {
    let (client, mut server) = session_pair(quiet_pings());

    let mut local = client.open_stream().await.unwrap();
    local.write(Bytes::from_static(b"x")).await.unwrap();

    let mut mirrored = server.accept_stream().await.unwrap();
    assert_eq!(
        mirrored.read().await.unwrap().unwrap(),
        Bytes::from_static(b"x")
    );

    // Finish the stream in both directions.
    local.close().await.unwrap();
    assert!(mirrored.read().await.unwrap().is_none());
    mirrored.close().await.unwrap();

    timeout(Duration::from_secs(1), client.shutdown())
        .await
        .expect("drain should complete promptly with no open streams");
    assert_eq!(client.state(), SessionState::Closed);

    // No new streams after draining.
    assert!(matches!(
        client.open_stream().await,
        Err(Error::SessionClosed)
    ));
}

#[tokio::test]
async fn drain_deadline_forces_closure_of_stuck_streams() {
    let config = SessionConfig {
        drain_timeout: Duration::from_millis(100),
        ..quiet_pings()
    };
    let (client, _server) = session_pair(config);

    let mut stuck = client.open_stream().await.unwrap();

    timeout(Duration::from_secs(1), client.shutdown())
        .await
        .expect("drain deadline must bound shutdown");
    assert_eq!(client.state(), SessionState::Closed);

    // The stuck stream was reset during teardown; its operations resolve
    // rather than hanging.
    let err = stuck.read().await.unwrap_err();
    assert!(matches!(err, Error::StreamReset { .. }));
}

#[tokio::test]
async fn missing_pongs_escalate_to_transport_failure() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let config = SessionConfig {
        ping_interval: Duration::from_millis(50),
        ping_timeout: Duration::from_millis(50),
        ..SessionConfig::default()
    };
    let client = Session::spawn(a, SessionRole::Client, config);

    // The peer never answers: hold the raw transport without running a
    // session on it.
    let _stalled_peer = b;

    timeout(Duration::from_secs(1), client.closed())
        .await
        .expect("stalled transport must close the session");
    assert_eq!(client.state(), SessionState::Closed);
}

#[tokio::test]
async fn transport_loss_resets_streams_with_a_distinguishable_reason() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Session::spawn(a, SessionRole::Client, quiet_pings());

    let mut stream = client.open_stream().await.unwrap();

    // Severing the connection is not a logical peer close.
    drop(b);

    timeout(Duration::from_secs(1), client.closed()).await.unwrap();
    let err = stream.read().await.unwrap_err();
    assert!(matches!(
        err,
        Error::StreamReset {
            reason: ResetReason::TransportFailure,
            ..
        }
    ));
    let err = stream.write(Bytes::from_static(b"x")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::StreamReset {
            reason: ResetReason::TransportFailure,
            ..
        }
    ));
}

#[tokio::test]
async fn sequence_gaps_are_connection_fatal() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Session::spawn(a, SessionRole::Client, quiet_pings());
    let mut peer = Framed::new(b, FrameCodec::new());

    let mut stream = client.open_stream().await.unwrap();

    // The first data frame must carry sequence 0; a gap means loss or
    // reordering underneath and fails the whole connection.
    peer.send(Frame::data(1, 5, FrameFlags::EMPTY, Bytes::from_static(b"x")))
        .await
        .unwrap();

    timeout(Duration::from_secs(1), client.closed())
        .await
        .expect("a sequence gap must close the session");
    assert_eq!(client.state(), SessionState::Closed);

    // Every open stream observes the reset with a protocol reason.
    let err = stream.read().await.unwrap_err();
    assert!(matches!(
        err,
        Error::StreamReset {
            reason: ResetReason::ProtocolViolation,
            ..
        }
    ));
}

#[tokio::test]
async fn receive_window_overrun_is_connection_fatal() {
    let config = SessionConfig {
        initial_window: 1024,
        ..quiet_pings()
    };
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Session::spawn(a, SessionRole::Client, config);
    let mut peer = Framed::new(b, FrameCodec::new());

    let mut stream = client.open_stream().await.unwrap();

    // 2 KiB against 1 KiB of granted credit.
    peer.send(Frame::data(1, 0, FrameFlags::EMPTY, Bytes::from(vec![0u8; 2048])))
        .await
        .unwrap();

    timeout(Duration::from_secs(1), client.closed())
        .await
        .expect("a window overrun must close the session");
    assert_eq!(client.state(), SessionState::Closed);

    let err = stream.read().await.unwrap_err();
    assert!(matches!(
        err,
        Error::StreamReset {
            reason: ResetReason::ProtocolViolation,
            ..
        }
    ));
}

#[tokio::test]
async fn frames_for_unassigned_streams_are_connection_fatal() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Session::spawn(a, SessionRole::Client, quiet_pings());
    let mut peer = Framed::new(b, FrameCodec::new());

    // Stream id 2 has the remote parity but was never opened.
    peer.send(Frame::data(2, 0, FrameFlags::EMPTY, Bytes::from_static(b"x")))
        .await
        .unwrap();

    timeout(Duration::from_secs(1), client.closed())
        .await
        .expect("an unassigned stream id must close the session");
    assert_eq!(client.state(), SessionState::Closed);
}

#[tokio::test]
async fn wrong_parity_opens_are_connection_fatal() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Session::spawn(a, SessionRole::Client, quiet_pings());
    let mut peer = Framed::new(b, FrameCodec::new());

    // Odd ids belong to the client side; the peer must not open them.
    peer.send(Frame::open(3)).await.unwrap();

    timeout(Duration::from_secs(1), client.closed())
        .await
        .expect("a wrong-parity open must close the session");
    assert_eq!(client.state(), SessionState::Closed);
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    let (client, mut server) = session_pair(quiet_pings());
    let mut events = client.events();

    let mut local = client.open_stream().await.unwrap();
    local.close().await.unwrap();

    let mut mirrored = server.accept_stream().await.unwrap();
    assert!(mirrored.read().await.unwrap().is_none());
    mirrored.close().await.unwrap();

    let mut saw_opened = false;
    let mut saw_closed = false;
    while let Ok(event) =
        timeout(Duration::from_millis(500), events.recv()).await
    {
        match event.unwrap() {
            weft_session::SessionEvent::StreamOpened { stream_id: 1, .. } => saw_opened = true,
            weft_session::SessionEvent::StreamClosed { stream_id: 1 } => {
                saw_closed = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_opened, "expected a StreamOpened notification");
    assert!(saw_closed, "expected a StreamClosed notification");
}
