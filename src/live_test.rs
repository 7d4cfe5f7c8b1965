use super::*;

use std::sync::Mutex as StdMutex;

use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::config::LiveOptions;

// =============================================================================
// LOOPBACK SERVER HARNESS
// =============================================================================

enum ServerCmd {
    SendText(String),
    Close(u16, String),
}

struct TestServer {
    base_url: String,
    inbound: mpsc::UnboundedReceiver<Message>,
    commands: mpsc::UnboundedSender<ServerCmd>,
}

/// Accept one websocket connection and bridge it to channels: everything the
/// client sends lands on `inbound`, and `commands` drives server-side sends.
async fn spawn_server() -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener addr");

    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let (commands, mut command_rx) = mpsc::unbounded_channel::<ServerCmd>();

    let _server = tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(ws) = accept_async(stream).await else {
            return;
        };
        let (mut sink, mut source) = ws.split();

        loop {
            tokio::select! {
                message = source.next() => {
                    match message {
                        Some(Ok(message)) => {
                            let _ = inbound_tx.send(message);
                        }
                        _ => break,
                    }
                }
                command = command_rx.recv() => {
                    match command {
                        Some(ServerCmd::SendText(text)) => {
                            if sink.send(Message::text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(ServerCmd::Close(code, reason)) => {
                            let frame = CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            };
                            let _ = sink.send(Message::Close(Some(frame))).await;
                        }
                        None => break,
                    }
                }
            }
        }
    });

    TestServer {
        base_url: format!("http://{addr}"),
        inbound,
        commands,
    }
}

fn test_config(server: &TestServer) -> ClientConfig {
    ClientConfig::new(server.base_url.clone(), "test-key")
}

/// Register a collector on every event kind.
fn subscribe_all(client: &LiveClient) -> Arc<StdMutex<Vec<LiveEvent>>> {
    let events = Arc::new(StdMutex::new(Vec::new()));
    for kind in EventKind::ALL {
        let sink = Arc::clone(&events);
        client.on(kind, move |event, _context| {
            sink.lock().expect("event log mutex").push(event.clone());
        });
    }
    events
}

fn kinds(events: &Arc<StdMutex<Vec<LiveEvent>>>) -> Vec<EventKind> {
    events
        .lock()
        .expect("event log mutex")
        .iter()
        .map(LiveEvent::kind)
        .collect()
}

fn count_kind(events: &Arc<StdMutex<Vec<LiveEvent>>>, kind: EventKind) -> usize {
    kinds(events).iter().filter(|k| **k == kind).count()
}

async fn wait_for(condition: impl Fn() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn recv_message(server: &mut TestServer) -> Message {
    tokio::time::timeout(Duration::from_secs(5), server.inbound.recv())
        .await
        .expect("timed out waiting for inbound frame")
        .expect("server connection ended")
}

/// Drain every text frame the server observed until the client disconnects.
async fn drain_texts(server: &mut TestServer) -> Vec<String> {
    let mut texts = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), server.inbound.recv()).await {
            Ok(Some(Message::Text(text))) => texts.push(text.to_string()),
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => panic!("server did not observe the client disconnect"),
        }
    }
    texts
}

// =============================================================================
// SESSION LIFECYCLE
// =============================================================================

#[tokio::test]
async fn start_dispatches_open_and_routes_inbound_events_in_order() {
    let server = spawn_server().await;
    let mut client = LiveClient::new(test_config(&server)).expect("client");
    let events = subscribe_all(&client);

    let started = client.start(StartParams::new()).await.expect("start");
    assert!(started);
    assert!(client.is_active());
    // Open fires synchronously, before start returns.
    assert_eq!(kinds(&events), vec![EventKind::Open]);

    server
        .commands
        .send(ServerCmd::SendText(
            r#"{"type":"Metadata","request_id":"req-9"}"#.to_owned(),
        ))
        .expect("server command");
    server
        .commands
        .send(ServerCmd::SendText(r#"{"type":"Bogus","x":1}"#.to_owned()))
        .expect("server command");

    wait_for(
        || events.lock().expect("event log mutex").len() >= 3,
        "inbound events",
    )
    .await;

    {
        let events = events.lock().expect("event log mutex");
        assert_eq!(events.len(), 3);
        let LiveEvent::Metadata(metadata) = &events[1] else {
            panic!("expected metadata second, got {:?}", events[1]);
        };
        assert_eq!(metadata.request_id, "req-9");
        let LiveEvent::Unhandled(unhandled) = &events[2] else {
            panic!("expected unhandled third, got {:?}", events[2]);
        };
        assert!(unhandled.raw.contains("Bogus"));
    }

    assert!(client.finish().await);
}

#[tokio::test]
async fn context_is_forwarded_to_every_dispatch() {
    let server = spawn_server().await;
    let mut client = LiveClient::new(test_config(&server)).expect("client");

    let traces = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&traces);
    client.on(EventKind::Transcript, move |_event, context| {
        let trace = context
            .get("trace_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        sink.lock().expect("trace mutex").push(trace);
    });

    let params = StartParams::new().with_context("trace_id", "t-42");
    assert!(client.start(params).await.expect("start"));

    for _ in 0..2 {
        server
            .commands
            .send(ServerCmd::SendText(r#"{"type":"Transcript"}"#.to_owned()))
            .expect("server command");
    }
    wait_for(
        || traces.lock().expect("trace mutex").len() >= 2,
        "transcript dispatches",
    )
    .await;

    assert_eq!(
        *traces.lock().expect("trace mutex"),
        vec!["t-42", "t-42"]
    );
    assert!(client.finish().await);
}

#[tokio::test]
async fn members_attached_at_start_are_readable() {
    let server = spawn_server().await;
    let mut client = LiveClient::new(test_config(&server)).expect("client");

    let params = StartParams::new().with_member("origin", "integration");
    assert!(client.start(params).await.expect("start"));

    assert_eq!(
        client.member("origin").and_then(Value::as_str),
        Some("integration")
    );
    assert!(client.member("missing").is_none());

    assert!(client.finish().await);
}

#[tokio::test]
async fn start_on_active_session_is_a_no_op() {
    let mut server = spawn_server().await;
    let mut client = LiveClient::new(test_config(&server)).expect("client");

    assert!(client.start(StartParams::new()).await.expect("start"));
    assert!(!client.start(StartParams::new()).await.expect("restart"));
    assert!(client.is_active());

    assert!(client.finish().await);
    let _ = drain_texts(&mut server).await;
}

// =============================================================================
// CONNECT FAILURES
// =============================================================================

/// Bind then drop a listener so the port refuses connections.
async fn refused_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener addr");
    drop(listener);
    format!("http://{addr}")
}

#[tokio::test]
async fn failed_connect_returns_false_and_leaves_safe_no_ops() {
    let config = ClientConfig::new(refused_url().await, "");
    let mut client = LiveClient::new(config).expect("client");
    let events = subscribe_all(&client);

    let started = client.start(StartParams::new()).await.expect("start");
    assert!(!started);
    assert!(!client.is_active());
    // No partial state: no Open event, no loops.
    assert!(events.lock().expect("event log mutex").is_empty());

    assert!(!client.send("audio").await.expect("send"));
    assert!(!client.finish().await);
}

#[tokio::test]
async fn failed_connect_raises_when_toggled() {
    let config =
        ClientConfig::new(refused_url().await, "").with_option(OPT_RAISE_ON_CONNECT, "true");
    let mut client = LiveClient::new(config).expect("client");

    let err = client
        .start(StartParams::new())
        .await
        .expect_err("connect failure should raise");
    assert!(matches!(err, LiveError::Connect(_)));
    assert!(!client.is_active());
}

#[tokio::test]
async fn invalid_structured_options_abort_before_any_network_activity() {
    let server = spawn_server().await;
    let mut client = LiveClient::new(test_config(&server)).expect("client");
    let events = subscribe_all(&client);

    let options = LiveOptions {
        utterance_end_ms: Some(100),
        ..LiveOptions::default()
    };
    let err = client
        .start(StartParams::new().with_options(options))
        .await
        .expect_err("options should fail validation");

    assert!(matches!(err, LiveError::Config(_)));
    assert!(!client.is_active());
    assert!(events.lock().expect("event log mutex").is_empty());
}

// =============================================================================
// SEND AND FINALIZE
// =============================================================================

#[tokio::test]
async fn send_delivers_text_and_binary_payloads() {
    let mut server = spawn_server().await;
    let mut client = LiveClient::new(test_config(&server)).expect("client");
    assert!(client.start(StartParams::new()).await.expect("start"));

    assert!(client.send("hello").await.expect("send text"));
    assert!(client.send(vec![1_u8, 2, 3]).await.expect("send binary"));

    let Message::Text(text) = recv_message(&mut server).await else {
        panic!("expected text frame first");
    };
    assert_eq!(text.as_str(), "hello");
    let Message::Binary(bytes) = recv_message(&mut server).await else {
        panic!("expected binary frame second");
    };
    assert_eq!(bytes.as_ref(), &[1_u8, 2, 3][..]);

    assert!(client.finish().await);
}

#[tokio::test]
async fn finalize_sends_flush_frame() {
    let mut server = spawn_server().await;
    let mut client = LiveClient::new(test_config(&server)).expect("client");
    assert!(client.start(StartParams::new()).await.expect("start"));

    assert!(client.finalize().await.expect("finalize"));

    let Message::Text(text) = recv_message(&mut server).await else {
        panic!("expected finalize frame");
    };
    assert_eq!(text.as_str(), r#"{"type":"Finalize"}"#);

    assert!(client.finish().await);
}

#[tokio::test]
async fn send_after_clean_close_fails_and_raises_only_when_toggled() {
    let server = spawn_server().await;
    let config = test_config(&server).with_option(OPT_RAISE_ON_SEND, "true");
    let mut client = LiveClient::new(config).expect("client");
    assert!(client.start(StartParams::new()).await.expect("start"));

    server
        .commands
        .send(ServerCmd::Close(1000, "done".to_owned()))
        .expect("server command");
    wait_for(|| !client.is_active(), "receive loop exit").await;

    // The socket handle is still present (clean close runs no shutdown), but
    // the transport refuses further writes.
    let err = client.send("too late").await.expect_err("send should raise");
    assert!(matches!(err, LiveError::Transport(_)));
}

// =============================================================================
// CLOSE HANDLING
// =============================================================================

#[tokio::test]
async fn clean_close_terminates_receive_loop_without_error_event() {
    let server = spawn_server().await;
    let mut client = LiveClient::new(test_config(&server)).expect("client");
    let events = subscribe_all(&client);
    assert!(client.start(StartParams::new()).await.expect("start"));

    server
        .commands
        .send(ServerCmd::Close(1000, "bye".to_owned()))
        .expect("server command");
    wait_for(|| !client.is_active(), "receive loop exit").await;

    // Clean close: no Error event, and no shutdown ran on its own.
    assert_eq!(count_kind(&events, EventKind::Error), 0);
    assert_eq!(count_kind(&events, EventKind::Close), 0);

    assert!(client.finish().await);
    assert_eq!(count_kind(&events, EventKind::Close), 1);
}

#[tokio::test]
async fn abnormal_close_dispatches_one_error_then_shuts_down() {
    let server = spawn_server().await;
    let mut client = LiveClient::new(test_config(&server)).expect("client");
    let events = subscribe_all(&client);
    assert!(client.start(StartParams::new()).await.expect("start"));

    server
        .commands
        .send(ServerCmd::Close(1011, "server exploded".to_owned()))
        .expect("server command");

    wait_for(
        || count_kind(&events, EventKind::Error) >= 1,
        "error event",
    )
    .await;
    wait_for(|| !client.is_active(), "receive loop exit").await;

    {
        let events = events.lock().expect("event log mutex");
        let errors: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                LiveEvent::Error(error) => Some(error.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].variant, "ConnectionClosed");
        assert!(errors[0].message.contains("1011"));
    }
    // The loop funneled through the shared shutdown.
    assert_eq!(count_kind(&events, EventKind::Close), 1);
    assert!(!client.send("post-shutdown").await.expect("send"));

    assert!(client.finish().await);
}

#[tokio::test]
async fn malformed_inbound_frame_is_fatal_with_generic_error_event() {
    let server = spawn_server().await;
    let mut client = LiveClient::new(test_config(&server)).expect("client");
    let events = subscribe_all(&client);
    assert!(client.start(StartParams::new()).await.expect("start"));

    server
        .commands
        .send(ServerCmd::SendText("{not valid json".to_owned()))
        .expect("server command");

    wait_for(
        || count_kind(&events, EventKind::Error) >= 1,
        "error event",
    )
    .await;
    wait_for(|| !client.is_active(), "receive loop exit").await;

    {
        let events = events.lock().expect("event log mutex");
        let Some(LiveEvent::Error(error)) = events
            .iter()
            .find(|event| event.kind() == EventKind::Error)
        else {
            panic!("expected an error event");
        };
        assert_eq!(error.variant, "Exception");
    }
    assert_eq!(count_kind(&events, EventKind::Close), 1);

    assert!(client.finish().await);
}

// =============================================================================
// SHUTDOWN
// =============================================================================

#[tokio::test]
async fn finish_is_idempotent_and_sends_close_stream_once() {
    let mut server = spawn_server().await;
    let mut client = LiveClient::new(test_config(&server)).expect("client");
    let events = subscribe_all(&client);
    assert!(client.start(StartParams::new()).await.expect("start"));

    assert!(client.finish().await);
    // A repeat finish has nothing to stop.
    assert!(!client.finish().await);

    // The socket handle is gone, so sends short-circuit.
    assert!(!client.send("late").await.expect("send"));

    let texts = drain_texts(&mut server).await;
    let close_streams = texts
        .iter()
        .filter(|text| text.contains("CloseStream"))
        .count();
    assert_eq!(close_streams, 1);

    assert_eq!(count_kind(&events, EventKind::Error), 0);
    assert!(count_kind(&events, EventKind::Close) >= 1);
}

// =============================================================================
// KEEPALIVE
// =============================================================================

#[tokio::test]
async fn keepalive_sends_one_liveness_frame_per_cadence_window() {
    let mut server = spawn_server().await;
    let config = test_config(&server).with_option(OPT_KEEPALIVE, "true");
    let mut client = LiveClient::new(config).expect("client");
    assert!(client.start(StartParams::new()).await.expect("start"));

    // The first liveness frame goes out on the 5th tick; the next not before
    // the 10th. Sampling at 6.5s must observe exactly one.
    tokio::time::sleep(Duration::from_millis(6500)).await;
    assert!(client.finish().await);

    let texts = drain_texts(&mut server).await;
    let keepalives = texts
        .iter()
        .filter(|text| text.contains("KeepAlive"))
        .count();
    assert_eq!(keepalives, 1);
}

#[tokio::test]
async fn keepalive_disabled_sends_no_liveness_frames() {
    let mut server = spawn_server().await;
    let mut client = LiveClient::new(test_config(&server)).expect("client");
    assert!(client.start(StartParams::new()).await.expect("start"));

    tokio::time::sleep(Duration::from_millis(6500)).await;
    assert!(client.finish().await);

    let texts = drain_texts(&mut server).await;
    assert_eq!(
        texts.iter().filter(|text| text.contains("KeepAlive")).count(),
        0
    );
}
