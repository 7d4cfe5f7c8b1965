//! Live session controller — connection lifecycle, concurrent loops, and the
//! exactly-once shutdown handshake.
//!
//! LIFECYCLE
//! =========
//! 1. `start` merges options and headers, connects, stores the write half of
//!    the socket in the shared handle, spawns the receive loop and (when
//!    enabled) the keepalive loop, then dispatches `Open`.
//! 2. Both loops poll the shared exit latch and the shared writer handle on
//!    every iteration; either loop can detect a fatal transport condition and
//!    funnel it through the shared shutdown sequence.
//! 3. `finish` — or a fatal loop error — runs the shutdown sequence:
//!    best-effort `CloseStream`, `Close` event, flush grace, exit latch,
//!    transport close, writer cleared. The cleared writer is what makes a
//!    repeat call skip the transport steps.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use frames::{CloseEvent, ControlFrame, ErrorEvent, EventKind, LiveEvent, OpenEvent, decode_event};

use crate::config::{
    ClientConfig, OPT_KEEPALIVE, OPT_RAISE_ON_CONNECT, OPT_RAISE_ON_ERROR, OPT_RAISE_ON_SEND,
    StartParams, append_query, merge_options, websocket_url,
};
use crate::dispatch::{Context, Dispatcher};
use crate::error::{LiveError, classify_close_frame, classify_ws_error};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Interval between keepalive ticks.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// A liveness frame goes out on every `KEEPALIVE_CADENCE`-th tick.
const KEEPALIVE_CADENCE: u64 = 5;

/// Cadence of client-driven transport pings, sent from the receive loop.
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Grace period letting the close-stream frame flush before teardown.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Path of the live transcription endpoint.
const LISTEN_ENDPOINT: &str = "v1/listen";

// =============================================================================
// OUTBOUND PAYLOAD
// =============================================================================

/// Outbound payload accepted by [`LiveClient::send`]: audio bytes or a text
/// control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    fn into_message(self) -> Message {
        match self {
            Payload::Text(text) => Message::text(text),
            Payload::Binary(bytes) => Message::binary(bytes),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Binary(bytes.to_vec())
    }
}

// =============================================================================
// SHARED SESSION STATE
// =============================================================================

/// Classified result of one socket write. The public `send` path and both
/// loops branch on this, so failure policy is decided in exactly one place.
enum SendOutcome {
    Sent,
    /// The exit latch is set; shutdown is in progress.
    Exiting,
    /// No socket handle; before connect or after shutdown.
    NoSocket,
    /// The close handshake already completed — not a failure.
    CleanClosed,
    Failed(LiveError),
}

/// State shared between the client handle and the two loop tasks.
struct SessionShared {
    dispatcher: Dispatcher,
    /// Monotonic false→true latch; loops observe it by polling.
    exit: AtomicBool,
    /// The socket handle. `None` before connect and after shutdown; owned
    /// exclusively by the session (never exposed to subscriber callbacks).
    writer: Mutex<Option<WsSink>>,
    /// Serializes the shutdown sequence so only the first of two concurrent
    /// callers observes the socket.
    teardown: Mutex<()>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            dispatcher: Dispatcher::default(),
            exit: AtomicBool::new(false),
            writer: Mutex::new(None),
            teardown: Mutex::new(()),
        }
    }

    fn is_exiting(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    async fn socket_present(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Write one message through the shared socket handle, classified.
    async fn send_message(&self, message: Message) -> SendOutcome {
        if self.is_exiting() {
            return SendOutcome::Exiting;
        }

        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return SendOutcome::NoSocket;
        };

        match sink.send(message).await {
            Ok(()) => SendOutcome::Sent,
            Err(ws_error) => match classify_ws_error(ws_error) {
                None => SendOutcome::CleanClosed,
                Some(live_error) => SendOutcome::Failed(live_error),
            },
        }
    }

    /// The shared shutdown sequence. Idempotent: a repeat call finds the
    /// writer cleared and skips the close-stream send, the flush grace, and
    /// the transport close.
    async fn signal_exit(&self, context: &Context) {
        let _guard = self.teardown.lock().await;

        let had_socket = self.socket_present().await;
        if had_socket {
            debug!("shutdown: sending CloseStream");
            match self
                .send_message(Message::text(ControlFrame::CloseStream.to_text()))
                .await
            {
                SendOutcome::Sent | SendOutcome::Exiting | SendOutcome::NoSocket => {}
                SendOutcome::CleanClosed => debug!("shutdown: peer already closed"),
                SendOutcome::Failed(live_error) => {
                    warn!(error = %live_error, "shutdown: close-stream send failed");
                }
            }
        }

        self.dispatcher
            .emit(&LiveEvent::Close(CloseEvent::default()), context);

        if had_socket {
            // Let the close-stream frame flush before tearing the socket down.
            tokio::time::sleep(CLOSE_GRACE).await;
        }

        // Set the latch only now, so the sends above were not short-circuited.
        self.exit.store(true, Ordering::SeqCst);

        let mut writer = self.writer.lock().await;
        if let Some(sink) = writer.as_mut() {
            debug!("shutdown: closing transport");
            if let Err(ws_error) = sink.close().await {
                match classify_ws_error(ws_error) {
                    None => debug!("shutdown: transport already closed"),
                    Some(live_error) => warn!(error = %live_error, "shutdown: transport close failed"),
                }
            }
        }
        *writer = None;
    }
}

/// Fatal-failure funnel shared by both loops: dispatch an `Error` event, run
/// the shared shutdown, then re-raise only when the policy toggle asks for it.
async fn fail_loop(
    shared: &SessionShared,
    context: &Context,
    description: &str,
    live_error: LiveError,
    raise_on_error: bool,
) -> Result<(), LiveError> {
    error!(error = %live_error, "{description}: fatal failure");
    let event = ErrorEvent::new(description, live_error.to_string(), live_error.variant());
    shared.dispatcher.emit(&LiveEvent::Error(event), context);
    shared.signal_exit(context).await;
    if raise_on_error { Err(live_error) } else { Ok(()) }
}

// =============================================================================
// RECEIVE LOOP
// =============================================================================

/// Pull frames off the read half, classify, and dispatch until the latch is
/// set, the socket is gone, or the connection terminates.
async fn receive_loop(
    shared: Arc<SessionShared>,
    context: Arc<Context>,
    mut reader: WsSource,
    raise_on_error: bool,
) -> Result<(), LiveError> {
    let mut ping_timer = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

    loop {
        if shared.is_exiting() {
            debug!("receive loop exiting: latch set");
            return Ok(());
        }
        if !shared.socket_present().await {
            debug!("receive loop exiting: socket absent");
            return Ok(());
        }

        let message = tokio::select! {
            _ = ping_timer.tick() => {
                // tungstenite has no automatic ping; transport liveness is
                // client-driven on a fixed cadence.
                let _ = shared.send_message(Message::Ping(vec![].into())).await;
                continue;
            }
            message = reader.next() => message,
        };

        match message {
            None => {
                debug!("receive loop exiting: stream ended");
                return Ok(());
            }
            Some(Ok(Message::Text(text))) => match decode_event(text.as_str()) {
                Ok(None) => {}
                Ok(Some(event)) => {
                    debug!(kind = %event.kind(), "dispatching inbound event");
                    shared.dispatcher.emit(&event, &context);
                }
                Err(decode_error) => {
                    return fail_loop(
                        &shared,
                        &context,
                        "receive loop",
                        LiveError::Unexpected(decode_error.to_string()),
                        raise_on_error,
                    )
                    .await;
                }
            },
            Some(Ok(Message::Close(frame))) => match classify_close_frame(frame.as_ref()) {
                None => {
                    info!("receive loop exiting: clean close");
                    return Ok(());
                }
                Some(live_error) => {
                    return fail_loop(&shared, &context, "receive loop", live_error, raise_on_error)
                        .await;
                }
            },
            // Binary, ping, and pong frames are not part of the event wire.
            Some(Ok(_)) => {}
            Some(Err(ws_error)) => match classify_ws_error(ws_error) {
                None => {
                    info!("receive loop exiting: connection closed");
                    return Ok(());
                }
                Some(live_error) => {
                    return fail_loop(&shared, &context, "receive loop", live_error, raise_on_error)
                        .await;
                }
            },
        }
    }
}

// =============================================================================
// KEEPALIVE LOOP
// =============================================================================

/// Tick once per interval; send a liveness frame on every cadence multiple
/// while the session is up. Failure handling mirrors the receive loop.
async fn keepalive_loop(
    shared: Arc<SessionShared>,
    context: Arc<Context>,
    raise_on_error: bool,
) -> Result<(), LiveError> {
    let mut ticker = interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
    let mut counter: u64 = 0;

    loop {
        ticker.tick().await;
        counter += 1;

        if shared.is_exiting() {
            debug!("keepalive loop exiting: latch set");
            return Ok(());
        }
        if !shared.socket_present().await {
            debug!("keepalive loop exiting: socket absent");
            return Ok(());
        }

        if counter.is_multiple_of(KEEPALIVE_CADENCE) {
            debug!(counter, "sending keepalive");
            match shared
                .send_message(Message::text(ControlFrame::KeepAlive.to_text()))
                .await
            {
                SendOutcome::Sent | SendOutcome::Exiting | SendOutcome::NoSocket => {}
                SendOutcome::CleanClosed => {
                    info!("keepalive loop exiting: connection closed");
                    return Ok(());
                }
                SendOutcome::Failed(live_error) => {
                    return fail_loop(
                        &shared,
                        &context,
                        "keepalive loop",
                        live_error,
                        raise_on_error,
                    )
                    .await;
                }
            }
        }
    }
}

// =============================================================================
// CLIENT
// =============================================================================

/// Client-side manager for one live transcription session.
///
/// Owns the socket handle, the exit latch, and the dispatch table; starts and
/// stops the receive and keepalive loops; implements the shutdown handshake.
/// At most one session is active per client at a time.
pub struct LiveClient {
    config: ClientConfig,
    shared: Arc<SessionShared>,
    context: Arc<Context>,
    members: HashMap<String, Value>,
    receive_task: Option<JoinHandle<Result<(), LiveError>>>,
    keepalive_task: Option<JoinHandle<Result<(), LiveError>>>,
}

impl LiveClient {
    /// Build a client from a validated configuration.
    ///
    /// # Errors
    ///
    /// [`LiveError::Config`] when the configuration is invalid.
    pub fn new(config: ClientConfig) -> Result<Self, LiveError> {
        config.validate()?;
        Ok(Self {
            config,
            shared: Arc::new(SessionShared::new()),
            context: Arc::new(Context::new()),
            members: HashMap::new(),
            receive_task: None,
            keepalive_task: None,
        })
    }

    /// Register a handler for an event kind. Multiple handlers per kind are
    /// invoked in registration order; registration during an active session
    /// is permitted.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&LiveEvent, &Context) + Send + Sync + 'static,
    {
        self.shared.dispatcher.on(kind, Arc::new(handler));
    }

    /// Whether a receive loop is currently running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.receive_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Read back an ad-hoc member attached at [`LiveClient::start`].
    #[must_use]
    pub fn member(&self, key: &str) -> Option<&Value> {
        self.members.get(key)
    }

    /// Establish the session: merge configuration, connect, spawn the loops,
    /// and dispatch `Open` to current subscribers before returning.
    ///
    /// Returns `Ok(false)` — with no partial state, no loops, and no `Open`
    /// event — when the connect attempt fails, unless the
    /// `termination_exception_connect` toggle upgrades the failure to `Err`.
    ///
    /// # Errors
    ///
    /// [`LiveError::Config`] when structured options fail validation or the
    /// connection target cannot be built (both before any network activity);
    /// [`LiveError::Connect`] for connect failures when the toggle is set.
    pub async fn start(&mut self, params: StartParams) -> Result<bool, LiveError> {
        if self.is_active() {
            warn!("start ignored: a session is already active");
            return Ok(false);
        }

        let query_pairs = merge_options(params.options.as_ref(), &params.addons)?;

        let mut headers = self.config.connection_headers();
        headers.extend(params.headers.clone());

        let url = append_query(
            &websocket_url(&self.config.base_url, LISTEN_ENDPOINT)?,
            &query_pairs,
        );
        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|ws_error| LiveError::Config(format!("invalid connection target: {ws_error}")))?;
        for (name, value) in &headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| LiveError::Config(format!("invalid header name: {name}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| LiveError::Config(format!("invalid value for header {name}")))?;
            let _ = request.headers_mut().insert(header_name, header_value);
        }

        info!(%url, "connecting live session");
        let (stream, _response) = match connect_async(request).await {
            Ok(connected) => connected,
            Err(ws_error) => {
                error!(error = %ws_error, "live connect failed");
                if self.config.is_enabled(OPT_RAISE_ON_CONNECT) {
                    return Err(LiveError::Connect(Box::new(ws_error)));
                }
                return Ok(false);
            }
        };

        let (sink, source) = stream.split();
        self.shared.exit.store(false, Ordering::SeqCst);
        *self.shared.writer.lock().await = Some(sink);
        self.context = Arc::new(params.context);
        self.members = params.members;

        let raise_on_error = self.config.is_enabled(OPT_RAISE_ON_ERROR);
        self.receive_task = Some(tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.context),
            source,
            raise_on_error,
        )));

        if self.config.is_enabled(OPT_KEEPALIVE) {
            info!("keepalive enabled");
            self.keepalive_task = Some(tokio::spawn(keepalive_loop(
                Arc::clone(&self.shared),
                Arc::clone(&self.context),
                raise_on_error,
            )));
        } else {
            debug!("keepalive disabled");
        }

        self.shared
            .dispatcher
            .emit(&LiveEvent::Open(OpenEvent::default()), &self.context);

        info!("live session started");
        Ok(true)
    }

    /// Write a payload to the socket.
    ///
    /// Returns `Ok(false)` when shutdown is in progress, no socket exists, or
    /// the write fails; a completed close handshake counts as success for
    /// idempotent callers.
    ///
    /// # Errors
    ///
    /// Only when the `termination_exception_send` toggle is set, in which
    /// case close and failure outcomes are upgraded to `Err`.
    pub async fn send(&self, payload: impl Into<Payload>) -> Result<bool, LiveError> {
        let raise_on_send = self.config.is_enabled(OPT_RAISE_ON_SEND);

        match self.shared.send_message(payload.into().into_message()).await {
            SendOutcome::Sent => Ok(true),
            SendOutcome::Exiting => {
                debug!("send skipped: shutdown in progress");
                Ok(false)
            }
            SendOutcome::NoSocket => {
                debug!("send skipped: no socket");
                Ok(false)
            }
            SendOutcome::CleanClosed => {
                debug!("send: connection already cleanly closed");
                if raise_on_send {
                    Err(LiveError::Transport(Box::new(WsError::ConnectionClosed)))
                } else {
                    Ok(true)
                }
            }
            SendOutcome::Failed(live_error) => {
                warn!(error = %live_error, "send failed");
                if raise_on_send {
                    Err(live_error)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Flush buffered transcription results by sending a `Finalize` control
    /// frame. Trivially succeeds when no socket exists; returns `Ok(false)`
    /// once shutdown is in progress.
    ///
    /// # Errors
    ///
    /// Propagates [`LiveClient::send`] errors (send toggle only).
    pub async fn finalize(&self) -> Result<bool, LiveError> {
        if self.shared.is_exiting() {
            debug!("finalize skipped: shutdown in progress");
            return Ok(false);
        }
        if !self.shared.socket_present().await {
            return Ok(true);
        }

        info!("sending Finalize");
        self.send(ControlFrame::Finalize.to_text()).await
    }

    /// Stop the session: run the shared shutdown sequence, then cancel and
    /// reap both loop tasks with per-task failures suppressed.
    ///
    /// Returns `false` when there was no session to stop, or when reaping a
    /// task surfaces a panic; `true` otherwise.
    pub async fn finish(&mut self) -> bool {
        self.shared.signal_exit(&self.context).await;

        let tasks: Vec<JoinHandle<Result<(), LiveError>>> =
            [self.keepalive_task.take(), self.receive_task.take()]
                .into_iter()
                .flatten()
                .collect();
        if tasks.is_empty() {
            debug!("finish: no session was running");
            return false;
        }

        let mut joined_cleanly = true;
        for task in tasks {
            task.abort();
            match task.await {
                Ok(Ok(())) => {}
                // A loop that re-raised after its Error event and shutdown.
                Ok(Err(live_error)) => warn!(error = %live_error, "loop task ended with error"),
                Err(join_error) if join_error.is_cancelled() => {}
                Err(join_error) => {
                    error!(error = %join_error, "loop task join failed");
                    joined_cleanly = false;
                }
            }
        }

        info!("live session finished");
        joined_cleanly
    }
}

#[cfg(test)]
#[path = "live_test.rs"]
mod tests;
