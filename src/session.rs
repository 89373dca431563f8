//! WebSocket client sessions.
//!
//! Each connected browser gets its own session task. A session runs on a
//! single periodic tick: it drains control commands until the tick deadline,
//! then pushes the latest reading. Recording is global, so a start or stop from
//! any session is seen by all of them.

use crate::config::ClientConfig;
use crate::error::{BridgeError, Result};
use crate::sink::SinkFactory;
use crate::state::BridgeState;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{WebSocketStream, accept_async};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Longest wait for a close handshake to be written to the client.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Control command sent by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlCommand {
    #[serde(rename = "START_REC")]
    StartRecording,
    #[serde(rename = "STOP_REC")]
    StopRecording,
}

impl ControlCommand {
    /// Decode a client message. Anything that is not a known command is `None`.
    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Frame pushed to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// Latest reading, as received from the glove.
    Reading { raw: String },
    /// Acknowledges a command with the recording state it produced.
    Recording { recording: bool },
    /// A command could not be carried out.
    Error { error: String },
}

impl ServerFrame {
    fn to_message(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

/// Lifecycle of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// TCP accepted, WebSocket handshake pending.
    Idle,
    Active,
    Closed,
}

/// Totals for one finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub frames_pushed: u64,
    pub commands_handled: u64,
}

/// One client's control/push loop.
pub struct ClientSession {
    id: u64,
    peer: SocketAddr,
    state: SessionState,
    bridge: Arc<BridgeState>,
    sinks: Arc<dyn SinkFactory>,
    push_interval: Duration,
    report: SessionReport,
}

impl ClientSession {
    pub fn new(
        id: u64,
        peer: SocketAddr,
        bridge: Arc<BridgeState>,
        sinks: Arc<dyn SinkFactory>,
        push_interval: Duration,
    ) -> Self {
        Self {
            id,
            peer,
            state: SessionState::Idle,
            bridge,
            sinks,
            push_interval,
            report: SessionReport::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Perform the WebSocket handshake on `stream` and run until the client
    /// goes away or `shutdown` fires.
    pub async fn run<S>(mut self, stream: S, shutdown: CancellationToken) -> SessionReport
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("[WS] Handshake with {} failed: {}", self.peer, e);
                self.state = SessionState::Closed;
                return self.report;
            }
        };

        self.state = SessionState::Active;
        info!("[WS] Client #{} connected from {}", self.id, self.peer);

        let mut deadline = Instant::now() + self.push_interval;
        while self.state == SessionState::Active {
            let cancelled = tokio::select! {
                _ = shutdown.cancelled() => true,
                _ = self.tick(&mut ws, deadline) => false,
            };
            if cancelled {
                // A client that stopped reading must not hold up shutdown
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await;
                self.close("bridge shutting down");
                break;
            }

            deadline += self.push_interval;
            let now = Instant::now();
            if deadline < now {
                // Fell behind (slow client); resume the cadence from now
                deadline = now + self.push_interval;
            }
        }

        self.report
    }

    /// One tick: drain commands until `deadline`, then push the latest reading.
    async fn tick<S>(&mut self, ws: &mut WebSocketStream<S>, deadline: Instant)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while self.state == SessionState::Active {
            match tokio::time::timeout_at(deadline, ws.next()).await {
                // No command pending this tick
                Err(_) => break,
                Ok(None) => self.close("connection ended"),
                Ok(Some(Ok(message))) => self.handle_message(ws, message).await,
                Ok(Some(Err(e))) => self.handle_ws_error(e),
            }
        }

        if self.state != SessionState::Active {
            return;
        }

        if let Some(reading) = self.bridge.get_latest() {
            let frame = ServerFrame::Reading {
                raw: reading.raw().to_string(),
            };
            if self.send(ws, &frame).await {
                self.report.frames_pushed += 1;
            }
        }
    }

    async fn handle_message<S>(&mut self, ws: &mut WebSocketStream<S>, message: Message)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let text = match &message {
            Message::Text(text) => text.as_str(),
            Message::Binary(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!("[WS] Client #{} sent non-UTF-8 binary frame", self.id);
                    return;
                }
            },
            Message::Close(_) => {
                // Send the close reply queued by the WebSocket layer
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.flush()).await;
                self.close("closed by client");
                return;
            }
            // Ping/pong are answered by the WebSocket layer
            _ => return,
        };

        let Some(command) = ControlCommand::decode(text) else {
            debug!("[WS] Client #{} sent unrecognized message: {}", self.id, text);
            return;
        };

        self.report.commands_handled += 1;
        let reply = self.apply(command);
        self.send(ws, &reply).await;
    }

    /// Carry out a command against the shared state and build the reply.
    fn apply(&self, command: ControlCommand) -> ServerFrame {
        let result = match command {
            ControlCommand::StartRecording => {
                self.bridge
                    .start_recording(self.sinks.as_ref())
                    .map(|started| {
                        debug!(
                            "[REC] Client #{} started recording to {}",
                            self.id, started.destination
                        );
                    })
            }
            ControlCommand::StopRecording => self.bridge.stop_recording().map(|summary| {
                if summary.is_none() {
                    debug!("[REC] Client #{} sent stop while not recording", self.id);
                }
            }),
        };

        match result {
            Ok(()) => ServerFrame::Recording {
                recording: self.bridge.is_recording(),
            },
            Err(e) => {
                warn!("[REC] Client #{} {:?} failed: {}", self.id, command, e);
                ServerFrame::Error {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Send a frame; a failed send ends the session. Returns whether it was sent.
    async fn send<S>(&mut self, ws: &mut WebSocketStream<S>, frame: &ServerFrame) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let message = match frame.to_message() {
            Ok(message) => message,
            Err(e) => {
                warn!("[WS] Failed to encode frame: {}", e);
                return false;
            }
        };

        match ws.send(message).await {
            Ok(()) => true,
            Err(e) => {
                self.handle_ws_error(e);
                false
            }
        }
    }

    fn handle_ws_error(&mut self, error: WsError) {
        match error {
            WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Io(_)
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                self.close("connection lost");
            }
            other => {
                warn!("[WS] Client #{} error: {}", self.id, other);
                self.close("protocol error");
            }
        }
    }

    fn close(&mut self, reason: &str) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        info!(
            "[WS] Client #{} disconnected ({}), {} frame(s) pushed",
            self.id, reason, self.report.frames_pushed
        );
    }
}

/// Accepts WebSocket clients and runs one [`ClientSession`] per connection.
pub struct ClientServer {
    listener: TcpListener,
    bridge: Arc<BridgeState>,
    sinks: Arc<dyn SinkFactory>,
    push_interval: Duration,
}

impl ClientServer {
    pub async fn bind(
        config: &ClientConfig,
        bridge: Arc<BridgeState>,
        sinks: Arc<dyn SinkFactory>,
    ) -> Result<Self> {
        let addr = config.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::Bind {
                what: "WebSocket",
                addr,
                source,
            })?;
        info!("[WS] Bridge running on ws://{}", listener.local_addr()?);

        Ok(Self {
            listener,
            bridge,
            sinks,
            push_interval: config.push_interval(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Spawn the accept loop. The returned task finishes once every session
    /// has ended after `shutdown` fires.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(self, shutdown: CancellationToken) {
        let sessions = TaskTracker::new();
        let mut next_id: u64 = 1;

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.listener.accept() => r,
            };

            let (stream, peer) = match accepted {
                Ok(a) => a,
                Err(e) => {
                    warn!("[WS] Accept error: {}", e);
                    // Persistent errors (e.g. out of file descriptors) would otherwise spin
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("[WS] Failed to set TCP_NODELAY for {}: {}", peer, e);
            }

            let session = ClientSession::new(
                next_id,
                peer,
                self.bridge.clone(),
                self.sinks.clone(),
                self.push_interval,
            );
            next_id += 1;

            let token = shutdown.child_token();
            sessions.spawn(async move {
                session.run(stream, token).await;
            });
        }

        sessions.close();
        sessions.wait().await;
        info!("[WS] Client server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Reading;
    use crate::sink::testing::{failing_close_factory, failing_factory, memory_factory};
    use tokio::io::DuplexStream;
    use tokio_tungstenite::client_async;

    type Client = WebSocketStream<DuplexStream>;

    /// Run a session over an in-memory pipe and return the connected client.
    async fn connect(
        bridge: Arc<BridgeState>,
        sinks: Arc<dyn SinkFactory>,
        shutdown: CancellationToken,
    ) -> (Client, JoinHandle<SessionReport>) {
        connect_with_buffer(bridge, sinks, shutdown, 64 * 1024).await
    }

    async fn connect_with_buffer(
        bridge: Arc<BridgeState>,
        sinks: Arc<dyn SinkFactory>,
        shutdown: CancellationToken,
        buffer: usize,
    ) -> (Client, JoinHandle<SessionReport>) {
        let (server_io, client_io) = tokio::io::duplex(buffer);
        let session = ClientSession::new(
            1,
            "127.0.0.1:50000".parse().unwrap(),
            bridge,
            sinks,
            Duration::from_millis(5),
        );
        assert_eq!(session.state(), SessionState::Idle);
        let handle = tokio::spawn(session.run(server_io, shutdown));
        let (client, _) = client_async("ws://localhost/", client_io).await.unwrap();
        (client, handle)
    }

    /// Next frame from the server, skipping reading pushes unless `want_reading`.
    async fn next_frame(client: &mut Client, want_reading: bool) -> ServerFrame {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            let Message::Text(text) = message else {
                continue;
            };
            let frame: ServerFrame = serde_json::from_str(text.as_str()).unwrap();
            let is_reading = matches!(frame, ServerFrame::Reading { .. });
            if is_reading == want_reading {
                return frame;
            }
        }
    }

    async fn send_text(client: &mut Client, text: &str) {
        client.send(Message::Text(text.into())).await.unwrap();
    }

    #[test]
    fn test_decode_commands() {
        assert_eq!(
            ControlCommand::decode(r#"{"type":"START_REC"}"#),
            Some(ControlCommand::StartRecording)
        );
        assert_eq!(
            ControlCommand::decode(r#"{"type":"STOP_REC","extra":1}"#),
            Some(ControlCommand::StopRecording)
        );
        assert_eq!(ControlCommand::decode(r#"{"type":"PAUSE"}"#), None);
        assert_eq!(ControlCommand::decode(r#"{"kind":"START_REC"}"#), None);
        assert_eq!(ControlCommand::decode("START_REC"), None);
        assert_eq!(ControlCommand::decode(""), None);
    }

    #[test]
    fn test_frame_shapes() {
        let frame = ServerFrame::Reading {
            raw: "1,2,3,4,5,6,7,8,9,10,11,12".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"raw":"1,2,3,4,5,6,7,8,9,10,11,12"}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerFrame::Recording { recording: true }).unwrap(),
            r#"{"recording":true}"#
        );
    }

    #[tokio::test]
    async fn test_pushes_nothing_until_first_reading() {
        let bridge = Arc::new(BridgeState::new());
        let (factory, _log) = memory_factory();
        let shutdown = CancellationToken::new();
        let (mut client, handle) =
            connect(bridge.clone(), Arc::new(factory), shutdown.clone()).await;

        // Several ticks pass with no reading; nothing is pushed
        let quiet = tokio::time::timeout(Duration::from_millis(50), client.next()).await;
        assert!(quiet.is_err());

        bridge.set_latest(Reading::parse("1,2,3,4,5,6,7,8,9,10,11,12").unwrap());
        assert_eq!(
            next_frame(&mut client, true).await,
            ServerFrame::Reading {
                raw: "1,2,3,4,5,6,7,8,9,10,11,12".to_string()
            }
        );

        shutdown.cancel();
        let report = handle.await.unwrap();
        assert!(report.frames_pushed >= 1);
    }

    #[tokio::test]
    async fn test_commands_toggle_global_recording() {
        let bridge = Arc::new(BridgeState::new());
        let (factory, log) = memory_factory();
        let shutdown = CancellationToken::new();
        let (mut client, handle) =
            connect(bridge.clone(), Arc::new(factory), shutdown.clone()).await;

        send_text(&mut client, r#"{"type":"START_REC"}"#).await;
        assert_eq!(
            next_frame(&mut client, false).await,
            ServerFrame::Recording { recording: true }
        );
        assert!(bridge.is_recording());

        // Stop twice: the second is a no-op but still acknowledged
        send_text(&mut client, r#"{"type":"STOP_REC"}"#).await;
        assert_eq!(
            next_frame(&mut client, false).await,
            ServerFrame::Recording { recording: false }
        );
        send_text(&mut client, r#"{"type":"STOP_REC"}"#).await;
        assert_eq!(
            next_frame(&mut client, false).await,
            ServerFrame::Recording { recording: false }
        );

        assert_eq!(log.lock().opens, 1);
        assert_eq!(log.lock().closes, 1);

        shutdown.cancel();
        let report = handle.await.unwrap();
        assert_eq!(report.commands_handled, 3);
    }

    #[tokio::test]
    async fn test_malformed_commands_are_ignored() {
        let bridge = Arc::new(BridgeState::new());
        let (factory, _log) = memory_factory();
        let shutdown = CancellationToken::new();
        let (mut client, handle) =
            connect(bridge.clone(), Arc::new(factory), shutdown.clone()).await;

        send_text(&mut client, "not json").await;
        send_text(&mut client, r#"{"type":"DANCE"}"#).await;
        client
            .send(Message::Binary(br#"{"type":"START_REC"}"#.to_vec().into()))
            .await
            .unwrap();

        // Session survived and the binary command was honoured
        assert_eq!(
            next_frame(&mut client, false).await,
            ServerFrame::Recording { recording: true }
        );

        shutdown.cancel();
        let report = handle.await.unwrap();
        assert_eq!(report.commands_handled, 1);
    }

    #[tokio::test]
    async fn test_open_failure_is_reported_to_client() {
        let bridge = Arc::new(BridgeState::new());
        let shutdown = CancellationToken::new();
        let (mut client, handle) =
            connect(bridge.clone(), Arc::new(failing_factory()), shutdown.clone()).await;

        send_text(&mut client, r#"{"type":"START_REC"}"#).await;
        match next_frame(&mut client, false).await {
            ServerFrame::Error { error } => assert!(error.contains("glove_data.csv")),
            other => panic!("expected error frame, got {other:?}"),
        }
        assert!(!bridge.is_recording());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_failure_is_reported_to_client() {
        let bridge = Arc::new(BridgeState::new());
        let (factory, _log) = failing_close_factory();
        let shutdown = CancellationToken::new();
        let (mut client, handle) =
            connect(bridge.clone(), Arc::new(factory), shutdown.clone()).await;

        send_text(&mut client, r#"{"type":"START_REC"}"#).await;
        assert_eq!(
            next_frame(&mut client, false).await,
            ServerFrame::Recording { recording: true }
        );

        send_text(&mut client, r#"{"type":"STOP_REC"}"#).await;
        match next_frame(&mut client, false).await {
            ServerFrame::Error { error } => assert!(error.contains("close")),
            other => panic!("expected error frame, got {other:?}"),
        }
        assert!(!bridge.is_recording());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_with_client_not_reading() {
        let bridge = Arc::new(BridgeState::new());
        bridge.set_latest(Reading::parse("1,2,3,4,5,6,7,8,9,10,11,12").unwrap());
        let (factory, _log) = memory_factory();
        let shutdown = CancellationToken::new();
        let (client, handle) =
            connect_with_buffer(bridge, Arc::new(factory), shutdown.clone(), 1024).await;

        // Pushes pile up until the pipe is full
        tokio::time::sleep(Duration::from_millis(300)).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("session did not end after shutdown")
            .unwrap();
        drop(client);
    }

    #[tokio::test]
    async fn test_client_close_ends_session_only() {
        let bridge = Arc::new(BridgeState::new());
        let (factory, _log) = memory_factory();
        let shutdown = CancellationToken::new();
        let (mut client, handle) =
            connect(bridge.clone(), Arc::new(factory), shutdown.clone()).await;

        send_text(&mut client, r#"{"type":"START_REC"}"#).await;
        next_frame(&mut client, false).await;
        client.close(None).await.unwrap();

        // The session answers the close handshake before going away
        let reply = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("no close reply");
        assert!(matches!(reply, Some(Ok(Message::Close(_)))));

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("session did not end")
            .unwrap();
        // Recording is global and outlives the session
        assert!(bridge.is_recording());
        assert!(!shutdown.is_cancelled());
    }
}
