// One client's session: join, read until something ends it, leave.

use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{Stream, StreamExt};
use huddle_common::protocol::ws::{PresencePayload, WsMessage};
use huddle_common::types::{User, UserId};
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{ConnectParams, RelayState, SessionSettings};
use crate::broadcast::Broadcaster;
use crate::dispatch::dispatch;
use crate::error::HandleError;
use crate::metrics;
use crate::registry::ConnectionHandle;

pub(crate) const MISSING_ID_REASON: &str = "id is required";
pub(crate) const SUPERSEDED_REASON: &str = "superseded by a newer connection";
const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat timeout";
const SHUTDOWN_REASON: &str = "server shutting down";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Joined,
    Closing,
    Closed,
}

impl SessionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Joined => "joined",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// Why a joined session left its read loop.
#[derive(Debug)]
pub enum DisconnectReason {
    /// Peer sent a close frame; `None` when it carried no status (1005).
    ClientClosed(Option<u16>),
    /// Transport ended without a close frame (1006).
    StreamEnded,
    ReadError(axum::Error),
    WriteError(HandleError),
    Superseded,
    HeartbeatTimeout,
    ServerShutdown,
}

impl DisconnectReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed(_) => "client_closed",
            Self::StreamEnded => "stream_ended",
            Self::ReadError(_) => "read_error",
            Self::WriteError(_) => "write_error",
            Self::Superseded => "superseded",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ServerShutdown => "server_shutdown",
        }
    }

    /// Close frame the relay sends on the way out, if any.
    pub fn close_frame(&self) -> Option<CloseFrame> {
        let (code, reason) = match self {
            Self::Superseded => (close_code::POLICY, SUPERSEDED_REASON),
            Self::HeartbeatTimeout => (close_code::AWAY, HEARTBEAT_TIMEOUT_REASON),
            Self::ServerShutdown => (close_code::AWAY, SHUTDOWN_REASON),
            _ => return None,
        };
        Some(CloseFrame { code, reason: reason.into() })
    }

    fn log(&self) {
        let reason = self.as_str();
        match self {
            Self::ClientClosed(Some(code @ (close_code::NORMAL | close_code::AWAY))) => {
                info!(reason, code, "client closed connection");
            }
            Self::ClientClosed(Some(code)) => {
                warn!(reason, code, "client closed connection with error status");
            }
            Self::ClientClosed(None) => {
                info!(reason, code = close_code::STATUS, "client closed connection without status");
            }
            Self::StreamEnded => {
                warn!(reason, code = close_code::ABNORMAL, "connection dropped without close frame");
            }
            Self::ReadError(error) => warn!(reason, error = %error, "websocket read failed"),
            Self::WriteError(error) => warn!(reason, error = %error, "websocket write failed"),
            Self::Superseded => info!(reason, "connection superseded by a newer one"),
            Self::HeartbeatTimeout => warn!(reason, "heartbeat timeout, disconnecting"),
            Self::ServerShutdown => info!(reason, "closing session for server shutdown"),
        }
    }
}

/// Entry point for an upgraded socket.
pub(super) async fn run(
    state: RelayState,
    mut socket: WebSocket,
    params: ConnectParams,
    request_id: String,
) {
    let Some(id) = params.id.as_deref().and_then(UserId::parse) else {
        metrics::record_connection_rejected();
        warn!(request_id = %request_id, "rejecting websocket without identity");
        let frame = CloseFrame { code: close_code::POLICY, reason: MISSING_ID_REASON.into() };
        let _ = socket.send(Message::Close(Some(frame))).await;
        return;
    };

    let user = User::new(id, params.name.as_deref());
    let (sink, stream) = socket.split();
    let handle = Arc::new(ConnectionHandle::from_sink(user, sink, state.settings.write_timeout));
    let span = info_span!(
        "session",
        user_id = %handle.user().id,
        connection_id = %handle.connection_id(),
        request_id = %request_id,
    );

    let session = Session::new(handle, state.broadcaster.clone(), state.settings);
    session.drive(stream, state.shutdown.clone()).instrument(span).await;
}

struct Session {
    state: SessionState,
    handle: Arc<ConnectionHandle>,
    broadcaster: Broadcaster,
    settings: SessionSettings,
}

impl Session {
    fn new(handle: Arc<ConnectionHandle>, broadcaster: Broadcaster, settings: SessionSettings) -> Self {
        Self { state: SessionState::Connecting, handle, broadcaster, settings }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = self.state.as_str(), to = next.as_str(), "session state change");
        self.state = next;
    }

    async fn drive<S>(mut self, stream: S, shutdown: watch::Receiver<bool>)
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        self.join().await;
        let reason = self.read_loop(stream, shutdown).await;
        self.leave(reason).await;
    }

    async fn join(&mut self) {
        let registry = self.broadcaster.registry();
        if let Some(previous) = registry.add(Arc::clone(&self.handle)).await {
            info!(
                previous_connection_id = %previous.connection_id(),
                "superseding existing connection for identity"
            );
            previous.evict();
            metrics::record_connection_superseded();
        }
        metrics::record_connection_accepted();
        self.transition(SessionState::Joined);
        info!(name = %self.handle.user().name, "user joined");

        let joined = WsMessage::ConnectedUser(PresencePayload::from(self.handle.user()));
        if let Err(error) = self.broadcaster.broadcast_message(&joined).await {
            error!(error = %error, "failed to encode connected user message");
        }
    }

    async fn read_loop<S>(
        &mut self,
        mut stream: S,
        shutdown: watch::Receiver<bool>,
    ) -> DisconnectReason
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let evicted = self.handle.evicted();
        tokio::pin!(evicted);
        let shutdown = wait_for_shutdown(shutdown);
        tokio::pin!(shutdown);

        // A peer is dead once a ping goes unanswered for `heartbeat_timeout`.
        // Any inbound frame clears the outstanding ping.
        let mut heartbeat = interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.reset();
        let mut ping_sent_at: Option<Instant> = None;

        loop {
            // Frames already queued are read before the heartbeat is judged,
            // so a long fan-out never hides a pong that arrived meanwhile.
            tokio::select! {
                biased;
                _ = &mut evicted => return DisconnectReason::Superseded,
                _ = &mut shutdown => return DisconnectReason::ServerShutdown,
                next = stream.next() => {
                    let message = match next {
                        Some(Ok(message)) => message,
                        Some(Err(error)) => return DisconnectReason::ReadError(error),
                        None => return DisconnectReason::StreamEnded,
                    };
                    ping_sent_at = None;

                    match message {
                        Message::Text(text) => {
                            dispatch(&self.broadcaster, text).await;
                        }
                        Message::Binary(bytes) => {
                            debug!(bytes = bytes.len(), "ignoring binary frame");
                        }
                        Message::Ping(payload) => {
                            if let Err(error) = self.handle.send(Message::Pong(payload)).await {
                                return DisconnectReason::WriteError(error);
                            }
                        }
                        Message::Pong(_) => {}
                        Message::Close(frame) => {
                            return DisconnectReason::ClientClosed(frame.map(|frame| frame.code));
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    match ping_sent_at {
                        Some(sent_at) if sent_at.elapsed() > self.settings.heartbeat_timeout => {
                            return DisconnectReason::HeartbeatTimeout;
                        }
                        Some(_) => {}
                        None => {
                            if let Err(error) =
                                self.handle.send(Message::Ping(Vec::new().into())).await
                            {
                                return DisconnectReason::WriteError(error);
                            }
                            ping_sent_at = Some(Instant::now());
                        }
                    }
                }
            }
        }
    }

    async fn leave(&mut self, reason: DisconnectReason) {
        self.transition(SessionState::Closing);
        reason.log();

        let user = self.handle.user();
        let removed = self
            .broadcaster
            .registry()
            .remove_if_current(&user.id, self.handle.connection_id())
            .await;

        if removed.is_some() {
            let left = WsMessage::DisconnectedUser(PresencePayload::from(user));
            if let Err(error) = self.broadcaster.broadcast_message(&left).await {
                error!(error = %error, "failed to encode disconnected user message");
            }
        } else {
            debug!("identity held by a newer connection; suppressing leave broadcast");
        }

        self.handle.close(reason.close_frame()).await;
        self.transition(SessionState::Closed);
    }
}

/// Resolves once shutdown is signalled. A dropped sender never resolves.
fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) -> impl Future<Output = ()> {
    async move {
        if shutdown.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes};
    use futures_util::{stream, StreamExt};
    use tokio::sync::watch;
    use tokio::time;

    use super::{DisconnectReason, Session, SessionState, SUPERSEDED_REASON};
    use crate::broadcast::Broadcaster;
    use crate::registry::{
        handle::test_support::{drain_text, recording_handle, stalled_handle},
        ConnectionRegistry,
    };
    use crate::ws::SessionSettings;

    type Inbound = Result<Message, axum::Error>;

    fn settings() -> SessionSettings {
        SessionSettings {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(1),
            max_frame_bytes: 65_536,
        }
    }

    fn production_heartbeat() -> SessionSettings {
        SessionSettings {
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(10),
            ..settings()
        }
    }

    #[test]
    fn only_relay_initiated_endings_carry_a_close_frame() {
        let superseded = DisconnectReason::Superseded.close_frame().expect("superseded frame");
        assert_eq!(superseded.code, close_code::POLICY);
        assert_eq!(superseded.reason.as_str(), SUPERSEDED_REASON);

        for reason in [DisconnectReason::HeartbeatTimeout, DisconnectReason::ServerShutdown] {
            let frame = reason.close_frame().expect("relay-initiated frame");
            assert_eq!(frame.code, close_code::AWAY);
        }

        assert!(DisconnectReason::ClientClosed(Some(close_code::NORMAL)).close_frame().is_none());
        assert!(DisconnectReason::ClientClosed(None).close_frame().is_none());
        assert!(DisconnectReason::StreamEnded.close_frame().is_none());
    }

    #[tokio::test]
    async fn session_relays_text_then_ends_on_client_close() {
        let registry = ConnectionRegistry::default();
        let broadcaster = Broadcaster::new(registry.clone());
        let (handle, mut frames) = recording_handle("u1");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let chat = r#"{"type":"chat","payload":{"user":{"id":"u1"},"text":"hi"}}"#;
        let inbound = stream::iter(vec![
            Ok::<_, axum::Error>(Message::Ping(Vec::new().into())),
            Ok(Message::Binary(vec![0xde, 0xad].into())),
            Ok(Message::Text(Utf8Bytes::from(chat))),
            Ok(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: Utf8Bytes::from("bye"),
            }))),
        ]);

        let mut session = Session::new(Arc::clone(&handle), broadcaster, settings());
        session.join().await;
        assert_eq!(session.state, SessionState::Joined);
        let reason = session.read_loop(inbound, shutdown_rx).await;
        assert!(matches!(reason, DisconnectReason::ClientClosed(Some(close_code::NORMAL))));
        session.leave(reason).await;

        assert_eq!(session.state, SessionState::Closed);
        let joined = r#"{"type":"connectedUser","payload":{"id":"u1","name":"u1"}}"#;
        assert_eq!(drain_text(&mut frames), vec![joined.to_string(), chat.to_string()]);
        assert_eq!(registry.size().await, 0);
        assert!(handle.is_closed().await);
    }

    #[tokio::test]
    async fn evicted_session_leaves_successor_registered() {
        let registry = ConnectionRegistry::default();
        let broadcaster = Broadcaster::new(registry.clone());
        let (old, _old_frames) = recording_handle("u1");
        let (new, mut new_frames) = recording_handle("u1");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut old_session = Session::new(Arc::clone(&old), broadcaster.clone(), settings());
        old_session.join().await;
        let mut new_session = Session::new(Arc::clone(&new), broadcaster, settings());
        new_session.join().await;
        assert!(old.is_evicted());

        let reason = old_session.read_loop(stream::pending::<Inbound>(), shutdown_rx).await;
        assert!(matches!(reason, DisconnectReason::Superseded));
        old_session.leave(reason).await;

        let current = registry
            .get(&new.user().id)
            .await
            .expect("successor should stay registered");
        assert_eq!(current.connection_id(), new.connection_id());
        // Only the successor's own join reached it; no leave for u1.
        assert_eq!(drain_text(&mut new_frames).len(), 1);
    }

    #[tokio::test]
    async fn shutdown_signal_ends_the_read_loop() {
        let broadcaster = Broadcaster::new(ConnectionRegistry::default());
        let (handle, _frames) = recording_handle("u1");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut session = Session::new(handle, broadcaster, settings());
        session.join().await;
        shutdown_tx.send(true).expect("receiver is alive");

        let reason = session.read_loop(stream::pending::<Inbound>(), shutdown_rx).await;
        assert!(matches!(reason, DisconnectReason::ServerShutdown));
    }

    #[tokio::test]
    async fn slow_fan_out_does_not_time_out_a_responsive_client() {
        time::pause();
        let registry = ConnectionRegistry::default();
        for n in 0..40 {
            registry.add(stalled_handle(&format!("s{n}"))).await;
        }
        let (handle, _frames) = recording_handle("u1");
        registry.add(Arc::clone(&handle)).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // The chat fan-out spends a write timeout on every stalled peer, far
        // past a heartbeat interval; the client's pong is queued behind it.
        let chat = r#"{"type":"chat","payload":{"user":{"id":"u1"},"text":"hi"}}"#;
        let inbound = stream::iter(vec![
            Ok::<_, axum::Error>(Message::Text(Utf8Bytes::from(chat))),
            Ok(Message::Pong(Vec::new().into())),
        ])
        .chain(stream::pending());

        tokio::spawn(async move {
            time::sleep(Duration::from_secs(45)).await;
            let _ = shutdown_tx.send(true);
        });

        let mut session = Session::new(handle, Broadcaster::new(registry), production_heartbeat());
        let reason = session.read_loop(inbound, shutdown_rx).await;
        assert!(matches!(reason, DisconnectReason::ServerShutdown), "got {reason:?}");
    }

    #[tokio::test]
    async fn unanswered_ping_times_out() {
        time::pause();
        let registry = ConnectionRegistry::default();
        let (handle, mut frames) = recording_handle("u1");
        registry.add(Arc::clone(&handle)).await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let started = time::Instant::now();
        let mut session = Session::new(handle, Broadcaster::new(registry), production_heartbeat());
        let reason = session.read_loop(stream::pending::<Inbound>(), shutdown_rx).await;

        assert!(matches!(reason, DisconnectReason::HeartbeatTimeout), "got {reason:?}");
        assert!(started.elapsed() >= Duration::from_secs(25));
        assert!(matches!(frames.try_recv(), Ok(Message::Ping(_))));
    }
}
