//! Duplex channel lifecycle: connect, authenticate, detect loss, reconnect
//! with bounded backoff.
//!
//! The transition rules live in [`ConnMachine`], which owns no I/O and is
//! tested without sockets. One supervisor task drives it; the backoff sleep
//! lives inside that task's loop, so there is never more than one pending
//! reconnect timer, and shutdown is a `select!` branch away at every
//! suspension point.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

use crate::config::{Identity, SessionConfig};
use crate::constants::KEEPALIVE_INTERVAL;
use crate::error::SessionError;
use crate::protocol::{self, AuthAction, ClientMessage, ServerMessage};

/// Where the session is in its lifecycle. `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Joined,
    Reconnecting,
    Failed,
}

/// Events the connection layer hands to the controller. The connection
/// manager knows nothing about reducers; it only reports.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    State(ConnectionState),
    Message(ServerMessage),
    Fatal(SessionError),
}

/// How the session was started. Only the very first connection of a
/// `Create` target authenticates with the create action; every later
/// attempt rejoins the code the server assigned.
#[derive(Debug, Clone)]
pub(crate) enum ConnectTarget {
    Create { media_id: Option<String> },
    Join { code: String },
}

/// Pure connection state machine. Transitions only; the supervisor supplies
/// the clock and the sockets.
#[derive(Debug)]
struct ConnMachine {
    state: ConnectionState,
    creating: bool,
    auth_sent: bool,
    reconnects: u32,
    total_attempts: u32,
    max_reconnects: u32,
    base_delay: Duration,
}

impl ConnMachine {
    fn new(creating: bool, max_reconnects: u32, base_delay: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            creating,
            auth_sent: false,
            reconnects: 0,
            total_attempts: 0,
            max_reconnects,
            base_delay,
        }
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn reconnect_attempts(&self) -> u32 {
        self.reconnects
    }

    /// A dial is starting. Returns the attempt number for logging.
    fn begin_attempt(&mut self) -> u32 {
        self.total_attempts += 1;
        self.state = ConnectionState::Connecting;
        self.total_attempts
    }

    /// The channel is open; authentication begins. Create is offered once,
    /// ever: a reconnect must never re-trigger party creation.
    fn channel_open(&mut self) -> AuthAction {
        self.state = ConnectionState::Authenticating;
        let action = if self.creating && !self.auth_sent {
            AuthAction::Create
        } else {
            AuthAction::Join
        };
        self.auth_sent = true;
        action
    }

    /// `party_joined` is the only way in. A successful join clears the
    /// failure streak.
    fn party_joined(&mut self) {
        self.state = ConnectionState::Joined;
        self.reconnects = 0;
    }

    /// Auth errors are not transient; there is no retry.
    fn auth_rejected(&mut self) {
        self.state = ConnectionState::Failed;
    }

    /// The channel dropped. Returns the backoff before the next attempt,
    /// or `None` once the attempt cap is exhausted (terminal).
    fn channel_lost(&mut self) -> Option<Duration> {
        if self.state == ConnectionState::Failed {
            return None;
        }
        if self.reconnects >= self.max_reconnects {
            self.state = ConnectionState::Failed;
            return None;
        }
        self.reconnects += 1;
        self.state = ConnectionState::Reconnecting;
        Some(self.base_delay * self.reconnects)
    }
}

/// Write half of the connection as seen by the controller. The socket
/// itself is owned exclusively by the supervisor task.
pub(crate) struct ConnectionHandle {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl ConnectionHandle {
    /// Queue a message for the wire. Fire-and-forget: no per-message ack.
    pub(crate) fn send(&self, msg: ClientMessage) -> Result<(), SessionError> {
        self.outbound.send(msg).map_err(|_| SessionError::Closed)
    }

    /// A second sender onto the same outbound queue, for the controller's
    /// periodic position reports.
    pub(crate) fn clone_sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.outbound.clone()
    }

    /// Tear the connection down. Idempotent; nothing is delivered after.
    pub(crate) fn close(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
    }
}

/// Spawn the supervisor for one session. Events arrive on `events` until
/// the session ends (terminal failure or [`ConnectionHandle::close`]).
pub(crate) fn spawn(
    config: SessionConfig,
    identity: Identity,
    target: ConnectTarget,
    events: mpsc::UnboundedSender<ConnEvent>,
) -> ConnectionHandle {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(run(config, identity, target, events, outbound_rx, shutdown_rx));
    ConnectionHandle {
        outbound: outbound_tx,
        shutdown: Mutex::new(Some(shutdown_tx)),
    }
}

enum LinkOutcome {
    Shutdown,
    AuthFailed(String),
    Lost,
}

async fn run(
    config: SessionConfig,
    identity: Identity,
    target: ConnectTarget,
    events: mpsc::UnboundedSender<ConnEvent>,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let creating = matches!(target, ConnectTarget::Create { .. });
    let mut machine = ConnMachine::new(
        creating,
        config.max_reconnect_attempts,
        config.reconnect_base_delay,
    );
    let mut code = match &target {
        ConnectTarget::Join { code } => Some(code.clone()),
        ConnectTarget::Create { .. } => None,
    };
    let create_media_id = match &target {
        ConnectTarget::Create { media_id } => media_id.clone(),
        ConnectTarget::Join { .. } => None,
    };

    loop {
        let attempt = machine.begin_attempt();
        emit(&events, ConnEvent::State(ConnectionState::Connecting));

        let url = match config.party_endpoint(code.as_deref()) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!("Cannot build party endpoint: {e:#}");
                emit(&events, ConnEvent::State(ConnectionState::Failed));
                emit(
                    &events,
                    ConnEvent::Fatal(SessionError::ConnectionLost {
                        attempts: machine.reconnect_attempts(),
                    }),
                );
                return;
            }
        };
        tracing::info!(%url, attempt, "Connecting to session server");

        let dialed = tokio::select! {
            dialed = connect_async(url.as_str()) => dialed,
            _ = &mut shutdown => {
                tracing::debug!("Shutdown requested while connecting");
                return;
            }
        };

        match dialed {
            Ok((ws, _)) => {
                let action = machine.channel_open();
                emit(&events, ConnEvent::State(ConnectionState::Authenticating));
                let media_id = if action == AuthAction::Create {
                    create_media_id.clone()
                } else {
                    None
                };
                let outcome = run_link(
                    ws,
                    &identity,
                    action,
                    media_id,
                    &mut machine,
                    &mut code,
                    &events,
                    &mut outbound,
                    &mut shutdown,
                )
                .await;
                match outcome {
                    LinkOutcome::Shutdown => return,
                    LinkOutcome::AuthFailed(message) => {
                        tracing::warn!("Authentication rejected: {message}");
                        emit(&events, ConnEvent::State(ConnectionState::Failed));
                        emit(&events, ConnEvent::Fatal(SessionError::Auth(message)));
                        return;
                    }
                    LinkOutcome::Lost => {}
                }
            }
            Err(e) => {
                tracing::warn!(attempt, "Connection attempt failed: {e}");
            }
        }

        match machine.channel_lost() {
            Some(delay) => {
                emit(&events, ConnEvent::State(ConnectionState::Reconnecting));
                tracing::info!(
                    delay_secs = delay.as_secs_f64(),
                    "Channel lost; reconnecting after delay"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = &mut shutdown => {
                        tracing::debug!("Shutdown requested during backoff");
                        return;
                    }
                }
            }
            None => {
                let attempts = machine.reconnect_attempts();
                tracing::error!(attempts, "Reconnect attempts exhausted");
                emit(&events, ConnEvent::State(ConnectionState::Failed));
                emit(
                    &events,
                    ConnEvent::Fatal(SessionError::ConnectionLost { attempts }),
                );
                return;
            }
        }
    }
}

/// One live WebSocket connection, from auth until close or loss.
#[allow(clippy::too_many_arguments)]
async fn run_link(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    identity: &Identity,
    action: AuthAction,
    media_id: Option<String>,
    machine: &mut ConnMachine,
    code: &mut Option<String>,
    events: &mpsc::UnboundedSender<ConnEvent>,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    shutdown: &mut oneshot::Receiver<()>,
) -> LinkOutcome {
    let (mut sink, mut stream) = ws.split();

    // Anything queued while we were disconnected is stale by now; the
    // server re-syncs us on rejoin anyway.
    while let Ok(stale) = outbound.try_recv() {
        tracing::debug!(?stale, "Dropping message queued while disconnected");
    }

    let auth = ClientMessage::Auth {
        user_id: identity.user_id.clone(),
        username: identity.username.clone(),
        action,
        token: identity.token.clone(),
        media_id,
    };
    if send_frame(&mut sink, &auth).await.is_err() {
        return LinkOutcome::Lost;
    }

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await; // immediate first tick

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    match protocol::decode(&text) {
                        Ok(msg) => {
                            if let Some(outcome) = handle_inbound(msg, machine, code, events) {
                                return outcome;
                            }
                        }
                        // A malformed frame is dropped, never fatal.
                        Err(e) => {
                            let err = SessionError::from(e);
                            tracing::warn!(kind = err.kind(), "Dropping frame: {err}");
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return LinkOutcome::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("WebSocket error: {e}");
                    return LinkOutcome::Lost;
                }
            },
            out = outbound.recv() => match out {
                Some(msg) => {
                    if send_frame(&mut sink, &msg).await.is_err() {
                        return LinkOutcome::Lost;
                    }
                }
                None => return LinkOutcome::Shutdown,
            },
            _ = keepalive.tick() => {
                if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    return LinkOutcome::Lost;
                }
            },
            _ = &mut *shutdown => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return LinkOutcome::Shutdown;
            }
        }
    }
}

/// Route one decoded frame. Returns an outcome only when the link must end.
fn handle_inbound(
    msg: ServerMessage,
    machine: &mut ConnMachine,
    code: &mut Option<String>,
    events: &mpsc::UnboundedSender<ConnEvent>,
) -> Option<LinkOutcome> {
    match &msg {
        ServerMessage::PartyJoined { party } => {
            *code = Some(party.party_id.clone());
            machine.party_joined();
            emit(events, ConnEvent::State(ConnectionState::Joined));
            emit(events, ConnEvent::Message(msg));
            None
        }
        ServerMessage::Error { message }
            if machine.state() == ConnectionState::Authenticating =>
        {
            machine.auth_rejected();
            Some(LinkOutcome::AuthFailed(message.clone()))
        }
        ServerMessage::Unknown => {
            tracing::debug!("Ignoring unknown message kind");
            None
        }
        _ => {
            emit(events, ConnEvent::Message(msg));
            None
        }
    }
}

async fn send_frame<S>(sink: &mut S, msg: &ClientMessage) -> Result<(), ()>
where
    S: SinkExt<WsMessage> + Unpin,
{
    let json = match protocol::encode(msg) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize outbound message: {e}");
            return Err(());
        }
    };
    sink.send(WsMessage::Text(json.into())).await.map_err(|_| ())
}

fn emit(events: &mpsc::UnboundedSender<ConnEvent>, event: ConnEvent) {
    let _ = events.send(event);
}
