//! Composition root: wires the connection manager into the state store and
//! the synchronization engine, and exposes the whole public API surface.
//!
//! All state transitions happen inside one pump task (message arrival or a
//! low-frequency timer tick), so reducer invocations never overlap and the
//! snapshot-replacement invariant holds without extra locking discipline.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::config::{Identity, SessionConfig};
use crate::connection::{self, ConnEvent, ConnectTarget, ConnectionHandle, ConnectionState};
use crate::constants::{MAX_CHAT_LEN, REACTION_SWEEP_INTERVAL, TIME_REPORT_INTERVAL};
use crate::error::SessionError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::{ChatEntry, Reaction, SessionState};
use crate::sync::{HostIntent, Player, SyncEngine};

/// Everything the presentation layer can observe, through one subscription.
#[derive(Debug)]
pub enum SessionEvent {
    Connection(ConnectionState),
    /// The party snapshot changed; read it via [`SessionController::snapshot`].
    PartyChanged,
    Chat(ChatEntry),
    Reaction(Reaction),
    Error { kind: &'static str, detail: String },
}

struct Shared {
    state: Mutex<SessionState>,
    connection: Mutex<ConnectionState>,
}

/// One live watch-party session. Construct with [`create`] or [`join`];
/// tear down with [`leave`]. One instance per session, no globals.
///
/// [`create`]: SessionController::create
/// [`join`]: SessionController::join
/// [`leave`]: SessionController::leave
pub struct SessionController {
    shared: Arc<Shared>,
    handle: ConnectionHandle,
    engine: Arc<SyncEngine>,
    player: Arc<dyn Player>,
    pump_task: tokio::task::JoinHandle<()>,
    closed: AtomicBool,
}

impl SessionController {
    /// Start a new party for `media_id`. The server assigns the code;
    /// watch for the first [`SessionEvent::PartyChanged`] to learn it.
    pub fn create(
        config: SessionConfig,
        identity: Identity,
        media_id: Option<String>,
        player: Arc<dyn Player>,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.party_endpoint(None)?;
        Ok(Self::start(
            config,
            identity,
            ConnectTarget::Create { media_id },
            player,
        ))
    }

    /// Join an existing party by code.
    pub fn join(
        config: SessionConfig,
        identity: Identity,
        code: &str,
        player: Arc<dyn Player>,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.party_endpoint(Some(code))?;
        Ok(Self::start(
            config,
            identity,
            ConnectTarget::Join {
                code: code.to_string(),
            },
            player,
        ))
    }

    fn start(
        config: SessionConfig,
        identity: Identity,
        target: ConnectTarget,
        player: Arc<dyn Player>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::new(identity.user_id.clone(), Instant::now())),
            connection: Mutex::new(ConnectionState::Disconnected),
        });
        let engine = Arc::new(SyncEngine::new(config.drift_threshold));

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let handle = connection::spawn(config, identity, target, conn_tx);

        let pump_task = tokio::spawn(pump(
            Arc::clone(&shared),
            Arc::clone(&engine),
            Arc::clone(&player),
            handle.clone_sender(),
            conn_rx,
            ui_tx,
        ));

        let controller = Self {
            shared,
            handle,
            engine,
            player,
            pump_task,
            closed: AtomicBool::new(false),
        };
        (controller, ui_rx)
    }

    /// A cloned view of the current session state, for rendering.
    pub fn snapshot(&self) -> SessionState {
        self.shared.state.lock().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.connection.lock()
    }

    /// Send a chat message. Empty input is ignored; overlong input is
    /// truncated the same way the server would truncate it.
    pub fn send_chat(&self, text: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        let text = clip_chat(text);
        if text.is_empty() {
            return Ok(());
        }
        self.handle.send(ClientMessage::Chat { text })
    }

    pub fn send_reaction(&self, emoji: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.handle.send(ClientMessage::Reaction {
            emoji: emoji.to_string(),
        })
    }

    /// Flip the local member's readiness. The change becomes visible once
    /// the server echoes a party update; membership is never patched locally.
    pub fn toggle_ready(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        let ready = !self.shared.state.lock().local_ready();
        self.handle.send(ClientMessage::Ready { ready })
    }

    pub fn request_play(&self) -> Result<(), SessionError> {
        self.host_command(HostIntent::Play)
    }

    pub fn request_pause(&self) -> Result<(), SessionError> {
        self.host_command(HostIntent::Pause)
    }

    pub fn request_seek(&self, time: f64) -> Result<(), SessionError> {
        self.host_command(HostIntent::Seek(time))
    }

    fn host_command(&self, intent: HostIntent) -> Result<(), SessionError> {
        self.ensure_open()?;
        let position = self.player.position().ok();
        let (message, command) = {
            let mut state = self.shared.state.lock();
            self.engine
                .host_intent(&mut state, intent, position, Instant::now())?
        };
        // Drive the player only after the state lock is released; it may
        // block briefly, like the reconcile path in `handle_message`.
        command.run(self.player.as_ref());
        self.handle.send(message)
    }

    /// Leave the party and tear the session down. Synchronously closes the
    /// channel and cancels all timers; no events fire afterward.
    pub fn leave(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.handle.close();
            // No reducer invocation or timer may fire past this point.
            self.pump_task.abort();
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        if *self.shared.connection.lock() == ConnectionState::Failed {
            return Err(SessionError::Closed);
        }
        Ok(())
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.leave();
    }
}

fn clip_chat(text: &str) -> String {
    let trimmed = text.trim();
    trimmed.chars().take(MAX_CHAT_LEN).collect()
}

/// The single serialized event loop for one session.
async fn pump(
    shared: Arc<Shared>,
    engine: Arc<SyncEngine>,
    player: Arc<dyn Player>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    mut conn_rx: mpsc::UnboundedReceiver<ConnEvent>,
    ui_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut sweep = tokio::time::interval(REACTION_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut report = tokio::time::interval(TIME_REPORT_INTERVAL);
    report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = conn_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    ConnEvent::State(state) => {
                        *shared.connection.lock() = state;
                        let _ = ui_tx.send(SessionEvent::Connection(state));
                    }
                    ConnEvent::Message(msg) => {
                        handle_message(&shared, &engine, player.as_ref(), &ui_tx, msg);
                    }
                    ConnEvent::Fatal(err) => {
                        let _ = ui_tx.send(SessionEvent::Error {
                            kind: err.kind(),
                            detail: err.to_string(),
                        });
                    }
                }
            }
            _ = sweep.tick() => {
                shared.state.lock().prune_reactions(Instant::now());
            }
            _ = report.tick() => {
                report_position(&shared, player.as_ref(), &outbound);
            }
        }
    }
}

fn handle_message(
    shared: &Shared,
    engine: &SyncEngine,
    player: &dyn Player,
    ui_tx: &mpsc::UnboundedSender<SessionEvent>,
    msg: ServerMessage,
) {
    let now = Instant::now();
    match &msg {
        ServerMessage::Sync { resync, .. } => {
            let resync = *resync;
            let playback = {
                let mut state = shared.state.lock();
                state.apply(&msg, now);
                state.playback
            };
            // Reconcile outside the lock; the player may block briefly.
            engine.apply_sync(&playback, resync, player, now);
        }
        ServerMessage::PartyJoined { .. } | ServerMessage::PartyUpdate { .. } => {
            shared.state.lock().apply(&msg, now);
            let _ = ui_tx.send(SessionEvent::PartyChanged);
        }
        ServerMessage::Chat { .. } => {
            let entry = {
                let mut state = shared.state.lock();
                state.apply(&msg, now);
                state.chat().back().cloned()
            };
            if let Some(entry) = entry {
                let _ = ui_tx.send(SessionEvent::Chat(entry));
            }
        }
        ServerMessage::Reaction { .. } => {
            let reaction = {
                let mut state = shared.state.lock();
                state.apply(&msg, now);
                state.reactions().last().cloned()
            };
            if let Some(reaction) = reaction {
                let _ = ui_tx.send(SessionEvent::Reaction(reaction));
            }
        }
        ServerMessage::Error { message } => {
            // Mid-session server complaint; advisory, not terminal.
            let _ = ui_tx.send(SessionEvent::Error {
                kind: "server",
                detail: message.clone(),
            });
        }
        ServerMessage::Unknown => {}
    }
}

/// Feed the server's drift detection while we are joined and playing.
fn report_position(
    shared: &Shared,
    player: &dyn Player,
    outbound: &mpsc::UnboundedSender<ClientMessage>,
) {
    if *shared.connection.lock() != ConnectionState::Joined {
        return;
    }
    if !shared.state.lock().playback.is_playing {
        return;
    }
    match player.position() {
        Ok(time) => {
            let _ = outbound.send(ClientMessage::TimeUpdate { time });
        }
        Err(e) => tracing::debug!("Skipping position report: {e}"),
    }
}
