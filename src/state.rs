//! Authoritative local model of a party.
//!
//! Everything here is a pure reducer over inbound protocol messages: no
//! timers, no I/O, so the whole transition surface is unit-testable without
//! a network. Party snapshots replace wholesale; members are never patched
//! in place.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::constants::{CHAT_CAPACITY, REACTION_TTL};
use crate::protocol::{ServerMessage, WireChatMessage, WireParty};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub user_id: String,
    pub username: String,
    pub is_host: bool,
    pub is_ready: bool,
}

/// One synchronized viewing session, mirrored from server snapshots.
#[derive(Debug, Clone)]
pub struct Party {
    /// Short opaque code; doubles as the channel routing key.
    pub code: String,
    pub host_id: String,
    pub media_id: Option<String>,
    pub media_title: Option<String>,
    pub media_poster: Option<String>,
    /// Ordered by join time, unique by id.
    pub members: Vec<Member>,
}

impl Party {
    fn from_wire(wire: &WireParty) -> Self {
        Self {
            code: wire.party_id.clone(),
            host_id: wire.host_id.clone(),
            media_id: wire.media_id.clone(),
            media_title: wire.media_title.clone(),
            media_poster: wire.media_poster.clone(),
            members: wire
                .members
                .iter()
                .map(|m| Member {
                    user_id: m.user_id.clone(),
                    username: m.username.clone(),
                    is_host: m.is_host,
                    is_ready: m.is_ready,
                })
                .collect(),
        }
    }
}

/// Last authoritative playback snapshot plus the instant it was true at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub position_secs: f64,
    pub playback_rate: f64,
    pub as_of: Instant,
}

impl PlaybackState {
    pub fn idle(now: Instant) -> Self {
        Self {
            is_playing: false,
            position_secs: 0.0,
            playback_rate: 1.0,
            as_of: now,
        }
    }

    /// Position implied by this snapshot at `now`. The player itself clamps
    /// against media duration; we only clamp the lower bound.
    pub fn projected_position(&self, now: Instant) -> f64 {
        let position = if self.is_playing {
            self.position_secs + now.duration_since(self.as_of).as_secs_f64() * self.playback_rate
        } else {
            self.position_secs
        };
        position.max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    User,
    System,
}

#[derive(Debug, Clone)]
pub struct ChatEntry {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub text: String,
    pub kind: ChatKind,
    pub received_at: Instant,
}

impl ChatEntry {
    fn from_wire(wire: &WireChatMessage, now: Instant) -> Self {
        Self {
            id: wire.id.clone(),
            user_id: wire.user_id.clone(),
            username: wire.username.clone(),
            text: wire.message.clone(),
            kind: match wire.message_type.as_str() {
                "system" => ChatKind::System,
                _ => ChatKind::User,
            },
            received_at: now,
        }
    }
}

/// Fire-and-forget emoji overlay. Never part of the party snapshot and
/// never retransmitted on resync.
#[derive(Debug, Clone)]
pub struct Reaction {
    pub id: Uuid,
    pub emoji: String,
    pub username: String,
    pub expires_at: Instant,
}

/// The session's local state. Mutated exclusively through [`apply`] and the
/// controller's periodic [`prune_reactions`] sweep.
///
/// [`apply`]: SessionState::apply
/// [`prune_reactions`]: SessionState::prune_reactions
#[derive(Debug, Clone)]
pub struct SessionState {
    local_user_id: String,
    pub party: Option<Party>,
    pub playback: PlaybackState,
    chat: VecDeque<ChatEntry>,
    reactions: Vec<Reaction>,
    chat_capacity: usize,
    reaction_ttl: Duration,
}

impl SessionState {
    pub fn new(local_user_id: impl Into<String>, now: Instant) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            party: None,
            playback: PlaybackState::idle(now),
            chat: VecDeque::with_capacity(CHAT_CAPACITY),
            reactions: Vec::new(),
            chat_capacity: CHAT_CAPACITY,
            reaction_ttl: REACTION_TTL,
        }
    }

    /// Fold one inbound message into the state. `now` is the arrival
    /// instant; passing it in keeps this free of clock reads.
    pub fn apply(&mut self, msg: &ServerMessage, now: Instant) {
        match msg {
            ServerMessage::PartyJoined { party } | ServerMessage::PartyUpdate { party } => {
                self.party = Some(Party::from_wire(party));
            }
            ServerMessage::Sync {
                is_playing,
                current_time,
                playback_rate,
                ..
            } => {
                // Always authoritative, even over a pending optimistic host
                // update. Divergence is bounded to one round-trip.
                self.playback = PlaybackState {
                    is_playing: *is_playing,
                    position_secs: *current_time,
                    playback_rate: *playback_rate,
                    as_of: now,
                };
            }
            ServerMessage::Chat { message } => {
                self.push_chat(ChatEntry::from_wire(message, now));
            }
            ServerMessage::Reaction { emoji, username } => {
                self.reactions.push(Reaction {
                    id: Uuid::new_v4(),
                    emoji: emoji.clone(),
                    username: username.clone(),
                    expires_at: now + self.reaction_ttl,
                });
            }
            // Errors are handled by the connection layer; unknown kinds are
            // dropped for forward compatibility.
            ServerMessage::Error { .. } | ServerMessage::Unknown => {}
        }
    }

    fn push_chat(&mut self, entry: ChatEntry) {
        if self.chat.len() == self.chat_capacity {
            self.chat.pop_front();
        }
        self.chat.push_back(entry);
    }

    /// Drop reactions past their TTL. Called from the controller's tick.
    pub fn prune_reactions(&mut self, now: Instant) {
        self.reactions.retain(|r| r.expires_at > now);
    }

    pub fn is_host(&self) -> bool {
        self.party
            .as_ref()
            .map(|p| p.host_id == self.local_user_id)
            .unwrap_or(false)
    }

    /// The local member's readiness, if we are in a party.
    pub fn local_ready(&self) -> bool {
        self.party
            .as_ref()
            .and_then(|p| p.members.iter().find(|m| m.user_id == self.local_user_id))
            .map(|m| m.is_ready)
            .unwrap_or(false)
    }

    pub fn party_code(&self) -> Option<&str> {
        self.party.as_ref().map(|p| p.code.as_str())
    }

    pub fn chat(&self) -> &VecDeque<ChatEntry> {
        &self.chat
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }
}
