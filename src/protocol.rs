use serde::{Deserialize, Serialize};

/// Auth handshake action. `Create` is only ever sent on the very first
/// connection of a party that does not exist server-side yet; reconnects
/// always rejoin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthAction {
    Join,
    Create,
}

/// Messages sent to the session server (must match the server protocol).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        user_id: String,
        username: String,
        action: AuthAction,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_id: Option<String>,
    },
    Chat {
        text: String,
    },
    Reaction {
        emoji: String,
    },
    Ready {
        ready: bool,
    },
    // Host only; the server re-validates authority.
    Play {
        time: f64,
    },
    Pause {
        time: f64,
    },
    Seek {
        time: f64,
    },
    /// Periodic position report feeding the server's drift detection.
    TimeUpdate {
        time: f64,
    },
}

/// Messages received from the session server. Unknown kinds decode to
/// `Unknown` so server-side protocol additions never break us.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    PartyJoined {
        party: WireParty,
    },
    PartyUpdate {
        party: WireParty,
    },
    Sync {
        is_playing: bool,
        current_time: f64,
        #[serde(default = "default_rate")]
        playback_rate: f64,
        #[serde(default)]
        resync: bool,
    },
    Chat {
        message: WireChatMessage,
    },
    Reaction {
        emoji: String,
        username: String,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

fn default_rate() -> f64 {
    1.0
}

/// Authoritative party snapshot as the server sends it. Extra fields the
/// server may add are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireParty {
    pub party_id: String,
    pub host_id: String,
    #[serde(default)]
    pub media_id: Option<String>,
    #[serde(default)]
    pub media_title: Option<String>,
    #[serde(default)]
    pub media_poster: Option<String>,
    #[serde(default)]
    pub members: Vec<WireMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMember {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub is_host: bool,
    #[serde(default)]
    pub is_ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireChatMessage {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub message: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
}

fn default_message_type() -> String {
    "chat".to_string()
}

/// Decode a single inbound text frame.
pub fn decode(text: &str) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Encode an outbound message to a text frame.
pub fn encode(msg: &ClientMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}
