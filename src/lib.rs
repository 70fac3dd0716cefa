//! Client-side session layer for Potluck watch parties.
//!
//! N participants watch the same media with shared playback control, chat,
//! and ephemeral reactions. One member (the host) is the source of truth for
//! playback; everyone else follows, correcting drift against the server's
//! authoritative `sync` snapshots. The layer tolerates jitter, dropped
//! connections, and late joiners: reconnects back off linearly up to an
//! attempt cap, and every rejoin re-syncs from scratch instead of trusting
//! stale local state.
//!
//! The crate is the state/protocol layer only. Rendering, media decoding,
//! and identity all live elsewhere; a [`Player`] implementation and an
//! [`Identity`] are handed in, and the presentation layer observes a single
//! [`SessionEvent`] stream.
//!
//! ```no_run
//! use std::sync::Arc;
//! use potluck_client::{Identity, SessionConfig, SessionController};
//! # fn player() -> Arc<dyn potluck_client::Player> { unimplemented!() }
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = SessionConfig::new("wss://potluck.example.com");
//! let identity = Identity {
//!     user_id: "u42".into(),
//!     username: "ana".into(),
//!     token: "opaque".into(),
//! };
//! let (session, mut events) = SessionController::join(config, identity, "ABC123", player())?;
//! session.send_chat("hello!")?;
//! while let Some(event) = events.recv().await {
//!     // drive the UI
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod constants;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod state;
pub mod sync;

pub use config::{Identity, SessionConfig};
pub use connection::ConnectionState;
pub use controller::{SessionController, SessionEvent};
pub use error::SessionError;
pub use state::{ChatEntry, ChatKind, Member, Party, PlaybackState, Reaction, SessionState};
pub use sync::{HostIntent, Player, PlayerCommand, SyncEngine, SyncOutcome};
