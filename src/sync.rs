//! Drift correction and host authority.
//!
//! The engine reconciles the local player against the last authoritative
//! playback snapshot and turns host intents into wire messages plus an
//! optimistic local update.

use std::time::Instant;

use crate::error::SessionError;
use crate::protocol::ClientMessage;
use crate::state::{PlaybackState, SessionState};

/// Seam to whatever actually renders the media. Mirrors the surface of a
/// libVLC-style player; implementations report failures as strings and the
/// engine logs and carries on, since a flaky player must not end the session.
pub trait Player: Send + Sync {
    fn position(&self) -> Result<f64, String>;
    fn is_playing(&self) -> Result<bool, String>;
    fn play(&self) -> Result<(), String>;
    fn pause(&self) -> Result<(), String>;
    fn seek(&self, seconds: f64) -> Result<(), String>;
    fn rate(&self) -> Result<f64, String>;
    fn set_rate(&self, rate: f64) -> Result<(), String>;
}

/// What a reconciliation pass actually did, for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SyncOutcome {
    /// Target of the hard correction, if one was issued.
    pub corrected_to: Option<f64>,
    pub forced_play: bool,
    pub forced_pause: bool,
    pub rate_changed: bool,
}

/// A host-authored playback intent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostIntent {
    Play,
    Pause,
    Seek(f64),
}

/// The player action that accompanies an accepted host intent. Returned
/// to the caller instead of executed in place, so the player is never
/// driven while a state lock is held.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerCommand {
    Play,
    Pause,
    Seek(f64),
}

impl PlayerCommand {
    pub fn run(&self, player: &dyn Player) {
        let result = match self {
            PlayerCommand::Play => player.play(),
            PlayerCommand::Pause => player.pause(),
            PlayerCommand::Seek(time) => player.seek(*time),
        };
        if let Err(e) = result {
            tracing::warn!("Player rejected host intent: {e}");
        }
    }
}

pub struct SyncEngine {
    drift_threshold: f64,
}

impl SyncEngine {
    pub fn new(drift_threshold: f64) -> Self {
        Self { drift_threshold }
    }

    /// Reconcile the local player against the snapshot the reducer just
    /// installed. Small drift is tolerated to avoid seek-jitter; play/pause
    /// disagreement is corrected unconditionally.
    pub fn apply_sync(
        &self,
        playback: &PlaybackState,
        resync: bool,
        player: &dyn Player,
        now: Instant,
    ) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        let target = playback.projected_position(now);

        // A failed position read only disables the drift check; the
        // play/pause and rate mirroring below run regardless, and a
        // resync still hard-corrects to the projected target.
        let drifted = match player.position() {
            Ok(local) => (local - target).abs() > self.drift_threshold,
            Err(e) => {
                tracing::warn!("Player position unavailable: {e}");
                false
            }
        };
        if resync || drifted {
            tracing::debug!(target, drifted, resync, "Hard correction");
            if let Err(e) = player.seek(target) {
                tracing::warn!("Player seek failed: {e}");
            } else {
                outcome.corrected_to = Some(target);
            }
        }

        match player.is_playing() {
            Ok(local_playing) if local_playing != playback.is_playing => {
                let result = if playback.is_playing {
                    outcome.forced_play = true;
                    player.play()
                } else {
                    outcome.forced_pause = true;
                    player.pause()
                };
                if let Err(e) = result {
                    tracing::warn!("Player play/pause failed: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Player state unavailable: {e}"),
        }

        let local_rate = player.rate().unwrap_or(1.0);
        if (local_rate - playback.playback_rate).abs() > crate::constants::RATE_EPSILON {
            if let Err(e) = player.set_rate(playback.playback_rate) {
                tracing::warn!("Player rate change failed: {e}");
            } else {
                outcome.rate_changed = true;
            }
        }

        outcome
    }

    /// Validate and apply a host intent: courtesy-check authority and
    /// update the local snapshot optimistically. Hands back the message to
    /// put on the wire plus the [`PlayerCommand`] the caller runs once the
    /// state lock is released. The server's echoed `sync` supersedes the
    /// optimistic snapshot unconditionally.
    ///
    /// `local_position` is the player position read by the caller; when it
    /// is unavailable the last snapshot's projection stands in.
    pub fn host_intent(
        &self,
        state: &mut SessionState,
        intent: HostIntent,
        local_position: Option<f64>,
        now: Instant,
    ) -> Result<(ClientMessage, PlayerCommand), SessionError> {
        if !state.is_host() {
            tracing::debug!(?intent, "Dropping playback intent from non-host");
            return Err(SessionError::HostOnly);
        }

        let current =
            local_position.unwrap_or_else(|| state.playback.projected_position(now));

        let (message, command, is_playing, position) = match intent {
            HostIntent::Play => (
                ClientMessage::Play { time: current },
                PlayerCommand::Play,
                true,
                current,
            ),
            HostIntent::Pause => (
                ClientMessage::Pause { time: current },
                PlayerCommand::Pause,
                false,
                current,
            ),
            HostIntent::Seek(time) => {
                let time = time.max(0.0);
                (
                    ClientMessage::Seek { time },
                    PlayerCommand::Seek(time),
                    state.playback.is_playing,
                    time,
                )
            }
        };

        state.playback = PlaybackState {
            is_playing,
            position_secs: position,
            playback_rate: state.playback.playback_rate,
            as_of: now,
        };

        Ok((message, command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ServerMessage, WireMember, WireParty};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Play,
        Pause,
        Seek(f64),
        SetRate(f64),
    }

    struct MockPlayer {
        position: Mutex<f64>,
        playing: Mutex<bool>,
        rate: Mutex<f64>,
        calls: Mutex<Vec<Call>>,
        broken_position: bool,
    }

    impl MockPlayer {
        fn new(position: f64, playing: bool) -> Self {
            Self {
                position: Mutex::new(position),
                playing: Mutex::new(playing),
                rate: Mutex::new(1.0),
                calls: Mutex::new(Vec::new()),
                broken_position: false,
            }
        }

        /// A player whose position read always fails, as a libVLC wrapper
        /// does mid teardown or before media is loaded.
        fn with_broken_position(playing: bool) -> Self {
            let mut player = Self::new(0.0, playing);
            player.broken_position = true;
            player
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn seeks(&self) -> Vec<f64> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Seek(t) => Some(t),
                    _ => None,
                })
                .collect()
        }
    }

    impl Player for MockPlayer {
        fn position(&self) -> Result<f64, String> {
            if self.broken_position {
                return Err("no media".into());
            }
            Ok(*self.position.lock())
        }
        fn is_playing(&self) -> Result<bool, String> {
            Ok(*self.playing.lock())
        }
        fn play(&self) -> Result<(), String> {
            *self.playing.lock() = true;
            self.calls.lock().push(Call::Play);
            Ok(())
        }
        fn pause(&self) -> Result<(), String> {
            *self.playing.lock() = false;
            self.calls.lock().push(Call::Pause);
            Ok(())
        }
        fn seek(&self, seconds: f64) -> Result<(), String> {
            *self.position.lock() = seconds;
            self.calls.lock().push(Call::Seek(seconds));
            Ok(())
        }
        fn rate(&self) -> Result<f64, String> {
            Ok(*self.rate.lock())
        }
        fn set_rate(&self, rate: f64) -> Result<(), String> {
            *self.rate.lock() = rate;
            self.calls.lock().push(Call::SetRate(rate));
            Ok(())
        }
    }

    fn playback(is_playing: bool, position: f64, as_of: Instant) -> PlaybackState {
        PlaybackState {
            is_playing,
            position_secs: position,
            playback_rate: 1.0,
            as_of,
        }
    }

    fn hosted_state(local_user: &str, host: &str, now: Instant) -> SessionState {
        let mut state = SessionState::new(local_user, now);
        state.apply(
            &ServerMessage::PartyJoined {
                party: WireParty {
                    party_id: "ABC123".into(),
                    host_id: host.into(),
                    media_id: None,
                    media_title: None,
                    media_poster: None,
                    members: vec![
                        WireMember {
                            user_id: "u1".into(),
                            username: "ana".into(),
                            is_host: host == "u1",
                            is_ready: true,
                        },
                        WireMember {
                            user_id: "u2".into(),
                            username: "ben".into(),
                            is_host: host == "u2",
                            is_ready: false,
                        },
                    ],
                },
            },
            now,
        );
        state
    }

    #[test]
    fn test_small_drift_is_tolerated() {
        let now = Instant::now();
        let engine = SyncEngine::new(2.0);
        // Host was at 120.0 playing; the frame arrives 1.4s later claiming
        // 121.4, and the local player also sits at 121.4. Drift ~ 0.
        let player = MockPlayer::new(121.4, true);
        let outcome = engine.apply_sync(&playback(true, 121.4, now), false, &player, now);
        assert_eq!(outcome.corrected_to, None);
        assert!(player.seeks().is_empty());
    }

    #[test]
    fn test_large_drift_forces_exactly_one_seek() {
        let now = Instant::now();
        let engine = SyncEngine::new(2.0);
        let player = MockPlayer::new(110.0, true);
        let outcome = engine.apply_sync(&playback(true, 121.4, now), false, &player, now);
        assert_eq!(outcome.corrected_to, Some(121.4));
        assert_eq!(player.seeks(), vec![121.4]);
    }

    #[test]
    fn test_resync_overrides_drift_tolerance() {
        let now = Instant::now();
        let engine = SyncEngine::new(2.0);
        // Drift is well under threshold, but resync demands the correction.
        let player = MockPlayer::new(199.5, true);
        let outcome = engine.apply_sync(&playback(true, 200.0, now), true, &player, now);
        assert_eq!(outcome.corrected_to, Some(200.0));
        assert_eq!(player.seeks(), vec![200.0]);
    }

    #[test]
    fn test_projection_accounts_for_snapshot_age() {
        let now = Instant::now();
        let engine = SyncEngine::new(2.0);
        // Snapshot said 100.0 three seconds ago while playing; the
        // authoritative position now is ~103.0 and the player is there.
        let player = MockPlayer::new(103.0, true);
        let snapshot = playback(true, 100.0, now);
        let outcome =
            engine.apply_sync(&snapshot, false, &player, now + Duration::from_secs(3));
        assert_eq!(outcome.corrected_to, None);
    }

    #[test]
    fn test_play_state_mirrors_unconditionally() {
        let now = Instant::now();
        let engine = SyncEngine::new(2.0);

        let paused_player = MockPlayer::new(50.0, false);
        let outcome = engine.apply_sync(&playback(true, 50.0, now), false, &paused_player, now);
        assert!(outcome.forced_play);
        assert_eq!(paused_player.calls(), vec![Call::Play]);

        let playing_player = MockPlayer::new(50.0, true);
        let outcome = engine.apply_sync(&playback(false, 50.0, now), false, &playing_player, now);
        assert!(outcome.forced_pause);
        assert_eq!(playing_player.calls(), vec![Call::Pause]);
    }

    #[test]
    fn test_rate_mirrors_when_server_changes_it() {
        let now = Instant::now();
        let engine = SyncEngine::new(2.0);
        let player = MockPlayer::new(10.0, true);
        let snapshot = PlaybackState {
            is_playing: true,
            position_secs: 10.0,
            playback_rate: 1.5,
            as_of: now,
        };
        let outcome = engine.apply_sync(&snapshot, false, &player, now);
        assert!(outcome.rate_changed);
        assert!(player.calls().contains(&Call::SetRate(1.5)));
    }

    #[test]
    fn test_play_pause_mirrors_when_position_read_fails() {
        let now = Instant::now();
        let engine = SyncEngine::new(2.0);
        // Position is unreadable, but the snapshot says playing and the
        // player is paused: the mirror still has to fire.
        let player = MockPlayer::with_broken_position(false);
        let outcome = engine.apply_sync(&playback(true, 50.0, now), false, &player, now);
        assert!(outcome.forced_play);
        assert_eq!(outcome.corrected_to, None);
        assert_eq!(player.calls(), vec![Call::Play]);
    }

    #[test]
    fn test_resync_corrects_even_without_position_read() {
        let now = Instant::now();
        let engine = SyncEngine::new(2.0);
        let player = MockPlayer::with_broken_position(true);
        let outcome = engine.apply_sync(&playback(true, 80.0, now), true, &player, now);
        assert_eq!(outcome.corrected_to, Some(80.0));
        assert_eq!(player.seeks(), vec![80.0]);
    }

    #[test]
    fn test_non_host_intent_is_rejected() {
        let now = Instant::now();
        let engine = SyncEngine::new(2.0);
        let player = MockPlayer::new(10.0, false);
        let mut state = hosted_state("u2", "u1", now);

        let result = engine.host_intent(&mut state, HostIntent::Play, player.position().ok(), now);
        assert!(matches!(result, Err(SessionError::HostOnly)));
        assert!(player.calls().is_empty());
        assert!(!state.playback.is_playing);
    }

    #[test]
    fn test_host_play_is_optimistic() {
        let now = Instant::now();
        let engine = SyncEngine::new(2.0);
        let player = MockPlayer::new(33.0, false);
        let mut state = hosted_state("u1", "u1", now);

        let (msg, command) = engine
            .host_intent(&mut state, HostIntent::Play, player.position().ok(), now)
            .unwrap();
        assert!(matches!(msg, ClientMessage::Play { time } if time == 33.0));
        assert!(state.playback.is_playing);
        assert_eq!(state.playback.position_secs, 33.0);

        // The engine never drives the player itself; the accepted intent
        // carries the action for the caller to run lock-free.
        assert!(player.calls().is_empty());
        command.run(&player);
        assert_eq!(player.calls(), vec![Call::Play]);
    }

    #[test]
    fn test_host_seek_clamps_and_keeps_play_state() {
        let now = Instant::now();
        let engine = SyncEngine::new(2.0);
        let player = MockPlayer::new(33.0, true);
        let mut state = hosted_state("u1", "u1", now);
        state.apply(
            &ServerMessage::Sync {
                is_playing: true,
                current_time: 33.0,
                playback_rate: 1.0,
                resync: false,
            },
            now,
        );

        let (msg, command) = engine
            .host_intent(&mut state, HostIntent::Seek(-4.0), player.position().ok(), now)
            .unwrap();
        assert!(matches!(msg, ClientMessage::Seek { time } if time == 0.0));
        assert!(state.playback.is_playing);
        assert_eq!(command, PlayerCommand::Seek(0.0));
        command.run(&player);
        assert_eq!(player.seeks(), vec![0.0]);
    }

    #[test]
    fn test_host_intent_falls_back_to_projection() {
        let now = Instant::now();
        let engine = SyncEngine::new(2.0);
        let mut state = hosted_state("u1", "u1", now);
        state.apply(
            &ServerMessage::Sync {
                is_playing: true,
                current_time: 60.0,
                playback_rate: 1.0,
                resync: false,
            },
            now,
        );

        // Position read failed; the pause is stamped with the projection.
        let later = now + Duration::from_secs(2);
        let (msg, command) = engine
            .host_intent(&mut state, HostIntent::Pause, None, later)
            .unwrap();
        assert!(matches!(msg, ClientMessage::Pause { time } if (time - 62.0).abs() < 1e-9));
        assert_eq!(command, PlayerCommand::Pause);
        assert!(!state.playback.is_playing);
    }

    #[test]
    fn test_echoed_sync_supersedes_optimistic_update() {
        let now = Instant::now();
        let engine = SyncEngine::new(2.0);
        let player = MockPlayer::new(33.0, false);
        let mut state = hosted_state("u1", "u1", now);

        engine
            .host_intent(&mut state, HostIntent::Play, player.position().ok(), now)
            .unwrap();
        assert!(state.playback.is_playing);

        // Server disagrees; its word is final.
        state.apply(
            &ServerMessage::Sync {
                is_playing: false,
                current_time: 30.0,
                playback_rate: 1.0,
                resync: false,
            },
            now,
        );
        assert!(!state.playback.is_playing);
        assert_eq!(state.playback.position_secs, 30.0);
    }
}
