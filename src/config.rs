use anyhow::{Context, Result};
use std::time::Duration;
use url::Url;

use crate::constants::{DRIFT_THRESHOLD_SECS, MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY};

/// Opaque identity handed to us by the auth layer. Never derived locally.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub token: String,
}

/// Tuning knobs for a session. `new` gives the defaults used in production.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket base URL of the session server, e.g. `wss://example.com`.
    pub server_url: String,
    pub drift_threshold: f64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            drift_threshold: DRIFT_THRESHOLD_SECS,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: RECONNECT_BASE_DELAY,
        }
    }

    /// Endpoint for a party. Joining (and every reconnect) dials the code;
    /// the very first create dials `new` and learns the code from the server.
    pub fn party_endpoint(&self, code: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&self.server_url).context("Invalid server URL")?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => anyhow::bail!("Unsupported URL scheme: {other}"),
        }
        let path = match code {
            Some(code) => format!("/ws/party/{}", code.trim().to_uppercase()),
            None => "/ws/party/new".to_string(),
        };
        url.set_path(&path);
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}
