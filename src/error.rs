use thiserror::Error;

/// Failures a session can surface. Only `Auth` and `ConnectionLost` are
/// terminal; everything else is recovered without interrupting playback.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The server rejected our credentials. Never retried.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The channel dropped and every reconnect attempt failed.
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },

    /// A single inbound frame could not be decoded. The frame is dropped;
    /// the connection is unaffected.
    #[error("malformed server frame: {0}")]
    Decode(#[from] serde_json::Error),

    /// A playback command was issued by a member without host authority.
    #[error("playback commands require host authority")]
    HostOnly,

    /// The session was already torn down.
    #[error("session is closed")]
    Closed,
}

impl SessionError {
    /// Short stable label for the presentation layer's error channel.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Auth(_) => "auth",
            SessionError::ConnectionLost { .. } => "connection_lost",
            SessionError::Decode(_) => "decode",
            SessionError::HostOnly => "host_only",
            SessionError::Closed => "closed",
        }
    }

    /// Terminal errors end the session; the rest are advisory.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionError::Auth(_) | SessionError::ConnectionLost { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(SessionError::Auth("bad token".into()).is_terminal());
        assert!(SessionError::ConnectionLost { attempts: 5 }.is_terminal());
        assert!(!SessionError::HostOnly.is_terminal());
        assert!(!SessionError::Closed.is_terminal());
    }

    #[test]
    fn test_decode_errors_convert_and_stay_advisory() {
        let serde_err = crate::protocol::decode("not json").unwrap_err();
        let err = SessionError::from(serde_err);
        assert_eq!(err.kind(), "decode");
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(SessionError::HostOnly.kind(), "host_only");
        assert_eq!(
            SessionError::ConnectionLost { attempts: 5 }.kind(),
            "connection_lost"
        );
    }
}
