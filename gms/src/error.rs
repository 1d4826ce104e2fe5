use std::net::SocketAddr;
use thiserror::Error;

/// Failures at the socket or session layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload of {size} bytes exceeds the datagram limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("destination {0} is unreachable")]
    Unreachable(SocketAddr),
    #[error("multicast is not enabled on this transport")]
    MulticastDisabled,
    #[error("connection to {0} was lost")]
    ConnectionLost(SocketAddr),
    #[error("session handshake with {peer} failed: {reason}")]
    Handshake { peer: SocketAddr, reason: String },
}

/// Public error taxonomy of the membership service.
#[derive(Debug, Error)]
pub enum GmsError {
    #[error(transparent)]
    Transport(TransportError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("membership service is closed")]
    MembershipClosed,
    #[error("invalid member identifier: {0}")]
    InvalidIdentifier(String),
    #[error("member {0} has been removed from the view")]
    MemberRemoved(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<TransportError> for GmsError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Handshake { peer, reason } => GmsError::Handshake(format!("{}: {}", peer, reason)),
            other => GmsError::Transport(other),
        }
    }
}

impl From<std::io::Error> for GmsError {
    fn from(err: std::io::Error) -> Self {
        GmsError::Transport(TransportError::Io(err))
    }
}

impl From<bincode::Error> for GmsError {
    fn from(err: bincode::Error) -> Self {
        GmsError::Codec(err.to_string())
    }
}

impl GmsError {
    /// Whether a retry at a later point can succeed. Closed services and
    /// malformed identities never recover by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GmsError::Transport(_) | GmsError::Handshake(_))
    }
}

pub type Result<T, E = GmsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_become_transport_errors() {
        let err: GmsError = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(err, GmsError::Transport(TransportError::Io(_))));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_session_handshake_failures_surface_as_handshake_errors() {
        let err: GmsError = TransportError::Handshake {
            peer: "127.0.0.1:7000".parse().unwrap(),
            reason: "timed out".into(),
        }
        .into();
        assert!(matches!(err, GmsError::Handshake(ref reason) if reason.contains("127.0.0.1:7000")));
    }

    #[test]
    fn test_closed_is_not_retryable() {
        assert!(!GmsError::MembershipClosed.is_retryable());
        assert!(!GmsError::InvalidIdentifier("no vm kind".into()).is_retryable());
    }
}
