//! Error types for the reasoner client

use crate::transport::TransportError;

/// Main error type for client operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Transport-level failure: closed, unreachable or broken session.
    /// Already retried once through a reconnect by the time callers see it.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A locally enforced deadline elapsed. The work may be partial or absent.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The server failed to evaluate a command. Never retried.
    #[error("Server error: {0}")]
    Server(String),

    /// Caller misuse (starting a started worker, continuing a finished query, ...)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The access lease expired and the operation did not opt out of the check
    #[error("Lease expired: {0}")]
    LeaseExpired(String),

    /// The server sent something the client could not make sense of
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Work was hard-stopped before it produced a result
    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Client closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether this error was raised before any network interaction because
    /// of caller misuse.
    pub fn is_programming_error(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }

    /// Whether the failure came from the connection rather than the work itself
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Closed)
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed(msg) => Self::Connection(format!("connection closed: {msg}")),
            TransportError::Unreachable(msg) => Self::Connection(format!("unreachable: {msg}")),
            TransportError::Timeout(after) => {
                Self::Timeout(format!("no reply from server within {after:?}"))
            }
            TransportError::Server(msg) => Self::Server(msg),
            TransportError::Protocol(msg) => Self::Protocol(msg),
        }
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
