use shared::ProtocolError;
use thiserror::Error;

/// Failures surfaced by the transport channel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// A send was attempted while the connection is not open
    #[error("connection is not open")]
    NotConnected,

    /// The connection closed before it ever reached the open state
    #[error("could not connect to {0}")]
    ConnectFailed(String),

    /// The connection dropped while open
    #[error("connection lost")]
    ConnectionLost,

    #[error("timed out waiting for the connection to open")]
    Timeout,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
