use std::time::Duration;

use inknode_protocol::ProtocolError;

/// Errors surfaced by the gateway client. Some variants advertise a minimum
/// reconnect backoff; the reconnect loop asks the error for its override.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("gateway: no connection")]
    NotConnected,

    #[error("gateway: connect rejected")]
    ConnectRejected,

    /// Connect rejected with a server-supplied message.
    #[error("{0}")]
    Rejected(String),

    #[error("gateway: unexpected handshake payload")]
    UnexpectedHandshakePayload,

    /// The gateway announced a restart; reconnect after the advertised delay.
    #[error("gateway shutting down")]
    Shutdown { backoff: Duration },

    #[error("gateway: pairing required")]
    PairingRequired,

    #[error("gateway: device identity required")]
    DeviceIdentityRequired,

    #[error("gateway: connection closed: {reason}")]
    Closed { code: Option<u16>, reason: String },

    #[error("gateway: transport: {0}")]
    Transport(String),

    #[error("gateway: read timed out")]
    ReadTimeout,

    #[error("gateway: write timed out")]
    WriteTimeout,

    #[error("gateway: cancelled")]
    Cancelled,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Minimum backoff advertised by this error, if any.
    pub fn backoff_override(&self) -> Option<Duration> {
        match self {
            Self::Shutdown { backoff } => Some(*backoff),
            Self::PairingRequired | Self::DeviceIdentityRequired => Some(Duration::from_secs(10)),
            _ => None,
        }
    }

    /// A shutdown override replaces the current backoff; every other
    /// override only raises it.
    pub fn replaces_backoff(&self) -> bool {
        matches!(self, Self::Shutdown { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
