//! Error types for transports and the transport manager.

use skein_routing::PacketError;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Operation on a closed, mid-redial or never-established transport
    #[error("transport is not serving")]
    NotServing,

    /// A connection is already bound to this transport
    #[error("transport is already serving")]
    AlreadyServing,

    /// Underlay dial did not complete within the deadline
    #[error("dial timed out")]
    DialTimeout,

    /// Settlement handshake failed
    #[error("settlement handshake failed: {0}")]
    HandshakeFailed(String),

    /// Frame-level violation on the wire
    #[error(transparent)]
    Frame(#[from] PacketError),

    /// The requested underlay type is not registered
    #[error("unknown network type: {0}")]
    UnknownNetwork(String),

    /// No underlay route to the requested visor
    #[error("no entry for visor {0} in the underlay table")]
    UnknownRemote(String),

    /// Discovery service failure
    #[error("transport discovery: {0}")]
    Discovery(String),

    /// Underlay I/O failure
    #[error("underlay: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the error terminates the transport for good, as opposed to
    /// triggering a redial.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HandshakeFailed(_) | Self::NotServing | Self::AlreadyServing
        )
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
