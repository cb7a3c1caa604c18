//! Error types for app networking.

use skein_router::RouterError;
use thiserror::Error;

/// App networking errors
#[derive(Debug, Error)]
pub enum AppError {
    /// Listen on a port that already has a reservation
    #[error("port {0} is already bound")]
    PortBound(u16),

    /// No free ephemeral ports remain
    #[error("ephemeral port range exhausted")]
    PortsExhausted,

    /// Accept on a closed listener
    #[error("listener is closed")]
    ListenerClosed,

    /// A networker is already registered for the network kind
    #[error("networker already registered for {0}")]
    NetworkerRegistered(String),

    /// No networker registered for the network kind
    #[error("no networker for {0}")]
    NoNetworker(String),

    /// Router-level failure
    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Result alias for app networking.
pub type Result<T> = std::result::Result<T, AppError>;
