//! Error types for the router and route groups.

use skein_routing::{PacketError, RoutingError};
use skein_transport::TransportError;
use thiserror::Error;

/// Router and route-group errors
#[derive(Debug, Error)]
pub enum RouterError {
    /// Route finder exhausted its retry budget
    #[error("no route found: {0}")]
    NoRoute(String),

    /// Setup node rejected or dropped the rule installation
    #[error("setup rejected: {0}")]
    SetupRejected(String),

    /// Read or write on a closed route group, or accept on a closed router
    #[error("closed pipe")]
    ClosedPipe,

    /// Operation after the router or manager closed
    #[error("not serving")]
    NotServing,

    /// Incoming packet matched no rule
    #[error("no rule for route id {0}")]
    UnknownRouteId(skein_routing::RouteId),

    /// Incoming packet's rule has no live route group
    #[error("no route group for descriptor {0}")]
    UnknownDescriptor(skein_routing::RouteDescriptor),

    /// Forward rule names a transport the manager does not hold
    #[error("unknown transport {0}")]
    UnknownTransport(uuid::Uuid),

    /// Rule-table failure
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Frame-level failure
    #[error(transparent)]
    Packet(#[from] PacketError),

    /// Transport-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result alias for router operations.
pub type Result<T> = std::result::Result<T, RouterError>;
