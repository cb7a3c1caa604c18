//! Setup-node control plane.
//!
//! A setup node is a trusted out-of-band peer that computes the per-hop
//! rules implied by a bidirectional route and pushes them to every hop,
//! both endpoints included. This module holds the visor-side pieces: the
//! RPC wire protocol, the gateway served to trusted setup peers, the
//! client used when dialing, and an in-process mock for multi-visor tests.

pub mod mock;
pub mod rpc;

use crate::error::Result;
use async_trait::async_trait;
use skein_crypto::PublicKey;
use skein_routing::{BidirectionalRoute, EdgeRules};

pub use mock::MockSetup;
pub use rpc::{RpcGateway, SetupNodeDialer};

/// RPC method installing endpoint rules on the responder.
pub const METHOD_ADD_EDGE_RULES: &str = "RPCGateway.AddEdgeRules";

/// RPC method installing rules on an intermediary.
pub const METHOD_ADD_INTERMEDIARY_RULES: &str = "RPCGateway.AddIntermediaryRules";

/// RPC method reserving route ids on a hop.
pub const METHOD_RESERVE_IDS: &str = "RPCGateway.ReserveIDs";

/// RPC method a dialing visor calls on the setup node itself.
pub const METHOD_DIAL_ROUTE_GROUP: &str = "RPCGateway.DialRouteGroup";

/// Negotiates distributed rule installation for a bidirectional route.
#[async_trait]
pub trait RouteGroupDialer: Send + Sync {
    /// Ask a setup node to install `route`, returning this (dialing)
    /// visor's edge rules.
    async fn dial_route_group(
        &self,
        setup_nodes: &[PublicKey],
        route: BidirectionalRoute,
    ) -> Result<EdgeRules>;
}
