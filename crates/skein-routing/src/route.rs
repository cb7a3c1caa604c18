//! Path and route types exchanged with the route finder and setup nodes.

use crate::address::RouteDescriptor;
use crate::rule::Rule;
use serde::{Deserialize, Serialize};
use skein_crypto::PublicKey;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// One hop along a route: the transport to traverse and its edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    /// Transport carrying this hop
    pub tp_id: Uuid,
    /// Sending visor
    pub from: PublicKey,
    /// Receiving visor
    pub to: PublicKey,
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.from, self.to, self.tp_id)
    }
}

/// An ordered sequence of hops between two visors.
pub type Path = Vec<Hop>;

/// The endpoint pair a path is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathEdges(pub PublicKey, pub PublicKey);

impl fmt::Display for PathEdges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.0, self.1)
    }
}

/// Request for distributed rule installation, sent to a setup node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidirectionalRoute {
    /// Circuit descriptor from the dialer's view
    pub desc: RouteDescriptor,
    /// Keep-alive installed on every rule, in milliseconds
    pub keep_alive_ms: u64,
    /// Hops from dialer to responder
    pub forward: Path,
    /// Hops from responder to dialer
    pub reverse: Path,
}

impl BidirectionalRoute {
    /// Keep-alive as a duration.
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

/// The rule pair a setup node delivers to each endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRules {
    /// Circuit descriptor from the dialer's view
    pub desc: RouteDescriptor,
    /// Endpoint Forward rule (this visor's sending direction)
    pub forward: Rule,
    /// Endpoint Consume rule (this visor's receiving direction)
    pub reverse: Rule,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::RouteId;
    use skein_crypto::Keypair;

    #[test]
    fn test_edge_rules_json_roundtrip() {
        let a = Keypair::generate().public;
        let b = Keypair::generate().public;
        let desc = RouteDescriptor::new(a, b, 1, 2);
        let tp = Uuid::new_v4();
        let rules = EdgeRules {
            desc,
            forward: Rule::forward(Duration::from_secs(2), RouteId(1), RouteId(2), tp, desc),
            reverse: Rule::consume(Duration::from_secs(2), RouteId(3), desc),
        };

        let json = serde_json::to_string(&rules).unwrap();
        let decoded: EdgeRules = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.desc, desc);
        assert_eq!(decoded.forward, rules.forward);
        assert_eq!(decoded.reverse, rules.reverse);
    }

    #[test]
    fn test_bidirectional_route_keep_alive() {
        let a = Keypair::generate().public;
        let b = Keypair::generate().public;
        let route = BidirectionalRoute {
            desc: RouteDescriptor::new(a, b, 1, 2),
            keep_alive_ms: 120_000,
            forward: vec![],
            reverse: vec![],
        };
        assert_eq!(route.keep_alive(), Duration::from_secs(120));
    }
}
