//! In-process setup node.
//!
//! Computes the per-hop rules implied by a bidirectional route and
//! installs them directly on registered routers, skipping the RPC
//! transport. Multi-visor tests use it to exercise the full dial/accept
//! path without a live setup peer.

use super::RouteGroupDialer;
use crate::error::{Result, RouterError};
use crate::router::Router;
use async_trait::async_trait;
use dashmap::DashMap;
use skein_crypto::PublicKey;
use skein_routing::{BidirectionalRoute, EdgeRules, Path, Rule};
use std::sync::Arc;
use std::time::Duration;

/// Registry of in-process routers acting as one trusted setup node.
#[derive(Default)]
pub struct MockSetup {
    routers: DashMap<PublicKey, Arc<Router>>,
}

impl MockSetup {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `router` reachable for rule installation.
    pub fn register(&self, pk: PublicKey, router: Arc<Router>) {
        self.routers.insert(pk, router);
    }

    fn router(&self, pk: &PublicKey) -> Result<Arc<Router>> {
        self.routers
            .get(pk)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| RouterError::SetupRejected(format!("unknown visor {pk}")))
    }

    /// Reserve ids along `path`, install intermediary rules, and return
    /// the first node's Forward rule with the last node's Consume rule.
    fn install_path(
        &self,
        path: &Path,
        keep_alive: Duration,
        desc: skein_routing::RouteDescriptor,
    ) -> Result<(Rule, Rule)> {
        let first = path
            .first()
            .ok_or_else(|| RouterError::SetupRejected("empty path".into()))?;

        let nodes: Vec<PublicKey> = std::iter::once(first.from)
            .chain(path.iter().map(|hop| hop.to))
            .collect();

        let mut ids = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let reserved = self.router(node)?.reserve_keys(1)?;
            ids.push(reserved[0]);
        }

        let forward = Rule::forward(keep_alive, ids[0], ids[1], first.tp_id, desc);
        for i in 1..nodes.len() - 1 {
            let rule = Rule::intermediary_forward(keep_alive, ids[i], ids[i + 1], path[i].tp_id);
            self.router(&nodes[i])?.save_routing_rules(&[rule]);
        }
        let consume = Rule::consume(keep_alive, ids[nodes.len() - 1], desc);

        Ok((forward, consume))
    }
}

#[async_trait]
impl RouteGroupDialer for MockSetup {
    async fn dial_route_group(
        &self,
        _setup_nodes: &[PublicKey],
        route: BidirectionalRoute,
    ) -> Result<EdgeRules> {
        let desc = route.desc;
        let keep_alive = route.keep_alive();

        let (fwd_forward, fwd_consume) = self.install_path(&route.forward, keep_alive, desc)?;
        let (rvs_forward, rvs_consume) = self.install_path(&route.reverse, keep_alive, desc)?;

        // the responder learns both its rules through the accept channel,
        // exactly as AddEdgeRules would deliver them
        self.router(&desc.dst_pk)?.introduce_rules(EdgeRules {
            desc,
            forward: rvs_forward,
            reverse: fwd_consume,
        })?;

        Ok(EdgeRules {
            desc,
            forward: fwd_forward,
            reverse: rvs_consume,
        })
    }
}
