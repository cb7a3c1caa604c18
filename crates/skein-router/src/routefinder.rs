//! Route finder client.
//!
//! The route finder is an external HTTP service that returns candidate
//! hop sequences between pairs of public keys. The mock client answers
//! with the single direct hop and backs most tests.

use crate::error::{Result, RouterError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skein_routing::{Hop, Path, PathEdges};
use skein_transport::{transport_id, NetworkType};
use std::collections::HashMap;

/// Inclusive hop bounds passed to the route finder.
pub const MIN_HOPS: usize = 0;

/// See [`MIN_HOPS`].
pub const MAX_HOPS: usize = 50;

/// Hop bounds for a route query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RouteOptions {
    /// Minimum number of hops, inclusive
    pub min_hops: usize,
    /// Maximum number of hops, inclusive
    pub max_hops: usize,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            min_hops: MIN_HOPS,
            max_hops: MAX_HOPS,
        }
    }
}

/// Source of candidate paths between visors.
#[async_trait]
pub trait RouteFinder: Send + Sync {
    /// Candidate paths for each requested edge pair, best first.
    async fn find_routes(
        &self,
        edges: &[PathEdges],
        opts: RouteOptions,
    ) -> Result<HashMap<PathEdges, Vec<Path>>>;
}

#[derive(Serialize)]
struct FindRoutesRequest<'a> {
    edges: &'a [PathEdges],
    opts: RouteOptions,
}

/// HTTP route finder client (`POST /routes`).
pub struct HttpRouteFinder {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRouteFinder {
    /// Client against the service at `base_url` (no trailing slash).
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    /// Client with a per-request timeout.
    #[must_use]
    pub fn with_timeout(base_url: String, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }
}

#[async_trait]
impl RouteFinder for HttpRouteFinder {
    async fn find_routes(
        &self,
        edges: &[PathEdges],
        opts: RouteOptions,
    ) -> Result<HashMap<PathEdges, Vec<Path>>> {
        let url = format!("{}/routes", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(url)
            .json(&FindRoutesRequest { edges, opts })
            .send()
            .await
            .map_err(|e| RouterError::NoRoute(e.to_string()))?;

        let pairs: Vec<(PathEdges, Vec<Path>)> = resp
            .error_for_status()
            .map_err(|e| RouterError::NoRoute(e.to_string()))?
            .json()
            .await
            .map_err(|e| RouterError::NoRoute(e.to_string()))?;
        Ok(pairs.into_iter().collect())
    }
}

/// Mock route finder: every pair is one direct hop apart.
pub struct MockRouteFinder {
    net_type: NetworkType,
}

impl MockRouteFinder {
    /// Mock whose hops ride transports of `net_type`.
    #[must_use]
    pub fn new(net_type: NetworkType) -> Self {
        Self { net_type }
    }
}

#[async_trait]
impl RouteFinder for MockRouteFinder {
    async fn find_routes(
        &self,
        edges: &[PathEdges],
        _opts: RouteOptions,
    ) -> Result<HashMap<PathEdges, Vec<Path>>> {
        if edges.is_empty() {
            return Err(RouterError::NoRoute("no edges requested".into()));
        }
        Ok(edges
            .iter()
            .map(|&PathEdges(from, to)| {
                let hop = Hop {
                    tp_id: transport_id(from, to, self.net_type),
                    from,
                    to,
                };
                (PathEdges(from, to), vec![vec![hop]])
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_crypto::Keypair;

    #[tokio::test]
    async fn test_mock_returns_direct_hop() {
        let finder = MockRouteFinder::new(NetworkType::Memory);
        let a = Keypair::generate().public;
        let b = Keypair::generate().public;
        let edges = [PathEdges(a, b), PathEdges(b, a)];

        let paths = finder
            .find_routes(&edges, RouteOptions::default())
            .await
            .unwrap();

        let forward = &paths[&PathEdges(a, b)][0];
        assert_eq!(forward.len(), 1);
        assert_eq!(forward[0].from, a);
        assert_eq!(forward[0].to, b);
        // both directions name the same symmetric transport
        assert_eq!(forward[0].tp_id, paths[&PathEdges(b, a)][0][0].tp_id);
    }

    #[tokio::test]
    async fn test_mock_rejects_empty_request() {
        let finder = MockRouteFinder::new(NetworkType::Memory);
        assert!(finder
            .find_routes(&[], RouteOptions::default())
            .await
            .is_err());
    }
}
