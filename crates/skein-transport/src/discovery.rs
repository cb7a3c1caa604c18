//! Transport discovery client.
//!
//! The discovery service is an external HTTP directory of transport
//! entries. The core consumes it as an opaque client; an in-memory
//! implementation backs tests and single-process deployments.

use crate::entry::{EntryWithStatus, SignedTransportEntry, Status};
use crate::error::{Result, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use skein_crypto::PublicKey;
use uuid::Uuid;

/// Directory of transport entries.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Register entries, with the edge signatures collected during
    /// settlement.
    async fn register_transports(&self, entries: &[SignedTransportEntry]) -> Result<()>;

    /// Entries that have `pk` as one of their edges.
    async fn get_transports_by_edge(&self, pk: PublicKey) -> Result<Vec<EntryWithStatus>>;

    /// Report liveness for a set of transports.
    async fn update_statuses(&self, statuses: &[Status]) -> Result<()>;

    /// Remove an entry by id.
    async fn delete_transport(&self, id: Uuid) -> Result<()>;
}

/// HTTP discovery client.
pub struct HttpDiscovery {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDiscovery {
    /// Client against the service at `base_url` (no trailing slash).
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl DiscoveryClient for HttpDiscovery {
    async fn register_transports(&self, entries: &[SignedTransportEntry]) -> Result<()> {
        let resp = self
            .client
            .post(self.url("/transports/"))
            .json(entries)
            .send()
            .await
            .map_err(|e| TransportError::Discovery(e.to_string()))?;
        resp.error_for_status()
            .map_err(|e| TransportError::Discovery(e.to_string()))?;
        Ok(())
    }

    async fn get_transports_by_edge(&self, pk: PublicKey) -> Result<Vec<EntryWithStatus>> {
        let resp = self
            .client
            .get(self.url(&format!("/transports/edge:{pk}")))
            .send()
            .await
            .map_err(|e| TransportError::Discovery(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        resp.error_for_status()
            .map_err(|e| TransportError::Discovery(e.to_string()))?
            .json()
            .await
            .map_err(|e| TransportError::Discovery(e.to_string()))
    }

    async fn update_statuses(&self, statuses: &[Status]) -> Result<()> {
        let resp = self
            .client
            .post(self.url("/statuses"))
            .json(statuses)
            .send()
            .await
            .map_err(|e| TransportError::Discovery(e.to_string()))?;
        resp.error_for_status()
            .map_err(|e| TransportError::Discovery(e.to_string()))?;
        Ok(())
    }

    async fn delete_transport(&self, id: Uuid) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/transports/id:{id}")))
            .send()
            .await
            .map_err(|e| TransportError::Discovery(e.to_string()))?;
        resp.error_for_status()
            .map_err(|e| TransportError::Discovery(e.to_string()))?;
        Ok(())
    }
}

/// In-memory discovery, the mock counterpart of [`HttpDiscovery`].
#[derive(Default)]
pub struct MemoryDiscovery {
    entries: DashMap<Uuid, EntryWithStatus>,
}

impl MemoryDiscovery {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DiscoveryClient for MemoryDiscovery {
    async fn register_transports(&self, entries: &[SignedTransportEntry]) -> Result<()> {
        for signed in entries {
            self.entries.insert(
                signed.entry.id,
                EntryWithStatus {
                    entry: signed.entry,
                    is_up: true,
                },
            );
        }
        Ok(())
    }

    async fn get_transports_by_edge(&self, pk: PublicKey) -> Result<Vec<EntryWithStatus>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.entry.edges.contains(&pk))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn update_statuses(&self, statuses: &[Status]) -> Result<()> {
        for status in statuses {
            if let Some(mut entry) = self.entries.get_mut(&status.id) {
                entry.is_up = status.is_up;
            }
        }
        Ok(())
    }

    async fn delete_transport(&self, id: Uuid) -> Result<()> {
        self.entries.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::TransportEntry;
    use crate::network::NetworkType;
    use skein_crypto::Keypair;

    #[tokio::test]
    async fn test_memory_discovery_register_query_delete() {
        let disc = MemoryDiscovery::new();
        let a = Keypair::generate().public;
        let b = Keypair::generate().public;
        let c = Keypair::generate().public;

        let entry = TransportEntry::new(a, b, NetworkType::Memory);
        disc.register_transports(&[SignedTransportEntry::new(entry)])
            .await
            .unwrap();

        assert_eq!(disc.get_transports_by_edge(a).await.unwrap().len(), 1);
        assert_eq!(disc.get_transports_by_edge(b).await.unwrap().len(), 1);
        assert!(disc.get_transports_by_edge(c).await.unwrap().is_empty());

        disc.update_statuses(&[Status {
            id: entry.id,
            is_up: false,
        }])
        .await
        .unwrap();
        assert!(!disc.get_transports_by_edge(a).await.unwrap()[0].is_up);

        disc.delete_transport(entry.id).await.unwrap();
        assert!(disc.get_transports_by_edge(a).await.unwrap().is_empty());
    }
}
