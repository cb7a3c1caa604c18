//! In-process underlay over `tokio::io::duplex`.
//!
//! A hub connects the visors of one process: listeners register under
//! (visor key, port) and dials hand the peer half of a duplex pipe to the
//! matching listener. Multi-visor tests run entirely on this underlay.

use super::{Connection, Listener, NetworkType, Underlay};
use crate::error::{Result, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use skein_crypto::PublicKey;
use std::sync::Arc;
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 64 * 1024;
const BACKLOG: usize = 16;

type Binding = (PublicKey, u16);

/// Shared in-process switchboard.
#[derive(Default)]
pub struct MemoryHub {
    bindings: DashMap<Binding, mpsc::Sender<Connection>>,
}

impl MemoryHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// An underlay for one visor attached to this hub.
    #[must_use]
    pub fn underlay(self: &Arc<Self>, local_pk: PublicKey) -> Arc<MemoryUnderlay> {
        Arc::new(MemoryUnderlay {
            hub: Arc::clone(self),
            local_pk,
        })
    }
}

/// One visor's endpoint on a [`MemoryHub`].
pub struct MemoryUnderlay {
    hub: Arc<MemoryHub>,
    local_pk: PublicKey,
}

struct Unbind {
    hub: Arc<MemoryHub>,
    binding: Binding,
}

impl Drop for Unbind {
    fn drop(&mut self) {
        self.hub.bindings.remove(&self.binding);
    }
}

#[async_trait]
impl Underlay for MemoryUnderlay {
    fn net_type(&self) -> NetworkType {
        NetworkType::Memory
    }

    async fn dial(&self, remote: PublicKey, port: u16) -> Result<Connection> {
        let tx = self
            .hub
            .bindings
            .get(&(remote, port))
            .map(|e| e.value().clone())
            .ok_or_else(|| TransportError::UnknownRemote(remote.to_string()))?;

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let inbound = Connection::new(self.local_pk, NetworkType::Memory, Box::new(far));
        tx.send(inbound)
            .await
            .map_err(|_| TransportError::UnknownRemote(remote.to_string()))?;

        Ok(Connection::new(remote, NetworkType::Memory, Box::new(near)))
    }

    async fn listen(&self, port: u16) -> Result<Listener> {
        let (tx, rx) = mpsc::channel(BACKLOG);
        let binding = (self.local_pk, port);
        self.hub.bindings.insert(binding, tx);
        let guard = Unbind {
            hub: Arc::clone(&self.hub),
            binding,
        };
        Ok(Listener::new(NetworkType::Memory, rx, Some(Box::new(guard))))
    }
}
