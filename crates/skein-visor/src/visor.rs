//! Visor assembly and lifecycle.
//!
//! Wires the underlay network, transport manager, routing table, router
//! and app networker together from a [`Config`], and tears everything
//! down within a bounded shutdown window.

use crate::config::{Config, LogStoreKind};
use skein_app::SkeinNetworker;
use skein_crypto::PublicKey;
use skein_router::{HttpRouteFinder, Router, RouterConfig, SetupNodeDialer};
use skein_routing::RoutingTable;
use skein_transport::network::memory::MemoryHub;
use skein_transport::network::tcp::TcpUnderlay;
use skein_transport::network::Network;
use skein_transport::{
    FileLogStore, HttpDiscovery, LogStore, ManagerConfig, MemoryLogStore, TransportManager,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Ceiling on a full visor shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Network kind the networker registers under.
pub const NETWORK_KIND: &str = "skein";

/// Visor startup errors
#[derive(Debug, Error)]
pub enum VisorError {
    /// Underlay binding failure
    #[error("underlay: {0}")]
    Underlay(#[from] skein_transport::TransportError),

    /// Log store location missing or unusable
    #[error("log store: {0}")]
    LogStore(String),

    /// Networker registration clash
    #[error(transparent)]
    App(#[from] skein_app::AppError),
}

/// A running visor.
pub struct Visor {
    pk: PublicKey,
    router: Arc<Router>,
    networker: Arc<SkeinNetworker>,
}

impl Visor {
    /// Build and start a visor from `config`.
    ///
    /// # Errors
    ///
    /// Underlay binding, log-store setup, or networker registration
    /// failures.
    pub async fn start(config: Config) -> Result<Self, VisorError> {
        let keys = config.keypair();
        let pk = keys.public;
        tracing::info!(%pk, "starting visor");

        let mut network = Network::new(pk).with_underlay(MemoryHub::new().underlay(pk));
        if let Some(tcp) = &config.underlays.tcp {
            let underlay = TcpUnderlay::bind(pk, tcp.listen_addr, tcp.pk_table.clone()).await?;
            tracing::info!(addr = %underlay.local_addr(), "tcp underlay bound");
            network = network.with_underlay(underlay);
        }
        let network = Arc::new(network);

        let log_store: Arc<dyn LogStore> = match config.transport.log_store.kind {
            LogStoreKind::Memory => Arc::new(MemoryLogStore::new()),
            LogStoreKind::File => {
                let dir = config
                    .transport
                    .log_store
                    .location
                    .clone()
                    .ok_or_else(|| VisorError::LogStore("file store needs a location".into()))?;
                Arc::new(FileLogStore::new(dir).map_err(|e| VisorError::LogStore(e.to_string()))?)
            }
        };

        let tm = TransportManager::new(
            Arc::clone(&network),
            ManagerConfig {
                keys,
                discovery: Arc::new(HttpDiscovery::new(config.transport.discovery.clone())),
                log_store,
            },
        );

        let rt = Arc::new(RoutingTable::new());
        let router = Router::new(
            Arc::clone(&network),
            Arc::clone(&tm),
            rt,
            RouterConfig {
                setup_nodes: config.routing.setup_nodes.clone(),
                route_finder: Arc::new(HttpRouteFinder::with_timeout(
                    config.routing.route_finder.clone(),
                    Duration::from_millis(config.routing.route_finder_timeout_ms),
                )),
                setup_dialer: Arc::new(SetupNodeDialer::new(Arc::clone(&network))),
                keep_alive: Duration::from_millis(config.routing.keep_alive_ms),
            },
        );
        router.serve().await;

        let networker = SkeinNetworker::new(Arc::clone(&router));
        skein_app::add_networker(NETWORK_KIND, networker.clone())?;

        tracing::info!(%pk, "visor is serving");
        Ok(Self {
            pk,
            router,
            networker,
        })
    }

    /// Local visor key.
    #[must_use]
    pub fn local_pk(&self) -> PublicKey {
        self.pk
    }

    /// The app networker serving this visor.
    #[must_use]
    pub fn networker(&self) -> Arc<SkeinNetworker> {
        Arc::clone(&self.networker)
    }

    /// Shut the visor down within the shutdown window. Idempotent.
    pub async fn close(&self) {
        tracing::info!(pk = %self.pk, "closing visor");
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.router.close())
            .await
            .is_err()
        {
            tracing::error!("shutdown timed out");
        }
        skein_app::clear_networkers();
        tracing::info!("visor closed");
    }
}
