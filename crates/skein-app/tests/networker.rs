//! App networking over live in-process visors.

use skein_app::{AppError, Networker, SkeinNetworker};
use skein_crypto::{Keypair, PublicKey};
use skein_router::setup::MockSetup;
use skein_router::{MockRouteFinder, Router, RouterConfig};
use skein_routing::{Addr, RoutingTable};
use skein_transport::network::memory::MemoryHub;
use skein_transport::network::Network;
use skein_transport::{
    ManagerConfig, MemoryDiscovery, MemoryLogStore, NetworkType, TransportManager,
};
use std::sync::Arc;
use std::time::Duration;

struct Visor {
    pk: PublicKey,
    tm: Arc<TransportManager>,
    networker: Arc<SkeinNetworker>,
}

struct Env {
    hub: Arc<MemoryHub>,
    setup: Arc<MockSetup>,
    discovery: Arc<MemoryDiscovery>,
}

impl Env {
    fn new() -> Self {
        Self {
            hub: MemoryHub::new(),
            setup: MockSetup::new(),
            discovery: Arc::new(MemoryDiscovery::new()),
        }
    }

    async fn visor(&self) -> Visor {
        let keys = Keypair::generate();
        let pk = keys.public;
        let network = Arc::new(Network::new(pk).with_underlay(self.hub.underlay(pk)));
        let tm = TransportManager::new(
            Arc::clone(&network),
            ManagerConfig {
                keys,
                discovery: self.discovery.clone(),
                log_store: Arc::new(MemoryLogStore::new()),
            },
        );
        let rt = Arc::new(RoutingTable::new());
        let router = Router::new(
            network,
            Arc::clone(&tm),
            rt,
            RouterConfig {
                setup_nodes: Vec::new(),
                route_finder: Arc::new(MockRouteFinder::new(NetworkType::Memory)),
                setup_dialer: self.setup.clone(),
                keep_alive: Duration::from_secs(120),
            },
        );
        self.setup.register(pk, Arc::clone(&router));
        router.serve().await;

        Visor {
            pk,
            tm,
            networker: SkeinNetworker::new(router),
        }
    }
}

#[tokio::test]
async fn test_dial_and_listen() {
    let env = Env::new();
    let v1 = env.visor().await;
    let v2 = env.visor().await;
    v1.tm
        .save_transport(v2.pk, NetworkType::Memory)
        .await
        .unwrap();

    // resolve the networker the way apps do: through the registry, as a
    // trait object
    skein_app::clear_networkers();
    skein_app::add_networker("skein", v2.networker.clone()).unwrap();
    let resolved: Arc<dyn Networker> = skein_app::networker("skein").unwrap();

    let mut listener = resolved.listen(Addr::new(v2.pk, 8000)).await.unwrap();

    let conn = v1.networker.dial(Addr::new(v2.pk, 8000)).await.unwrap();
    let accepted = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(accepted.local_addr().port, 8000);
    assert_eq!(accepted.remote_addr().pk, v1.pk);
    assert_eq!(conn.remote_addr(), Addr::new(v2.pk, 8000));
    // the dialer got an ephemeral local port
    assert!(conn.local_addr().port >= skein_app::PORTER_MIN_EPHEMERAL);

    conn.write(b"hello").await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), accepted.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"hello");

    accepted.write(b"world").await.unwrap();
    let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"world");

    conn.close().await;
    conn.close().await; // idempotent
}

#[tokio::test]
async fn test_port_exhaustion() {
    let env = Env::new();
    let visor = env.visor().await;

    let addr = Addr::new(visor.pk, 9000);
    let mut first = visor.networker.listen(addr).await.unwrap();

    // second listen on the same port is refused
    let err = visor.networker.listen(addr).await.unwrap_err();
    assert!(matches!(err, AppError::PortBound(9000)));

    // closing the first listener frees the port for a third
    first.close();
    let _third = visor.networker.listen(addr).await.unwrap();
}

#[tokio::test]
async fn test_dial_failure_releases_port() {
    let env = Env::new();
    let visor = env.visor().await;
    let stranger = Keypair::generate().public;

    // no transport and no listener: the dial fails fast
    let result = visor.networker.dial(Addr::new(stranger, 1)).await;
    assert!(result.is_err());

    // the ephemeral port reserved for the failed dial is free again:
    // the next dial draws from the same cursor without exhaustion
    let result = visor.networker.dial(Addr::new(stranger, 1)).await;
    assert!(result.is_err());
}
