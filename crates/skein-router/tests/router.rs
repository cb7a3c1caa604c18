//! End-to-end circuits across live in-process visors.

use async_trait::async_trait;
use skein_crypto::{Keypair, PublicKey};
use skein_router::error::{Result as RouterResult, RouterError};
use skein_router::setup::rpc::call;
use skein_router::setup::{MockSetup, METHOD_RESERVE_IDS};
use skein_router::{MockRouteFinder, RouteFinder, RouteOptions, Router, RouterConfig};
use skein_routing::{Hop, Path, PathEdges, RouteId, RoutingTable};
use skein_transport::network::memory::MemoryHub;
use skein_transport::network::{Network, Underlay};
use skein_transport::{
    transport_id, ManagerConfig, MemoryDiscovery, MemoryLogStore, NetworkType, TransportManager,
    AWAIT_SETUP_PORT,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct Visor {
    pk: PublicKey,
    tm: Arc<TransportManager>,
    rt: Arc<RoutingTable>,
    router: Arc<Router>,
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

    async fn visor(
        &self,
        keys: Keypair,
        finder: Arc<dyn RouteFinder>,
        keep_alive: Duration,
        setup_nodes: Vec<PublicKey>,
    ) -> Visor {
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
            Arc::clone(&rt),
            RouterConfig {
                setup_nodes,
                route_finder: finder,
                setup_dialer: self.setup.clone(),
                keep_alive,
            },
        );
        self.setup.register(pk, Arc::clone(&router));
        router.serve().await;

        Visor { pk, tm, rt, router }
    }
}

fn direct_finder() -> Arc<dyn RouteFinder> {
    Arc::new(MockRouteFinder::new(NetworkType::Memory))
}

/// Two directly-connected visors with an established transport.
async fn two_visors(keep_alive: Duration) -> (Env, Visor, Visor) {
    let env = Env::new();
    let v1 = env
        .visor(Keypair::generate(), direct_finder(), keep_alive, Vec::new())
        .await;
    let v2 = env
        .visor(Keypair::generate(), direct_finder(), keep_alive, Vec::new())
        .await;
    v1.tm
        .save_transport(v2.pk, NetworkType::Memory)
        .await
        .unwrap();
    (env, v1, v2)
}

/// Route finder answering with a fixed chain of visors in either
/// direction.
struct ChainRouteFinder {
    chain: Vec<PublicKey>,
}

#[async_trait]
impl RouteFinder for ChainRouteFinder {
    async fn find_routes(
        &self,
        edges: &[PathEdges],
        _opts: RouteOptions,
    ) -> RouterResult<HashMap<PathEdges, Vec<Path>>> {
        let mut out = HashMap::new();
        for &PathEdges(from, to) in edges {
            let nodes: Vec<PublicKey> = if self.chain.first() == Some(&from) {
                self.chain.clone()
            } else {
                self.chain.iter().rev().copied().collect()
            };
            assert_eq!(nodes.last(), Some(&to));
            let path: Path = nodes
                .windows(2)
                .map(|pair| Hop {
                    tp_id: transport_id(pair[0], pair[1], NetworkType::Memory),
                    from: pair[0],
                    to: pair[1],
                })
                .collect();
            out.insert(PathEdges(from, to), vec![path]);
        }
        Ok(out)
    }
}

#[tokio::test]
async fn test_two_visor_dial() {
    let (_env, v1, v2) = two_visors(Duration::from_secs(120)).await;

    let g1 = v1.router.dial_routes(v2.pk, 7000, 8000).await.unwrap();
    let g2 = v2.router.accept_routes().await.unwrap();

    assert_eq!(g1.local_addr().pk, v1.pk);
    assert_eq!(g1.local_addr().port, 7000);
    assert_eq!(g1.remote_addr().pk, v2.pk);
    assert_eq!(g2.local_addr().pk, v2.pk);
    assert_eq!(g2.local_addr().port, 8000);
    assert_eq!(g2.remote_addr().port, 7000);

    g1.write(&[0x01, 0x02, 0x03]).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), g2.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], &[0x01, 0x02, 0x03]);

    // and the reverse direction
    g2.write(b"pong").await.unwrap();
    let n = tokio::time::timeout(Duration::from_secs(5), g1.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"pong");
}

#[tokio::test]
async fn test_short_read_preserves_order() {
    let (_env, v1, v2) = two_visors(Duration::from_secs(120)).await;

    let g1 = v1.router.dial_routes(v2.pk, 1, 2).await.unwrap();
    let g2 = v2.router.accept_routes().await.unwrap();

    g1.write(b"abcdef").await.unwrap();

    let mut buf = [0u8; 2];
    let mut collected = Vec::new();
    while collected.len() < 6 {
        let n = tokio::time::timeout(Duration::from_secs(5), g2.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        collected.extend_from_slice(&buf[..n]);
    }
    assert_eq!(collected, b"abcdef");
}

#[tokio::test]
async fn test_three_hop_forward() {
    let env = Env::new();
    let keys: Vec<Keypair> = (0..3).map(|_| Keypair::generate()).collect();
    let chain: Vec<PublicKey> = keys.iter().map(|k| k.public).collect();
    let finder = Arc::new(ChainRouteFinder {
        chain: chain.clone(),
    });

    let mut visors = Vec::new();
    for keypair in keys {
        visors.push(
            env.visor(
                keypair,
                finder.clone(),
                Duration::from_secs(120),
                Vec::new(),
            )
            .await,
        );
    }
    let (a, m, b) = (&visors[0], &visors[1], &visors[2]);

    a.tm.save_transport(m.pk, NetworkType::Memory).await.unwrap();
    m.tm.save_transport(b.pk, NetworkType::Memory).await.unwrap();

    let ga = a.router.dial_routes(b.pk, 7000, 8000).await.unwrap();
    let gb = b.router.accept_routes().await.unwrap();

    // the intermediary holds forwarding state for both directions
    assert!(m.rt.count() >= 2);

    ga.write(b"across").await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), gb.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"across");

    gb.write(b"back").await.unwrap();
    let n = tokio::time::timeout(Duration::from_secs(5), ga.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"back");
}

#[tokio::test]
async fn test_graceful_close() {
    let (_env, v1, v2) = two_visors(Duration::from_secs(120)).await;

    let g1 = v1.router.dial_routes(v2.pk, 7000, 8000).await.unwrap();
    let g2 = v2.router.accept_routes().await.unwrap();

    g1.write(b"last words").await.unwrap();
    g1.close().await;
    g1.close().await; // idempotent

    // buffered payloads drain before the closed pipe surfaces
    let mut buf = [0u8; 32];
    let n = tokio::time::timeout(Duration::from_secs(5), g2.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"last words");

    let err = tokio::time::timeout(Duration::from_secs(5), g2.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RouterError::ClosedPipe));
    assert!(g2.is_closed());

    // neither table still holds rules for the descriptor
    tokio::time::timeout(Duration::from_secs(5), async {
        while v1.rt.count() != 0 || v2.rt.count() != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    // writes on the closed group fail
    assert!(matches!(
        g1.write(b"x").await.unwrap_err(),
        RouterError::ClosedPipe
    ));
}

#[tokio::test]
async fn test_keep_alive_expiry() {
    let (_env, v1, v2) = two_visors(Duration::from_millis(200)).await;

    let g1 = v1.router.dial_routes(v2.pk, 7000, 8000).await.unwrap();
    let g2 = v2.router.accept_routes().await.unwrap();
    let _ = g2;

    // silence the peer without a graceful close: its keep-alives stop
    // refreshing v1's rules, so the activity sweep reclaims them
    v2.tm.close().await;

    tokio::time::timeout(Duration::from_secs(10), async {
        while v1.rt.count() != 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    let mut buf = [0u8; 8];
    let err = tokio::time::timeout(Duration::from_secs(5), g1.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RouterError::ClosedPipe));
}

#[tokio::test]
async fn test_router_close_is_idempotent() {
    let (_env, v1, v2) = two_visors(Duration::from_secs(120)).await;

    let g1 = v1.router.dial_routes(v2.pk, 1, 2).await.unwrap();
    let _g2 = v2.router.accept_routes().await.unwrap();

    v1.router.close().await;
    v1.router.close().await;

    assert!(g1.is_closed());
    assert!(matches!(
        v1.router.accept_routes().await.unwrap_err(),
        RouterError::NotServing
    ));
    assert!(matches!(
        v1.router.dial_routes(v2.pk, 3, 4).await.unwrap_err(),
        RouterError::NotServing
    ));
}

#[tokio::test]
async fn test_introduce_rules_after_close() {
    let (_env, v1, v2) = two_visors(Duration::from_secs(120)).await;

    let g1 = v1.router.dial_routes(v2.pk, 1, 2).await.unwrap();
    let rules_template = g1.descriptor();

    v2.router.close().await;

    let reserved = v1.router.reserve_keys(2).unwrap();
    let rules = skein_routing::EdgeRules {
        desc: rules_template,
        forward: skein_routing::Rule::forward(
            Duration::from_secs(1),
            reserved[0],
            RouteId(99),
            transport_id(v1.pk, v2.pk, NetworkType::Memory),
            rules_template,
        ),
        reverse: skein_routing::Rule::consume(Duration::from_secs(1), reserved[1], rules_template),
    };
    assert!(matches!(
        v2.router.introduce_rules(rules).unwrap_err(),
        RouterError::ClosedPipe
    ));
}

#[tokio::test]
async fn test_setup_gateway_trust() {
    let env = Env::new();
    let setup_keys = Keypair::generate();
    let intruder_keys = Keypair::generate();

    let visor = env
        .visor(
            Keypair::generate(),
            direct_finder(),
            Duration::from_secs(120),
            vec![setup_keys.public],
        )
        .await;

    assert!(visor.router.setup_is_trusted(setup_keys.public));
    assert!(!visor.router.setup_is_trusted(intruder_keys.public));

    // a trusted setup node can reserve ids over the gateway
    let mut conn = env
        .hub
        .underlay(setup_keys.public)
        .dial(visor.pk, AWAIT_SETUP_PORT)
        .await
        .unwrap();
    let ids: Vec<RouteId> = call(&mut conn, METHOD_RESERVE_IDS, &3u8).await.unwrap();
    assert_eq!(ids.len(), 3);

    // an untrusted peer is dropped before any method runs
    let mut conn = env
        .hub
        .underlay(intruder_keys.public)
        .dial(visor.pk, AWAIT_SETUP_PORT)
        .await
        .unwrap();
    let res: RouterResult<Vec<RouteId>> = call(&mut conn, METHOD_RESERVE_IDS, &3u8).await;
    assert!(res.is_err());
}
