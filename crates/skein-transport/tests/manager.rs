//! Transport manager behavior across two live visors.

use skein_crypto::Keypair;
use skein_routing::{Packet, RouteId};
use skein_transport::network::memory::MemoryHub;
use skein_transport::network::Network;
use skein_transport::{
    transport_id, ManagerConfig, MemoryDiscovery, MemoryLogStore, NetworkType, TransportError,
    TransportManager,
};
use std::sync::Arc;
use std::time::Duration;

struct Env {
    m0: Arc<TransportManager>,
    m1: Arc<TransportManager>,
    pk0: skein_crypto::PublicKey,
    pk1: skein_crypto::PublicKey,
}

/// Two managers on one in-memory hub sharing a discovery directory.
async fn two_managers() -> Env {
    let hub = MemoryHub::new();
    let discovery = Arc::new(MemoryDiscovery::new());

    let mut managers = Vec::new();
    let mut pks = Vec::new();
    for _ in 0..2 {
        let keys = Keypair::generate();
        pks.push(keys.public);
        let network = Arc::new(
            Network::new(keys.public).with_underlay(hub.underlay(keys.public)),
        );
        let manager = TransportManager::new(
            network,
            ManagerConfig {
                keys,
                discovery: discovery.clone(),
                log_store: Arc::new(MemoryLogStore::new()),
            },
        );
        manager.serve().await;
        managers.push(manager);
    }

    let m1 = managers.pop().unwrap();
    let m0 = managers.pop().unwrap();
    Env {
        m0,
        m1,
        pk0: pks[0],
        pk1: pks[1],
    }
}

#[tokio::test]
async fn test_packet_roundtrip() {
    let env = two_managers().await;

    let tp = env
        .m1
        .save_transport(env.pk0, NetworkType::Memory)
        .await
        .unwrap();
    assert!(tp.is_serving());

    let packet = Packet::data(RouteId(42), vec![1, 2, 3]).unwrap();
    tp.write_packet(&packet).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), env.m0.read_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, packet);
}

#[tokio::test]
async fn test_transport_uniqueness() {
    let env = two_managers().await;

    let first = env
        .m1
        .save_transport(env.pk0, NetworkType::Memory)
        .await
        .unwrap();
    let second = env
        .m1
        .save_transport(env.pk0, NetworkType::Memory)
        .await
        .unwrap();
    assert_eq!(first.entry().id, second.entry().id);
    assert!(Arc::ptr_eq(&first, &second));

    // both managers converge on the symmetric id
    let id = transport_id(env.pk0, env.pk1, NetworkType::Memory);
    assert_eq!(first.entry().id, id);

    // the accept side eventually holds the same transport
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if env.m0.transport(id).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_stale_transport_retry() {
    let env = two_managers().await;

    let stale = env
        .m1
        .save_transport(env.pk0, NetworkType::Memory)
        .await
        .unwrap();
    stale.close().await;

    // the stale entry answers NotServing; one retry yields a fresh link
    let fresh = env
        .m1
        .save_transport(env.pk0, NetworkType::Memory)
        .await
        .unwrap();
    assert!(fresh.is_serving());
    assert!(!Arc::ptr_eq(&stale, &fresh));
}

#[tokio::test]
async fn test_read_packet_after_close() {
    let env = two_managers().await;
    env.m0.close().await;
    let err = env.m0.read_packet().await.unwrap_err();
    assert!(matches!(err, TransportError::NotServing));

    // close is idempotent
    env.m0.close().await;
}

#[tokio::test]
async fn test_save_transport_after_close() {
    let env = two_managers().await;
    env.m1.close().await;
    let err = env
        .m1
        .save_transport(env.pk0, NetworkType::Memory)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NotServing));
}

#[tokio::test]
async fn test_unknown_network_rejected() {
    let env = two_managers().await;
    let err = env
        .m1
        .save_transport(env.pk0, NetworkType::Tcp)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::UnknownNetwork(_)));
}
