//! Settlement handshake over a live in-memory underlay.

use skein_crypto::Keypair;
use skein_transport::handshake::settle;
use skein_transport::network::memory::MemoryHub;
use skein_transport::network::Underlay;
use skein_transport::TRANSPORT_PORT;

#[tokio::test]
async fn test_settlement_handshake() {
    let hub = MemoryHub::new();
    let a = Keypair::generate();
    let b = Keypair::generate();

    let mut lis = hub
        .underlay(b.public)
        .listen(TRANSPORT_PORT)
        .await
        .unwrap();

    let responder_secret = b.secret.clone();
    let responder = tokio::spawn(async move {
        let mut conn = lis.accept().await.unwrap();
        settle(&mut conn, &responder_secret, false).await
    });

    let mut conn = hub
        .underlay(a.public)
        .dial(b.public, TRANSPORT_PORT)
        .await
        .unwrap();
    let initiator_entry = settle(&mut conn, &a.secret, true).await.unwrap();
    let responder_entry = responder.await.unwrap().unwrap();

    // both sides agree on the entry and hold both signatures
    assert_eq!(initiator_entry.entry, responder_entry.entry);
    assert!(initiator_entry.signatures.iter().all(Option::is_some));
    assert!(responder_entry.signatures.iter().all(Option::is_some));
}

#[tokio::test]
async fn test_settlement_symmetry() {
    // a handshake with roles mirrored settles on the same transport id
    let hub = MemoryHub::new();
    let a = Keypair::generate();
    let b = Keypair::generate();

    let mut first_id = None;
    for (dialer, acceptor) in [(&a, &b), (&b, &a)] {
        let mut lis = hub
            .underlay(acceptor.public)
            .listen(TRANSPORT_PORT)
            .await
            .unwrap();

        let secret = acceptor.secret.clone();
        let responder = tokio::spawn(async move {
            let mut conn = lis.accept().await.unwrap();
            settle(&mut conn, &secret, false).await
        });

        let mut conn = hub
            .underlay(dialer.public)
            .dial(acceptor.public, TRANSPORT_PORT)
            .await
            .unwrap();
        let signed = settle(&mut conn, &dialer.secret, true).await.unwrap();
        responder.await.unwrap().unwrap();

        match first_id {
            None => first_id = Some(signed.entry.id),
            Some(id) => assert_eq!(signed.entry.id, id),
        }
    }
}
