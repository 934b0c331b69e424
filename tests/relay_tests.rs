// Relay tests
// Sessions talking through a real relay server on a loopback port.

mod common;
use common::{fast_config, make_mutual, setup_logging, wait_until, TestPeer, ALICE_PHONE, BOB_PHONE};

use std::sync::Arc;
use std::time::Duration;

use heychat::models::{DeliveryStatus, Identity};
use heychat::p2p::relay_transport::RelayTransport;
use heychat::p2p::{ConnectError, LoopbackMedia, SessionManager};
use heychat::relay::RelayServer;

async fn start_relay(backlog: usize) -> String {
    let server = RelayServer::bind("127.0.0.1:0", backlog).await.expect("bind relay");
    let url = format!("ws://{}", server.local_addr().unwrap());
    server.spawn();
    url
}

async fn join(url: &str, phone: &str, name: &str) -> (TestPeer, Arc<RelayTransport>) {
    let address = RelayTransport::random_address();
    let identity = Identity::from_phone(phone, name, address.as_str()).unwrap();
    let (transport, incoming) = RelayTransport::connect(url, &address, name).await.expect("join relay");
    let transport = Arc::new(transport);
    let media = LoopbackMedia::new();
    let session = SessionManager::spawn_with_media(
        identity.clone(),
        transport.clone(),
        incoming,
        fast_config(),
        Box::new(media.clone()),
    );
    (
        TestPeer {
            session,
            identity,
            media,
        },
        transport,
    )
}

async fn wait_for_presence(transport: &RelayTransport, address: &str) {
    wait_until("relay presence", || async move {
        transport.peers().await.iter().any(|peer| peer.address == address)
    })
    .await;
}

#[tokio::test]
async fn test_chat_through_relay() {
    setup_logging();
    let url = start_relay(10).await;
    let (alice, alice_relay) = join(&url, ALICE_PHONE, "Alice").await;
    let (bob, _bob_relay) = join(&url, BOB_PHONE, "Bob").await;
    wait_for_presence(&alice_relay, bob.address()).await;

    make_mutual(&alice, &bob).await;
    let id = alice.session.send_chat(BOB_PHONE, "over the relay").await.unwrap();

    let (a, b) = (&alice, &bob);
    let id = id.as_str();
    wait_until("bob to store the chat", || async move {
        b.session.conversation(ALICE_PHONE).await.iter().any(|m| m.message.id == id)
    })
    .await;
    wait_until("the delivered receipt", || async move {
        a.session
            .conversation(BOB_PHONE)
            .await
            .iter()
            .any(|m| m.message.id == id && m.status == DeliveryStatus::Delivered)
    })
    .await;
}

#[tokio::test]
async fn test_announce_discovers_peers() {
    setup_logging();
    let url = start_relay(10).await;
    let (alice, alice_relay) = join(&url, ALICE_PHONE, "Alice").await;
    let (bob, bob_relay) = join(&url, BOB_PHONE, "Bob").await;
    wait_for_presence(&bob_relay, alice.address()).await;

    alice_relay.announce(alice.session.user_info_frame().await.unwrap()).unwrap();

    let (a, b) = (&alice, &bob);
    wait_until("bob to discover alice", || async move {
        b.session.resolve(ALICE_PHONE).await.as_deref() == Some(a.address())
    })
    .await;
    wait_until("alice to discover bob", || async move {
        a.session.resolve(BOB_PHONE).await.as_deref() == Some(b.address())
    })
    .await;
}

#[tokio::test]
async fn test_backlog_reaches_late_joiner() {
    setup_logging();
    let url = start_relay(10).await;
    let (alice, alice_relay) = join(&url, ALICE_PHONE, "Alice").await;
    alice_relay.announce(alice.session.user_info_frame().await.unwrap()).unwrap();
    // let the relay file the announcement before anyone else arrives
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (bob, _bob_relay) = join(&url, BOB_PHONE, "Bob").await;
    let b = &bob;
    wait_until("bob to discover alice from the backlog", || async move {
        b.session.resolve(ALICE_PHONE).await.is_some()
    })
    .await;
}

#[tokio::test]
async fn test_duplicate_address_is_refused() {
    setup_logging();
    let url = start_relay(10).await;
    let address = RelayTransport::random_address();
    let (_first, _incoming) = RelayTransport::connect(&url, &address, "First").await.unwrap();

    let second = RelayTransport::connect(&url, &address, "Second").await;
    assert!(matches!(second, Err(ConnectError::Refused(_))));
}

#[tokio::test]
async fn test_unknown_address_is_unreachable() {
    setup_logging();
    let url = start_relay(10).await;
    let (alice, _alice_relay) = join(&url, ALICE_PHONE, "Alice").await;

    let result = alice.session.connect("peer-nobody").await;
    assert_eq!(result, Err(ConnectError::Unreachable("peer-nobody".to_string())));
    let own = alice.session.connect(alice.address()).await;
    assert_eq!(own, Err(ConnectError::Refused(alice.address().to_string())));
}

#[tokio::test]
async fn test_leaving_relay_closes_connection() {
    setup_logging();
    let url = start_relay(10).await;
    let (alice, alice_relay) = join(&url, ALICE_PHONE, "Alice").await;
    let (bob, bob_relay) = join(&url, BOB_PHONE, "Bob").await;
    wait_for_presence(&alice_relay, bob.address()).await;
    alice.session.connect(bob.address()).await.unwrap();

    bob_relay.leave();

    let a = &alice;
    wait_until("alice to see bob go offline", || async move {
        a.session
            .discovered_peers()
            .await
            .iter()
            .any(|peer| peer.identity.id == BOB_PHONE && !peer.online)
    })
    .await;
    assert!(alice.session.connections().await.is_empty());
    assert!(alice_relay.peers().await.is_empty());
}

#[tokio::test]
async fn test_relay_unreachable() {
    setup_logging();
    // nothing listens on a port we just released
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let result = RelayTransport::connect(&url, "peer-lonely", "Lonely").await;
    assert!(matches!(result, Err(ConnectError::Unreachable(_))));
}
