// Common test utilities for integration tests
// In-memory peers, polling helpers and event recorders shared by all test files
#![allow(dead_code)]

use log::{info, LevelFilter};
use std::future::Future;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use chrono::Utc;
use heychat::models::{ContactStatus, Identity, Message, MessageKind, Payload, UserInfo};
use heychat::p2p::codec;
use heychat::p2p::{LoopbackMedia, MemoryNetwork, PeerLink, SessionConfig, SessionManager, Transport};
use tokio::sync::mpsc;

pub const ALICE_PHONE: &str = "+94712345678";
pub const BOB_PHONE: &str = "+94779876543";
pub const CAROL_PHONE: &str = "+94701112233";

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// Short timeouts so failure paths finish quickly.
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_secs(2),
        call_timeout: Duration::from_millis(300),
        call_check_interval: Duration::from_millis(20),
        ..SessionConfig::default()
    }
}

/// One local identity running on the in-memory network.
pub struct TestPeer {
    pub session: SessionManager,
    pub identity: Identity,
    pub media: LoopbackMedia,
}

impl TestPeer {
    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn address(&self) -> &str {
        &self.identity.address
    }
}

pub fn spawn_peer(network: &MemoryNetwork, phone: &str, name: &str, address: &str) -> TestPeer {
    spawn_peer_with(network, phone, name, address, fast_config(), LoopbackMedia::new())
}

pub fn spawn_peer_with(
    network: &MemoryNetwork,
    phone: &str,
    name: &str,
    address: &str,
    config: SessionConfig,
    media: LoopbackMedia,
) -> TestPeer {
    let identity = Identity::from_phone(phone, name, address).expect("valid test phone");
    let (transport, incoming) = network.bind(address).expect("address is free");
    let session = SessionManager::spawn_with_media(
        identity.clone(),
        Arc::new(transport),
        incoming,
        config,
        Box::new(media.clone()),
    );
    info!("Spawned test peer {} at {}", identity.id, address);
    TestPeer {
        session,
        identity,
        media,
    }
}

/// Poll `condition` until it holds, panicking after a few seconds.
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if condition().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Connect `a` to `b` and run the contact handshake until both edges are Mutual.
pub async fn make_mutual(a: &TestPeer, b: &TestPeer) {
    a.session.connect(b.address()).await.expect("connect");
    wait_until("both sides to be identified", || async move {
        a.session.resolve(b.id()).await.is_some() && b.session.resolve(a.id()).await.is_some()
    })
    .await;

    a.session.request_contact(b.id()).await.expect("contact request");
    wait_until("the request to arrive", || async move {
        b.session.contact_status(a.id()).await == Some(ContactStatus::RequestedByThem)
    })
    .await;

    b.session.accept_contact(a.id()).await.expect("contact accept");
    wait_until("both edges to be mutual", || async move {
        a.session.contact_status(b.id()).await == Some(ContactStatus::Mutual)
            && b.session.contact_status(a.id()).await == Some(ContactStatus::Mutual)
    })
    .await;
}

/// Collects whatever a listener callback sees.
pub struct Recorder<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn callback(&self) -> impl Fn(&T) + Send + 'static {
        let items = self.items.clone();
        move |item: &T| items.lock().unwrap().push(item.clone())
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

/// A hand-driven peer that writes raw frames, for exercising what a
/// well-behaved session would never send.
pub struct RawPeer {
    pub identity: Identity,
    pub link: PeerLink,
    _incoming: mpsc::Receiver<PeerLink>,
}

impl RawPeer {
    /// Open a link to `target` without introducing ourselves yet.
    pub async fn open(network: &MemoryNetwork, phone: &str, name: &str, address: &str, target: &str) -> RawPeer {
        let identity = Identity::from_phone(phone, name, address).expect("valid test phone");
        let (transport, incoming) = network.bind(address).expect("address is free");
        let link = transport.open(target).await.expect("target is listening");
        RawPeer {
            identity,
            link,
            _incoming: incoming,
        }
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn message(&self, recipient: Option<&str>, payload: Payload) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            sender: self.identity.id.clone(),
            sender_display_name: self.identity.display_name.clone(),
            recipient: recipient.map(str::to_string),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn send(&self, message: &Message) {
        self.send_frame(&codec::encode(message).expect("encodable message"));
    }

    pub fn send_frame(&self, frame: &str) {
        self.link.sender.send(frame.to_string()).expect("link is open");
    }

    pub fn introduce(&self) {
        self.send(&self.message(None, Payload::UserInfo(UserInfo::from(&self.identity))));
    }

    /// Stop taking frames from the session while still able to send.
    pub fn stop_reading(&mut self) {
        let (_, closed) = mpsc::unbounded_channel();
        self.link.receiver = closed;
    }

    /// Wait for the session to drop our link, discarding whatever it sent.
    pub async fn wait_for_close(&mut self) {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            match tokio::time::timeout_at(deadline, self.link.receiver.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return,
                Err(_) => panic!("Timed out waiting for {} to be disconnected", self.identity.id),
            }
        }
    }

    /// Next frame of `kind` the session sent us, skipping everything else.
    pub async fn next_of_kind(&mut self, kind: MessageKind) -> Message {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let frame = tokio::time::timeout_at(deadline, self.link.receiver.recv())
                .await
                .unwrap_or_else(|_| panic!("Timed out waiting for {}", kind))
                .expect("link closed");
            let message = codec::decode(&frame).expect("session sends valid frames");
            if message.kind() == kind {
                return message;
            }
        }
    }
}
