// Transport abstraction for the session layer
// Any reliable, ordered, point-to-point frame channel can carry a session.

use async_trait::async_trait;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of a listener's pending-accept queue in the in-memory network.
const ACCEPT_BACKLOG: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Timed out connecting to {0}")]
    Timeout(String),
    #[error("Connection to {0} was refused")]
    Refused(String),
    #[error("Address {0} is unreachable")]
    Unreachable(String),
    #[error("Connect to {0} was cancelled")]
    Cancelled(String),
    #[error("Session is shut down")]
    Closed,
}

/// One live link to a peer address.
///
/// Outbound frames go through `sender`; inbound frames arrive on `receiver`
/// in the order the peer sent them. The link is closed once `receiver`
/// yields `None`. Dropping `sender` closes it for the remote side.
#[derive(Debug)]
pub struct PeerLink {
    pub peer_address: String,
    pub sender: mpsc::UnboundedSender<String>,
    pub receiver: mpsc::UnboundedReceiver<String>,
}

impl PeerLink {
    /// Two cross-wired ends of one link.
    pub fn pair(a_address: &str, b_address: &str) -> (PeerLink, PeerLink) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            PeerLink {
                peer_address: b_address.to_string(),
                sender: b_tx,
                receiver: a_rx,
            },
            PeerLink {
                peer_address: a_address.to_string(),
                sender: a_tx,
                receiver: b_rx,
            },
        )
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The address other peers use to reach us.
    fn local_address(&self) -> String;

    /// Open a link to `address`. Timeouts are applied by the caller.
    async fn open(&self, address: &str) -> Result<PeerLink, ConnectError>;

    /// True when every address has one underlying channel, so a newer link
    /// to it supersedes the older one. Otherwise links are independent and
    /// two peers dialing each other end up with one link per direction.
    fn replaces_links(&self) -> bool {
        false
    }
}

/// An in-process network of addressable listeners.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<PeerLink>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `address` and get the transport plus its accept queue.
    pub fn bind(&self, address: &str) -> Result<(MemoryTransport, mpsc::Receiver<PeerLink>), ConnectError> {
        let mut listeners = self.listeners.lock().map_err(|_| ConnectError::Closed)?;
        if let Some(existing) = listeners.get(address) {
            if !existing.is_closed() {
                return Err(ConnectError::Refused(address.to_string()));
            }
        }
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        listeners.insert(address.to_string(), tx);
        info!("Bound in-memory address {}", address);

        Ok((
            MemoryTransport {
                address: address.to_string(),
                network: self.clone(),
            },
            rx,
        ))
    }

    pub fn unbind(&self, address: &str) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(address);
        }
    }
}

pub struct MemoryTransport {
    address: String,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_address(&self) -> String {
        self.address.clone()
    }

    async fn open(&self, address: &str) -> Result<PeerLink, ConnectError> {
        let listener = {
            let listeners = self.network.listeners.lock().map_err(|_| ConnectError::Closed)?;
            listeners.get(address).cloned()
        };
        let listener = listener.ok_or_else(|| ConnectError::Unreachable(address.to_string()))?;

        let (local, remote) = PeerLink::pair(&self.address, address);
        listener
            .send(remote)
            .await
            .map_err(|_| ConnectError::Refused(address.to_string()))?;
        debug!("Opened in-memory link {} -> {}", self.address, address);
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_links_are_cross_wired() {
        let network = MemoryNetwork::new();
        let (a, _a_incoming) = network.bind("a").unwrap();
        let (_b, mut b_incoming) = network.bind("b").unwrap();

        let mut a_link = a.open("b").await.unwrap();
        let mut b_link = b_incoming.recv().await.unwrap();
        assert_eq!(a_link.peer_address, "b");
        assert_eq!(b_link.peer_address, "a");

        a_link.sender.send("one".to_string()).unwrap();
        a_link.sender.send("two".to_string()).unwrap();
        assert_eq!(b_link.receiver.recv().await.as_deref(), Some("one"));
        assert_eq!(b_link.receiver.recv().await.as_deref(), Some("two"));

        b_link.sender.send("back".to_string()).unwrap();
        assert_eq!(a_link.receiver.recv().await.as_deref(), Some("back"));

        drop(a_link);
        assert_eq!(b_link.receiver.recv().await, None);
    }

    #[tokio::test]
    async fn test_open_errors() {
        let network = MemoryNetwork::new();
        let (a, _a_incoming) = network.bind("a").unwrap();
        assert_eq!(a.open("nowhere").await.unwrap_err(), ConnectError::Unreachable("nowhere".to_string()));

        let (_b, b_incoming) = network.bind("b").unwrap();
        drop(b_incoming);
        assert_eq!(a.open("b").await.unwrap_err(), ConnectError::Refused("b".to_string()));
    }

    #[test]
    fn test_address_cannot_be_bound_twice() {
        let network = MemoryNetwork::new();
        let (_a, _incoming) = network.bind("a").unwrap();
        assert!(network.bind("a").is_err());
    }
}
