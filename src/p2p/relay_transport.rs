// Transport over the heychat relay
//
// A single WebSocket to the relay is multiplexed into one `PeerLink` per
// remote address. Frames from an address we have no link with open an
// incoming link; a link closes on hangup, undeliverable, or the peer leaving
// the relay.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use super::transport::{ConnectError, PeerLink, Transport};
use crate::relay::{ClientFrame, Delivery, PresenceEntry, ServerFrame};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const INCOMING_BACKLOG: usize = 64;

// address -> (link id, sender feeding that link's receiver)
type Links = Arc<TokioMutex<HashMap<String, (u64, mpsc::UnboundedSender<String>)>>>;

#[derive(Clone)]
struct RelayLinks {
    address: String,
    outbound: mpsc::UnboundedSender<WsMessage>,
    links: Links,
    presence: Arc<TokioMutex<Vec<PresenceEntry>>>,
    next_link: Arc<AtomicU64>,
}

impl RelayLinks {
    fn push(&self, frame: &ClientFrame) -> Result<(), ConnectError> {
        let json = serde_json::to_string(frame).map_err(|e| {
            error!("Could not encode relay frame: {}", e);
            ConnectError::Closed
        })?;
        self.outbound
            .send(WsMessage::Text(json))
            .map_err(|_| ConnectError::Closed)
    }

    /// Create a link to `peer`, optionally preloaded with a first frame.
    async fn new_link(&self, peer: &str, first: Option<String>) -> PeerLink {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let link_id = self.next_link.fetch_add(1, Ordering::Relaxed);
        if let Some(frame) = first {
            let _ = in_tx.send(frame);
        }
        self.links.lock().await.insert(peer.to_string(), (link_id, in_tx));

        let relay = self.clone();
        let remote = peer.to_string();
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                let frame = ClientFrame::Send {
                    to: Some(remote.clone()),
                    data,
                };
                if relay.push(&frame).is_err() {
                    break;
                }
            }
            // the session dropped its end; tell the peer unless the link is already gone
            let mut links = relay.links.lock().await;
            if links.get(&remote).map(|(id, _)| *id) == Some(link_id) {
                links.remove(&remote);
                let _ = relay.push(&ClientFrame::Hangup { to: remote.clone() });
                debug!("Hung up relay link to {}", remote);
            }
        });

        PeerLink {
            peer_address: peer.to_string(),
            sender: out_tx,
            receiver: in_rx,
        }
    }

    async fn drop_link(&self, peer: &str) {
        if self.links.lock().await.remove(peer).is_some() {
            debug!("Relay link to {} closed by the remote side", peer);
        }
    }

    async fn deliver(&self, delivery: Delivery, incoming: &mpsc::Sender<PeerLink>) {
        if delivery.from == self.address {
            return;
        }
        let mut data = delivery.data;
        {
            let links = self.links.lock().await;
            if let Some((_, tx)) = links.get(&delivery.from) {
                match tx.send(data) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(returned)) => data = returned,
                }
            }
        }

        debug!("New incoming relay link from {}", delivery.from);
        let link = self.new_link(&delivery.from, Some(data)).await;
        if incoming.send(link).await.is_err() {
            warn!("Session is no longer accepting links; dropping frame from {}", delivery.from);
            self.drop_link(&delivery.from).await;
        }
    }

    async fn update_presence(&self, peers: Vec<PresenceEntry>) {
        let mut links = self.links.lock().await;
        let gone: Vec<String> = links
            .keys()
            .filter(|address| !peers.iter().any(|peer| &peer.address == *address))
            .cloned()
            .collect();
        for address in gone {
            info!("{} left the relay", address);
            links.remove(&address);
        }
        drop(links);
        *self.presence.lock().await = peers;
    }
}

/// `Transport` backed by a relay server.
pub struct RelayTransport {
    relay: RelayLinks,
}

impl RelayTransport {
    /// A fresh transport address, like a throwaway peer id.
    pub fn random_address() -> String {
        format!("peer-{}", uuid::Uuid::new_v4().simple())
    }

    /// Join the relay at `url` as `address`. Resolves once the relay has
    /// accepted us and sent its first presence list.
    pub async fn connect(
        url: &str,
        address: &str,
        display_name: &str,
    ) -> Result<(Self, mpsc::Receiver<PeerLink>), ConnectError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ConnectError::Unreachable(format!("{} ({})", url, e)))?;
        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_BACKLOG);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = write.send(message).await {
                    error!("Relay write failed: {}", e);
                    break;
                }
            }
        });

        let relay = RelayLinks {
            address: address.to_string(),
            outbound,
            links: Arc::new(TokioMutex::new(HashMap::new())),
            presence: Arc::new(TokioMutex::new(Vec::new())),
            next_link: Arc::new(AtomicU64::new(1)),
        };

        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), ConnectError>>();
        let reader = relay.clone();
        tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            while let Some(message) = read.next().await {
                let text = match message {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        error!("Relay read failed: {}", e);
                        break;
                    }
                };
                let frame = match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Ignoring unreadable relay frame: {}", e);
                        continue;
                    }
                };
                match frame {
                    ServerFrame::Presence { peers } => {
                        reader.update_presence(peers).await;
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(Ok(()));
                        }
                    }
                    ServerFrame::Deliver(delivery) => reader.deliver(delivery, &incoming_tx).await,
                    ServerFrame::Backlog { frames } => {
                        debug!("Replaying {} backlog frame(s)", frames.len());
                        for delivery in frames {
                            reader.deliver(delivery, &incoming_tx).await;
                        }
                    }
                    ServerFrame::Hangup { from } => reader.drop_link(&from).await,
                    ServerFrame::Undeliverable { to } => {
                        warn!("Relay could not deliver to {}", to);
                        reader.drop_link(&to).await;
                    }
                    ServerFrame::Error { reason } => {
                        warn!("Relay error: {}", reason);
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(Err(ConnectError::Refused(reason)));
                        }
                    }
                }
            }
            info!("Relay connection closed");
            reader.links.lock().await.clear();
        });

        relay.push(&ClientFrame::Join {
            address: address.to_string(),
            display_name: display_name.to_string(),
        })?;

        match tokio::time::timeout(JOIN_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                info!("Joined relay {} as {}", url, address);
                Ok((Self { relay }, incoming_rx))
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(ConnectError::Refused(url.to_string())),
            Err(_) => Err(ConnectError::Timeout(url.to_string())),
        }
    }

    /// Everyone else currently on the relay.
    pub async fn peers(&self) -> Vec<PresenceEntry> {
        self.relay
            .presence
            .lock()
            .await
            .iter()
            .filter(|peer| peer.address != self.relay.address)
            .cloned()
            .collect()
    }

    /// Broadcast a frame to everyone on the relay, e.g. our encoded UserInfo.
    pub fn announce(&self, data: String) -> Result<(), ConnectError> {
        self.relay.push(&ClientFrame::Send { to: None, data })
    }

    /// Close the relay connection. Everyone else sees us leave presence,
    /// which closes their links to us.
    pub fn leave(&self) {
        if self.relay.outbound.send(WsMessage::Close(None)).is_ok() {
            info!("Leaving relay as {}", self.relay.address);
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn local_address(&self) -> String {
        self.relay.address.clone()
    }

    fn replaces_links(&self) -> bool {
        true
    }

    async fn open(&self, address: &str) -> Result<PeerLink, ConnectError> {
        if address == self.relay.address {
            return Err(ConnectError::Refused(address.to_string()));
        }
        let present = self
            .relay
            .presence
            .lock()
            .await
            .iter()
            .any(|peer| peer.address == address);
        if !present {
            return Err(ConnectError::Unreachable(address.to_string()));
        }
        Ok(self.relay.new_link(address, None).await)
    }
}
