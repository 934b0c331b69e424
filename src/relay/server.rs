use bounded_vec_deque::BoundedVecDeque;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

use super::{ClientFrame, Delivery, PresenceEntry, RelayError, ServerFrame};

type Tx = mpsc::UnboundedSender<Message>;

struct Peer {
    display_name: String,
    tx: Tx,
}

struct RelayState {
    peers: HashMap<String, Peer>,
    backlog: BoundedVecDeque<Delivery>,
}

impl RelayState {
    fn presence(&self) -> Vec<PresenceEntry> {
        let mut peers: Vec<PresenceEntry> = self
            .peers
            .iter()
            .map(|(address, peer)| PresenceEntry {
                address: address.clone(),
                display_name: peer.display_name.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    fn broadcast_presence(&self) {
        let frame = ServerFrame::Presence { peers: self.presence() };
        for peer in self.peers.values() {
            push(&peer.tx, &frame);
        }
    }
}

type SharedState = Arc<TokioMutex<RelayState>>;

fn push(tx: &Tx, frame: &ServerFrame) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            if tx.send(Message::Text(json)).is_err() {
                debug!("Relay client went away before a frame could be queued");
            }
        }
        Err(e) => error!("Could not encode relay frame: {}", e),
    }
}

/// WebSocket relay between transport addresses.
pub struct RelayServer {
    listener: TcpListener,
    state: SharedState,
}

impl RelayServer {
    pub async fn bind(addr: &str, backlog_limit: usize) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            state: Arc::new(TokioMutex::new(RelayState {
                peers: HashMap::new(),
                backlog: BoundedVecDeque::new(backlog_limit.max(1)),
            })),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<(), RelayError> {
        loop {
            let (stream, remote) = self.listener.accept().await?;
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(state, stream).await {
                    warn!("Relay connection from {} ended with error: {}", remote, e);
                }
            });
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<(), RelayError>> {
        tokio::spawn(self.run())
    }
}

async fn handle_connection(state: SharedState, stream: TcpStream) -> Result<(), RelayError> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = write.send(message).await {
                debug!("Relay write failed: {}", e);
                break;
            }
        }
    });

    let mut joined: Option<String> = None;
    while let Some(message) = read.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Relay read failed for {:?}: {}", joined, e);
                break;
            }
        };
        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Relay got an invalid frame from {:?}: {}", joined, e);
                push(&tx, &ServerFrame::Error {
                    reason: format!("invalid frame: {}", e),
                });
                continue;
            }
        };

        match frame {
            ClientFrame::Join { address, display_name } => {
                if joined.is_some() {
                    push(&tx, &ServerFrame::Error {
                        reason: "already joined".to_string(),
                    });
                    continue;
                }
                let mut state = state.lock().await;
                if state.peers.contains_key(&address) {
                    warn!("Relay refused duplicate address {}", address);
                    push(&tx, &ServerFrame::Error {
                        reason: format!("address {} is already in use", address),
                    });
                    continue;
                }
                info!("{} ({}) joined the relay", address, display_name);
                state.peers.insert(
                    address.clone(),
                    Peer {
                        display_name,
                        tx: tx.clone(),
                    },
                );
                let frames: Vec<Delivery> = state.backlog.iter().cloned().collect();
                if !frames.is_empty() {
                    push(&tx, &ServerFrame::Backlog { frames });
                }
                state.broadcast_presence();
                joined = Some(address);
            }
            ClientFrame::Send { to, data } => {
                let Some(from) = joined.clone() else {
                    push(&tx, &ServerFrame::Error {
                        reason: "join before sending".to_string(),
                    });
                    continue;
                };
                let delivery = Delivery {
                    from: from.clone(),
                    data,
                    timestamp: Utc::now(),
                };
                let mut state = state.lock().await;
                match to {
                    Some(to) => match state.peers.get(&to) {
                        Some(peer) => push(&peer.tx, &ServerFrame::Deliver(delivery)),
                        None => {
                            debug!("Relay cannot deliver from {} to {}", from, to);
                            push(&tx, &ServerFrame::Undeliverable { to });
                        }
                    },
                    None => {
                        let frame = ServerFrame::Deliver(delivery.clone());
                        for (address, peer) in state.peers.iter() {
                            if *address != from {
                                push(&peer.tx, &frame);
                            }
                        }
                        state.backlog.push_back(delivery);
                    }
                }
            }
            ClientFrame::Hangup { to } => {
                let Some(from) = joined.clone() else {
                    continue;
                };
                let state = state.lock().await;
                if let Some(peer) = state.peers.get(&to) {
                    push(&peer.tx, &ServerFrame::Hangup { from });
                }
            }
        }
    }

    if let Some(address) = joined {
        let mut state = state.lock().await;
        state.peers.remove(&address);
        info!("{} left the relay", address);
        state.broadcast_presence();
    }
    drop(tx);
    writer.abort();
    Ok(())
}
