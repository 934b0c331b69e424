// Peer session layer for heychat
// Discovery, connection lifecycle, contacts, messaging and call signaling
// over any `Transport`. Feature modules extend `SessionManager` with their
// own operations.

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub mod call;
pub mod chat_states;
pub mod codec;
pub mod contacts;
pub mod delivery_receipts;
pub mod listeners;
pub mod media;
pub mod registry;
pub mod relay_transport;
pub mod store;
pub mod transport;
mod session;

pub use call::{CallEndReason, CallError, CallEvent, CallSession};
pub use chat_states::TypingStatus;
pub use contacts::ContactError;
pub use listeners::ListenerId;
pub use media::{LoopbackMedia, MediaEngine, MediaError};
pub use registry::PeerRecord;
pub use store::StoredMessage;
pub use transport::{ConnectError, MemoryNetwork, MemoryTransport, PeerLink, Transport};

use crate::models::{ContactEdge, Identity, Message, MessageKind, Payload};
use session::{BeginConnect, Event, SessionActor};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Window for transport open plus the UserInfo handshake.
    pub connect_timeout: Duration,
    /// How long a call may sit in Ringing or Connecting without progress.
    pub call_timeout: Duration,
    pub call_check_interval: Duration,
    /// Frames kept per connection until the peer identifies itself. A peer
    /// that sends more than this first is disconnected.
    pub max_buffered_frames: usize,
    /// Message ids remembered per sender for duplicate suppression.
    pub dedup_window: usize,
    pub send_delivery_receipts: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            call_timeout: call::DEFAULT_CALL_TIMEOUT,
            call_check_interval: Duration::from_secs(1),
            max_buffered_frames: 64,
            dedup_window: 256,
            send_delivery_receipts: true,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendFailure {
    #[error("No open connection to {0}")]
    NotConnected(String),
    #[error("{0} is not a mutual contact")]
    NotMutualContact(String),
    #[error("Session is shut down")]
    Closed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Session is shut down")]
pub struct SessionClosed;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot belongs to {found}, not {expected}")]
    IdentityMismatch { expected: String, found: String },
    #[error("Session is shut down")]
    Closed,
}

/// Everything worth persisting across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub local_id: String,
    pub contacts: Vec<ContactEdge>,
    pub conversations: BTreeMap<String, Vec<StoredMessage>>,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// `None` until a link exists.
    pub connection_id: Option<u64>,
    pub peer_address: String,
    pub remote_identity: Option<String>,
    pub state: ConnectionState,
}

struct Inner {
    local_id: String,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<Event>,
    config: SessionConfig,
    // replaced on every disconnect_all so later connects are unaffected
    cancel: Mutex<CancellationToken>,
}

/// Handle to the session of one local identity. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Start the session actor. `incoming` carries links other peers opened
    /// to us. Must be called inside a tokio runtime.
    pub fn spawn(
        local: Identity,
        transport: Arc<dyn Transport>,
        incoming: mpsc::Receiver<PeerLink>,
        config: SessionConfig,
    ) -> Self {
        Self::spawn_with_media(local, transport, incoming, config, Box::new(LoopbackMedia::new()))
    }

    pub fn spawn_with_media(
        mut local: Identity,
        transport: Arc<dyn Transport>,
        incoming: mpsc::Receiver<PeerLink>,
        config: SessionConfig,
        media: Box<dyn MediaEngine>,
    ) -> Self {
        local.address = transport.local_address();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let actor = SessionActor::new(local.clone(), transport.clone(), config.clone(), events_tx.clone(), media);
        tokio::spawn(actor.run(events_rx, incoming));

        Self {
            inner: Arc::new(Inner {
                local_id: local.id,
                transport,
                events: events_tx,
                config,
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Run `f` on the actor and wait for its result.
    pub(crate) async fn invoke<R, F>(&self, f: F) -> Result<R, SessionClosed>
    where
        F: FnOnce(&mut SessionActor) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = Box::new(move |actor: &mut SessionActor| {
            let _ = tx.send(f(actor));
        });
        self.inner.events.send(Event::Invoke(job)).map_err(|_| SessionClosed)?;
        rx.await.map_err(|_| SessionClosed)
    }

    fn cancel_token(&self) -> CancellationToken {
        self.inner
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Open a connection to `address` and wait until the peer has identified
    /// itself. An address with an open, identified connection is returned as is.
    pub async fn connect(&self, address: &str) -> Result<ConnectionInfo, ConnectError> {
        let cancel = self.cancel_token();
        let target = address.to_string();
        let begin = self
            .invoke(move |actor| actor.begin_connect(&target))
            .await
            .map_err(|_| ConnectError::Closed)?;

        let attempt = async {
            match begin {
                BeginConnect::Existing(info) => Ok(info),
                BeginConnect::Handshake(waiter) => waiter
                    .await
                    .unwrap_or_else(|_| Err(ConnectError::Refused(address.to_string()))),
                BeginConnect::Started => self.open_and_handshake(address).await,
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ConnectError::Cancelled(address.to_string())),
            outcome = tokio::time::timeout(self.inner.config.connect_timeout, attempt) => match outcome {
                Ok(result) => result,
                Err(_) => Err(ConnectError::Timeout(address.to_string())),
            },
        };

        match &result {
            Ok(info) => info!("Connected to {:?} at {}", info.remote_identity, address),
            Err(e) => {
                let target = address.to_string();
                let reason = e.clone();
                let _ = self.invoke(move |actor| actor.abort_connect(&target, &reason)).await;
            }
        }
        result
    }

    async fn open_and_handshake(&self, address: &str) -> Result<ConnectionInfo, ConnectError> {
        let link = self.inner.transport.open(address).await?;
        let handshake = self
            .invoke(move |actor| actor.attach_outgoing(link))
            .await
            .map_err(|_| ConnectError::Closed)?;
        handshake
            .await
            .unwrap_or_else(|_| Err(ConnectError::Refused(address.to_string())))
    }

    /// Close every connection and cancel connects still in flight.
    pub async fn disconnect_all(&self) {
        {
            let mut cancel = self.inner.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            cancel.cancel();
            *cancel = CancellationToken::new();
        }
        let _ = self.invoke(|actor| actor.close_all("disconnect requested")).await;
    }

    /// Send to an identified peer. Chat content requires a mutual contact.
    /// Returns the message id.
    pub async fn send(&self, recipient: &str, payload: Payload) -> Result<String, SendFailure> {
        let recipient = recipient.to_string();
        self.invoke(move |actor| actor.send(&recipient, payload))
            .await
            .map_err(|_| SendFailure::Closed)?
    }

    pub async fn send_chat(&self, recipient: &str, text: &str) -> Result<String, SendFailure> {
        self.send(recipient, Payload::chat(text)).await
    }

    /// Send to every open connection. Returns how many received it.
    pub async fn broadcast(&self, payload: Payload) -> Result<usize, SessionClosed> {
        self.invoke(move |actor| actor.broadcast(payload)).await
    }

    pub async fn on_message<F>(&self, kind: Option<MessageKind>, callback: F) -> Result<ListenerId, SessionClosed>
    where
        F: Fn(&Message) + Send + 'static,
    {
        self.invoke(move |actor| {
            let id = actor.listeners.next_id();
            actor.listeners.messages.add(
                id,
                Box::new(move |message: &Message| {
                    if kind.map_or(true, |kind| message.kind() == kind) {
                        callback(message)
                    }
                }),
            );
            id
        })
        .await
    }

    pub async fn on_connection_change<F>(&self, callback: F) -> Result<ListenerId, SessionClosed>
    where
        F: Fn(&ConnectionInfo) + Send + 'static,
    {
        self.invoke(move |actor| {
            let id = actor.listeners.next_id();
            actor.listeners.connections.add(id, Box::new(callback));
            id
        })
        .await
    }

    pub async fn on_contact_change<F>(&self, callback: F) -> Result<ListenerId, SessionClosed>
    where
        F: Fn(&ContactEdge) + Send + 'static,
    {
        self.invoke(move |actor| {
            let id = actor.listeners.next_id();
            actor.listeners.contacts.add(id, Box::new(callback));
            id
        })
        .await
    }

    pub async fn on_peer_discovered<F>(&self, callback: F) -> Result<ListenerId, SessionClosed>
    where
        F: Fn(&PeerRecord) + Send + 'static,
    {
        self.invoke(move |actor| {
            let id = actor.listeners.next_id();
            actor.listeners.peers.add(id, Box::new(callback));
            id
        })
        .await
    }

    pub async fn on_call_event<F>(&self, callback: F) -> Result<ListenerId, SessionClosed>
    where
        F: Fn(&CallEvent) + Send + 'static,
    {
        self.invoke(move |actor| {
            let id = actor.listeners.next_id();
            actor.listeners.calls.add(id, Box::new(callback));
            id
        })
        .await
    }

    /// Returns false if the listener was already gone.
    pub async fn unsubscribe(&self, id: ListenerId) -> bool {
        self.invoke(move |actor| actor.listeners.remove(id)).await.unwrap_or(false)
    }

    pub async fn resolve(&self, id: &str) -> Option<String> {
        let id = id.to_string();
        self.invoke(move |actor| actor.registry.resolve(&id).map(str::to_string))
            .await
            .ok()
            .flatten()
    }

    pub async fn discovered_peers(&self) -> Vec<PeerRecord> {
        self.invoke(|actor| actor.registry.peers()).await.unwrap_or_default()
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.invoke(|actor| actor.connections()).await.unwrap_or_default()
    }

    pub async fn conversation(&self, contact_id: &str) -> Vec<StoredMessage> {
        let contact_id = contact_id.to_string();
        self.invoke(move |actor| actor.store.get(&contact_id).to_vec())
            .await
            .unwrap_or_default()
    }

    pub async fn conversation_ids(&self) -> Vec<String> {
        self.invoke(|actor| actor.store.conversation_ids()).await.unwrap_or_default()
    }

    pub async fn local_identity(&self) -> Result<Identity, SessionClosed> {
        self.invoke(|actor| actor.local.clone()).await
    }

    /// Pick up a new transport address and re-announce ourselves.
    pub async fn refresh_address(&self) -> Result<Identity, SessionClosed> {
        self.invoke(|actor| actor.refresh_address()).await
    }

    /// Our UserInfo as an encoded broadcast frame, for transports with their
    /// own discovery channel.
    pub async fn user_info_frame(&self) -> Result<String, SessionClosed> {
        self.invoke(|actor| actor.user_info_frame())
            .await?
            .map_err(|e| {
                log::error!("Could not encode UserInfo: {}", e);
                SessionClosed
            })
    }

    pub async fn export_state(&self) -> Result<SessionSnapshot, SessionClosed> {
        self.invoke(|actor| actor.export()).await
    }

    pub async fn import_state(&self, snapshot: SessionSnapshot) -> Result<(), SnapshotError> {
        self.invoke(move |actor| actor.import(snapshot))
            .await
            .map_err(|_| SnapshotError::Closed)?
    }

    /// Close everything and stop the actor. Later calls fail with `Closed`.
    pub async fn shutdown(&self) {
        debug!("Shutting down session for {}", self.inner.local_id);
        self.cancel_token().cancel();
        let _ = self
            .invoke(|actor| {
                actor.close_all("session shut down");
                actor.running = false;
            })
            .await;
    }
}
