// Session actor
//
// One task per local identity owns every piece of session state. Local API
// calls arrive as queued closures, and each connection has a reader task that
// forwards its frames into the same queue, so per-connection order is kept
// and no two mutations ever overlap.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use super::call::CallStateMachine;
use super::codec::{self, DecodeError};
use super::contacts::ContactGraph;
use super::listeners::SessionListeners;
use super::media::MediaEngine;
use super::registry::IdentityRegistry;
use super::store::MessageStore;
use super::transport::{ConnectError, PeerLink, Transport};
use super::{ConnectionInfo, ConnectionState, SendFailure, SessionConfig, SessionSnapshot, SnapshotError};
use crate::models::{ContactCard, DeliveryStatus, Identity, Message, MessageKind, Payload, UserInfo};

pub(crate) type Job = Box<dyn FnOnce(&mut SessionActor) + Send>;
pub(crate) type Handshake = oneshot::Receiver<Result<ConnectionInfo, ConnectError>>;
type Waiter = oneshot::Sender<Result<ConnectionInfo, ConnectError>>;

pub(crate) enum Event {
    Frame { conn: u64, address: String, frame: String },
    Closed { conn: u64, address: String },
    Invoke(Job),
}

pub(crate) enum BeginConnect {
    /// Already open and identified.
    Existing(ConnectionInfo),
    /// A link exists or is being opened; wait for its UserInfo.
    Handshake(Handshake),
    /// Caller must open the link.
    Started,
}

struct ConnectionEntry {
    id: u64,
    // we opened this link
    outgoing: bool,
    remote_identity: Option<String>,
    sender: mpsc::UnboundedSender<String>,
    // frames that arrived before the peer's UserInfo
    buffered: VecDeque<Message>,
    reader: JoinHandle<()>,
}

/// Recently seen message ids of one sender, oldest first.
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// False if `id` was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

pub(crate) struct SessionActor {
    pub(crate) local: Identity,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    events_tx: mpsc::UnboundedSender<Event>,
    next_conn_id: u64,
    connections: HashMap<String, ConnectionEntry>,
    // addresses being opened -> connect calls waiting on the same address
    pending: HashMap<String, Vec<Waiter>>,
    handshake_waiters: HashMap<u64, Vec<Waiter>>,
    // crossed links held open until the peer drops them
    parked: HashMap<u64, (mpsc::UnboundedSender<String>, JoinHandle<()>)>,
    seen: HashMap<String, SeenIds>,
    pub(crate) registry: IdentityRegistry,
    pub(crate) contacts: ContactGraph,
    pub(crate) store: MessageStore,
    pub(crate) calls: CallStateMachine,
    pub(crate) listeners: SessionListeners,
    pub(crate) running: bool,
}

impl SessionActor {
    pub(crate) fn new(
        local: Identity,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        events_tx: mpsc::UnboundedSender<Event>,
        media: Box<dyn MediaEngine>,
    ) -> Self {
        Self {
            contacts: ContactGraph::new(&local.id),
            calls: CallStateMachine::new(config.call_timeout, media),
            local,
            transport,
            config,
            events_tx,
            next_conn_id: 0,
            connections: HashMap::new(),
            pending: HashMap::new(),
            handshake_waiters: HashMap::new(),
            parked: HashMap::new(),
            seen: HashMap::new(),
            registry: IdentityRegistry::new(),
            store: MessageStore::new(),
            listeners: SessionListeners::default(),
            running: true,
        }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>, mut incoming: mpsc::Receiver<PeerLink>) {
        let mut ticker = interval(self.config.call_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut accepting = true;
        info!("Session for {} running at {}", self.local.id, self.local.address);

        while self.running {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                link = incoming.recv(), if accepting => match link {
                    Some(link) => {
                        info!("Incoming link from {}", link.peer_address);
                        self.attach(link, false);
                    }
                    None => {
                        debug!("Transport for {} stopped accepting links", self.local.id);
                        accepting = false;
                    }
                },
                _ = ticker.tick() => self.check_call_timeout(),
            }
        }

        self.close_all("session shut down");
        info!("Session for {} stopped", self.local.id);
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Frame { conn, address, frame } => self.handle_frame(conn, &address, &frame),
            Event::Closed { conn, address } => {
                if self.parked.remove(&conn).is_some() {
                    debug!("Crossed link {} to {} closed", conn, address);
                } else {
                    self.close_connection(&address, conn, "link closed");
                }
            }
            Event::Invoke(job) => job(self),
        }
    }

    // ---- connection lifecycle ----

    pub(crate) fn begin_connect(&mut self, address: &str) -> BeginConnect {
        if let Some(entry) = self.connections.get(address) {
            if entry.remote_identity.is_some() {
                return BeginConnect::Existing(Self::info(address, entry, ConnectionState::Open));
            }
            let (tx, rx) = oneshot::channel();
            self.handshake_waiters.entry(entry.id).or_default().push(tx);
            return BeginConnect::Handshake(rx);
        }
        if let Some(waiters) = self.pending.get_mut(address) {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            return BeginConnect::Handshake(rx);
        }

        self.pending.insert(address.to_string(), Vec::new());
        self.emit_connection(ConnectionInfo {
            connection_id: None,
            peer_address: address.to_string(),
            remote_identity: None,
            state: ConnectionState::Connecting,
        });
        BeginConnect::Started
    }

    /// Attach a link we opened; resolves once the peer identifies itself.
    pub(crate) fn attach_outgoing(&mut self, link: PeerLink) -> Handshake {
        let (tx, rx) = oneshot::channel();
        self.pending.entry(link.peer_address.clone()).or_default().push(tx);
        self.attach(link, true);
        rx
    }

    /// A connect attempt failed or was cancelled before the handshake
    /// completed. Everyone waiting on the same address gets `reason`.
    pub(crate) fn abort_connect(&mut self, address: &str, reason: &ConnectError) {
        if let Some(waiters) = self.pending.remove(address) {
            info!("Connect to {} failed: {}", address, reason);
            for waiter in waiters {
                let _ = waiter.send(Err(reason.clone()));
            }
            self.emit_connection(ConnectionInfo {
                connection_id: None,
                peer_address: address.to_string(),
                remote_identity: None,
                state: ConnectionState::Closed,
            });
            return;
        }
        let unresolved = self
            .connections
            .get(address)
            .filter(|entry| entry.remote_identity.is_none())
            .map(|entry| entry.id);
        if let Some(id) = unresolved {
            for waiter in self.handshake_waiters.remove(&id).unwrap_or_default() {
                let _ = waiter.send(Err(reason.clone()));
            }
            self.close_connection(address, id, &reason.to_string());
        }
    }

    fn spawn_reader(&self, id: u64, address: &str, mut receiver: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        let events = self.events_tx.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            while let Some(frame) = receiver.recv().await {
                let event = Event::Frame {
                    conn: id,
                    address: address.clone(),
                    frame,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            let _ = events.send(Event::Closed { conn: id, address });
        })
    }

    /// Take ownership of a link: start its reader and introduce ourselves.
    /// When it loses a crossed connect the existing connection stays and
    /// takes over our connect calls.
    pub(crate) fn attach(&mut self, link: PeerLink, outgoing: bool) {
        let PeerLink {
            peer_address,
            sender,
            receiver,
        } = link;
        self.next_conn_id += 1;
        let id = self.next_conn_id;
        let reader = self.spawn_reader(id, &peer_address, receiver);

        let mut inherited = None;
        let existing = self
            .connections
            .get(&peer_address)
            .map(|entry| (entry.id, entry.outgoing));
        if let Some((old, old_outgoing)) = existing {
            if self.transport.replaces_links() {
                inherited = self.swap_out(&peer_address, old, id);
            } else if old_outgoing == outgoing {
                self.close_connection(&peer_address, old, "replaced by a new link");
            } else if outgoing == (self.local.address < peer_address) {
                // crossed connect: both sides keep the link opened by the lower address
                inherited = self.swap_out(&peer_address, old, id);
            } else {
                self.retire(id, &peer_address, sender, reader);
                self.settle_waiters(&peer_address, old, outgoing);
                return;
            }
        }

        let (remote_identity, buffered) = inherited.unwrap_or_default();
        let entry = ConnectionEntry {
            id,
            outgoing,
            remote_identity,
            sender,
            buffered,
            reader,
        };
        let info = Self::info(&peer_address, &entry, ConnectionState::Open);
        self.connections.insert(peer_address.clone(), entry);
        info!("Connection {} to {} open", id, peer_address);
        self.emit_connection(info);
        self.settle_waiters(&peer_address, id, outgoing);

        let hello = self.envelope(None, Payload::UserInfo(UserInfo::from(&self.local)));
        if let Err(e) = self.write_frame(&peer_address, &hello) {
            warn!("Could not introduce ourselves to {}: {}", peer_address, e);
        }
    }

    /// Hand the connect calls waiting on `address` to connection `conn` when
    /// we dialed it, and answer them all if it is already identified.
    fn settle_waiters(&mut self, address: &str, conn: u64, take_pending: bool) {
        if take_pending {
            if let Some(waiters) = self.pending.remove(address) {
                self.handshake_waiters.entry(conn).or_default().extend(waiters);
            }
        }
        let Some(info) = self
            .connections
            .get(address)
            .filter(|entry| entry.id == conn && entry.remote_identity.is_some())
            .map(|entry| Self::info(address, entry, ConnectionState::Open))
        else {
            return;
        };
        for waiter in self.handshake_waiters.remove(&conn).unwrap_or_default() {
            let _ = waiter.send(Ok(info.clone()));
        }
    }

    /// Hand connection `old` over to the link `new`, which reaches the same
    /// peer. The peer stays online and its waiters, identity and early frames
    /// move across.
    fn swap_out(&mut self, address: &str, old: u64, new: u64) -> Option<(Option<String>, VecDeque<Message>)> {
        let entry = self.connections.remove(address)?;
        if let Some(waiters) = self.handshake_waiters.remove(&old) {
            self.handshake_waiters.entry(new).or_default().extend(waiters);
        }
        info!("Connection {} to {} superseded by {}", old, address, new);
        self.emit_connection(Self::info(address, &entry, ConnectionState::Closed));

        let ConnectionEntry {
            remote_identity,
            sender,
            buffered,
            reader,
            ..
        } = entry;
        self.retire(old, address, sender, reader);
        Some((remote_identity, buffered))
    }

    /// Put away a link that no connection uses. The higher address closes it;
    /// the lower one holds it until the peer does, so the peer's own handshake
    /// on the surviving link is never cut short.
    fn retire(&mut self, id: u64, address: &str, sender: mpsc::UnboundedSender<String>, reader: JoinHandle<()>) {
        if !self.transport.replaces_links() && self.local.address.as_str() < address {
            debug!("Holding link {} to {} until the peer drops it", id, address);
            self.parked.insert(id, (sender, reader));
        } else {
            debug!("Dropping link {} to {}", id, address);
            reader.abort();
        }
    }

    /// Tear down one connection. Runs at most once per connection id.
    pub(crate) fn close_connection(&mut self, address: &str, conn: u64, reason: &str) {
        if self.connections.get(address).map(|entry| entry.id) != Some(conn) {
            return;
        }
        let Some(entry) = self.connections.remove(address) else {
            return;
        };
        entry.reader.abort();
        self.handshake_waiters.remove(&conn);
        if !entry.buffered.is_empty() {
            debug!("Discarding {} unresolved frame(s) from {}", entry.buffered.len(), address);
        }
        info!("Connection {} to {} closed: {}", conn, address, reason);

        let info = Self::info(address, &entry, ConnectionState::Closed);
        drop(entry);
        self.emit_connection(info.clone());

        for id in self.registry.mark_offline(address) {
            if let Some(record) = self.registry.get(&id).cloned() {
                self.listeners.peers.emit(&record);
            }
        }
        if let Some(remote) = info.remote_identity {
            self.call_connection_lost(&remote);
        }
    }

    pub(crate) fn close_all(&mut self, reason: &str) {
        let open: Vec<(String, u64)> = self
            .connections
            .iter()
            .map(|(address, entry)| (address.clone(), entry.id))
            .collect();
        for (address, id) in open {
            self.close_connection(&address, id, reason);
        }

        for (_, (_, reader)) in self.parked.drain() {
            reader.abort();
        }

        let pending: Vec<String> = self.pending.drain().map(|(address, _)| address).collect();
        for address in pending {
            self.emit_connection(ConnectionInfo {
                connection_id: None,
                peer_address: address,
                remote_identity: None,
                state: ConnectionState::Closed,
            });
        }
    }

    pub(crate) fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|(address, entry)| Self::info(address, entry, ConnectionState::Open))
            .collect();
        infos.sort_by(|a, b| a.peer_address.cmp(&b.peer_address));
        infos
    }

    fn info(address: &str, entry: &ConnectionEntry, state: ConnectionState) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: Some(entry.id),
            peer_address: address.to_string(),
            remote_identity: entry.remote_identity.clone(),
            state,
        }
    }

    fn emit_connection(&self, info: ConnectionInfo) {
        self.listeners.connections.emit(&info);
    }

    // ---- inbound ----

    fn handle_frame(&mut self, conn: u64, address: &str, frame: &str) {
        let limit = self.config.max_buffered_frames.max(1);
        let message = match codec::decode(frame) {
            Ok(message) => message,
            Err(DecodeError::UnknownKind(kind)) => {
                debug!("Ignoring frame of unknown kind '{}' from {}", kind, address);
                return;
            }
            Err(e) => {
                warn!("Dropping frame from {}: {}", address, e);
                return;
            }
        };

        let Some(entry) = self.connections.get_mut(address) else {
            debug!("Frame from {} after its connection closed", address);
            return;
        };
        if entry.id != conn {
            return;
        }

        if let Payload::UserInfo(info) = &message.payload {
            let info = info.clone();
            self.handle_user_info(address, &info, message);
            return;
        }

        match entry.remote_identity.as_deref() {
            None if entry.buffered.len() >= limit => {
                warn!("{} sent {} frames without identifying itself", address, limit + 1);
                self.close_connection(address, conn, "too many frames before UserInfo");
            }
            None => {
                debug!("Buffering {} from unresolved connection {}", message.kind(), address);
                entry.buffered.push_back(message);
            }
            Some(remote) if remote != message.sender => {
                warn!(
                    "Dropping {} claiming to be from {} on the connection of {}",
                    message.kind(),
                    message.sender,
                    remote
                );
            }
            Some(_) => self.route(message),
        }
    }

    fn handle_user_info(&mut self, address: &str, info: &UserInfo, message: Message) {
        if info.id != message.sender {
            warn!("Dropping UserInfo from {}: sender {} does not match id {}", address, message.sender, info.id);
            return;
        }
        let Some(entry) = self.connections.get_mut(address) else {
            return;
        };
        if let Some(existing) = &entry.remote_identity {
            if *existing != message.sender {
                warn!(
                    "Dropping UserInfo for {} on the connection of {}",
                    message.sender, existing
                );
                return;
            }
        }

        let first = entry.remote_identity.is_none();
        entry.remote_identity = Some(message.sender.clone());
        let early: Vec<Message> = entry.buffered.drain(..).collect();
        let conn = entry.id;
        let connection = Self::info(address, entry, ConnectionState::Open);

        let record = self.registry.upsert(&message.sender, info, address);
        debug!("{} ({}) is at {}", record.identity.id, record.identity.display_name, address);
        self.listeners.peers.emit(&record);

        if first {
            info!("Connection {} identified as {}", conn, message.sender);
            self.emit_connection(connection.clone());
            for waiter in self.handshake_waiters.remove(&conn).unwrap_or_default() {
                let _ = waiter.send(Ok(connection.clone()));
            }
        }
        self.listeners.messages.emit(&message);

        for early_message in early {
            if early_message.sender != message.sender {
                warn!(
                    "Dropping buffered {} from {} on the connection of {}",
                    early_message.kind(),
                    early_message.sender,
                    message.sender
                );
                continue;
            }
            self.route(early_message);
        }
    }

    /// Dispatch a message from an identified connection by kind, then notify listeners.
    fn route(&mut self, message: Message) {
        let window = self.config.dedup_window;
        let fresh = self
            .seen
            .entry(message.sender.clone())
            .or_insert_with(|| SeenIds::new(window))
            .insert(&message.id);
        if !fresh {
            debug!("Dropping duplicate {} {} from {}", message.kind(), message.id, message.sender);
            return;
        }
        if let Some(recipient) = &message.recipient {
            if *recipient != self.local.id {
                debug!("Dropping {} addressed to {}", message.kind(), recipient);
                return;
            }
        }

        let kind = message.kind();
        let sender = message.sender.clone();
        if kind.is_chat_content() && !self.contacts.is_mutual(&sender) {
            warn!("Dropping {} from {}: not a mutual contact", kind, sender);
            return;
        }

        match &message.payload {
            Payload::ContactRequest(card) => self.on_contact_request(&sender, card),
            Payload::ContactAccept(card) => self.on_contact_accept(&sender, card),
            Payload::Chat(_) => {
                let stored = self.store.append(&sender, message.clone(), DeliveryStatus::Delivered);
                if stored && self.config.send_delivery_receipts {
                    if let Err(e) = self.send_receipt(&sender, vec![message.id.clone()], DeliveryStatus::Delivered) {
                        warn!("Could not acknowledge {} to {}: {}", message.id, sender, e);
                    }
                }
            }
            Payload::ReadReceipt(receipt) => self.apply_receipt(&sender, receipt),
            Payload::Typing(notice) => debug!("{} is {}", sender, notice.state),
            Payload::UserInfo(_) => {}
            payload if kind.is_call_signal() => self.handle_call_signal(&sender, payload),
            _ => {}
        }

        self.listeners.messages.emit(&message);
    }

    // ---- outbound ----

    pub(crate) fn envelope(&self, recipient: Option<&str>, payload: Payload) -> Message {
        Message {
            id: Uuid::now_v7().to_string(),
            sender: self.local.id.clone(),
            sender_display_name: self.local.display_name.clone(),
            recipient: recipient.map(str::to_string),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn contact_card(&self) -> ContactCard {
        ContactCard {
            display_name: self.local.display_name.clone(),
            phone: self.local.phone.clone(),
        }
    }

    /// True when `id` resolves to an open connection that identified as `id`.
    pub(crate) fn is_reachable(&self, id: &str) -> bool {
        self.registry
            .resolve(id)
            .and_then(|address| self.connections.get(address))
            .map_or(false, |entry| entry.remote_identity.as_deref() == Some(id))
    }

    fn write_frame(&mut self, address: &str, message: &Message) -> Result<(), SendFailure> {
        let frame = codec::encode(message).map_err(|e| {
            error!("Could not encode {} {}: {}", message.kind(), message.id, e);
            SendFailure::NotConnected(address.to_string())
        })?;
        let Some(entry) = self.connections.get(address) else {
            return Err(SendFailure::NotConnected(address.to_string()));
        };
        if entry.sender.send(frame).is_err() {
            let id = entry.id;
            self.close_connection(address, id, "transport rejected frame");
            return Err(SendFailure::NotConnected(address.to_string()));
        }
        debug!("Sent {} {} to {}", message.kind(), message.id, address);
        Ok(())
    }

    /// Send without the mutual-contact gate. Used for handshakes, receipts
    /// routed through `send`, and call signaling.
    pub(crate) fn send_internal(&mut self, to: &str, payload: Payload) -> Result<Message, SendFailure> {
        if !self.is_reachable(to) {
            return Err(SendFailure::NotConnected(to.to_string()));
        }
        let address = self
            .registry
            .resolve(to)
            .map(str::to_string)
            .ok_or_else(|| SendFailure::NotConnected(to.to_string()))?;
        let message = self.envelope(Some(to), payload);
        self.write_frame(&address, &message)?;
        Ok(message)
    }

    pub(crate) fn send(&mut self, to: &str, payload: Payload) -> Result<String, SendFailure> {
        let kind = payload.kind();
        if kind.is_chat_content() && !self.contacts.is_mutual(to) {
            return Err(SendFailure::NotMutualContact(to.to_string()));
        }
        let message = self.send_internal(to, payload)?;
        if kind == MessageKind::Chat {
            self.store.append(to, message.clone(), DeliveryStatus::Sent);
        }
        Ok(message.id)
    }

    /// Send to every open connection; returns how many links took the frame.
    pub(crate) fn broadcast(&mut self, payload: Payload) -> usize {
        let message = self.envelope(None, payload);
        let addresses: Vec<String> = self.connections.keys().cloned().collect();
        addresses
            .iter()
            .filter(|address| self.write_frame(address, &message).is_ok())
            .count()
    }

    pub(crate) fn refresh_address(&mut self) -> Identity {
        let address = self.transport.local_address();
        if address != self.local.address {
            info!("Local address changed from {} to {}", self.local.address, address);
            self.local.address = address;
        }
        let reached = self.broadcast(Payload::UserInfo(UserInfo::from(&self.local)));
        debug!("Re-announced {} to {} connection(s)", self.local.id, reached);
        self.local.clone()
    }

    pub(crate) fn user_info_frame(&self) -> serde_json::Result<String> {
        codec::encode(&self.envelope(None, Payload::UserInfo(UserInfo::from(&self.local))))
    }

    // ---- persistence ----

    pub(crate) fn export(&self) -> SessionSnapshot {
        SessionSnapshot {
            local_id: self.local.id.clone(),
            contacts: self.contacts.edges(),
            conversations: self.store.snapshot(),
            exported_at: Utc::now(),
        }
    }

    pub(crate) fn import(&mut self, snapshot: SessionSnapshot) -> Result<(), SnapshotError> {
        if snapshot.local_id != self.local.id {
            return Err(SnapshotError::IdentityMismatch {
                expected: self.local.id.clone(),
                found: snapshot.local_id,
            });
        }
        info!(
            "Restoring {} contact(s) and {} conversation(s) for {}",
            snapshot.contacts.len(),
            snapshot.conversations.len(),
            self.local.id
        );
        self.contacts.restore(snapshot.contacts);
        self.store.restore(snapshot.conversations);
        Ok(())
    }
}
