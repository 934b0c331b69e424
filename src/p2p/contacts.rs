// Contact graph: who we may exchange chat content with
//
// An edge becomes Mutual once one side has requested and the other accepted.
// Repeated requests or accepts on a Mutual edge change nothing.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use thiserror::Error;

use super::registry::PeerRecord;
use super::session::SessionActor;
use super::{SendFailure, SessionClosed, SessionManager};
use crate::models::{ContactCard, ContactEdge, ContactStatus, Payload};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContactError {
    #[error("Contact edge with {remote} does not allow this (currently {status:?})")]
    InvalidState {
        remote: String,
        status: Option<ContactStatus>,
    },
    #[error(transparent)]
    Send(#[from] SendFailure),
    #[error("Session is shut down")]
    Closed,
}

impl From<SessionClosed> for ContactError {
    fn from(_: SessionClosed) -> Self {
        ContactError::Closed
    }
}

/// What an inbound ContactRequest did to the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// A new RequestedByThem edge waiting for a local decision.
    NewRequest(ContactEdge),
    /// Both sides asked at once; the edge is Mutual and we owe an accept.
    Crossed(ContactEdge),
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcceptOutcome {
    Mutual(ContactEdge),
    Ignored,
}

#[derive(Debug)]
pub struct ContactGraph {
    local_id: String,
    edges: HashMap<String, ContactEdge>,
}

impl ContactGraph {
    pub fn new(local_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            edges: HashMap::new(),
        }
    }

    pub fn get(&self, remote_id: &str) -> Option<&ContactEdge> {
        self.edges.get(remote_id)
    }

    pub fn status(&self, remote_id: &str) -> Option<ContactStatus> {
        self.edges.get(remote_id).map(|edge| edge.status)
    }

    pub fn is_mutual(&self, remote_id: &str) -> bool {
        self.status(remote_id) == Some(ContactStatus::Mutual)
    }

    /// Requests may only start from no edge at all.
    pub fn check_request(&self, remote_id: &str) -> Result<(), ContactError> {
        match self.status(remote_id) {
            None if remote_id != self.local_id => Ok(()),
            status => Err(ContactError::InvalidState {
                remote: remote_id.to_string(),
                status,
            }),
        }
    }

    pub fn check_accept(&self, remote_id: &str) -> Result<(), ContactError> {
        match self.status(remote_id) {
            Some(ContactStatus::RequestedByThem) => Ok(()),
            status => Err(ContactError::InvalidState {
                remote: remote_id.to_string(),
                status,
            }),
        }
    }

    pub fn request(&mut self, remote_id: &str, display_name: Option<String>) -> Result<ContactEdge, ContactError> {
        self.check_request(remote_id)?;
        Ok(self.set(remote_id, ContactStatus::RequestedByMe, display_name))
    }

    pub fn accept(&mut self, remote_id: &str) -> Result<ContactEdge, ContactError> {
        self.check_accept(remote_id)?;
        let display_name = self.edges.get(remote_id).and_then(|edge| edge.display_name.clone());
        Ok(self.set(remote_id, ContactStatus::Mutual, display_name))
    }

    /// Drop a pending inbound request.
    pub fn decline(&mut self, remote_id: &str) -> Result<ContactEdge, ContactError> {
        self.check_accept(remote_id)?;
        self.edges.remove(remote_id).ok_or_else(|| ContactError::InvalidState {
            remote: remote_id.to_string(),
            status: None,
        })
    }

    pub fn on_request_received(&mut self, remote_id: &str, card: &ContactCard) -> RequestOutcome {
        match self.status(remote_id) {
            None => {
                info!("Contact request from {} ({})", remote_id, card.display_name);
                RequestOutcome::NewRequest(self.set(
                    remote_id,
                    ContactStatus::RequestedByThem,
                    Some(card.display_name.clone()),
                ))
            }
            Some(ContactStatus::RequestedByMe) => {
                info!("Crossed contact requests with {}; now mutual", remote_id);
                RequestOutcome::Crossed(self.set(remote_id, ContactStatus::Mutual, Some(card.display_name.clone())))
            }
            Some(status) => {
                debug!("Ignoring repeated contact request from {} ({})", remote_id, status);
                RequestOutcome::Ignored
            }
        }
    }

    pub fn on_accept_received(&mut self, remote_id: &str, card: &ContactCard) -> AcceptOutcome {
        match self.status(remote_id) {
            Some(ContactStatus::RequestedByMe) => {
                info!("{} accepted our contact request", remote_id);
                AcceptOutcome::Mutual(self.set(remote_id, ContactStatus::Mutual, Some(card.display_name.clone())))
            }
            Some(ContactStatus::Mutual) => {
                debug!("Ignoring repeated contact accept from {}", remote_id);
                AcceptOutcome::Ignored
            }
            status => {
                warn!("Ignoring unsolicited contact accept from {} (edge {:?})", remote_id, status);
                AcceptOutcome::Ignored
            }
        }
    }

    pub fn edges(&self) -> Vec<ContactEdge> {
        let mut edges: Vec<ContactEdge> = self.edges.values().cloned().collect();
        edges.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        edges
    }

    pub fn mutual_ids(&self) -> Vec<String> {
        self.edges().into_iter().filter(|e| e.is_mutual()).map(|e| e.remote_id).collect()
    }

    pub fn pending_requests(&self) -> Vec<ContactEdge> {
        self.edges()
            .into_iter()
            .filter(|e| e.status == ContactStatus::RequestedByThem)
            .collect()
    }

    /// Replace the graph with persisted edges. Edges owned by another local
    /// identity are skipped.
    pub fn restore(&mut self, edges: Vec<ContactEdge>) {
        self.edges.clear();
        for edge in edges {
            if edge.local_id != self.local_id {
                warn!("Skipping contact edge for {} owned by {}", edge.remote_id, edge.local_id);
                continue;
            }
            self.edges.insert(edge.remote_id.clone(), edge);
        }
    }

    fn set(&mut self, remote_id: &str, status: ContactStatus, display_name: Option<String>) -> ContactEdge {
        let edge = ContactEdge {
            local_id: self.local_id.clone(),
            remote_id: remote_id.to_string(),
            status,
            display_name,
            updated_at: Utc::now(),
        };
        self.edges.insert(remote_id.to_string(), edge.clone());
        edge
    }
}

impl SessionActor {
    pub(crate) fn request_contact(&mut self, remote_id: &str) -> Result<ContactEdge, ContactError> {
        self.contacts.check_request(remote_id)?;
        let card = self.contact_card();
        self.send_internal(remote_id, Payload::ContactRequest(card))?;

        let display_name = self.registry.get(remote_id).map(|r| r.identity.display_name.clone());
        let edge = self.contacts.request(remote_id, display_name)?;
        self.listeners.contacts.emit(&edge);
        Ok(edge)
    }

    pub(crate) fn accept_contact(&mut self, remote_id: &str) -> Result<ContactEdge, ContactError> {
        self.contacts.check_accept(remote_id)?;
        let card = self.contact_card();
        self.send_internal(remote_id, Payload::ContactAccept(card))?;

        let edge = self.contacts.accept(remote_id)?;
        self.listeners.contacts.emit(&edge);
        Ok(edge)
    }

    pub(crate) fn decline_contact(&mut self, remote_id: &str) -> Result<(), ContactError> {
        self.contacts.decline(remote_id)?;
        info!("Declined contact request from {}", remote_id);
        Ok(())
    }

    pub(crate) fn on_contact_request(&mut self, sender: &str, card: &ContactCard) {
        match self.contacts.on_request_received(sender, card) {
            RequestOutcome::NewRequest(edge) => self.listeners.contacts.emit(&edge),
            RequestOutcome::Crossed(edge) => {
                let card = self.contact_card();
                if let Err(e) = self.send_internal(sender, Payload::ContactAccept(card)) {
                    warn!("Could not send contact accept to {}: {}", sender, e);
                }
                self.listeners.contacts.emit(&edge);
            }
            RequestOutcome::Ignored => {}
        }
    }

    pub(crate) fn on_contact_accept(&mut self, sender: &str, card: &ContactCard) {
        if let AcceptOutcome::Mutual(edge) = self.contacts.on_accept_received(sender, card) {
            self.listeners.contacts.emit(&edge);
        }
    }
}

impl SessionManager {
    /// Ask `remote_id` to become a contact. The peer must be connected.
    pub async fn request_contact(&self, remote_id: &str) -> Result<ContactEdge, ContactError> {
        let remote_id = remote_id.to_string();
        self.invoke(move |actor| actor.request_contact(&remote_id)).await?
    }

    /// Accept a pending request; the edge becomes Mutual.
    pub async fn accept_contact(&self, remote_id: &str) -> Result<ContactEdge, ContactError> {
        let remote_id = remote_id.to_string();
        self.invoke(move |actor| actor.accept_contact(&remote_id)).await?
    }

    pub async fn decline_contact(&self, remote_id: &str) -> Result<(), ContactError> {
        let remote_id = remote_id.to_string();
        self.invoke(move |actor| actor.decline_contact(&remote_id)).await?
    }

    pub async fn contacts(&self) -> Vec<ContactEdge> {
        self.invoke(|actor| actor.contacts.edges()).await.unwrap_or_default()
    }

    pub async fn contact_status(&self, remote_id: &str) -> Option<ContactStatus> {
        let remote_id = remote_id.to_string();
        self.invoke(move |actor| actor.contacts.status(&remote_id)).await.ok().flatten()
    }

    pub async fn pending_requests(&self) -> Vec<ContactEdge> {
        self.invoke(|actor| actor.contacts.pending_requests()).await.unwrap_or_default()
    }

    /// Discovered peers we are Mutual with.
    pub async fn mutual_contacts(&self) -> Vec<PeerRecord> {
        self.invoke(|actor| {
            actor
                .contacts
                .mutual_ids()
                .iter()
                .filter_map(|id| actor.registry.get(id).cloned())
                .collect()
        })
        .await
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(name: &str) -> ContactCard {
        ContactCard {
            display_name: name.to_string(),
            phone: None,
        }
    }

    #[test]
    fn test_request_then_accept() {
        let mut alice = ContactGraph::new("alice");
        let mut bob = ContactGraph::new("bob");

        alice.request("bob", None).unwrap();
        assert_eq!(alice.status("bob"), Some(ContactStatus::RequestedByMe));

        assert!(matches!(bob.on_request_received("alice", &card("Alice")), RequestOutcome::NewRequest(_)));
        assert_eq!(bob.status("alice"), Some(ContactStatus::RequestedByThem));
        assert_eq!(bob.pending_requests().len(), 1);

        let edge = bob.accept("alice").unwrap();
        assert!(edge.is_mutual());
        assert_eq!(edge.display_name.as_deref(), Some("Alice"));

        assert!(matches!(alice.on_accept_received("bob", &card("Bob")), AcceptOutcome::Mutual(_)));
        assert!(alice.is_mutual("bob"));
        assert_eq!(alice.mutual_ids(), vec!["bob".to_string()]);
    }

    #[test]
    fn test_repeats_on_mutual_edge_are_no_ops() {
        let mut alice = ContactGraph::new("alice");
        alice.request("bob", None).unwrap();
        alice.on_accept_received("bob", &card("Bob"));
        let before = alice.get("bob").cloned();

        assert_eq!(alice.on_accept_received("bob", &card("Bob")), AcceptOutcome::Ignored);
        assert_eq!(alice.on_request_received("bob", &card("Bob")), RequestOutcome::Ignored);
        assert_eq!(alice.get("bob").cloned(), before);
    }

    #[test]
    fn test_crossed_requests_become_mutual() {
        let mut alice = ContactGraph::new("alice");
        alice.request("bob", None).unwrap();
        assert!(matches!(alice.on_request_received("bob", &card("Bob")), RequestOutcome::Crossed(_)));
        assert!(alice.is_mutual("bob"));
    }

    #[test]
    fn test_invalid_local_transitions() {
        let mut alice = ContactGraph::new("alice");
        assert!(matches!(alice.accept("bob"), Err(ContactError::InvalidState { .. })));
        assert!(alice.request("alice", None).is_err());

        alice.request("bob", None).unwrap();
        assert!(alice.request("bob", None).is_err());
        assert!(alice.accept("bob").is_err());

        alice.on_request_received("carol", &card("Carol"));
        assert!(alice.request("carol", None).is_err());
    }

    #[test]
    fn test_unsolicited_accept_is_ignored() {
        let mut alice = ContactGraph::new("alice");
        assert_eq!(alice.on_accept_received("mallory", &card("Mallory")), AcceptOutcome::Ignored);
        assert_eq!(alice.status("mallory"), None);

        alice.on_request_received("carol", &card("Carol"));
        assert_eq!(alice.on_accept_received("carol", &card("Carol")), AcceptOutcome::Ignored);
        assert_eq!(alice.status("carol"), Some(ContactStatus::RequestedByThem));
    }

    #[test]
    fn test_decline_removes_pending_request() {
        let mut alice = ContactGraph::new("alice");
        alice.on_request_received("carol", &card("Carol"));
        alice.decline("carol").unwrap();
        assert_eq!(alice.status("carol"), None);
        assert!(alice.decline("carol").is_err());

        // a later request starts over
        assert!(matches!(alice.on_request_received("carol", &card("Carol")), RequestOutcome::NewRequest(_)));
    }

    #[test]
    fn test_restore_skips_foreign_edges() {
        let mut alice = ContactGraph::new("alice");
        alice.request("bob", None).unwrap();
        let mut edges = alice.edges();
        let mut foreign = edges[0].clone();
        foreign.local_id = "eve".to_string();
        foreign.remote_id = "carol".to_string();
        edges.push(foreign);

        let mut restored = ContactGraph::new("alice");
        restored.restore(edges);
        assert_eq!(restored.edges().len(), 1);
        assert_eq!(restored.status("bob"), Some(ContactStatus::RequestedByMe));
    }
}
