// Identity registry: stable user id -> current transport address
// Fed by UserInfo discovery frames; owned by the session actor.

use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;

use crate::models::{Identity, UserInfo};

/// What we know about a discovered peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub identity: Identity,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct IdentityRegistry {
    peers: HashMap<String, PeerRecord>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a UserInfo seen on a connection to `address`.
    ///
    /// The connection's address wins over the address claimed in the payload:
    /// it is the one our transport can actually reach.
    pub fn upsert(&mut self, sender: &str, info: &UserInfo, address: &str) -> PeerRecord {
        if info.address != address {
            debug!(
                "Peer {} claims address {} but is connected via {}",
                sender, info.address, address
            );
        }
        let record = PeerRecord {
            identity: Identity {
                id: sender.to_string(),
                display_name: info.display_name.clone(),
                address: address.to_string(),
                phone: info.phone.clone(),
            },
            online: true,
            last_seen: Utc::now(),
        };
        self.peers.insert(sender.to_string(), record.clone());
        record
    }

    /// Resolve an identity to its current address.
    pub fn resolve(&self, id: &str) -> Option<&str> {
        self.peers.get(id).map(|record| record.identity.address.as_str())
    }

    pub fn get(&self, id: &str) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    /// Mark everyone reachable at `address` as offline; returns their ids.
    pub fn mark_offline(&mut self, address: &str) -> Vec<String> {
        let now = Utc::now();
        self.peers
            .values_mut()
            .filter(|record| record.online && record.identity.address == address)
            .map(|record| {
                record.online = false;
                record.last_seen = now;
                record.identity.id.clone()
            })
            .collect()
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.identity.id.cmp(&b.identity.id));
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, address: &str) -> UserInfo {
        UserInfo {
            id: id.to_string(),
            display_name: format!("User {}", id),
            address: address.to_string(),
            phone: None,
            online: true,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_address_refreshes_on_new_user_info() {
        let mut registry = IdentityRegistry::new();
        registry.upsert("alice", &info("alice", "peer-1"), "peer-1");
        assert_eq!(registry.resolve("alice"), Some("peer-1"));

        registry.upsert("alice", &info("alice", "peer-9"), "peer-9");
        assert_eq!(registry.resolve("alice"), Some("peer-9"));
        assert_eq!(registry.peers().len(), 1);
    }

    #[test]
    fn test_connection_address_is_authoritative() {
        let mut registry = IdentityRegistry::new();
        registry.upsert("alice", &info("alice", "spoofed"), "peer-1");
        assert_eq!(registry.resolve("alice"), Some("peer-1"));
    }

    #[test]
    fn test_offline_peers_stay_resolvable() {
        let mut registry = IdentityRegistry::new();
        registry.upsert("alice", &info("alice", "peer-1"), "peer-1");
        registry.upsert("bob", &info("bob", "peer-2"), "peer-2");

        assert_eq!(registry.mark_offline("peer-1"), vec!["alice".to_string()]);
        assert!(!registry.get("alice").unwrap().online);
        assert!(registry.get("bob").unwrap().online);
        assert_eq!(registry.resolve("alice"), Some("peer-1"));
        assert!(registry.mark_offline("peer-1").is_empty());
    }
}
