// Listener registries for session events
//
// Callbacks run on the session actor, in the order they were added, after
// the state change they describe has been applied. They must not block.

use super::call::CallEvent;
use super::registry::PeerRecord;
use super::ConnectionInfo;
use crate::models::{ContactEdge, Message};

/// Handle returned by every `on_*` subscription; pass it to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Callback<T> = Box<dyn Fn(&T) + Send>;

pub struct Listeners<T> {
    entries: Vec<(ListenerId, Callback<T>)>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> Listeners<T> {
    pub fn add(&mut self, id: ListenerId, callback: Callback<T>) {
        self.entries.push((id, callback));
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| *existing != id);
        self.entries.len() != before
    }

    pub fn emit(&self, event: &T) {
        for (_, callback) in &self.entries {
            callback(event);
        }
    }
}

#[derive(Default)]
pub struct SessionListeners {
    next_id: u64,
    pub messages: Listeners<Message>,
    pub connections: Listeners<ConnectionInfo>,
    pub contacts: Listeners<ContactEdge>,
    pub peers: Listeners<PeerRecord>,
    pub calls: Listeners<CallEvent>,
}

impl SessionListeners {
    pub fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }

    /// Remove a subscription from whichever registry holds it.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        self.messages.remove(id)
            || self.connections.remove(id)
            || self.contacts.remove(id)
            || self.peers.remove(id)
            || self.calls.remove(id)
    }
}
