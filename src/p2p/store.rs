// Per-conversation message log
// Append-only; the only later mutation is a forward-only status upgrade.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::models::{DeliveryStatus, Message};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message: Message,
    pub status: DeliveryStatus,
}

#[derive(Debug, Default)]
struct Conversation {
    log: Vec<StoredMessage>,
    // message id -> position in `log`
    index: HashMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    conversations: HashMap<String, Conversation>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the end of a conversation. A message id already present in
    /// that conversation is not appended twice.
    pub fn append(&mut self, conversation_id: &str, message: Message, status: DeliveryStatus) -> bool {
        let conversation = self.conversations.entry(conversation_id.to_string()).or_default();
        if conversation.index.contains_key(&message.id) {
            debug!("Message {} already stored in {}", message.id, conversation_id);
            return false;
        }
        conversation.index.insert(message.id.clone(), conversation.log.len());
        conversation.log.push(StoredMessage { message, status });
        true
    }

    /// Move a message forward to `status`. Unknown ids and backwards moves are no-ops.
    pub fn update_status(&mut self, conversation_id: &str, message_id: &str, status: DeliveryStatus) -> bool {
        let Some(conversation) = self.conversations.get_mut(conversation_id) else {
            return false;
        };
        let Some(&position) = conversation.index.get(message_id) else {
            debug!("Status update for unknown message {} in {}", message_id, conversation_id);
            return false;
        };
        let stored = &mut conversation.log[position];
        if status <= stored.status {
            return false;
        }
        stored.status = status;
        true
    }

    /// The whole ordered log; empty for unknown conversations.
    pub fn get(&self, conversation_id: &str) -> &[StoredMessage] {
        self.conversations
            .get(conversation_id)
            .map(|conversation| conversation.log.as_slice())
            .unwrap_or(&[])
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.conversations.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<StoredMessage>> {
        self.conversations
            .iter()
            .map(|(id, conversation)| (id.clone(), conversation.log.clone()))
            .collect()
    }

    pub fn restore(&mut self, conversations: BTreeMap<String, Vec<StoredMessage>>) {
        self.conversations.clear();
        for (id, log) in conversations {
            for stored in log {
                self.append(&id, stored.message, stored.status);
            }
        }
    }
}
