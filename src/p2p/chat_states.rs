// Typing notifications
// Ephemeral: they reach listeners but never the message store.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{SendFailure, SessionManager};
use crate::models::{Payload, TypingNotice};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingStatus {
    Active,    // participating, not typing
    Composing, // typing right now
    Paused,    // started typing, then stopped
    Inactive,  // idle for a while
    Gone,      // left the conversation
}

impl fmt::Display for TypingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            TypingStatus::Active => "active",
            TypingStatus::Composing => "composing",
            TypingStatus::Paused => "paused",
            TypingStatus::Inactive => "inactive",
            TypingStatus::Gone => "gone",
        };
        f.write_str(status)
    }
}

impl SessionManager {
    /// Tell a mutual contact what we are doing in their conversation.
    pub async fn send_typing(&self, contact_id: &str, state: TypingStatus) -> Result<String, SendFailure> {
        self.send(contact_id, Payload::Typing(TypingNotice { state })).await
    }
}
