// JSON wire codec for the message envelope
//
// A frame is one JSON object: {id, kind, sender, senderDisplayName, recipient, payload, timestamp}.
// Decoding is two-step so an unrecognised kind can be told apart from a broken frame.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::models::{Message, MessageKind, Payload};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame is not a valid envelope, or the payload does not fit its kind.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The kind is not one we know. Callers ignore these.
    #[error("Unknown message kind: {0}")]
    UnknownKind(String),
}

/// Loosely typed envelope as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    pub id: String,
    pub kind: String,
    pub sender: String,
    pub sender_display_name: String,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TryFrom<WireEnvelope> for Message {
    type Error = DecodeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let kind: MessageKind = wire.kind.parse()?;
        let payload = Payload::from_value(kind, wire.payload)
            .map_err(|e| DecodeError::MalformedEnvelope(format!("{} payload: {}", kind, e)))?;

        if wire.id.is_empty() || wire.sender.is_empty() {
            return Err(DecodeError::MalformedEnvelope("missing id or sender".to_string()));
        }

        Ok(Message {
            id: wire.id,
            sender: wire.sender,
            sender_display_name: wire.sender_display_name,
            recipient: wire.recipient,
            payload,
            timestamp: wire.timestamp,
        })
    }
}

pub fn encode(message: &Message) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

pub fn decode(frame: &str) -> Result<Message, DecodeError> {
    let wire: WireEnvelope =
        serde_json::from_str(frame).map_err(|e| DecodeError::MalformedEnvelope(e.to_string()))?;
    Message::try_from(wire)
}
