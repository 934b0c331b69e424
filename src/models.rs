// Data model shared by the session layer, the relay and the CLI

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::p2p::chat_states::TypingStatus;
use crate::p2p::codec::{DecodeError, WireEnvelope};

static PHONE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9][0-9 ()\-]{6,19}$").expect("phone pattern is valid"));

/// A user on the network: a stable id plus the transport address it can
/// currently be reached at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            address: address.into(),
            phone: None,
        }
    }

    /// Build an identity whose id is derived from a phone number.
    ///
    /// Returns `None` when the input does not look like a phone number.
    pub fn from_phone(phone: &str, display_name: impl Into<String>, address: impl Into<String>) -> Option<Self> {
        let normalized = normalize_phone(phone)?;
        Some(Self {
            id: normalized.clone(),
            display_name: display_name.into(),
            address: address.into(),
            phone: Some(normalized),
        })
    }
}

/// Normalize a phone number to international form.
///
/// Local numbers with a leading `0` get the `+94` country prefix. Everything
/// else is reduced to `+` followed by its digits.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let trimmed = phone.trim();
    if !PHONE_PATTERN.is_match(trimmed) {
        return None;
    }
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.strip_prefix('0') {
        Some(rest) if !trimmed.starts_with('+') => Some(format!("+94{}", rest)),
        _ => Some(format!("+{}", digits)),
    }
}

/// Closed set of message kinds understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    UserInfo,
    ContactRequest,
    ContactAccept,
    #[serde(rename = "message")]
    Chat,
    Typing,
    ReadReceipt,
    CallRequest,
    CallAccepted,
    CallRejected,
    CallEnded,
    Offer,
    Answer,
    IceCandidate,
}

impl MessageKind {
    pub const ALL: [MessageKind; 13] = [
        MessageKind::UserInfo,
        MessageKind::ContactRequest,
        MessageKind::ContactAccept,
        MessageKind::Chat,
        MessageKind::Typing,
        MessageKind::ReadReceipt,
        MessageKind::CallRequest,
        MessageKind::CallAccepted,
        MessageKind::CallRejected,
        MessageKind::CallEnded,
        MessageKind::Offer,
        MessageKind::Answer,
        MessageKind::IceCandidate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::UserInfo => "user-info",
            MessageKind::ContactRequest => "contact-request",
            MessageKind::ContactAccept => "contact-accept",
            MessageKind::Chat => "message",
            MessageKind::Typing => "typing",
            MessageKind::ReadReceipt => "read-receipt",
            MessageKind::CallRequest => "call-request",
            MessageKind::CallAccepted => "call-accepted",
            MessageKind::CallRejected => "call-rejected",
            MessageKind::CallEnded => "call-ended",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
        }
    }

    /// Kinds that may only be exchanged between mutual contacts.
    pub fn is_chat_content(&self) -> bool {
        matches!(self, MessageKind::Chat | MessageKind::Typing | MessageKind::ReadReceipt)
    }

    pub fn is_contact_handshake(&self) -> bool {
        matches!(self, MessageKind::ContactRequest | MessageKind::ContactAccept)
    }

    pub fn is_call_signal(&self) -> bool {
        matches!(
            self,
            MessageKind::CallRequest
                | MessageKind::CallAccepted
                | MessageKind::CallRejected
                | MessageKind::CallEnded
                | MessageKind::Offer
                | MessageKind::Answer
                | MessageKind::IceCandidate
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownKind(s.to_string()))
    }
}

/// Discovery payload: who the sender is and where it lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    pub display_name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

impl From<&Identity> for UserInfo {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            address: identity.address.clone(),
            phone: identity.phone.clone(),
            online: true,
            last_seen: Utc::now(),
        }
    }
}

/// The card attached to contact requests and accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactCard {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingNotice {
    pub state: TypingStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub message_ids: Vec<String>,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Ringing,
    Connecting,
    Active,
    Ended,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            CallState::Idle => "Idle",
            CallState::Ringing => "Ringing",
            CallState::Connecting => "Connecting",
            CallState::Active => "Active",
            CallState::Ended => "Ended",
        };
        write!(f, "{state}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub call_type: CallType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAccepted {
    pub call_type: CallType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectReason {
    Declined,
    Busy,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRejected {
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Hangup,
    Timeout,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnded {
    pub reason: EndReason,
}

/// Offer or answer produced by the media layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Kind-specific message body. The variant decides the wire `kind`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    UserInfo(UserInfo),
    ContactRequest(ContactCard),
    ContactAccept(ContactCard),
    Chat(ChatContent),
    Typing(TypingNotice),
    ReadReceipt(Receipt),
    CallRequest(CallRequest),
    CallAccepted(CallAccepted),
    CallRejected(CallRejected),
    CallEnded(CallEnded),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::UserInfo(_) => MessageKind::UserInfo,
            Payload::ContactRequest(_) => MessageKind::ContactRequest,
            Payload::ContactAccept(_) => MessageKind::ContactAccept,
            Payload::Chat(_) => MessageKind::Chat,
            Payload::Typing(_) => MessageKind::Typing,
            Payload::ReadReceipt(_) => MessageKind::ReadReceipt,
            Payload::CallRequest(_) => MessageKind::CallRequest,
            Payload::CallAccepted(_) => MessageKind::CallAccepted,
            Payload::CallRejected(_) => MessageKind::CallRejected,
            Payload::CallEnded(_) => MessageKind::CallEnded,
            Payload::Offer(_) => MessageKind::Offer,
            Payload::Answer(_) => MessageKind::Answer,
            Payload::IceCandidate(_) => MessageKind::IceCandidate,
        }
    }

    /// Decode the body of a message whose kind is already known.
    pub fn from_value(kind: MessageKind, value: serde_json::Value) -> serde_json::Result<Self> {
        use serde_json::from_value;
        Ok(match kind {
            MessageKind::UserInfo => Payload::UserInfo(from_value(value)?),
            MessageKind::ContactRequest => Payload::ContactRequest(from_value(value)?),
            MessageKind::ContactAccept => Payload::ContactAccept(from_value(value)?),
            MessageKind::Chat => Payload::Chat(from_value(value)?),
            MessageKind::Typing => Payload::Typing(from_value(value)?),
            MessageKind::ReadReceipt => Payload::ReadReceipt(from_value(value)?),
            MessageKind::CallRequest => Payload::CallRequest(from_value(value)?),
            MessageKind::CallAccepted => Payload::CallAccepted(from_value(value)?),
            MessageKind::CallRejected => Payload::CallRejected(from_value(value)?),
            MessageKind::CallEnded => Payload::CallEnded(from_value(value)?),
            MessageKind::Offer => Payload::Offer(from_value(value)?),
            MessageKind::Answer => Payload::Answer(from_value(value)?),
            MessageKind::IceCandidate => Payload::IceCandidate(from_value(value)?),
        })
    }

    pub fn chat(text: impl Into<String>) -> Self {
        Payload::Chat(ChatContent { text: text.into() })
    }
}

/// Wire envelope. Immutable once sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub sender_display_name: String,
    /// `None` means broadcast.
    pub recipient: Option<String>,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Chat(content) => Some(&content.text),
            _ => None,
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Wire<'a> {
            id: &'a str,
            kind: MessageKind,
            sender: &'a str,
            sender_display_name: &'a str,
            recipient: Option<&'a str>,
            payload: &'a Payload,
            timestamp: &'a DateTime<Utc>,
        }

        Wire {
            id: &self.id,
            kind: self.kind(),
            sender: &self.sender,
            sender_display_name: &self.sender_display_name,
            recipient: self.recipient.as_deref(),
            payload: &self.payload,
            timestamp: &self.timestamp,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireEnvelope::deserialize(deserializer)?;
        Message::try_from(wire).map_err(de::Error::custom)
    }
}

/// Delivery progress of a stored message. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent = 1,
    Delivered = 2,
    Read = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContactStatus {
    RequestedByMe,
    RequestedByThem,
    Mutual,
}

impl fmt::Display for ContactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            ContactStatus::RequestedByMe => "RequestedByMe",
            ContactStatus::RequestedByThem => "RequestedByThem",
            ContactStatus::Mutual => "Mutual",
        };
        write!(f, "{status}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactEdge {
    pub local_id: String,
    pub remote_id: String,
    pub status: ContactStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ContactEdge {
    pub fn is_mutual(&self) -> bool {
        self.status == ContactStatus::Mutual
    }
}
