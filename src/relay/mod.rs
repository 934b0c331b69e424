// Relay protocol
// Store-and-forward between transport addresses. The relay never looks
// inside `data`: session frames travel through it as opaque strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod server;

pub use server::RelayServer;

/// Broadcast frames replayed to late joiners.
pub const DEFAULT_BACKLOG: usize = 50;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frames a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    Join {
        address: String,
        #[serde(rename = "displayName")]
        display_name: String,
    },
    /// `to: None` broadcasts to everyone else and lands in the backlog.
    Send {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        data: String,
    },
    Hangup {
        to: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub address: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub from: String,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

/// Frames the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Presence { peers: Vec<PresenceEntry> },
    Deliver(Delivery),
    Backlog { frames: Vec<Delivery> },
    Hangup { from: String },
    Undeliverable { to: String },
    Error { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_shapes() {
        let join = ClientFrame::Join {
            address: "peer-1".to_string(),
            display_name: "Kasun".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&join).unwrap(),
            json!({"type": "join", "address": "peer-1", "displayName": "Kasun"})
        );

        let broadcast: ClientFrame = serde_json::from_value(json!({"type": "send", "data": "x"})).unwrap();
        assert_eq!(
            broadcast,
            ClientFrame::Send {
                to: None,
                data: "x".to_string()
            }
        );
    }

    #[test]
    fn test_server_frame_shapes() {
        let deliver = ServerFrame::Deliver(Delivery {
            from: "peer-1".to_string(),
            data: "{}".to_string(),
            timestamp: Utc::now(),
        });
        let value = serde_json::to_value(&deliver).unwrap();
        assert_eq!(value["type"], "deliver");
        assert_eq!(value["from"], "peer-1");

        let undeliverable: ServerFrame = serde_json::from_value(json!({"type": "undeliverable", "to": "peer-2"})).unwrap();
        assert_eq!(
            undeliverable,
            ServerFrame::Undeliverable {
                to: "peer-2".to_string()
            }
        );
    }
}
