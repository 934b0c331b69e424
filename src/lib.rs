// heychat: phone-identified peer chat with contact handshakes and call signaling
pub mod config;
pub mod models;
pub mod p2p; // session layer
pub mod relay; // store-and-forward relay server

// Re-export main types for convenience
pub use models::*;
pub use p2p::{SessionConfig, SessionManager};
