//! # xpchat-client
//!
//! Client side of the XPchat signaling protocol: a reconnecting WebSocket
//! connection to the relay, the typing-indicator debouncer and the bridge
//! that feeds call signals into an [`xpchat_media::CallManager`].

pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod retry;
pub mod typing;

pub use bridge::{spawn_bridge, ClientEvent};
pub use config::ClientConfig;
pub use connection::{await_auth, SignalingClient};
pub use error::ClientError;
pub use retry::RetryPolicy;
pub use typing::TypingNotifier;
