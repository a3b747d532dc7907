//! Types shared by the XPchat relay server and its clients: identities, call
//! descriptors and the JSON envelope exchanged over the WebSocket.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{ClientMessage, Relayed, ServerMessage};
pub use types::{CallId, CallKind, ChatId, PresenceStatus, UserId};
