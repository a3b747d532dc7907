use thiserror::Error;

use xpchat_shared::ProtocolError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Gave up connecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Timed out waiting for the server")]
    Timeout,

    #[error("Connection closed")]
    Closed,
}
