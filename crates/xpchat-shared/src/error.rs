use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown `type` tag, missing required fields or invalid JSON.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),

    #[error("Envelope too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}
