//! Client configuration.
//!
//! Defaults target a relay on localhost; `from_env` overrides individual
//! settings.

use std::time::Duration;

use xpchat_media::CallConfig;
use xpchat_shared::constants::{DEFAULT_HTTP_PORT, TYPING_IDLE_MS, WS_PATH};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the relay.
    /// Env: `XPCHAT_SERVER_URL`
    /// Default: `ws://127.0.0.1:3000/ws`
    pub server_url: String,

    pub retry: RetryPolicy,

    /// Offer and ring timeouts.
    /// Env: `XPCHAT_OFFER_TIMEOUT_SECS`, `XPCHAT_RING_TIMEOUT_SECS`
    pub call: CallConfig,

    /// Quiet period before `isTyping=false` is sent.
    pub typing_idle: Duration,

    /// How long to wait for `auth_success` after connecting.
    pub auth_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://127.0.0.1:{DEFAULT_HTTP_PORT}{WS_PATH}"),
            retry: RetryPolicy::default(),
            call: CallConfig::default(),
            typing_idle: Duration::from_millis(TYPING_IDLE_MS),
            auth_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("XPCHAT_SERVER_URL") {
            config.server_url = url;
        }

        if let Ok(val) = std::env::var("XPCHAT_OFFER_TIMEOUT_SECS") {
            match parse_secs(&val) {
                Some(d) => config.call.offer_timeout = d,
                None => tracing::warn!(value = %val, "Invalid XPCHAT_OFFER_TIMEOUT_SECS, using default"),
            }
        }

        if let Ok(val) = std::env::var("XPCHAT_RING_TIMEOUT_SECS") {
            match parse_secs(&val) {
                Some(d) => config.call.ring_timeout = d,
                None => tracing::warn!(value = %val, "Invalid XPCHAT_RING_TIMEOUT_SECS, using default"),
            }
        }

        config
    }
}

/// Positive whole seconds.
fn parse_secs(value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(Duration::from_secs(n)),
    }
}
