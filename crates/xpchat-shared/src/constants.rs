/// Application name
pub const APP_NAME: &str = "XPchat";

/// Default HTTP / WebSocket port (server)
pub const DEFAULT_HTTP_PORT: u16 = 3000;

/// Path of the WebSocket endpoint
pub const WS_PATH: &str = "/ws";

/// Public room every connected user takes part in
pub const GENERAL_CHAT_ID: &str = "general";

/// Maximum inbound WebSocket frame size in bytes (256 KiB)
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Maximum upload size in bytes (50 MiB)
pub const MAX_UPLOAD_SIZE: usize = 50 * 1024 * 1024;

/// Caller gives up on an unanswered offer after this many seconds
pub const DEFAULT_OFFER_TIMEOUT_SECS: u64 = 45;

/// Callee stops ringing after this many seconds
pub const DEFAULT_RING_TIMEOUT_SECS: u64 = 30;

/// Quiet period after the last keystroke before `isTyping=false` is sent
pub const TYPING_IDLE_MS: u64 = 1000;

/// Client reconnection defaults
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;
pub const RECONNECT_BASE_DELAY_MS: u64 = 1000;
pub const RECONNECT_MULTIPLIER: u32 = 2;
