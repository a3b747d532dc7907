//! # xpchat-server
//!
//! Relay server for XPchat.
//!
//! This binary provides:
//! - **WebSocket relay** (`/ws`): authenticates connections, tracks presence
//!   and forwards chat, typing and WebRTC signaling envelopes between users
//! - **REST API** (axum) for users, chats, message history and call history
//! - **Upload storage** for attachments and avatars
//! - **Per-IP rate limiting** on the REST routes

mod api;
mod config;
mod error;
mod rate_limit;
mod registry;
mod router;
mod uploads;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use xpchat_store::{Database, SqliteStore};

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::rate_limit::RateLimiter;
use crate::uploads::UploadStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,xpchat_server=debug")),
        )
        .init();

    info!("Starting XPchat relay server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;
    // Nobody is connected to a freshly started relay.
    let reset = db.reset_presence()?;
    if reset > 0 {
        info!(users = reset, "Cleared stale online status");
    }
    let store = Arc::new(SqliteStore::new(db));

    let uploads = UploadStore::new(config.upload_path.clone(), config.max_upload_size).await?;

    let rate_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);

    let http_addr = config.http_addr;
    let app_state = AppState::new(store, uploads, rate_limiter.clone(), config);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let purged = rate_limiter.purge_stale(Duration::from_secs(600)).await;
            if purged > 0 {
                tracing::debug!(purged, "Purged idle rate limit buckets");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server until shutdown
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
