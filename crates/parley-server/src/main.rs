//! # parley-server
//!
//! Realtime chat server.
//!
//! This binary provides:
//! - **WebSocket gateway** for direct messages, channel messages,
//!   edit/delete/pin notifications and call signaling
//! - **REST API** (axum) for channels, history, settings and attachments
//! - **Identity webhook** that keeps local users in sync with the provider
//! - **Per-IP and per-user rate limiting**

mod api;
mod auth;
mod config;
mod error;
mod fanout;
mod gateway;
mod membership;
mod policy;
mod rate_limit;
mod registry;
mod signaling;
mod uploads;
mod views;
mod webhook;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_store::{ChatStore, MemoryStore, SqliteStore};

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::uploads::UploadStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug,parley_store=debug")),
        )
        .init();

    info!("Starting Parley server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        addr = %config.http_addr,
        uploads = %config.upload_path.display(),
        max_upload = config.max_upload_size,
        "Loaded configuration"
    );
    info!(
        instance = %config.instance_name,
        persistent = config.database_path.is_some(),
        admin_enabled = config.admin_token.is_some(),
        "Instance settings"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store: Arc<dyn ChatStore> = match &config.database_path {
        Some(path) => {
            info!(path = %path.display(), "Opening SQLite store");
            Arc::new(SqliteStore::open(path)?)
        }
        None => {
            info!("No DATABASE_PATH set, keeping data in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let uploads = UploadStore::new(config.upload_path.clone(), config.max_upload_size).await?;

    let http_addr = config.http_addr;
    let app_state = AppState::new(config, store, uploads);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let ip_limiter = app_state.rate_limiter.clone();
    let event_limiter = app_state.event_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            ip_limiter.purge_stale(600.0).await;
            event_limiter.purge_stale(600.0).await;
        }
    });

    // Credential cache cleanup (every 10 minutes)
    let verifier = app_state.token_verifier.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            verifier.purge_expired().await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
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
