//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use parley_shared::constants::{APP_NAME, DEFAULT_HTTP_PORT, MAX_FILE_SIZE};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file. When unset the server keeps everything in
    /// memory and loses it on restart.
    /// Env: `DATABASE_PATH`
    pub database_path: Option<PathBuf>,

    /// Directory where uploaded attachments are stored.
    /// Env: `UPLOAD_PATH`
    /// Default: `./uploads`
    pub upload_path: PathBuf,

    /// Maximum attachment size in bytes. Also the HTTP body limit.
    /// Env: `MAX_UPLOAD_SIZE`
    pub max_upload_size: usize,

    /// Ed25519 public key of the identity provider (hex-encoded, 64 chars).
    /// Verifies access tokens and webhook signatures.
    /// Env: `IDENTITY_PROVIDER_PUBKEY`
    /// Default: all-zeros, which rejects every token (development only).
    pub identity_provider_pubkey: [u8; 32],

    /// CORS origin. `None` allows any origin.
    /// Env: `ALLOWED_ORIGIN`
    pub allowed_origin: Option<String>,

    /// Sustained realtime events per second allowed per user.
    /// Env: `EVENTS_PER_SECOND`
    pub events_per_second: f64,

    /// Realtime event burst allowed per user.
    /// Env: `EVENT_BURST`
    pub event_burst: f64,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Parley"`
    pub instance_name: String,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            upload_path: PathBuf::from("./uploads"),
            max_upload_size: MAX_FILE_SIZE,
            identity_provider_pubkey: [0u8; 32],
            allowed_origin: None,
            events_per_second: 20.0,
            event_burst: 60.0,
            instance_name: APP_NAME.to_string(),
            admin_token: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = var("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Some(path) = var("UPLOAD_PATH") {
            config.upload_path = PathBuf::from(path);
        }

        if let Some(val) = var("MAX_UPLOAD_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_upload_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_UPLOAD_SIZE, using default"),
            }
        }

        if let Some(hex_key) = var("IDENTITY_PROVIDER_PUBKEY") {
            match parse_hex_pubkey(&hex_key) {
                Ok(key) => config.identity_provider_pubkey = key,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Invalid IDENTITY_PROVIDER_PUBKEY, using default (dev-only)"
                    );
                }
            }
        }

        if let Some(origin) = var("ALLOWED_ORIGIN") {
            if !origin.is_empty() && origin != "*" {
                config.allowed_origin = Some(origin);
            }
        }

        if let Some(val) = var("EVENTS_PER_SECOND") {
            match val.parse::<f64>() {
                Ok(n) if n > 0.0 => config.events_per_second = n,
                _ => tracing::warn!(value = %val, "Invalid EVENTS_PER_SECOND, using default"),
            }
        }

        if let Some(val) = var("EVENT_BURST") {
            match val.parse::<f64>() {
                Ok(n) if n >= 1.0 => config.event_burst = n,
                _ => tracing::warn!(value = %val, "Invalid EVENT_BURST, using default"),
            }
        }

        if let Some(name) = var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(token) = var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Parse a 64-character hex string into a 32-byte array.
pub fn parse_hex_pubkey(value: &str) -> Result<[u8; 32], String> {
    let value = value.trim();
    if value.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", value.len()));
    }

    let bytes = hex::decode(value).map_err(|e| format!("invalid hex: {e}"))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
