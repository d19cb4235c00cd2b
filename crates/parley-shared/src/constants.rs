/// Application name
pub const APP_NAME: &str = "Parley";

/// Content a soft-deleted message is replaced with.
pub const DELETED_MESSAGE_TOMBSTONE: &str = "This message was deleted.";

/// Maximum text message size in bytes (64 KiB)
pub const MAX_MESSAGE_SIZE: usize = 65_536;

/// Maximum attachment size in bytes (50 MiB)
pub const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;

/// Random bytes in a channel join token before base64url encoding
pub const JOIN_TOKEN_BYTES: usize = 24;

/// Default HTTP port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;
