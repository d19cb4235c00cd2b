//! v001 -- Initial schema creation.
//!
//! Creates `users`, `channels`, `channel_members`, `messages` and
//! `channel_messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (synced from the identity provider)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id                    TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    external_id           TEXT NOT NULL UNIQUE,        -- identity provider subject
    email                 TEXT NOT NULL,
    first_name            TEXT,
    last_name             TEXT,
    image                 TEXT,
    color                 INTEGER,
    profile_setup         INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    allow_direct_messages INTEGER NOT NULL DEFAULT 1,  -- boolean 0/1
    created_at            TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Channels
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels (
    id                TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    name              TEXT NOT NULL,
    admin_id          TEXT NOT NULL,
    pinned_message_id TEXT,
    join_token        TEXT NOT NULL UNIQUE,
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS channel_members (
    channel_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    added_seq  INTEGER NOT NULL,                   -- preserves insertion order

    PRIMARY KEY (channel_id, user_id),
    FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_channel_members_user ON channel_members(user_id);

-- ----------------------------------------------------------------
-- Messages: exactly one of recipient_id / channel_id is set
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                    TEXT PRIMARY KEY NOT NULL,
    sender_id             TEXT NOT NULL,
    recipient_id          TEXT,
    channel_id            TEXT,
    message_type          TEXT NOT NULL,           -- text | file | audio
    content               TEXT,
    file_url              TEXT,
    audio_url             TEXT,
    timestamp             TEXT NOT NULL,
    is_edited             INTEGER NOT NULL DEFAULT 0,
    edited_at             TEXT,
    is_deleted            INTEGER NOT NULL DEFAULT 0,
    original_content_type TEXT,
    mentions              TEXT NOT NULL DEFAULT '[]', -- JSON array of user ids

    CHECK ((recipient_id IS NULL) <> (channel_id IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_messages_direct
    ON messages(sender_id, recipient_id, timestamp);

-- ----------------------------------------------------------------
-- Channel message list (append order)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channel_messages (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id TEXT NOT NULL,
    message_id TEXT NOT NULL,

    FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_channel_messages_channel
    ON channel_messages(channel_id, seq);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
