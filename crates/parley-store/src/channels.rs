//! CRUD operations for [`Channel`] records.
//!
//! Members and the message list live in their own tables and are loaded
//! alongside the channel row.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use parley_shared::token::generate_join_token;
use parley_shared::types::{ChannelId, MessageId, UserId};

use crate::database::{fmt_timestamp, get_id, get_opt_id, get_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::{Channel, NewChannel};

const CHANNEL_COLUMNS: &str =
    "id, name, admin_id, pinned_message_id, join_token, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new channel with a fresh join token.
    pub fn create_channel(&self, new: &NewChannel) -> Result<Channel> {
        let id = ChannelId::new();
        let now = fmt_timestamp(&Utc::now());

        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO channels (id, name, admin_id, join_token, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                id.to_string(),
                new.name,
                new.admin.to_string(),
                generate_join_token(),
                now,
            ],
        )?;
        for member in &new.members {
            insert_member(&tx, id, *member)?;
        }
        tx.commit()?;

        self.get_channel(id)?.ok_or(StoreError::NotFound("Channel"))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_channel(&self, id: ChannelId) -> Result<Option<Channel>> {
        let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1");
        let channel = self
            .conn()
            .query_row(&sql, params![id.to_string()], row_to_channel)
            .optional()?;
        channel.map(|c| self.hydrate(c)).transpose()
    }

    pub fn get_channel_by_join_token(&self, token: &str) -> Result<Option<Channel>> {
        let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE join_token = ?1");
        let channel = self
            .conn()
            .query_row(&sql, params![token], row_to_channel)
            .optional()?;
        channel.map(|c| self.hydrate(c)).transpose()
    }

    /// Channels the user administers or belongs to, most recently active first.
    pub fn list_channels_for_user(&self, user: UserId) -> Result<Vec<Channel>> {
        let sql = format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels
             WHERE admin_id = ?1
                OR id IN (SELECT channel_id FROM channel_members WHERE user_id = ?1)
             ORDER BY updated_at DESC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![user.to_string()], row_to_channel)?;

        let mut channels = Vec::new();
        for row in rows {
            channels.push(self.hydrate(row?)?);
        }
        Ok(channels)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Union `members` into the channel; existing members are ignored.
    pub fn add_channel_members(&self, id: ChannelId, members: &[UserId]) -> Result<Channel> {
        let tx = self.conn().unchecked_transaction()?;
        touch(&tx, id)?;
        for member in members {
            insert_member(&tx, id, *member)?;
        }
        tx.commit()?;

        self.get_channel(id)?.ok_or(StoreError::NotFound("Channel"))
    }

    pub fn append_channel_message(&self, id: ChannelId, message: MessageId) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        touch(&tx, id)?;
        tx.execute(
            "INSERT INTO channel_messages (channel_id, message_id) VALUES (?1, ?2)",
            params![id.to_string(), message.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_pinned_message(&self, id: ChannelId, message: Option<MessageId>) -> Result<Channel> {
        let affected = self.conn().execute(
            "UPDATE channels SET pinned_message_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                id.to_string(),
                message.map(|m| m.to_string()),
                fmt_timestamp(&Utc::now()),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound("Channel"));
        }
        self.get_channel(id)?.ok_or(StoreError::NotFound("Channel"))
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn hydrate(&self, mut channel: Channel) -> Result<Channel> {
        let id = channel.id.to_string();

        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM channel_members WHERE channel_id = ?1 ORDER BY added_seq",
        )?;
        let rows = stmt.query_map(params![id], |row| get_id::<UserId>(row, 0))?;
        for row in rows {
            channel.members.push(row?);
        }

        let mut stmt = self.conn().prepare(
            "SELECT message_id FROM channel_messages WHERE channel_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![id], |row| get_id::<MessageId>(row, 0))?;
        for row in rows {
            channel.messages.push(row?);
        }

        Ok(channel)
    }
}

/// Bump `updated_at`, failing with `NotFound` for an unknown channel.
fn touch(conn: &rusqlite::Connection, id: ChannelId) -> Result<()> {
    let affected = conn.execute(
        "UPDATE channels SET updated_at = ?2 WHERE id = ?1",
        params![id.to_string(), fmt_timestamp(&Utc::now())],
    )?;
    if affected == 0 {
        return Err(StoreError::NotFound("Channel"));
    }
    Ok(())
}

fn insert_member(conn: &rusqlite::Connection, channel: ChannelId, user: UserId) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO channel_members (channel_id, user_id, added_seq)
         VALUES (?1, ?2,
                 (SELECT COALESCE(MAX(added_seq), 0) + 1 FROM channel_members WHERE channel_id = ?1))",
        params![channel.to_string(), user.to_string()],
    )?;
    Ok(())
}

/// Map a `channels` row; members and messages are filled in by `hydrate`.
fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: get_id(row, 0)?,
        name: row.get(1)?,
        admin: get_id(row, 2)?,
        members: Vec::new(),
        messages: Vec::new(),
        pinned_message: get_opt_id(row, 3)?,
        join_token: row.get(4)?,
        created_at: get_timestamp(row, 5)?,
        updated_at: get_timestamp(row, 6)?,
    })
}
