use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use parley_shared::protocol::BodyFields;
use parley_shared::types::{ChannelId, MessageId, MessageType, UserId};

use crate::database::{
    conversion_error, fmt_timestamp, get_id, get_opt_id, get_opt_timestamp, get_timestamp, Database,
};
use crate::error::{Result, StoreError};
use crate::models::{DirectContact, Message, MessageTarget, NewMessage};

const MESSAGE_COLUMNS: &str = "m.id, m.sender_id, m.recipient_id, m.channel_id, m.message_type,
     m.content, m.file_url, m.audio_url, m.timestamp, m.is_edited, m.edited_at, m.is_deleted,
     m.original_content_type, m.mentions";

impl Database {
    pub fn insert_message(&self, new: &NewMessage) -> Result<Message> {
        let message = Message {
            id: MessageId::new(),
            sender: new.sender,
            target: new.target,
            body: new.body.clone(),
            timestamp: Utc::now(),
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            original_content_type: None,
            mentions: new.mentions.clone(),
        };

        let (recipient, channel) = match message.target {
            MessageTarget::Direct(user) => (Some(user.to_string()), None),
            MessageTarget::Channel(channel) => (None, Some(channel.to_string())),
        };
        let fields = message.body.to_fields();

        self.conn().execute(
            "INSERT INTO messages (id, sender_id, recipient_id, channel_id, message_type,
                                   content, file_url, audio_url, timestamp, mentions)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                message.id.to_string(),
                message.sender.to_string(),
                recipient,
                channel,
                fields.message_type.as_str(),
                fields.content,
                fields.file_url,
                fields.audio_url,
                fmt_timestamp(&message.timestamp),
                serde_json::to_string(&message.mentions)?,
            ],
        )?;
        Ok(message)
    }

    pub fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, params![id.to_string()], row_to_message)
            .optional()?)
    }

    /// Persist the mutable fields (body, edit and delete state) unless the
    /// stored row is already deleted. `Ok(false)` means it was, and nothing
    /// was written.
    pub fn update_live_message(&self, message: &Message) -> Result<bool> {
        let fields = message.body.to_fields();
        let affected = self.conn().execute(
            "UPDATE messages
             SET message_type = ?2, content = ?3, file_url = ?4, audio_url = ?5,
                 is_edited = ?6, edited_at = ?7, is_deleted = ?8, original_content_type = ?9
             WHERE id = ?1 AND is_deleted = 0",
            params![
                message.id.to_string(),
                fields.message_type.as_str(),
                fields.content,
                fields.file_url,
                fields.audio_url,
                message.is_edited,
                message.edited_at.as_ref().map(fmt_timestamp),
                message.is_deleted,
                message.original_content_type.map(|t| t.as_str()),
            ],
        )?;
        if affected > 0 {
            return Ok(true);
        }

        let exists: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM messages WHERE id = ?1",
                params![message.id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound("Message")),
        }
    }

    /// Both directions of the conversation between `a` and `b`, oldest first.
    pub fn get_direct_messages(&self, a: UserId, b: UserId) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m
             WHERE (m.sender_id = ?1 AND m.recipient_id = ?2)
                OR (m.sender_id = ?2 AND m.recipient_id = ?1)
             ORDER BY m.timestamp ASC, m.rowid ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![a.to_string(), b.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Direct-message partners of `user` with the time of the latest
    /// message either way, newest first.
    pub fn get_direct_contacts(&self, user: UserId) -> Result<Vec<DirectContact>> {
        let mut stmt = self.conn().prepare(
            "SELECT CASE WHEN sender_id = ?1 THEN recipient_id ELSE sender_id END AS partner,
                    MAX(timestamp) AS last_time, MAX(rowid) AS last_row
             FROM messages
             WHERE recipient_id IS NOT NULL AND (sender_id = ?1 OR recipient_id = ?1)
             GROUP BY partner
             ORDER BY last_time DESC, last_row DESC",
        )?;
        let rows = stmt.query_map(params![user.to_string()], |row| {
            Ok(DirectContact {
                user: get_id(row, 0)?,
                last_message_time: get_timestamp(row, 1)?,
            })
        })?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    /// Messages in the channel's list order.
    pub fn get_messages_for_channel(&self, channel: ChannelId) -> Result<Vec<Message>> {
        let exists: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM channels WHERE id = ?1",
                params![channel.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound("Channel"));
        }

        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM channel_messages cm
             JOIN messages m ON m.id = cm.message_id
             WHERE cm.channel_id = ?1
             ORDER BY cm.seq ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![channel.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn get_message_type(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<MessageType>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        MessageType::parse(&s).ok_or_else(|| conversion_error(idx, format!("unknown message type {s}")))
    })
    .transpose()
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let recipient: Option<UserId> = get_opt_id(row, 2)?;
    let channel: Option<ChannelId> = get_opt_id(row, 3)?;
    let target = match (recipient, channel) {
        (Some(user), None) => MessageTarget::Direct(user),
        (None, Some(channel)) => MessageTarget::Channel(channel),
        _ => return Err(conversion_error(2, "message must target a user or a channel")),
    };

    let message_type = get_message_type(row, 4)?
        .ok_or_else(|| conversion_error(4, "missing message type"))?;
    let body = BodyFields {
        message_type,
        content: row.get(5)?,
        file_url: row.get(6)?,
        audio_url: row.get(7)?,
    }
    .into_body()
    .map_err(|e| conversion_error(4, e))?;

    let mentions: String = row.get(13)?;
    let mentions: Vec<UserId> =
        serde_json::from_str(&mentions).map_err(|e| conversion_error(13, e))?;

    Ok(Message {
        id: get_id(row, 0)?,
        sender: get_id(row, 1)?,
        target,
        body,
        timestamp: get_timestamp(row, 8)?,
        is_edited: row.get(9)?,
        edited_at: get_opt_timestamp(row, 10)?,
        is_deleted: row.get(11)?,
        original_content_type: get_message_type(row, 12)?,
        mentions,
    })
}
