//! Domain model structs owned by the document store.
//!
//! The realtime core reads these to make policy and membership decisions;
//! only edit/delete mutate a [`Message`] after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use parley_shared::constants::DELETED_MESSAGE_TOMBSTONE;
use parley_shared::protocol::{validate_text, MessageBody, UserProfile};
use parley_shared::types::{ChannelId, MessageId, MessageType, UserId};
use parley_shared::ProtocolError;

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A local user record, kept in sync with the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    /// Subject id assigned by the identity provider.
    pub external_id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub image: Option<String>,
    pub color: Option<i64>,
    pub profile_setup: bool,
    /// Whether other users may open direct conversations with this user.
    pub allow_direct_messages: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// "First Last", falling back to the email when no name is set.
    pub fn display_name(&self) -> String {
        let name = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        );
        let name = name.trim();
        if name.is_empty() {
            self.email.clone()
        } else {
            name.to_string()
        }
    }

    /// Case-insensitive substring match on first name, last name or email.
    /// An empty term matches everyone.
    pub fn matches_search(&self, term: &str) -> bool {
        let needle = term.trim().to_lowercase();
        [
            self.first_name.as_deref(),
            self.last_name.as_deref(),
            Some(self.email.as_str()),
        ]
        .into_iter()
        .flatten()
        .any(|field| field.to_lowercase().contains(&needle))
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            image: self.image.clone(),
            color: self.color,
        }
    }
}

/// Fields pushed by the identity provider on create/update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserUpsert {
    pub external_id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub image: Option<String>,
}

/// Self-service profile edit. Marks the profile as set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub first_name: String,
    pub last_name: String,
    pub color: Option<i64>,
}

/// A direct-message partner and when the latest message between the two was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectContact {
    pub user: UserId,
    pub last_message_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub admin: UserId,
    /// Explicit members. The admin is not necessarily listed here.
    pub members: Vec<UserId>,
    /// Message ids in append order.
    pub messages: Vec<MessageId>,
    pub pinned_message: Option<MessageId>,
    /// Opaque token allowing anyone holding it to join.
    pub join_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    pub fn is_admin(&self, user: &UserId) -> bool {
        self.admin == *user
    }

    /// Admin counts as a member.
    pub fn is_member(&self, user: &UserId) -> bool {
        self.is_admin(user) || self.members.contains(user)
    }
}

#[derive(Debug, Clone)]
pub struct NewChannel {
    pub name: String,
    pub admin: UserId,
    pub members: Vec<UserId>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Where a message was sent: exactly one user or exactly one channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageTarget {
    Direct(UserId),
    Channel(ChannelId),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender: UserId,
    pub target: MessageTarget,
    pub body: MessageBody,
    pub timestamp: DateTime<Utc>,
    pub is_edited: bool,
    /// Last edit time; doubles as deletion time for deleted messages.
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    /// Type the message had before it was deleted.
    pub original_content_type: Option<MessageType>,
    /// Mentioned users (channel messages only).
    pub mentions: Vec<UserId>,
}

/// Rejections raised when mutating a message in place.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("Message is already deleted")]
    AlreadyDeleted,

    #[error("Only text messages can be edited")]
    NotText,

    #[error("Invalid content: {0}")]
    InvalidContent(#[from] ProtocolError),
}

impl Message {
    pub fn recipient(&self) -> Option<UserId> {
        match self.target {
            MessageTarget::Direct(user) => Some(user),
            MessageTarget::Channel(_) => None,
        }
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        match self.target {
            MessageTarget::Channel(channel) => Some(channel),
            MessageTarget::Direct(_) => None,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Replace the text of a live text message.
    pub fn apply_edit(&mut self, new_content: &str, now: DateTime<Utc>) -> Result<(), MutationError> {
        if self.is_deleted {
            return Err(MutationError::AlreadyDeleted);
        }
        if self.message_type() != MessageType::Text {
            return Err(MutationError::NotText);
        }
        validate_text(new_content)?;

        self.body = MessageBody::Text(new_content.to_string());
        self.is_edited = true;
        self.edited_at = Some(now);
        Ok(())
    }

    /// Soft delete: the content becomes the tombstone, the original type is
    /// kept aside, nothing is ever removed from the store.
    pub fn apply_delete(&mut self, now: DateTime<Utc>) -> Result<(), MutationError> {
        if self.is_deleted {
            return Err(MutationError::AlreadyDeleted);
        }

        self.original_content_type = Some(self.message_type());
        self.body = MessageBody::Text(DELETED_MESSAGE_TOMBSTONE.to_string());
        self.is_deleted = true;
        self.edited_at = Some(now);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: UserId,
    pub target: MessageTarget,
    pub body: MessageBody,
    pub mentions: Vec<UserId>,
}

impl NewMessage {
    pub fn direct(sender: UserId, recipient: UserId, body: MessageBody) -> Self {
        Self {
            sender,
            target: MessageTarget::Direct(recipient),
            body,
            mentions: Vec::new(),
        }
    }

    pub fn channel(sender: UserId, channel: ChannelId, body: MessageBody, mentions: Vec<UserId>) -> Self {
        Self {
            sender,
            target: MessageTarget::Channel(channel),
            body,
            mentions,
        }
    }
}
