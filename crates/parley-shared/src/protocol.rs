use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::ProtocolError;
use crate::types::{ChannelId, MessageId, MessageType, UserId};

// ---------------------------------------------------------------------------
// Message bodies
// ---------------------------------------------------------------------------

/// Validated message body. The type tag and the body always agree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Text(String),
    File { url: String },
    Audio { url: String },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Text(_) => MessageType::Text,
            Self::File { .. } => MessageType::File,
            Self::Audio { .. } => MessageType::Audio,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(content) => Some(content),
            _ => None,
        }
    }

    /// Text content or attachment URL, whichever the body carries.
    pub fn summary(&self) -> &str {
        match self {
            Self::Text(content) => content,
            Self::File { url } | Self::Audio { url } => url,
        }
    }

    pub fn to_fields(&self) -> BodyFields {
        let mut fields = BodyFields {
            message_type: self.message_type(),
            content: None,
            file_url: None,
            audio_url: None,
        };
        match self {
            Self::Text(content) => fields.content = Some(content.clone()),
            Self::File { url } => fields.file_url = Some(url.clone()),
            Self::Audio { url } => fields.audio_url = Some(url.clone()),
        }
        fields
    }
}

/// Flat wire form of a body: `messageType` plus whichever of `content`,
/// `fileUrl`, `audioUrl` applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyFields {
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
}

impl BodyFields {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Text,
            content: Some(content.into()),
            file_url: None,
            audio_url: None,
        }
    }

    pub fn into_body(self) -> Result<MessageBody, ProtocolError> {
        let non_blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        match self.message_type {
            MessageType::Text => {
                let content = non_blank(self.content).ok_or(ProtocolError::EmptyContent)?;
                validate_text(&content)?;
                Ok(MessageBody::Text(content))
            }
            MessageType::File => non_blank(self.file_url)
                .map(|url| MessageBody::File { url })
                .ok_or(ProtocolError::MissingField("fileUrl")),
            MessageType::Audio => non_blank(self.audio_url)
                .map(|url| MessageBody::Audio { url })
                .ok_or(ProtocolError::MissingField("audioUrl")),
        }
    }
}

/// Check a text body (new message or edit) against the content rules.
pub fn validate_text(content: &str) -> Result<(), ProtocolError> {
    if content.trim().is_empty() {
        return Err(ProtocolError::EmptyContent);
    }
    if content.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::ContentTooLarge {
            size: content.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Client -> Server
// ---------------------------------------------------------------------------

/// Events a connected client may emit. JSON shape:
/// `{"event": "send-direct-message", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    SendDirectMessage(SendDirectMessage),
    SendChannelMessage(SendChannelMessage),
    EditMessage(EditMessage),
    DeleteMessage(DeleteMessage),
    PinMessage(PinMessage),
    /// Sent by the creator right after creating a channel over HTTP.
    AddChannelNotify(ChannelRef),
    Offer(SignalRequest),
    Answer(SignalRequest),
    Candidate(SignalRequest),
    End(SignalRequest),
    Reject(SignalRequest),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendDirectMessage(_) => "send-direct-message",
            Self::SendChannelMessage(_) => "send-channel-message",
            Self::EditMessage(_) => "edit-message",
            Self::DeleteMessage(_) => "delete-message",
            Self::PinMessage(_) => "pin-message",
            Self::AddChannelNotify(_) => "add-channel-notify",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Candidate(_) => "candidate",
            Self::End(_) => "end",
            Self::Reject(_) => "reject",
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendDirectMessage {
    pub recipient: UserId,
    #[serde(flatten)]
    pub body: BodyFields,
    #[serde(default)]
    pub correlation_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendChannelMessage {
    pub channel_id: ChannelId,
    #[serde(flatten)]
    pub body: BodyFields,
    #[serde(default)]
    pub mentions: Vec<UserId>,
    #[serde(default)]
    pub correlation_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub message_id: MessageId,
    pub new_content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinMessage {
    pub channel_id: ChannelId,
    /// `None` unpins.
    #[serde(default)]
    pub message_id: Option<MessageId>,
}

/// Any channel snapshot; only the id is trusted; the rest is re-read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRef {
    #[serde(alias = "_id", alias = "channelId")]
    pub id: ChannelId,
}

/// WebRTC signaling request. The payload (SDP, ICE candidate, ...) is
/// opaque to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    pub target: UserId,
    #[serde(default)]
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Server -> Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    ReceiveDirectMessage(Delivery),
    ReceiveChannelMessage(Delivery),
    MessageEdited(MessageView),
    MessageDeleted(MessageView),
    ChannelUpdated(ChannelView),
    DmBlocked(DmBlocked),
    SendError(SendError),
    NewChannelAdded(ChannelView),
    CallOffer(SignalDelivery),
    CallAnswered(SignalDelivery),
    CallDeclined(SignalDelivery),
    IceCandidate(SignalDelivery),
    CallEnded(SignalDelivery),
    /// Last event a connection receives after the same user connected again.
    SessionReplaced(SessionReplaced),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReceiveDirectMessage(_) => "receive-direct-message",
            Self::ReceiveChannelMessage(_) => "receive-channel-message",
            Self::MessageEdited(_) => "message-edited",
            Self::MessageDeleted(_) => "message-deleted",
            Self::ChannelUpdated(_) => "channel-updated",
            Self::DmBlocked(_) => "dm-blocked",
            Self::SendError(_) => "send-error",
            Self::NewChannelAdded(_) => "new-channel-added",
            Self::CallOffer(_) => "call-offer",
            Self::CallAnswered(_) => "call-answered",
            Self::CallDeclined(_) => "call-declined",
            Self::IceCandidate(_) => "ice-candidate",
            Self::CallEnded(_) => "call-ended",
            Self::SessionReplaced(_) => "session-replaced",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A persisted message as delivered live, plus the sender's correlation
/// token so the client can reconcile its optimistic entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    #[serde(flatten)]
    pub message: MessageView,
    #[serde(default)]
    pub correlation_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DmBlocked {
    pub recipient_id: UserId,
    pub recipient_name: String,
    pub message_type: MessageType,
    pub message_content: String,
    #[serde(default)]
    pub correlation_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendError {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDelivery {
    pub from: UserId,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReplaced {
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub image: Option<String>,
    pub color: Option<i64>,
}

impl UserProfile {
    /// Placeholder for an identity whose record no longer exists.
    pub fn unknown(id: UserId) -> Self {
        Self {
            id,
            email: String::new(),
            first_name: None,
            last_name: None,
            image: None,
            color: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: MessageId,
    pub sender: UserProfile,
    pub recipient: Option<UserProfile>,
    pub channel_id: Option<ChannelId>,
    #[serde(flatten)]
    pub body: BodyFields,
    pub timestamp: DateTime<Utc>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub original_content_type: Option<MessageType>,
    #[serde(default)]
    pub mentions: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelView {
    pub id: ChannelId,
    pub name: String,
    pub admin: UserProfile,
    pub members: Vec<UserProfile>,
    pub pinned_message: Option<Box<MessageView>>,
    pub join_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
