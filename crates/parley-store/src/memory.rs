//! In-memory [`ChatStore`], used for development and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use parley_shared::token::generate_join_token;
use parley_shared::types::{ChannelId, MessageId, UserId};

use crate::error::{Result, StoreError};
use crate::models::{
    Channel, DirectContact, Message, MessageTarget, NewChannel, NewMessage, ProfileUpdate, User,
    UserUpsert,
};
use crate::store::ChatStore;

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, User>,
    channels: HashMap<ChannelId, Channel>,
    messages: HashMap<MessageId, Message>,
    /// Insertion order, so history queries are stable for equal timestamps.
    message_order: Vec<MessageId>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages (all kinds).
    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn find_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }

    async fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.external_id == external_id)
            .cloned())
    }

    async fn users_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>> {
        let inner = self.inner.read().await;
        Ok(ids.iter().filter_map(|id| inner.users.get(id).cloned()).collect())
    }

    async fn upsert_user(&self, upsert: UserUpsert) -> Result<User> {
        let mut inner = self.inner.write().await;

        if let Some(user) = inner
            .users
            .values_mut()
            .find(|u| u.external_id == upsert.external_id)
        {
            user.email = upsert.email;
            user.first_name = upsert.first_name;
            user.last_name = upsert.last_name;
            user.image = upsert.image;
            return Ok(user.clone());
        }

        let user = User {
            id: UserId::new(),
            external_id: upsert.external_id,
            email: upsert.email,
            first_name: upsert.first_name,
            last_name: upsert.last_name,
            image: upsert.image,
            color: None,
            profile_setup: false,
            allow_direct_messages: true,
            created_at: Utc::now(),
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn delete_user_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        let mut inner = self.inner.write().await;
        let id = inner
            .users
            .values()
            .find(|u| u.external_id == external_id)
            .map(|u| u.id);
        Ok(id.and_then(|id| inner.users.remove(&id)))
    }

    async fn set_allow_direct_messages(&self, id: UserId, allow: bool) -> Result<User> {
        let mut inner = self.inner.write().await;
        let user = inner.users.get_mut(&id).ok_or(StoreError::NotFound("User"))?;
        user.allow_direct_messages = allow;
        Ok(user.clone())
    }

    async fn list_users(&self, exclude: UserId) -> Result<Vec<User>> {
        let inner = self.inner.read().await;
        let mut users: Vec<User> = inner
            .users
            .values()
            .filter(|u| u.id != exclude)
            .cloned()
            .collect();
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    async fn search_users(&self, exclude: UserId, term: &str) -> Result<Vec<User>> {
        let mut users = self.list_users(exclude).await?;
        users.retain(|u| u.matches_search(term));
        Ok(users)
    }

    async fn update_profile(&self, id: UserId, update: ProfileUpdate) -> Result<User> {
        let mut inner = self.inner.write().await;
        let user = inner.users.get_mut(&id).ok_or(StoreError::NotFound("User"))?;
        user.first_name = Some(update.first_name);
        user.last_name = Some(update.last_name);
        user.color = update.color;
        user.profile_setup = true;
        Ok(user.clone())
    }

    async fn set_user_image(&self, id: UserId, image: Option<String>) -> Result<User> {
        let mut inner = self.inner.write().await;
        let user = inner.users.get_mut(&id).ok_or(StoreError::NotFound("User"))?;
        user.image = image;
        Ok(user.clone())
    }

    async fn create_message(&self, new: NewMessage) -> Result<Message> {
        let message = Message {
            id: MessageId::new(),
            sender: new.sender,
            target: new.target,
            body: new.body,
            timestamp: Utc::now(),
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            original_content_type: None,
            mentions: new.mentions,
        };

        let mut inner = self.inner.write().await;
        inner.message_order.push(message.id);
        inner.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>> {
        Ok(self.inner.read().await.messages.get(&id).cloned())
    }

    async fn update_live_message(&self, message: &Message) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .messages
            .get_mut(&message.id)
            .ok_or(StoreError::NotFound("Message"))?;
        if stored.is_deleted {
            return Ok(false);
        }
        *stored = message.clone();
        Ok(true)
    }

    async fn direct_history(&self, a: UserId, b: UserId) -> Result<Vec<Message>> {
        let inner = self.inner.read().await;
        let mut history: Vec<Message> = inner
            .message_order
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .filter(|m| match m.target {
                MessageTarget::Direct(recipient) => {
                    (m.sender == a && recipient == b) || (m.sender == b && recipient == a)
                }
                MessageTarget::Channel(_) => false,
            })
            .cloned()
            .collect();
        // Stable sort keeps insertion order for identical timestamps.
        history.sort_by_key(|m| m.timestamp);
        Ok(history)
    }

    async fn direct_contacts(&self, user: UserId) -> Result<Vec<DirectContact>> {
        let inner = self.inner.read().await;
        // partner -> (latest timestamp, position in insertion order)
        let mut latest = HashMap::new();
        for (position, message) in inner
            .message_order
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .enumerate()
        {
            let MessageTarget::Direct(recipient) = message.target else {
                continue;
            };
            let partner = if message.sender == user {
                recipient
            } else if recipient == user {
                message.sender
            } else {
                continue;
            };
            let key = (message.timestamp, position);
            let newest = latest.entry(partner).or_insert(key);
            if key > *newest {
                *newest = key;
            }
        }

        let mut contacts: Vec<_> = latest.into_iter().collect();
        contacts.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(contacts
            .into_iter()
            .map(|(partner, (time, _))| DirectContact {
                user: partner,
                last_message_time: time,
            })
            .collect())
    }

    async fn channel_messages(&self, channel: ChannelId) -> Result<Vec<Message>> {
        let inner = self.inner.read().await;
        let channel = inner
            .channels
            .get(&channel)
            .ok_or(StoreError::NotFound("Channel"))?;
        Ok(channel
            .messages
            .iter()
            .filter_map(|id| inner.messages.get(id).cloned())
            .collect())
    }

    async fn create_channel(&self, new: NewChannel) -> Result<Channel> {
        let now = Utc::now();
        let mut members = Vec::with_capacity(new.members.len());
        for member in new.members {
            if !members.contains(&member) {
                members.push(member);
            }
        }

        let channel = Channel {
            id: ChannelId::new(),
            name: new.name,
            admin: new.admin,
            members,
            messages: Vec::new(),
            pinned_message: None,
            join_token: generate_join_token(),
            created_at: now,
            updated_at: now,
        };

        self.inner
            .write()
            .await
            .channels
            .insert(channel.id, channel.clone());
        Ok(channel)
    }

    async fn find_channel(&self, id: ChannelId) -> Result<Option<Channel>> {
        Ok(self.inner.read().await.channels.get(&id).cloned())
    }

    async fn find_channel_by_join_token(&self, token: &str) -> Result<Option<Channel>> {
        let inner = self.inner.read().await;
        Ok(inner
            .channels
            .values()
            .find(|c| c.join_token == token)
            .cloned())
    }

    async fn channels_for_user(&self, user: UserId) -> Result<Vec<Channel>> {
        let inner = self.inner.read().await;
        let mut channels: Vec<Channel> = inner
            .channels
            .values()
            .filter(|c| c.is_member(&user))
            .cloned()
            .collect();
        channels.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(channels)
    }

    async fn add_channel_members(&self, id: ChannelId, members: &[UserId]) -> Result<Channel> {
        let mut inner = self.inner.write().await;
        let channel = inner
            .channels
            .get_mut(&id)
            .ok_or(StoreError::NotFound("Channel"))?;
        for member in members {
            if !channel.members.contains(member) {
                channel.members.push(*member);
            }
        }
        channel.updated_at = Utc::now();
        Ok(channel.clone())
    }

    async fn append_channel_message(&self, id: ChannelId, message: MessageId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let channel = inner
            .channels
            .get_mut(&id)
            .ok_or(StoreError::NotFound("Channel"))?;
        channel.messages.push(message);
        channel.updated_at = Utc::now();
        Ok(())
    }

    async fn set_pinned_message(&self, id: ChannelId, message: Option<MessageId>) -> Result<Channel> {
        let mut inner = self.inner.write().await;
        let channel = inner
            .channels
            .get_mut(&id)
            .ok_or(StoreError::NotFound("Channel"))?;
        channel.pinned_message = message;
        channel.updated_at = Utc::now();
        Ok(channel.clone())
    }
}
