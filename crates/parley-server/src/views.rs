//! Builds wire views (profiles resolved) from store records.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parley_shared::protocol::{ChannelView, MessageView, UserProfile};
use parley_shared::types::UserId;
use parley_store::{Channel, ChatStore, Message, StoreError};

#[derive(Clone)]
pub struct ViewBuilder {
    store: Arc<dyn ChatStore>,
}

impl ViewBuilder {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    async fn profiles(
        &self,
        ids: impl IntoIterator<Item = UserId>,
    ) -> Result<HashMap<UserId, UserProfile>, StoreError> {
        let ids: Vec<UserId> = ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let users = self.store.users_by_ids(&ids).await?;
        Ok(users.into_iter().map(|u| (u.id, u.profile())).collect())
    }

    fn render(message: &Message, profiles: &HashMap<UserId, UserProfile>) -> MessageView {
        let profile = |id: UserId| {
            profiles
                .get(&id)
                .cloned()
                .unwrap_or_else(|| UserProfile::unknown(id))
        };

        MessageView {
            id: message.id,
            sender: profile(message.sender),
            recipient: message.recipient().map(profile),
            channel_id: message.channel_id(),
            body: message.body.to_fields(),
            timestamp: message.timestamp,
            is_edited: message.is_edited,
            edited_at: message.edited_at,
            is_deleted: message.is_deleted,
            original_content_type: message.original_content_type,
            mentions: message.mentions.clone(),
        }
    }

    pub async fn message(&self, message: &Message) -> Result<MessageView, StoreError> {
        let ids = std::iter::once(message.sender).chain(message.recipient());
        let profiles = self.profiles(ids).await?;
        Ok(Self::render(message, &profiles))
    }

    /// Views for a history page, with one profile lookup for all senders.
    pub async fn messages(&self, messages: &[Message]) -> Result<Vec<MessageView>, StoreError> {
        let ids = messages
            .iter()
            .flat_map(|m| std::iter::once(m.sender).chain(m.recipient()));
        let profiles = self.profiles(ids).await?;
        Ok(messages.iter().map(|m| Self::render(m, &profiles)).collect())
    }

    pub async fn channel(&self, channel: &Channel) -> Result<ChannelView, StoreError> {
        let ids = std::iter::once(channel.admin).chain(channel.members.iter().copied());
        let profiles = self.profiles(ids).await?;
        let profile = |id: &UserId| {
            profiles
                .get(id)
                .cloned()
                .unwrap_or_else(|| UserProfile::unknown(*id))
        };

        let pinned_message = match channel.pinned_message {
            Some(id) => match self.store.find_message(id).await? {
                Some(message) => Some(Box::new(self.message(&message).await?)),
                None => None,
            },
            None => None,
        };

        Ok(ChannelView {
            id: channel.id,
            name: channel.name.clone(),
            admin: profile(&channel.admin),
            members: channel.members.iter().map(profile).collect(),
            pinned_message,
            join_token: channel.join_token.clone(),
            created_at: channel.created_at,
            updated_at: channel.updated_at,
        })
    }
}
