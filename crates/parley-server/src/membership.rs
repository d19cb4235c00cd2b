//! Recipient resolution.
//!
//! Every fanout path asks this module who should receive an event. Channel
//! audiences are read fresh from the store on each call, so members added
//! a moment ago are included without touching the registry.

use std::collections::BTreeSet;
use std::sync::Arc;

use parley_shared::types::{ChannelId, UserId};
use parley_store::{Channel, ChatStore, Message, MessageTarget, StoreError};

/// De-duplicated set of users that must receive an event.
pub type Audience = BTreeSet<UserId>;

#[derive(Clone)]
pub struct MembershipResolver {
    store: Arc<dyn ChatStore>,
}

impl MembershipResolver {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    pub fn resolve_direct(&self, a: UserId, b: UserId) -> Audience {
        BTreeSet::from([a, b])
    }

    /// Members of `channel` plus its admin.
    pub fn channel_audience(channel: &Channel) -> Audience {
        let mut audience: Audience = channel.members.iter().copied().collect();
        audience.insert(channel.admin);
        audience
    }

    pub async fn resolve_channel(&self, channel: ChannelId) -> Result<Audience, StoreError> {
        let channel = self
            .store
            .find_channel(channel)
            .await?
            .ok_or(StoreError::NotFound("Channel"))?;
        Ok(Self::channel_audience(&channel))
    }

    /// Audience of an existing message: the DM pair or its channel.
    pub async fn resolve_message(&self, message: &Message) -> Result<Audience, StoreError> {
        match message.target {
            MessageTarget::Direct(recipient) => Ok(self.resolve_direct(message.sender, recipient)),
            MessageTarget::Channel(channel) => self.resolve_channel(channel).await,
        }
    }
}
