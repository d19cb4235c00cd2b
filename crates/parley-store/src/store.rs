//! The document-store boundary used by the realtime core and the HTTP layer.
//!
//! Every call is independent: there is no transaction spanning two calls,
//! so e.g. persisting a channel message and appending it to the channel's
//! list can be interleaved with other handlers.

use async_trait::async_trait;

use parley_shared::types::{ChannelId, MessageId, UserId};

use crate::error::Result;
use crate::models::{
    Channel, DirectContact, Message, NewChannel, NewMessage, ProfileUpdate, User, UserUpsert,
};

#[async_trait]
pub trait ChatStore: Send + Sync {
    // -- users --

    async fn find_user(&self, id: UserId) -> Result<Option<User>>;

    async fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<User>>;

    /// Users for the given ids; unknown ids are silently omitted.
    async fn users_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>>;

    /// Create or update the user keyed by `external_id`.
    async fn upsert_user(&self, upsert: UserUpsert) -> Result<User>;

    async fn delete_user_by_external_id(&self, external_id: &str) -> Result<Option<User>>;

    async fn set_allow_direct_messages(&self, id: UserId, allow: bool) -> Result<User>;

    /// Every user except `exclude`, oldest account first.
    async fn list_users(&self, exclude: UserId) -> Result<Vec<User>>;

    /// Users other than `exclude` matching [`User::matches_search`], oldest first.
    async fn search_users(&self, exclude: UserId, term: &str) -> Result<Vec<User>>;

    async fn update_profile(&self, id: UserId, update: ProfileUpdate) -> Result<User>;

    async fn set_user_image(&self, id: UserId, image: Option<String>) -> Result<User>;

    // -- messages --

    async fn create_message(&self, new: NewMessage) -> Result<Message>;

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>>;

    /// Overwrite the mutable fields of an existing message, but only while
    /// the stored copy is not deleted. Returns `false` without writing when
    /// it already is, so a stale read can never revive a tombstone.
    async fn update_live_message(&self, message: &Message) -> Result<bool>;

    /// Direct messages between `a` and `b` in both directions, oldest first.
    async fn direct_history(&self, a: UserId, b: UserId) -> Result<Vec<Message>>;

    /// Everyone `user` exchanged direct messages with, latest conversation first.
    async fn direct_contacts(&self, user: UserId) -> Result<Vec<DirectContact>>;

    /// Messages in the channel's list order.
    async fn channel_messages(&self, channel: ChannelId) -> Result<Vec<Message>>;

    // -- channels --

    async fn create_channel(&self, new: NewChannel) -> Result<Channel>;

    async fn find_channel(&self, id: ChannelId) -> Result<Option<Channel>>;

    async fn find_channel_by_join_token(&self, token: &str) -> Result<Option<Channel>>;

    /// Channels where `user` is admin or member, most recently updated first.
    async fn channels_for_user(&self, user: UserId) -> Result<Vec<Channel>>;

    /// Union `members` into the channel's member set.
    async fn add_channel_members(&self, id: ChannelId, members: &[UserId]) -> Result<Channel>;

    async fn append_channel_message(&self, id: ChannelId, message: MessageId) -> Result<()>;

    async fn set_pinned_message(&self, id: ChannelId, message: Option<MessageId>) -> Result<Channel>;
}
