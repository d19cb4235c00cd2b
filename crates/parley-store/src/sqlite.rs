//! [`ChatStore`] backed by the SQLite [`Database`].
//!
//! rusqlite is synchronous, so every call takes the connection lock on the
//! blocking thread pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use parley_shared::types::{ChannelId, MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{
    Channel, DirectContact, Message, NewChannel, NewMessage, ProfileUpdate, User, UserUpsert,
};
use crate::store::ChatStore;

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn find_user(&self, id: UserId) -> Result<Option<User>> {
        self.call(move |db| db.get_user(id)).await
    }

    async fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        let external_id = external_id.to_string();
        self.call(move |db| db.get_user_by_external_id(&external_id))
            .await
    }

    async fn users_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>> {
        let ids = ids.to_vec();
        self.call(move |db| db.get_users(&ids)).await
    }

    async fn upsert_user(&self, upsert: UserUpsert) -> Result<User> {
        self.call(move |db| db.upsert_user(&upsert)).await
    }

    async fn delete_user_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        let external_id = external_id.to_string();
        self.call(move |db| db.delete_user_by_external_id(&external_id))
            .await
    }

    async fn set_allow_direct_messages(&self, id: UserId, allow: bool) -> Result<User> {
        self.call(move |db| db.set_allow_direct_messages(id, allow))
            .await
    }

    async fn list_users(&self, exclude: UserId) -> Result<Vec<User>> {
        self.call(move |db| db.list_users_except(exclude)).await
    }

    async fn search_users(&self, exclude: UserId, term: &str) -> Result<Vec<User>> {
        let term = term.to_string();
        self.call(move |db| db.search_users(exclude, &term)).await
    }

    async fn update_profile(&self, id: UserId, update: ProfileUpdate) -> Result<User> {
        self.call(move |db| db.update_profile(id, &update)).await
    }

    async fn set_user_image(&self, id: UserId, image: Option<String>) -> Result<User> {
        self.call(move |db| db.set_user_image(id, image.as_deref()))
            .await
    }

    async fn create_message(&self, new: NewMessage) -> Result<Message> {
        self.call(move |db| db.insert_message(&new)).await
    }

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>> {
        self.call(move |db| db.get_message(id)).await
    }

    async fn update_live_message(&self, message: &Message) -> Result<bool> {
        let message = message.clone();
        self.call(move |db| db.update_live_message(&message)).await
    }

    async fn direct_history(&self, a: UserId, b: UserId) -> Result<Vec<Message>> {
        self.call(move |db| db.get_direct_messages(a, b)).await
    }

    async fn direct_contacts(&self, user: UserId) -> Result<Vec<DirectContact>> {
        self.call(move |db| db.get_direct_contacts(user)).await
    }

    async fn channel_messages(&self, channel: ChannelId) -> Result<Vec<Message>> {
        self.call(move |db| db.get_messages_for_channel(channel))
            .await
    }

    async fn create_channel(&self, new: NewChannel) -> Result<Channel> {
        self.call(move |db| db.create_channel(&new)).await
    }

    async fn find_channel(&self, id: ChannelId) -> Result<Option<Channel>> {
        self.call(move |db| db.get_channel(id)).await
    }

    async fn find_channel_by_join_token(&self, token: &str) -> Result<Option<Channel>> {
        let token = token.to_string();
        self.call(move |db| db.get_channel_by_join_token(&token))
            .await
    }

    async fn channels_for_user(&self, user: UserId) -> Result<Vec<Channel>> {
        self.call(move |db| db.list_channels_for_user(user)).await
    }

    async fn add_channel_members(&self, id: ChannelId, members: &[UserId]) -> Result<Channel> {
        let members = members.to_vec();
        self.call(move |db| db.add_channel_members(id, &members))
            .await
    }

    async fn append_channel_message(&self, id: ChannelId, message: MessageId) -> Result<()> {
        self.call(move |db| db.append_channel_message(id, message))
            .await
    }

    async fn set_pinned_message(&self, id: ChannelId, message: Option<MessageId>) -> Result<Channel> {
        self.call(move |db| db.set_pinned_message(id, message))
            .await
    }
}
