//! Message fanout.
//!
//! Persists messages, resolves their audience through the
//! [`MembershipResolver`] and emits events to whoever is connected right
//! now. Offline recipients miss the live event and catch up through
//! history. Once a write has committed, a failure while building or
//! delivering events is logged and never undoes it.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use parley_shared::protocol::{
    ChannelView, Delivery, DmBlocked, MessageBody, MessageView, SendError, ServerEvent,
};
use parley_shared::types::{ChannelId, MessageId, UserId};
use parley_store::{Channel, ChatStore, Message, MutationError, NewMessage, StoreError};

use crate::error::ServerError;
use crate::membership::{Audience, MembershipResolver};
use crate::policy::{PolicyDecision, PolicyGate};
use crate::registry::ConnectionRegistry;
use crate::views::ViewBuilder;

/// Result of a send attempt that did not fail outright.
#[derive(Debug)]
pub enum SendOutcome {
    /// Persisted and queued for `delivered` live connections.
    Sent { message: Message, delivered: usize },
    /// The recipient does not accept direct messages; the sender got dm-blocked.
    Blocked,
    /// Target missing or sender not allowed; the sender got send-error.
    Rejected { reason: String },
}

#[derive(Clone)]
pub struct FanoutEngine {
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
    membership: MembershipResolver,
    policy: PolicyGate,
    views: ViewBuilder,
}

impl FanoutEngine {
    pub fn new(store: Arc<dyn ChatStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            membership: MembershipResolver::new(store.clone()),
            policy: PolicyGate::new(),
            views: ViewBuilder::new(store.clone()),
            store,
            registry,
        }
    }

    pub fn views(&self) -> &ViewBuilder {
        &self.views
    }

    pub fn membership(&self) -> &MembershipResolver {
        &self.membership
    }

    /// Queue `event` for every connected member of `audience`.
    pub fn emit(&self, audience: &Audience, event: &ServerEvent) -> usize {
        audience
            .iter()
            .filter(|user| self.registry.send(user, event.clone()))
            .count()
    }

    fn reject(&self, sender: UserId, error: SendError) -> SendOutcome {
        let reason = error.reason.clone();
        self.registry.send(&sender, ServerEvent::SendError(error));
        SendOutcome::Rejected { reason }
    }

    // ------------------------------------------------------------------
    // Sends
    // ------------------------------------------------------------------

    pub async fn send_direct(
        &self,
        sender: UserId,
        recipient: UserId,
        body: MessageBody,
        correlation_token: Option<String>,
    ) -> Result<SendOutcome, ServerError> {
        let Some(recipient_user) = self.store.find_user(recipient).await? else {
            debug!(sender = %sender, recipient = %recipient, "Direct message to unknown recipient");
            return Ok(self.reject(
                sender,
                SendError {
                    reason: "recipient not found".into(),
                    correlation_token,
                    recipient_id: Some(recipient),
                    ..Default::default()
                },
            ));
        };

        if let PolicyDecision::Reject { recipient_label } =
            self.policy.check_direct(sender, &recipient_user)
        {
            self.registry.send(
                &sender,
                ServerEvent::DmBlocked(DmBlocked {
                    recipient_id: recipient,
                    recipient_name: recipient_label,
                    message_type: body.message_type(),
                    message_content: body.summary().to_string(),
                    correlation_token,
                }),
            );
            return Ok(SendOutcome::Blocked);
        }

        let message = self
            .store
            .create_message(NewMessage::direct(sender, recipient, body))
            .await?;

        let audience = self.membership.resolve_direct(sender, recipient);
        let delivered = match self.views.message(&message).await {
            Ok(view) => self.emit(
                &audience,
                &ServerEvent::ReceiveDirectMessage(Delivery {
                    message: view,
                    correlation_token,
                }),
            ),
            Err(e) => {
                warn!(message = %message.id, error = %e, "Direct message stored but not delivered");
                0
            }
        };

        debug!(sender = %sender, recipient = %recipient, delivered, "Direct message sent");
        Ok(SendOutcome::Sent { message, delivered })
    }

    pub async fn send_channel(
        &self,
        sender: UserId,
        channel_id: ChannelId,
        body: MessageBody,
        mentions: Vec<UserId>,
        correlation_token: Option<String>,
    ) -> Result<SendOutcome, ServerError> {
        let rejection = |reason: &str| SendError {
            reason: reason.into(),
            correlation_token: correlation_token.clone(),
            channel_id: Some(channel_id),
            ..Default::default()
        };

        let Some(channel) = self.store.find_channel(channel_id).await? else {
            return Ok(self.reject(sender, rejection("channel not found")));
        };
        if !channel.is_member(&sender) {
            warn!(sender = %sender, channel = %channel_id, "Channel message from non-member");
            return Ok(self.reject(sender, rejection("not a member of this channel")));
        }

        let message = self
            .store
            .create_message(NewMessage::channel(sender, channel_id, body, mentions))
            .await?;
        if let Err(e) = self
            .store
            .append_channel_message(channel_id, message.id)
            .await
        {
            warn!(message = %message.id, channel = %channel_id, error = %e, "Channel message stored but not listed");
        }

        let delivered = match self.channel_delivery(&message, correlation_token).await {
            Ok((audience, event)) => self.emit(&audience, &event),
            Err(e) => {
                warn!(message = %message.id, channel = %channel_id, error = %e, "Channel message stored but not delivered");
                0
            }
        };

        debug!(sender = %sender, channel = %channel_id, delivered, "Channel message sent");
        Ok(SendOutcome::Sent { message, delivered })
    }

    async fn channel_delivery(
        &self,
        message: &Message,
        correlation_token: Option<String>,
    ) -> Result<(Audience, ServerEvent), StoreError> {
        let audience = self.membership.resolve_message(message).await?;
        let view = self.views.message(message).await?;
        Ok((
            audience,
            ServerEvent::ReceiveChannelMessage(Delivery {
                message: view,
                correlation_token,
            }),
        ))
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    async fn owned_message(&self, requester: UserId, id: MessageId) -> Result<Message, ServerError> {
        let message = self
            .store
            .find_message(id)
            .await?
            .ok_or_else(|| ServerError::NotFound("Message".into()))?;
        if message.sender != requester {
            return Err(ServerError::Forbidden(
                "only the sender can change a message".into(),
            ));
        }
        Ok(message)
    }

    /// Write an edited or deleted copy back. Another handler may have
    /// deleted the message since it was read; that write wins.
    async fn commit(&self, message: &Message) -> Result<(), ServerError> {
        if !self.store.update_live_message(message).await? {
            debug!(message = %message.id, "Message deleted concurrently");
            return Err(MutationError::AlreadyDeleted.into());
        }
        Ok(())
    }

    /// Re-resolve the message's audience and emit; failures only log.
    async fn broadcast_message(&self, message: &Message, wrap: fn(MessageView) -> ServerEvent) -> usize {
        let audience = match self.membership.resolve_message(message).await {
            Ok(audience) => audience,
            Err(e) => {
                warn!(message = %message.id, error = %e, "Could not resolve message audience");
                return 0;
            }
        };
        match self.views.message(message).await {
            Ok(view) => self.emit(&audience, &wrap(view)),
            Err(e) => {
                warn!(message = %message.id, error = %e, "Could not build message view");
                0
            }
        }
    }

    pub async fn edit_message(
        &self,
        requester: UserId,
        id: MessageId,
        new_content: &str,
    ) -> Result<Message, ServerError> {
        let mut message = self.owned_message(requester, id).await?;
        message.apply_edit(new_content, Utc::now())?;
        self.commit(&message).await?;

        let delivered = self
            .broadcast_message(&message, ServerEvent::MessageEdited)
            .await;
        debug!(message = %id, delivered, "Message edited");
        Ok(message)
    }

    pub async fn delete_message(&self, requester: UserId, id: MessageId) -> Result<Message, ServerError> {
        let mut message = self.owned_message(requester, id).await?;
        message.apply_delete(Utc::now())?;
        self.commit(&message).await?;

        let delivered = self
            .broadcast_message(&message, ServerEvent::MessageDeleted)
            .await;
        debug!(message = %id, delivered, "Message deleted");
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Channel updates
    // ------------------------------------------------------------------

    async fn admin_channel(&self, requester: UserId, id: ChannelId) -> Result<Channel, ServerError> {
        let channel = self
            .store
            .find_channel(id)
            .await?
            .ok_or_else(|| ServerError::NotFound("Channel".into()))?;
        if !channel.is_admin(&requester) {
            return Err(ServerError::Forbidden(
                "only the channel admin can do that".into(),
            ));
        }
        Ok(channel)
    }

    /// Send the channel snapshot to members ∪ admin.
    async fn broadcast_channel(&self, channel: &Channel, wrap: fn(ChannelView) -> ServerEvent) -> usize {
        match self.views.channel(channel).await {
            Ok(view) => self.emit(&MembershipResolver::channel_audience(channel), &wrap(view)),
            Err(e) => {
                warn!(channel = %channel.id, error = %e, "Could not build channel view");
                0
            }
        }
    }

    /// Set or clear the pinned message. Admin only.
    pub async fn pin_message(
        &self,
        requester: UserId,
        channel_id: ChannelId,
        message_id: Option<MessageId>,
    ) -> Result<Channel, ServerError> {
        self.admin_channel(requester, channel_id).await?;

        if let Some(id) = message_id {
            let in_channel = self
                .store
                .find_message(id)
                .await?
                .is_some_and(|m| m.channel_id() == Some(channel_id));
            if !in_channel {
                return Err(ServerError::NotFound("Message".into()));
            }
        }

        let channel = self.store.set_pinned_message(channel_id, message_id).await?;
        let delivered = self
            .broadcast_channel(&channel, ServerEvent::ChannelUpdated)
            .await;
        info!(channel = %channel_id, pinned = ?message_id.map(|m| m.short()), delivered, "Pinned message updated");
        Ok(channel)
    }

    /// Announce a freshly created channel. Only the id is trusted; the
    /// snapshot is re-read from the store.
    pub async fn notify_channel_added(
        &self,
        requester: UserId,
        channel_id: ChannelId,
    ) -> Result<usize, ServerError> {
        let channel = self
            .store
            .find_channel(channel_id)
            .await?
            .ok_or_else(|| ServerError::NotFound("Channel".into()))?;
        if !channel.is_member(&requester) {
            return Err(ServerError::Forbidden("not a member of this channel".into()));
        }

        Ok(self
            .broadcast_channel(&channel, ServerEvent::NewChannelAdded)
            .await)
    }

    /// Admin adds existing users. Every id must name a known user.
    pub async fn add_members(
        &self,
        requester: UserId,
        channel_id: ChannelId,
        member_ids: &[UserId],
    ) -> Result<Channel, ServerError> {
        let before = self.admin_channel(requester, channel_id).await?;

        let mut wanted = member_ids.to_vec();
        wanted.sort();
        wanted.dedup();
        let known = self.store.users_by_ids(&wanted).await?;
        if known.len() != wanted.len() {
            return Err(ServerError::BadRequest("some member ids are not valid users".into()));
        }

        let channel = self.store.add_channel_members(channel_id, &wanted).await?;
        self.announce_membership(&before, &channel).await;
        info!(channel = %channel_id, added = wanted.len(), "Channel members added");
        Ok(channel)
    }

    /// Join by token. Joining a channel one already belongs to is a no-op.
    pub async fn join(&self, user: UserId, join_token: &str) -> Result<Channel, ServerError> {
        let before = self
            .store
            .find_channel_by_join_token(join_token)
            .await?
            .ok_or_else(|| ServerError::NotFound("Channel".into()))?;
        if before.is_member(&user) {
            return Ok(before);
        }

        let channel = self.store.add_channel_members(before.id, &[user]).await?;
        self.announce_membership(&before, &channel).await;
        info!(channel = %channel.id, user = %user, "User joined channel");
        Ok(channel)
    }

    /// channel-updated for everyone, plus new-channel-added for newcomers.
    async fn announce_membership(&self, before: &Channel, after: &Channel) {
        let view = match self.views.channel(after).await {
            Ok(view) => view,
            Err(e) => {
                warn!(channel = %after.id, error = %e, "Could not build channel view");
                return;
            }
        };

        let audience = MembershipResolver::channel_audience(after);
        let newcomers: Audience = audience
            .iter()
            .filter(|u| !before.is_member(u))
            .copied()
            .collect();

        self.emit(&audience, &ServerEvent::ChannelUpdated(view.clone()));
        self.emit(&newcomers, &ServerEvent::NewChannelAdded(view));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::constants::DELETED_MESSAGE_TOMBSTONE;
    use async_trait::async_trait;
    use parley_store::Result as StoreResult;
    use parley_store::{DirectContact, MemoryStore, NewChannel, ProfileUpdate, User, UserUpsert};
    use tokio::sync::{mpsc, Barrier};

    use crate::registry::{ConnectionHandle, Outbound, OutboundRx};

    /// A [`MemoryStore`] that can hold message readers at a barrier, so two
    /// handlers both see the message before either writes, and can fail
    /// channel list appends.
    #[derive(Default)]
    struct ScriptedStore {
        inner: MemoryStore,
        read_barrier: Option<Barrier>,
        fail_append: bool,
    }

    impl std::ops::Deref for ScriptedStore {
        type Target = MemoryStore;

        fn deref(&self) -> &MemoryStore {
            &self.inner
        }
    }

    #[async_trait]
    impl ChatStore for ScriptedStore {
        async fn find_user(&self, id: UserId) -> StoreResult<Option<User>> {
            self.inner.find_user(id).await
        }

        async fn find_user_by_external_id(&self, external_id: &str) -> StoreResult<Option<User>> {
            self.inner.find_user_by_external_id(external_id).await
        }

        async fn users_by_ids(&self, ids: &[UserId]) -> StoreResult<Vec<User>> {
            self.inner.users_by_ids(ids).await
        }

        async fn upsert_user(&self, upsert: UserUpsert) -> StoreResult<User> {
            self.inner.upsert_user(upsert).await
        }

        async fn delete_user_by_external_id(&self, external_id: &str) -> StoreResult<Option<User>> {
            self.inner.delete_user_by_external_id(external_id).await
        }

        async fn set_allow_direct_messages(&self, id: UserId, allow: bool) -> StoreResult<User> {
            self.inner.set_allow_direct_messages(id, allow).await
        }

        async fn list_users(&self, exclude: UserId) -> StoreResult<Vec<User>> {
            self.inner.list_users(exclude).await
        }

        async fn search_users(&self, exclude: UserId, term: &str) -> StoreResult<Vec<User>> {
            self.inner.search_users(exclude, term).await
        }

        async fn update_profile(&self, id: UserId, update: ProfileUpdate) -> StoreResult<User> {
            self.inner.update_profile(id, update).await
        }

        async fn set_user_image(&self, id: UserId, image: Option<String>) -> StoreResult<User> {
            self.inner.set_user_image(id, image).await
        }

        async fn create_message(&self, new: NewMessage) -> StoreResult<Message> {
            self.inner.create_message(new).await
        }

        async fn find_message(&self, id: MessageId) -> StoreResult<Option<Message>> {
            let found = self.inner.find_message(id).await;
            if let Some(barrier) = &self.read_barrier {
                barrier.wait().await;
            }
            found
        }

        async fn update_live_message(&self, message: &Message) -> StoreResult<bool> {
            self.inner.update_live_message(message).await
        }

        async fn direct_history(&self, a: UserId, b: UserId) -> StoreResult<Vec<Message>> {
            self.inner.direct_history(a, b).await
        }

        async fn direct_contacts(&self, user: UserId) -> StoreResult<Vec<DirectContact>> {
            self.inner.direct_contacts(user).await
        }

        async fn channel_messages(&self, channel: ChannelId) -> StoreResult<Vec<Message>> {
            self.inner.channel_messages(channel).await
        }

        async fn create_channel(&self, new: NewChannel) -> StoreResult<Channel> {
            self.inner.create_channel(new).await
        }

        async fn find_channel(&self, id: ChannelId) -> StoreResult<Option<Channel>> {
            self.inner.find_channel(id).await
        }

        async fn find_channel_by_join_token(&self, token: &str) -> StoreResult<Option<Channel>> {
            self.inner.find_channel_by_join_token(token).await
        }

        async fn channels_for_user(&self, user: UserId) -> StoreResult<Vec<Channel>> {
            self.inner.channels_for_user(user).await
        }

        async fn add_channel_members(&self, id: ChannelId, members: &[UserId]) -> StoreResult<Channel> {
            self.inner.add_channel_members(id, members).await
        }

        async fn append_channel_message(&self, id: ChannelId, message: MessageId) -> StoreResult<()> {
            if self.fail_append {
                return Err(StoreError::Unavailable("append refused".into()));
            }
            self.inner.append_channel_message(id, message).await
        }

        async fn set_pinned_message(&self, id: ChannelId, message: Option<MessageId>) -> StoreResult<Channel> {
            self.inner.set_pinned_message(id, message).await
        }
    }

    struct Harness {
        store: Arc<ScriptedStore>,
        registry: Arc<ConnectionRegistry>,
        engine: FanoutEngine,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_store(ScriptedStore::default())
        }

        fn with_store(store: ScriptedStore) -> Self {
            let store = Arc::new(store);
            let registry = Arc::new(ConnectionRegistry::new());
            let engine = FanoutEngine::new(store.clone(), registry.clone());
            Self {
                store,
                registry,
                engine,
            }
        }

        async fn user(&self, ext: &str) -> UserId {
            self.store
                .upsert_user(UserUpsert {
                    external_id: ext.into(),
                    email: format!("{ext}@example.com"),
                    first_name: Some(ext.into()),
                    last_name: None,
                    image: None,
                })
                .await
                .unwrap()
                .id
        }

        fn connect(&self, user: UserId) -> OutboundRx {
            let (tx, rx) = mpsc::unbounded_channel();
            self.registry.register(ConnectionHandle::new(user, tx));
            rx
        }

        async fn channel(&self, admin: UserId, members: Vec<UserId>) -> ChannelId {
            self.store
                .create_channel(NewChannel {
                    name: "general".into(),
                    admin,
                    members,
                })
                .await
                .unwrap()
                .id
        }
    }

    fn drain(rx: &mut OutboundRx) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Event(event) = item {
                events.push(event);
            }
        }
        events
    }

    fn text(s: &str) -> MessageBody {
        MessageBody::Text(s.into())
    }

    #[tokio::test]
    async fn test_direct_message_reaches_both_parties() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        let mut rx_a = h.connect(a);
        let mut rx_b = h.connect(b);

        let outcome = h
            .engine
            .send_direct(a, b, text("hi"), Some("t1".into()))
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Sent { delivered: 2, .. }));

        for rx in [&mut rx_a, &mut rx_b] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            let ServerEvent::ReceiveDirectMessage(delivery) = &events[0] else {
                panic!("expected receive-direct-message, got {}", events[0].name());
            };
            assert_eq!(delivery.message.body.content.as_deref(), Some("hi"));
            assert_eq!(delivery.correlation_token.as_deref(), Some("t1"));
        }

        let history = h.store.direct_history(a, b).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender, a);
        assert_eq!(history[0].recipient(), Some(b));
        assert_eq!(history[0].body, text("hi"));
    }

    #[tokio::test]
    async fn test_dm_blocked_persists_nothing() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        h.store.set_allow_direct_messages(b, false).await.unwrap();
        let mut rx_a = h.connect(a);
        let mut rx_b = h.connect(b);

        let outcome = h.engine.send_direct(a, b, text("hi"), None).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Blocked));

        let events = drain(&mut rx_a);
        assert_eq!(events.len(), 1);
        let ServerEvent::DmBlocked(blocked) = &events[0] else {
            panic!("expected dm-blocked");
        };
        assert_eq!(blocked.message_content, "hi");
        assert_eq!(blocked.recipient_name, "b");
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(h.store.message_count().await, 0);
    }

    #[tokio::test]
    async fn test_dm_blocked_with_offline_sender_emits_nothing() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        h.store.set_allow_direct_messages(b, false).await.unwrap();
        let mut rx_b = h.connect(b);

        let outcome = h.engine.send_direct(a, b, text("hi"), None).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Blocked));
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(h.store.message_count().await, 0);
    }

    #[tokio::test]
    async fn test_direct_to_unknown_recipient() {
        let h = Harness::new();
        let a = h.user("a").await;
        let mut rx_a = h.connect(a);

        let outcome = h
            .engine
            .send_direct(a, UserId::new(), text("hi"), Some("t9".into()))
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Rejected { .. }));

        let events = drain(&mut rx_a);
        let [ServerEvent::SendError(err)] = events.as_slice() else {
            panic!("expected a single send-error");
        };
        assert_eq!(err.reason, "recipient not found");
        assert_eq!(err.correlation_token.as_deref(), Some("t9"));
        assert_eq!(h.store.message_count().await, 0);
    }

    #[tokio::test]
    async fn test_channel_fanout_includes_late_member() {
        let h = Harness::new();
        let (x, y, z, w, outsider) = (
            h.user("x").await,
            h.user("y").await,
            h.user("z").await,
            h.user("w").await,
            h.user("o").await,
        );
        let channel = h.channel(x, vec![y, z]).await;
        let mut rx: Vec<OutboundRx> = [x, y, z, w, outsider].iter().map(|u| h.connect(*u)).collect();

        h.engine
            .send_channel(y, channel, text("first"), vec![], Some("c1".into()))
            .await
            .unwrap();

        for (i, r) in rx.iter_mut().enumerate() {
            let events = drain(r);
            if i < 3 {
                assert_eq!(events.len(), 1);
                let ServerEvent::ReceiveChannelMessage(delivery) = &events[0] else {
                    panic!("expected receive-channel-message");
                };
                assert_eq!(delivery.message.channel_id, Some(channel));
            } else {
                assert!(events.is_empty());
            }
        }

        h.engine.add_members(x, channel, &[w]).await.unwrap();
        for r in rx.iter_mut() {
            drain(r);
        }

        let outcome = h
            .engine
            .send_channel(z, channel, text("second"), vec![w], None)
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Sent { delivered: 4, .. }));
        assert_eq!(drain(&mut rx[3]).len(), 1);
        assert!(drain(&mut rx[4]).is_empty());

        let messages = h.store.channel_messages(channel).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].mentions, vec![w]);
    }

    #[tokio::test]
    async fn test_channel_send_by_non_member_is_rejected() {
        let h = Harness::new();
        let admin = h.user("admin").await;
        let outsider = h.user("outsider").await;
        let channel = h.channel(admin, vec![]).await;
        let mut rx_admin = h.connect(admin);
        let mut rx_out = h.connect(outsider);

        let outcome = h
            .engine
            .send_channel(outsider, channel, text("let me in"), vec![], None)
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Rejected { .. }));
        assert!(matches!(drain(&mut rx_out).as_slice(), [ServerEvent::SendError(_)]));
        assert!(drain(&mut rx_admin).is_empty());
        assert_eq!(h.store.message_count().await, 0);
    }

    #[tokio::test]
    async fn test_channel_send_to_missing_channel() {
        let h = Harness::new();
        let a = h.user("a").await;
        let mut rx_a = h.connect(a);

        let outcome = h
            .engine
            .send_channel(a, ChannelId::new(), text("hello?"), vec![], None)
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Rejected { ref reason } if reason == "channel not found"));
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[tokio::test]
    async fn test_edit_and_delete_by_non_sender_change_nothing() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        let SendOutcome::Sent { message, .. } =
            h.engine.send_direct(a, b, text("hi"), None).await.unwrap()
        else {
            panic!("expected send");
        };
        let mut rx_a = h.connect(a);
        let mut rx_b = h.connect(b);

        assert!(matches!(
            h.engine.edit_message(b, message.id, "hacked").await,
            Err(ServerError::Forbidden(_))
        ));
        assert!(matches!(
            h.engine.delete_message(b, message.id).await,
            Err(ServerError::Forbidden(_))
        ));

        let stored = h.store.find_message(message.id).await.unwrap().unwrap();
        assert_eq!(stored, message);
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_edit_emits_to_pair() {
        let h = Harness::new();
        let a = h.user("a").await;
        let b = h.user("b").await;
        let SendOutcome::Sent { message, .. } =
            h.engine.send_direct(a, b, text("helo"), None).await.unwrap()
        else {
            panic!("expected send");
        };
        let mut rx_b = h.connect(b);

        let edited = h.engine.edit_message(a, message.id, "hello").await.unwrap();
        assert!(edited.is_edited);

        let events = drain(&mut rx_b);
        let [ServerEvent::MessageEdited(view)] = events.as_slice() else {
            panic!("expected message-edited");
        };
        assert_eq!(view.body.content.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_second_delete_is_rejected_without_event() {
        let h = Harness::new();
        let admin = h.user("admin").await;
        let member = h.user("member").await;
        let channel = h.channel(admin, vec![member]).await;
        let SendOutcome::Sent { message, .. } = h
            .engine
            .send_channel(member, channel, text("oops"), vec![], None)
            .await
            .unwrap()
        else {
            panic!("expected send");
        };
        let mut rx_admin = h.connect(admin);

        let deleted = h.engine.delete_message(member, message.id).await.unwrap();
        assert!(deleted.is_deleted);
        assert_eq!(deleted.body, text(DELETED_MESSAGE_TOMBSTONE));

        assert!(matches!(
            h.engine.delete_message(member, message.id).await,
            Err(ServerError::InvalidState(_))
        ));

        let events = drain(&mut rx_admin);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::MessageDeleted(_)));
    }

    #[tokio::test]
    async fn test_pin_requires_admin() {
        let h = Harness::new();
        let admin = h.user("admin").await;
        let member = h.user("member").await;
        let channel = h.channel(admin, vec![member]).await;
        let SendOutcome::Sent { message, .. } = h
            .engine
            .send_channel(member, channel, text("pin me"), vec![], None)
            .await
            .unwrap()
        else {
            panic!("expected send");
        };
        let mut rx_member = h.connect(member);

        assert!(matches!(
            h.engine.pin_message(member, channel, Some(message.id)).await,
            Err(ServerError::Forbidden(_))
        ));
        assert_eq!(
            h.store.find_channel(channel).await.unwrap().unwrap().pinned_message,
            None
        );
        assert!(drain(&mut rx_member).is_empty());

        let pinned = h.engine.pin_message(admin, channel, Some(message.id)).await.unwrap();
        assert_eq!(pinned.pinned_message, Some(message.id));
        let events = drain(&mut rx_member);
        let [ServerEvent::ChannelUpdated(view)] = events.as_slice() else {
            panic!("expected channel-updated");
        };
        assert_eq!(view.pinned_message.as_ref().map(|m| m.id), Some(message.id));

        let unpinned = h.engine.pin_message(admin, channel, None).await.unwrap();
        assert_eq!(unpinned.pinned_message, None);
    }

    #[tokio::test]
    async fn test_pin_message_from_other_channel_is_not_found() {
        let h = Harness::new();
        let admin = h.user("admin").await;
        let first = h.channel(admin, vec![]).await;
        let second = h.channel(admin, vec![]).await;
        let SendOutcome::Sent { message, .. } = h
            .engine
            .send_channel(admin, second, text("elsewhere"), vec![], None)
            .await
            .unwrap()
        else {
            panic!("expected send");
        };

        assert!(matches!(
            h.engine.pin_message(admin, first, Some(message.id)).await,
            Err(ServerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_join_announces_to_newcomer() {
        let h = Harness::new();
        let admin = h.user("admin").await;
        let joiner = h.user("joiner").await;
        let channel = h.channel(admin, vec![]).await;
        let token = h.store.find_channel(channel).await.unwrap().unwrap().join_token;
        let mut rx_admin = h.connect(admin);
        let mut rx_joiner = h.connect(joiner);

        let joined = h.engine.join(joiner, &token).await.unwrap();
        assert!(joined.is_member(&joiner));

        assert!(matches!(drain(&mut rx_admin).as_slice(), [ServerEvent::ChannelUpdated(_)]));
        assert!(matches!(
            drain(&mut rx_joiner).as_slice(),
            [ServerEvent::ChannelUpdated(_), ServerEvent::NewChannelAdded(_)]
        ));

        h.engine.join(joiner, &token).await.unwrap();
        assert!(drain(&mut rx_admin).is_empty());
    }

    #[tokio::test]
    async fn test_notify_channel_added_reaches_members_and_admin() {
        let h = Harness::new();
        let admin = h.user("admin").await;
        let member = h.user("member").await;
        let channel = h.channel(admin, vec![member]).await;
        let mut rx_admin = h.connect(admin);
        let mut rx_member = h.connect(member);

        let delivered = h.engine.notify_channel_added(admin, channel).await.unwrap();
        assert_eq!(delivered, 2);
        assert!(matches!(drain(&mut rx_admin).as_slice(), [ServerEvent::NewChannelAdded(_)]));
        assert!(matches!(drain(&mut rx_member).as_slice(), [ServerEvent::NewChannelAdded(_)]));
    }

    #[tokio::test]
    async fn test_add_members_rejects_unknown_users() {
        let h = Harness::new();
        let admin = h.user("admin").await;
        let channel = h.channel(admin, vec![]).await;

        assert!(matches!(
            h.engine.add_members(admin, channel, &[UserId::new()]).await,
            Err(ServerError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_racing_edit_never_revives_deleted_message() {
        let h = Harness::with_store(ScriptedStore {
            read_barrier: Some(Barrier::new(2)),
            ..Default::default()
        });
        let a = h.user("a").await;
        let b = h.user("b").await;
        let SendOutcome::Sent { message, .. } =
            h.engine.send_direct(a, b, text("hi"), None).await.unwrap()
        else {
            panic!("expected send");
        };

        let (edited, deleted) = tokio::join!(
            h.engine.edit_message(a, message.id, "edited"),
            h.engine.delete_message(a, message.id),
        );
        assert!(deleted.is_ok());
        assert!(matches!(edited, Ok(_) | Err(ServerError::InvalidState(_))));

        let stored = h.store.inner.find_message(message.id).await.unwrap().unwrap();
        assert!(stored.is_deleted);
        assert_eq!(stored.body, text(DELETED_MESSAGE_TOMBSTONE));
    }

    #[tokio::test]
    async fn test_racing_deletes_emit_one_event() {
        let h = Harness::with_store(ScriptedStore {
            read_barrier: Some(Barrier::new(2)),
            ..Default::default()
        });
        let a = h.user("a").await;
        let b = h.user("b").await;
        let SendOutcome::Sent { message, .. } =
            h.engine.send_direct(a, b, text("hi"), None).await.unwrap()
        else {
            panic!("expected send");
        };
        let mut rx_b = h.connect(b);

        let (first, second) = tokio::join!(
            h.engine.delete_message(a, message.id),
            h.engine.delete_message(a, message.id),
        );
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ServerError::InvalidState(_)))));

        let events = drain(&mut rx_b);
        assert!(matches!(events.as_slice(), [ServerEvent::MessageDeleted(_)]));
    }

    #[tokio::test]
    async fn test_channel_send_survives_failed_list_append() {
        let h = Harness::with_store(ScriptedStore {
            fail_append: true,
            ..Default::default()
        });
        let admin = h.user("admin").await;
        let member = h.user("member").await;
        let channel = h.channel(admin, vec![member]).await;
        let mut rx_admin = h.connect(admin);
        let mut rx_member = h.connect(member);

        let outcome = h
            .engine
            .send_channel(member, channel, text("still delivered"), vec![], Some("c7".into()))
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Sent { delivered: 2, .. }));

        assert!(matches!(
            drain(&mut rx_admin).as_slice(),
            [ServerEvent::ReceiveChannelMessage(_)]
        ));
        let events = drain(&mut rx_member);
        assert!(matches!(events.as_slice(), [ServerEvent::ReceiveChannelMessage(_)]));
        assert_eq!(h.store.message_count().await, 1);
    }
}
