//! Per-frame protocol handling for an authenticated connection.

use std::sync::Arc;

use crate::connection_manager::{ConnectionHandle, SubscribeOutcome};
use crate::domain::{ChannelId, ThreadId, UserId};
use crate::hub::Hub;
use crate::metrics::WsFrameMetrics;
use crate::ratelimit::RateRule;
use crate::store::StoreError;

use super::message::{close_code, ClientMessage, ErrorCode, ServerMessage};

/// Authorization is re-run this many times when a revocation races it
const MAX_AUTHORIZATION_ATTEMPTS: usize = 3;

/// What the reader loop does after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    Close { code: u16, reason: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Authorization {
    Granted,
    Denied(ErrorCode),
}

/// Runs inbound frames through the size cap, the per-user message rate, the
/// decoder and finally the action handlers.
///
/// One dispatcher serves one connection's reader loop, so frames from the
/// same connection are handled strictly one after another.
pub struct Dispatcher {
    hub: Arc<Hub>,
    max_message_bytes: usize,
}

impl Dispatcher {
    pub fn new(hub: Arc<Hub>, max_message_bytes: usize) -> Self {
        Self {
            hub,
            max_message_bytes,
        }
    }

    pub async fn handle_frame(&self, conn: &ConnectionHandle, payload: &[u8]) -> FrameOutcome {
        if payload.len() > self.max_message_bytes {
            tracing::warn!(
                connection_id = %conn.id,
                size = payload.len(),
                "Inbound frame over size cap"
            );
            return FrameOutcome::Close {
                code: close_code::MESSAGE_TOO_BIG,
                reason: "message too big",
            };
        }

        if !self.allow(RateRule::Message, conn.user_id) {
            tracing::warn!(connection_id = %conn.id, user_id = conn.user_id, "Message rate exceeded");
            return FrameOutcome::Close {
                code: close_code::RATE_LIMITED,
                reason: "rate limited",
            };
        }

        let message = match std::str::from_utf8(payload)
            .ok()
            .map(ClientMessage::parse)
        {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                WsFrameMetrics::record("invalid");
                tracing::debug!(connection_id = %conn.id, error = %e, "Dropping malformed frame");
                return FrameOutcome::Continue;
            }
            None => {
                WsFrameMetrics::record("invalid");
                tracing::debug!(connection_id = %conn.id, "Dropping non UTF-8 frame");
                return FrameOutcome::Continue;
            }
        };

        WsFrameMetrics::record(message.kind());
        self.dispatch(conn, message).await;
        FrameOutcome::Continue
    }

    #[tracing::instrument(
        name = "ws.message",
        skip(self, conn),
        fields(connection_id = %conn.id, user_id = conn.user_id, message_type = message.kind())
    )]
    async fn dispatch(&self, conn: &ConnectionHandle, message: ClientMessage) {
        let registry = self.hub.registry();

        match message {
            ClientMessage::Subscribe { channel_id } => {
                if !self.allow(RateRule::Subscribe, conn.user_id) {
                    self.reply(conn, ServerMessage::channel_error(ErrorCode::RateLimited, channel_id))
                        .await;
                    return;
                }
                if let Some(reply) = self.subscribe_channel(conn, channel_id).await {
                    self.reply(conn, reply).await;
                }
            }
            ClientMessage::Unsubscribe { channel_id } => {
                if self.allow(RateRule::Unsubscribe, conn.user_id) {
                    registry.unsubscribe_channel(conn.id, channel_id);
                }
            }
            ClientMessage::SubscribeDm { thread_id } => {
                if !self.allow(RateRule::SubscribeDm, conn.user_id) {
                    self.reply(conn, ServerMessage::dm_error(ErrorCode::RateLimited, thread_id))
                        .await;
                    return;
                }
                if let Some(reply) = self.subscribe_dm(conn, thread_id).await {
                    self.reply(conn, reply).await;
                }
            }
            ClientMessage::UnsubscribeDm { thread_id } => {
                if self.allow(RateRule::UnsubscribeDm, conn.user_id) {
                    registry.unsubscribe_dm(conn.id, thread_id);
                }
            }
            ClientMessage::SubscribeHome => {
                if !self.allow(RateRule::SubscribeHome, conn.user_id) {
                    self.reply(conn, ServerMessage::error(ErrorCode::RateLimited)).await;
                    return;
                }
                if registry.set_home(conn.id, true) {
                    self.reply(conn, ServerMessage::SubscribedHome).await;
                }
            }
            ClientMessage::UnsubscribeHome => {
                if self.allow(RateRule::UnsubscribeHome, conn.user_id) {
                    registry.set_home(conn.id, false);
                }
            }
        }
    }

    /// Authorize, add, then make sure no revocation slipped in between.
    ///
    /// `None` means the connection closed meanwhile and nothing is sent.
    async fn subscribe_channel(
        &self,
        conn: &ConnectionHandle,
        channel_id: ChannelId,
    ) -> Option<ServerMessage> {
        let registry = self.hub.registry();

        for attempt in 1..=MAX_AUTHORIZATION_ATTEMPTS {
            let epoch = registry.revocation_epoch(conn.user_id);

            match self.authorize_channel(conn.user_id, channel_id).await {
                Ok(Authorization::Granted) => {}
                Ok(Authorization::Denied(code)) => {
                    return Some(ServerMessage::channel_error(code, channel_id));
                }
                Err(e) => {
                    tracing::error!(channel_id = channel_id, error = %e, "Channel authorization failed");
                    return Some(ServerMessage::channel_error(ErrorCode::ServerError, channel_id));
                }
            }

            let outcome = registry.subscribe_channel(conn.id, channel_id);
            if outcome == SubscribeOutcome::Closed {
                tracing::debug!(connection_id = %conn.id, "Connection closed during authorization");
                return None;
            }
            if registry.revocation_epoch(conn.user_id) == epoch {
                return Some(ServerMessage::Subscribed { channel_id });
            }

            if outcome == SubscribeOutcome::Added {
                registry.unsubscribe_channel(conn.id, channel_id);
            }
            tracing::debug!(
                channel_id = channel_id,
                attempt = attempt,
                "Revocation raced authorization, retrying"
            );
        }

        tracing::warn!(channel_id = channel_id, "Giving up on channel authorization");
        Some(ServerMessage::channel_error(ErrorCode::ServerError, channel_id))
    }

    async fn subscribe_dm(&self, conn: &ConnectionHandle, thread_id: ThreadId) -> Option<ServerMessage> {
        match self.authorize_dm(conn.user_id, thread_id).await {
            Ok(Authorization::Granted) => {}
            Ok(Authorization::Denied(code)) => return Some(ServerMessage::dm_error(code, thread_id)),
            Err(e) => {
                tracing::error!(thread_id = thread_id, error = %e, "DM authorization failed");
                return Some(ServerMessage::dm_error(ErrorCode::ServerError, thread_id));
            }
        }

        match self.hub.registry().subscribe_dm(conn.id, thread_id) {
            SubscribeOutcome::Closed => None,
            _ => Some(ServerMessage::SubscribedDm { thread_id }),
        }
    }

    async fn authorize_channel(
        &self,
        user_id: UserId,
        channel_id: ChannelId,
    ) -> Result<Authorization, StoreError> {
        let store = self.hub.store();

        let Some(room) = store.channel_room(channel_id).await? else {
            return Ok(Authorization::Denied(ErrorCode::ChannelNotFound));
        };
        if store.is_room_banned(room.room_id, user_id).await? {
            return Ok(Authorization::Denied(ErrorCode::RoomBanned));
        }
        if !room.is_public
            && room.owner_id != user_id
            && !store.is_room_member(room.room_id, user_id).await?
        {
            return Ok(Authorization::Denied(ErrorCode::NotMember));
        }
        Ok(Authorization::Granted)
    }

    async fn authorize_dm(
        &self,
        user_id: UserId,
        thread_id: ThreadId,
    ) -> Result<Authorization, StoreError> {
        let store = self.hub.store();

        let other = match store.dm_thread_members(thread_id).await? {
            Some((a, b)) if a == user_id => b,
            Some((a, b)) if b == user_id => a,
            _ => return Ok(Authorization::Denied(ErrorCode::Forbidden)),
        };
        if other != user_id && !store.are_friends(user_id, other).await? {
            return Ok(Authorization::Denied(ErrorCode::NotFriends));
        }
        Ok(Authorization::Granted)
    }

    fn allow(&self, rule: RateRule, user_id: UserId) -> bool {
        self.hub
            .limiter()
            .check(rule, &user_id.to_string())
            .is_allowed()
    }

    async fn reply(&self, conn: &ConnectionHandle, message: ServerMessage) {
        let Some(frame) = crate::broadcast::Broadcaster::encode(&message) else {
            return;
        };
        if conn.send(frame).await.is_err() {
            tracing::debug!(connection_id = %conn.id, "Reply dropped, writer gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::{ConnectionRegistry, OutboundMessage, TopicKey};
    use crate::domain::RoomId;
    use crate::ratelimit::{RateLimitConfig, RuleLimit};
    use crate::store::{GatewayStore, MemoryStore, RoomAccess};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;
    use tokio::sync::mpsc;

    /// Revokes `revoked_user`'s access every time a channel is looked up,
    /// `races` times
    struct RacingStore {
        inner: MemoryStore,
        registry: OnceLock<Arc<ConnectionRegistry>>,
        revoked_user: UserId,
        races: AtomicUsize,
    }

    #[async_trait]
    impl GatewayStore for RacingStore {
        async fn channel_room(&self, channel_id: ChannelId) -> Result<Option<RoomAccess>, StoreError> {
            let raced = self
                .races
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if raced {
                if let Some(registry) = self.registry.get() {
                    registry.bump_revocation_epoch(self.revoked_user);
                }
            }
            self.inner.channel_room(channel_id).await
        }

        async fn is_room_banned(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError> {
            self.inner.is_room_banned(room_id, user_id).await
        }

        async fn is_room_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError> {
            self.inner.is_room_member(room_id, user_id).await
        }

        async fn dm_thread_members(
            &self,
            thread_id: ThreadId,
        ) -> Result<Option<(UserId, UserId)>, StoreError> {
            self.inner.dm_thread_members(thread_id).await
        }

        async fn are_friends(&self, a: UserId, b: UserId) -> Result<bool, StoreError> {
            self.inner.are_friends(a, b).await
        }

        async fn room_channel_ids(&self, room_id: RoomId) -> Result<Vec<ChannelId>, StoreError> {
            self.inner.room_channel_ids(room_id).await
        }

        async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomId>, StoreError> {
            self.inner.rooms_for_user(user_id).await
        }

        fn backend(&self) -> &'static str {
            "racing"
        }
    }

    fn racing(races: usize) -> (Arc<Hub>, Dispatcher) {
        racing_for(5, races)
    }

    fn racing_for(revoked_user: UserId, races: usize) -> (Arc<Hub>, Dispatcher) {
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            registry: OnceLock::new(),
            revoked_user,
            races: AtomicUsize::new(races),
        });
        store.inner.add_room(2, 100, true);
        store.inner.add_channel(20, 2);

        let (hub, _worker) = Hub::new(RateLimitConfig::default(), store.clone());
        let _ = store.registry.set(hub.registry().clone());
        let dispatcher = Dispatcher::new(hub.clone(), 64 * 1024);
        (hub, dispatcher)
    }

    struct Fixture {
        hub: Arc<Hub>,
        store: Arc<MemoryStore>,
        dispatcher: Dispatcher,
    }

    fn fixture_with(config: RateLimitConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.add_room(1, 100, false);
        store.add_channel(10, 1);
        store.add_room(2, 100, true);
        store.add_channel(20, 2);
        store.add_dm_thread(30, 5, 6);

        let (hub, _worker) = Hub::new(config, store.clone());
        let dispatcher = Dispatcher::new(hub.clone(), 64 * 1024);
        Fixture {
            hub,
            store,
            dispatcher,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RateLimitConfig::default())
    }

    fn connect(
        f: &Fixture,
        user_id: UserId,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (f.hub.registry().register(user_id, tx), rx)
    }

    fn next_json(rx: &mut mpsc::Receiver<OutboundMessage>) -> Option<serde_json::Value> {
        match rx.try_recv().ok()? {
            OutboundMessage::Text(json) => serde_json::from_str(&json).ok(),
            OutboundMessage::Close { .. } => None,
        }
    }

    async fn send(f: &Fixture, conn: &ConnectionHandle, text: &str) -> FrameOutcome {
        f.dispatcher.handle_frame(conn, text.as_bytes()).await
    }

    #[tokio::test]
    async fn test_non_member_of_private_room_is_refused() {
        let f = fixture();
        let (conn, mut rx) = connect(&f, 5);

        send(&f, &conn, r#"{"type":"subscribe","channelId":10}"#).await;

        let reply = next_json(&mut rx).unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "not_member");
        assert!(!f.hub.registry().is_subscribed(&TopicKey::Channel(10), conn.id));
    }

    #[tokio::test]
    async fn test_member_public_and_owner_subscribe() {
        let f = fixture();
        f.store.add_member(1, 5);
        let (member, mut member_rx) = connect(&f, 5);
        let (owner, mut owner_rx) = connect(&f, 100);
        let (stranger, mut stranger_rx) = connect(&f, 9);

        send(&f, &member, r#"{"type":"subscribe","channelId":10}"#).await;
        send(&f, &owner, r#"{"type":"subscribe","channelId":10}"#).await;
        send(&f, &stranger, r#"{"type":"subscribe","channelId":20}"#).await;

        for rx in [&mut member_rx, &mut owner_rx] {
            let reply = next_json(rx).unwrap();
            assert_eq!(reply["type"], "subscribed");
            assert_eq!(reply["channelId"], 10);
        }
        assert_eq!(next_json(&mut stranger_rx).unwrap()["channelId"], 20);
        assert!(f.hub.registry().is_subscribed(&TopicKey::Channel(20), stranger.id));
    }

    #[tokio::test]
    async fn test_channel_not_found_and_banned() {
        let f = fixture();
        f.store.ban(2, 5);
        let (conn, mut rx) = connect(&f, 5);

        send(&f, &conn, r#"{"type":"subscribe","channelId":999}"#).await;
        let reply = next_json(&mut rx).unwrap();
        assert_eq!(reply["error"], "channel_not_found");
        assert_eq!(reply["channelId"], 999);

        send(&f, &conn, r#"{"type":"subscribe","channelId":20}"#).await;
        assert_eq!(next_json(&mut rx).unwrap()["error"], "room_banned");
    }

    #[tokio::test]
    async fn test_dm_requires_membership_and_friendship() {
        let f = fixture();
        let (member, mut member_rx) = connect(&f, 5);
        let (outsider, mut outsider_rx) = connect(&f, 7);

        send(&f, &outsider, r#"{"type":"subscribe_dm","threadId":30}"#).await;
        assert_eq!(next_json(&mut outsider_rx).unwrap()["error"], "forbidden");

        send(&f, &member, r#"{"type":"subscribe_dm","threadId":30}"#).await;
        let reply = next_json(&mut member_rx).unwrap();
        assert_eq!(reply["error"], "not_friends");
        assert_eq!(reply["threadId"], 30);

        f.store.befriend(6, 5);
        send(&f, &member, r#"{"type":"subscribe_dm","threadId":30}"#).await;
        assert_eq!(next_json(&mut member_rx).unwrap()["type"], "subscribed_dm");
        assert!(f.hub.registry().is_subscribed(&TopicKey::Dm(30), member.id));

        send(&f, &member, r#"{"type":"unsubscribe_dm","threadId":30}"#).await;
        assert!(next_json(&mut member_rx).is_none());
        assert!(!f.hub.registry().has_topic(&TopicKey::Dm(30)));
    }

    #[tokio::test]
    async fn test_home_toggle() {
        let f = fixture();
        let (conn, mut rx) = connect(&f, 5);

        send(&f, &conn, r#"{"type":"subscribe_home"}"#).await;
        assert_eq!(next_json(&mut rx).unwrap()["type"], "subscribed_home");
        assert!(conn.home_enabled());

        send(&f, &conn, r#"{"type":"unsubscribe_home"}"#).await;
        assert!(next_json(&mut rx).is_none());
        assert!(!conn.home_enabled());
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped_silently() {
        let f = fixture();
        let (conn, mut rx) = connect(&f, 5);

        for text in [
            "not json",
            r#"{"type":"teleport"}"#,
            r#"{"type":"subscribe"}"#,
            r#"{"type":"subscribe","channelId":"10"}"#,
            r#"{"type":"subscribe","channelId":-1}"#,
        ] {
            assert_eq!(send(&f, &conn, text).await, FrameOutcome::Continue);
        }
        assert!(next_json(&mut rx).is_none());
    }

    #[tokio::test]
    async fn test_oversize_frame_closes() {
        let f = fixture();
        let (conn, _rx) = connect(&f, 5);
        let payload = vec![b' '; 64 * 1024 + 1];

        assert_eq!(
            f.dispatcher.handle_frame(&conn, &payload).await,
            FrameOutcome::Close {
                code: close_code::MESSAGE_TOO_BIG,
                reason: "message too big",
            }
        );
    }

    #[tokio::test]
    async fn test_global_message_rate_closes() {
        let f = fixture_with(RateLimitConfig {
            message: RuleLimit::new(60_000, 2),
            ..Default::default()
        });
        let (conn, _rx) = connect(&f, 5);

        assert_eq!(send(&f, &conn, "{}").await, FrameOutcome::Continue);
        assert_eq!(send(&f, &conn, "{}").await, FrameOutcome::Continue);
        assert!(matches!(
            send(&f, &conn, "{}").await,
            FrameOutcome::Close {
                code: close_code::RATE_LIMITED,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_subscribe_rate_limit_replies_error() {
        let f = fixture_with(RateLimitConfig {
            subscribe: RuleLimit::new(60_000, 1),
            ..Default::default()
        });
        let (conn, mut rx) = connect(&f, 5);

        send(&f, &conn, r#"{"type":"subscribe","channelId":20}"#).await;
        assert_eq!(next_json(&mut rx).unwrap()["type"], "subscribed");

        send(&f, &conn, r#"{"type":"subscribe","channelId":20}"#).await;
        let reply = next_json(&mut rx).unwrap();
        assert_eq!(reply["error"], "rate_limited");
        assert_eq!(reply["channelId"], 20);
    }

    #[tokio::test]
    async fn test_store_outage_replies_server_error() {
        let f = fixture();
        f.store.set_unavailable(true);
        let (conn, mut rx) = connect(&f, 5);

        send(&f, &conn, r#"{"type":"subscribe","channelId":20}"#).await;
        let reply = next_json(&mut rx).unwrap();
        assert_eq!(reply["error"], "server_error");
        assert_eq!(reply["channelId"], 20);
        assert!(!f.hub.registry().has_topic(&TopicKey::Channel(20)));
    }

    #[tokio::test]
    async fn test_closed_connection_gets_no_subscription() {
        let f = fixture();
        let (conn, _rx) = connect(&f, 5);
        f.hub.registry().unregister(conn.id);

        send(&f, &conn, r#"{"type":"subscribe","channelId":20}"#).await;
        assert!(!f.hub.registry().has_topic(&TopicKey::Channel(20)));
    }

    #[tokio::test]
    async fn test_revocation_during_authorization_is_rechecked() {
        let (hub, dispatcher) = racing(1);
        let (tx, mut rx) = mpsc::channel(8);
        let conn = hub.registry().register(5, tx);

        dispatcher
            .handle_frame(&conn, br#"{"type":"subscribe","channelId":20}"#)
            .await;

        assert_eq!(next_json(&mut rx).unwrap()["type"], "subscribed");
        assert!(hub.registry().is_subscribed(&TopicKey::Channel(20), conn.id));
    }

    #[tokio::test]
    async fn test_persistent_revocation_gives_up() {
        let (hub, dispatcher) = racing(MAX_AUTHORIZATION_ATTEMPTS);
        let (tx, mut rx) = mpsc::channel(8);
        let conn = hub.registry().register(5, tx);

        dispatcher
            .handle_frame(&conn, br#"{"type":"subscribe","channelId":20}"#)
            .await;

        assert_eq!(next_json(&mut rx).unwrap()["error"], "server_error");
        assert!(!hub.registry().has_topic(&TopicKey::Channel(20)));
    }

    #[tokio::test]
    async fn test_revocation_of_another_user_does_not_retry() {
        let (hub, dispatcher) = racing_for(6, MAX_AUTHORIZATION_ATTEMPTS);
        let (tx_other, _rx_other) = mpsc::channel(8);
        hub.registry().register(6, tx_other);
        let (tx, mut rx) = mpsc::channel(8);
        let conn = hub.registry().register(5, tx);

        dispatcher
            .handle_frame(&conn, br#"{"type":"subscribe","channelId":20}"#)
            .await;

        assert_eq!(next_json(&mut rx).unwrap()["type"], "subscribed");
        assert!(hub.registry().is_subscribed(&TopicKey::Channel(20), conn.id));
        assert_eq!(hub.registry().revocation_epoch(5), 0);
        assert_eq!(hub.registry().revocation_epoch(6), 1);
    }
}
