use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::{ChannelId, ThreadId, UserId};
use crate::metrics::{CONNECTIONS_TOTAL, USERS_ONLINE};
use crate::presence::PresenceChange;

use super::stats::ConnectionStats;
use super::topic::{SubscriptionIndex, TopicKey};
use super::types::{ConnectionHandle, OutboundMessage};

/// Result of adding a topic subscription to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Added,
    AlreadySubscribed,
    /// The connection was unregistered; nothing changed
    Closed,
}

/// Authoritative set of live connections.
///
/// Owns every [`ConnectionHandle`]; the topic index only stores ids. Each
/// connection is indexed under exactly one `user:<id>` topic for its whole
/// lifetime, which is also where presence is derived from.
pub struct ConnectionRegistry {
    /// connection_id -> ConnectionHandle
    connections: DashMap<Uuid, Arc<ConnectionHandle>>,
    /// topic -> Set<connection_id>
    topics: SubscriptionIndex,
    presence: mpsc::UnboundedSender<PresenceChange>,
    /// user_id -> revocation epoch, bumped whenever that user's subscriptions
    /// are revoked from outside the dispatcher. Dropped with the user's last
    /// connection.
    revocations: DashMap<UserId, u64>,
}

impl ConnectionRegistry {
    pub fn new(presence: mpsc::UnboundedSender<PresenceChange>) -> Self {
        Self {
            connections: DashMap::new(),
            topics: SubscriptionIndex::new(),
            presence,
            revocations: DashMap::new(),
        }
    }

    /// Register a new connection
    pub fn register(
        &self,
        user_id: UserId,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle::new(user_id, sender));
        let conn_id = handle.id;

        self.connections.insert(conn_id, handle.clone());
        CONNECTIONS_TOTAL.inc();

        // Emitted under the topic lock so transitions for one user are queued
        // in the order they happened.
        self.topics
            .add_observed(TopicKey::User(user_id), conn_id, |count| {
                if count == 1 {
                    USERS_ONLINE.inc();
                    self.emit(PresenceChange::online(user_id));
                }
            });

        tracing::info!(connection_id = %conn_id, user_id = user_id, "Connection registered");

        handle
    }

    /// Remove a connection from every index. No-op if already removed.
    pub fn unregister(&self, connection_id: Uuid) -> bool {
        let Some((_, handle)) = self.connections.remove(&connection_id) else {
            return false;
        };
        CONNECTIONS_TOTAL.dec();

        let topics = handle.close().unwrap_or_default();
        for key in &topics {
            self.topics.remove(key, connection_id);
        }

        let user_id = handle.user_id;
        self.topics
            .remove_observed(&TopicKey::User(user_id), connection_id, |remaining| {
                if remaining == 0 {
                    USERS_ONLINE.dec();
                    self.revocations.remove(&user_id);
                    self.emit(PresenceChange::offline(user_id));
                }
            });

        tracing::info!(
            connection_id = %connection_id,
            user_id = user_id,
            topics = topics.len(),
            "Connection unregistered"
        );
        true
    }

    fn emit(&self, change: PresenceChange) {
        if self.presence.send(change).is_err() {
            tracing::warn!(user_id = change.user_id, "Presence worker gone, transition dropped");
        }
    }

    pub fn subscribe_channel(&self, connection_id: Uuid, channel_id: ChannelId) -> SubscribeOutcome {
        self.subscribe_topic(connection_id, TopicKey::Channel(channel_id))
    }

    pub fn unsubscribe_channel(&self, connection_id: Uuid, channel_id: ChannelId) -> bool {
        self.unsubscribe_topic(connection_id, TopicKey::Channel(channel_id))
    }

    pub fn subscribe_dm(&self, connection_id: Uuid, thread_id: ThreadId) -> SubscribeOutcome {
        self.subscribe_topic(connection_id, TopicKey::Dm(thread_id))
    }

    pub fn unsubscribe_dm(&self, connection_id: Uuid, thread_id: ThreadId) -> bool {
        self.unsubscribe_topic(connection_id, TopicKey::Dm(thread_id))
    }

    /// Toggle the home feed flag. False if the connection is gone.
    pub fn set_home(&self, connection_id: Uuid, enabled: bool) -> bool {
        self.connections
            .get(&connection_id)
            .map(|handle| handle.set_home(enabled))
            .unwrap_or(false)
    }

    fn subscribe_topic(&self, connection_id: Uuid, key: TopicKey) -> SubscribeOutcome {
        let Some(handle) = self.get_connection(connection_id) else {
            return SubscribeOutcome::Closed;
        };

        match handle.with_added(key, || {
            self.topics.add(key, connection_id);
        }) {
            Some(true) => {
                tracing::debug!(connection_id = %connection_id, topic = %key, "Subscribed");
                SubscribeOutcome::Added
            }
            Some(false) => SubscribeOutcome::AlreadySubscribed,
            None => SubscribeOutcome::Closed,
        }
    }

    fn unsubscribe_topic(&self, connection_id: Uuid, key: TopicKey) -> bool {
        let Some(handle) = self.get_connection(connection_id) else {
            return false;
        };

        let removed = handle.with_removed(&key, || {
            self.topics.remove(&key, connection_id);
        });
        if removed {
            tracing::debug!(connection_id = %connection_id, topic = %key, "Unsubscribed");
        }
        removed
    }

    /// Strip every connection of `user_id` from `key`; returns how many were removed
    pub fn remove_user_from_topic(&self, user_id: UserId, key: TopicKey) -> usize {
        self.connections_of(user_id)
            .iter()
            .filter(|handle| self.unsubscribe_topic(handle.id, key))
            .count()
    }

    /// All connections of a user
    pub fn connections_of(&self, user_id: UserId) -> Vec<Arc<ConnectionHandle>> {
        self.topic_connections(&TopicKey::User(user_id))
    }

    /// All connections currently indexed under `key`
    pub fn topic_connections(&self, key: &TopicKey) -> Vec<Arc<ConnectionHandle>> {
        self.topics
            .members(key)
            .iter()
            .filter_map(|id| self.get_connection(*id))
            .collect()
    }

    pub fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn is_subscribed(&self, key: &TopicKey, connection_id: Uuid) -> bool {
        self.topics.contains(key, connection_id)
    }

    pub fn has_topic(&self, key: &TopicKey) -> bool {
        self.topics.has_topic(key)
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.topics.count(&TopicKey::User(user_id)) > 0
    }

    pub fn get_connection(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&connection_id).map(|h| h.clone())
    }

    pub fn revocation_epoch(&self, user_id: UserId) -> u64 {
        self.revocations.get(&user_id).map(|epoch| *epoch).unwrap_or(0)
    }

    /// Must be called before the revoked subscriptions are stripped.
    /// Offline users have nothing in flight, so no epoch is kept for them.
    pub fn bump_revocation_epoch(&self, user_id: UserId) -> u64 {
        if !self.is_online(user_id) {
            return 0;
        }
        let mut epoch = self.revocations.entry(user_id).or_insert(0);
        *epoch += 1;
        *epoch
    }

    pub fn stats(&self) -> ConnectionStats {
        let topics = self.topics.counts();
        ConnectionStats {
            total_connections: self.connections.len(),
            online_users: topics.users,
            topics,
        }
    }
}
