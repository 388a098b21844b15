//! Connection handle and outbound frame types

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::{ChannelId, UserId};

use super::TopicKey;

/// Frame queued for a connection's writer task
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Serialized JSON text, shared between every recipient of a broadcast
    Text(Arc<str>),
    /// Close the socket with this code and reason
    Close { code: u16, reason: &'static str },
}

#[derive(Debug, Default)]
struct SubscriptionState {
    open: bool,
    /// `Channel` and `Dm` keys this connection was authorized for
    topics: HashSet<TopicKey>,
    home: bool,
}

/// Handle for a single WebSocket connection.
///
/// The subscription state sits behind a per-connection mutex. The registry
/// holds it while mutating the topic index on this connection's behalf, so
/// a subscribe can never land after the connection was unregistered.
pub struct ConnectionHandle {
    pub id: Uuid,
    pub user_id: UserId,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<OutboundMessage>,
    state: Mutex<SubscriptionState>,
}

impl ConnectionHandle {
    pub(super) fn new(user_id: UserId, sender: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            connected_at: Utc::now(),
            sender,
            state: Mutex::new(SubscriptionState {
                open: true,
                ..Default::default()
            }),
        }
    }

    /// Queue a frame without waiting; fails if the queue is full or closed
    pub fn try_send(
        &self,
        message: OutboundMessage,
    ) -> Result<(), mpsc::error::TrySendError<OutboundMessage>> {
        self.sender.try_send(message)
    }

    /// Queue a frame, waiting for room in the queue
    pub async fn send(
        &self,
        message: OutboundMessage,
    ) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        self.sender.send(message).await
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn home_enabled(&self) -> bool {
        let state = self.state.lock();
        state.open && state.home
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.state
            .lock()
            .topics
            .iter()
            .filter_map(|t| match t {
                TopicKey::Channel(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn is_subscribed(&self, key: &TopicKey) -> bool {
        self.state.lock().topics.contains(key)
    }

    /// Add `key` to this connection's subscriptions and run `index` while
    /// still holding the connection lock. `None` if the connection is closed.
    pub(super) fn with_added(&self, key: TopicKey, index: impl FnOnce()) -> Option<bool> {
        let mut state = self.state.lock();
        if !state.open {
            return None;
        }
        let added = state.topics.insert(key);
        if added {
            index();
        }
        Some(added)
    }

    /// Remove `key` from this connection's subscriptions, running `index`
    /// under the connection lock when it was present.
    pub(super) fn with_removed(&self, key: &TopicKey, index: impl FnOnce()) -> bool {
        let mut state = self.state.lock();
        let removed = state.topics.remove(key);
        if removed {
            index();
        }
        removed
    }

    /// Returns false if the connection is already closed
    pub(super) fn set_home(&self, enabled: bool) -> bool {
        let mut state = self.state.lock();
        if !state.open {
            return false;
        }
        state.home = enabled;
        true
    }

    /// Mark closed and hand back every topic it was subscribed to.
    /// `None` if it was already closed.
    pub(super) fn close(&self) -> Option<Vec<TopicKey>> {
        let mut state = self.state.lock();
        if !state.open {
            return None;
        }
        state.open = false;
        state.home = false;
        Some(state.topics.drain().collect())
    }
}
