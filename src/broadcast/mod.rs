//! Fan-out of server frames to live connections.

mod room;

pub use room::{RemovalReason, RoomFanout};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;

use crate::connection_manager::{ConnectionHandle, ConnectionRegistry, OutboundMessage, TopicKey};
use crate::domain::UserId;
use crate::metrics::BroadcastMetrics;
use crate::websocket::ServerMessage;

#[derive(Debug, Default)]
struct BroadcastCounters {
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastStats {
    pub broadcasts: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Delivers frames to topic subscribers or to a user's connections.
///
/// Delivery never waits on a client: frames go into each connection's
/// bounded queue with `try_send`, and a full or closed queue only costs that
/// one connection its copy.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    counters: BroadcastCounters,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            counters: BroadcastCounters::default(),
        }
    }

    /// Serialize once for any number of recipients
    pub fn encode(message: &ServerMessage) -> Option<OutboundMessage> {
        match serde_json::to_string(message) {
            Ok(json) => Some(OutboundMessage::Text(json.into())),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize server message");
                None
            }
        }
    }

    /// Queue a frame for one connection, swallowing transport errors
    pub fn send_safe(&self, conn: &ConnectionHandle, frame: &OutboundMessage) -> bool {
        match conn.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(connection_id = %conn.id, "Outbound queue full, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(connection_id = %conn.id, "Connection closed, frame dropped");
                false
            }
        }
    }

    /// Send to every connection indexed under `key`
    pub fn broadcast_topic(&self, key: &TopicKey, message: &ServerMessage) -> usize {
        let targets = self.registry.topic_connections(key);
        self.deliver(key.kind(), &targets, message)
    }

    /// Send to the user's connections that opted into the home feed
    pub fn broadcast_user_home(&self, user_id: UserId, message: &ServerMessage) -> usize {
        let targets: Vec<_> = self
            .registry
            .connections_of(user_id)
            .into_iter()
            .filter(|conn| conn.home_enabled())
            .collect();
        self.deliver("home", &targets, message)
    }

    /// Send to every connection of the user, home feed or not
    pub fn broadcast_user_all(&self, user_id: UserId, message: &ServerMessage) -> usize {
        let targets = self.registry.connections_of(user_id);
        self.deliver("user", &targets, message)
    }

    fn deliver(
        &self,
        target: &'static str,
        connections: &[Arc<ConnectionHandle>],
        message: &ServerMessage,
    ) -> usize {
        if connections.is_empty() {
            return 0;
        }
        let Some(frame) = Self::encode(message) else {
            return 0;
        };

        let delivered = connections
            .iter()
            .filter(|conn| self.send_safe(conn, &frame))
            .count();
        let failed = connections.len() - delivered;

        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.counters.failed.fetch_add(failed as u64, Ordering::Relaxed);
        BroadcastMetrics::record(target, delivered, failed);

        tracing::debug!(target = target, delivered = delivered, failed = failed, "Broadcast");
        delivered
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            broadcasts: self.counters.broadcasts.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<ConnectionRegistry>, Broadcaster) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new(tx));
        let broadcaster = Broadcaster::new(registry.clone());
        (registry, broadcaster)
    }

    fn text(frame: OutboundMessage) -> serde_json::Value {
        match frame {
            OutboundMessage::Text(json) => serde_json::from_str(&json).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_failing_socket_does_not_abort_topic_delivery() {
        let (registry, broadcaster) = setup();

        let (full_tx, _full_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = mpsc::channel(4);
        let (ok_tx, mut ok_rx) = mpsc::channel(4);
        drop(closed_rx);

        let full = registry.register(1, full_tx);
        let closed = registry.register(2, closed_tx);
        let ok = registry.register(3, ok_tx);
        for conn in [&full, &closed, &ok] {
            registry.subscribe_channel(conn.id, 5);
        }
        // Fill the single-slot queue
        full.try_send(OutboundMessage::Text("{}".into())).unwrap();

        let message = ServerMessage::ChannelMessageDeleted {
            channel_id: 5,
            message_id: 1,
        };
        assert_eq!(broadcaster.broadcast_topic(&TopicKey::Channel(5), &message), 1);

        let received = text(ok_rx.try_recv().unwrap());
        assert_eq!(received["type"], "channel_message_deleted");

        let stats = broadcaster.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 2);
    }

    #[test]
    fn test_home_only_reaches_opted_in_connections() {
        let (registry, broadcaster) = setup();
        let (home_tx, mut home_rx) = mpsc::channel(4);
        let (plain_tx, mut plain_rx) = mpsc::channel(4);

        let home = registry.register(1, home_tx);
        registry.register(1, plain_tx);
        registry.set_home(home.id, true);

        let message = ServerMessage::HomeUpdated {
            kind: "friend_request".to_string(),
            data: None,
        };
        assert_eq!(broadcaster.broadcast_user_home(1, &message), 1);
        assert!(home_rx.try_recv().is_ok());
        assert!(plain_rx.try_recv().is_err());

        assert_eq!(
            broadcaster.broadcast_user_all(1, &ServerMessage::RoomUnbanned { room_id: 2 }),
            2
        );
        assert!(home_rx.try_recv().is_ok());
        assert!(plain_rx.try_recv().is_ok());
    }

    #[test]
    fn test_empty_topic_is_a_no_op() {
        let (_registry, broadcaster) = setup();
        let message = ServerMessage::SubscribedHome;

        assert_eq!(broadcaster.broadcast_topic(&TopicKey::Dm(1), &message), 0);
        assert_eq!(broadcaster.stats().broadcasts, 0);
    }
}
