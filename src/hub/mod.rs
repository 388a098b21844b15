//! Single owner of the gateway's shared state.
//!
//! Everything that touches connections goes through one [`Hub`]: the
//! registry and topic index, the rate limiter, the broadcaster and the
//! room helpers. The store is shared with the room helpers but never cached.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::broadcast::{BroadcastStats, Broadcaster, RemovalReason, RoomFanout};
use crate::connection_manager::{ConnectionRegistry, ConnectionStats};
use crate::domain::{RoomId, UserId};
use crate::presence::{PresenceTracker, PresenceWorker};
use crate::ratelimit::{RateLimitConfig, RateLimiter, RateLimiterStats};
use crate::store::GatewayStore;
use crate::websocket::ServerMessage;

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connections: ConnectionStats,
    pub broadcasts: BroadcastStats,
    pub ratelimit: RateLimiterStats,
}

pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<Broadcaster>,
    rooms: Arc<RoomFanout>,
    limiter: Arc<RateLimiter>,
    store: Arc<dyn GatewayStore>,
}

impl Hub {
    /// Build the hub and the presence worker that must be spawned next to it
    pub fn new(
        ratelimit: RateLimitConfig,
        store: Arc<dyn GatewayStore>,
    ) -> (Arc<Self>, PresenceWorker) {
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(ConnectionRegistry::new(presence_tx));
        let broadcaster = Arc::new(Broadcaster::new(registry.clone()));
        let rooms = Arc::new(RoomFanout::new(
            broadcaster.clone(),
            registry.clone(),
            store.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(ratelimit));

        let worker = PresenceWorker::new(presence_rx, PresenceTracker::new(rooms.clone()));

        let hub = Arc::new(Self {
            registry,
            broadcaster,
            rooms,
            limiter,
            store,
        });
        (hub, worker)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn rooms(&self) -> &Arc<RoomFanout> {
        &self.rooms
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn store(&self) -> &Arc<dyn GatewayStore> {
        &self.store
    }

    /// Fire-and-forget [`RoomFanout::broadcast_room`]
    pub fn spawn_broadcast_room(&self, room_id: RoomId, message: ServerMessage) {
        let rooms = self.rooms.clone();
        tokio::spawn(async move {
            if let Err(e) = rooms.broadcast_room(room_id, &message).await {
                tracing::warn!(room_id = room_id, error = %e, "Room broadcast failed");
            }
        });
    }

    /// Fire-and-forget [`RoomFanout::broadcast_rooms_for_user`]
    pub fn spawn_broadcast_rooms_for_user(&self, user_id: UserId, message: ServerMessage) {
        let rooms = self.rooms.clone();
        tokio::spawn(async move {
            if let Err(e) = rooms.broadcast_rooms_for_user(user_id, &message).await {
                tracing::warn!(user_id = user_id, error = %e, "User rooms broadcast failed");
            }
        });
    }

    /// Fire-and-forget [`RoomFanout::remove_user_from_room`]
    pub fn spawn_remove_user_from_room(
        &self,
        user_id: UserId,
        room_id: RoomId,
        reason: RemovalReason,
    ) {
        let rooms = self.rooms.clone();
        tokio::spawn(async move {
            if let Err(e) = rooms.remove_user_from_room(user_id, room_id, reason).await {
                tracing::warn!(
                    user_id = user_id,
                    room_id = room_id,
                    reason = reason.as_str(),
                    error = %e,
                    "Room removal failed"
                );
            }
        });
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.stats(),
            broadcasts: self.broadcaster.stats(),
            ratelimit: self.limiter.stats(),
        }
    }
}
