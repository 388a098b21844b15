//! Presence tracking.
//!
//! Presence is never stored: a user is online while at least one of their
//! connections is indexed under `user:<id>`. The registry emits a
//! [`PresenceChange`] on the 0→1 and 1→0 edges only, and the
//! [`PresenceWorker`] turns each edge into one `room_presence` broadcast per
//! room the user owns or belongs to.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broadcast::RoomFanout;
use crate::domain::UserId;
use crate::metrics::PresenceMetrics;
use crate::store::StoreError;
use crate::websocket::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: UserId,
    pub online: bool,
}

impl PresenceChange {
    pub fn online(user_id: UserId) -> Self {
        Self {
            user_id,
            online: true,
        }
    }

    pub fn offline(user_id: UserId) -> Self {
        Self {
            user_id,
            online: false,
        }
    }
}

/// Fans presence transitions out to the user's rooms
pub struct PresenceTracker {
    rooms: Arc<RoomFanout>,
}

impl PresenceTracker {
    pub fn new(rooms: Arc<RoomFanout>) -> Self {
        Self { rooms }
    }

    /// Broadcast one transition; returns the number of rooms notified
    #[tracing::instrument(name = "presence.broadcast", skip(self), fields(user_id = change.user_id, online = change.online))]
    pub async fn handle(&self, change: PresenceChange) -> Result<usize, StoreError> {
        PresenceMetrics::record_transition(change.online);

        let message = ServerMessage::RoomPresence {
            user_id: change.user_id,
            online: change.online,
        };
        self.rooms
            .broadcast_rooms_for_user(change.user_id, &message)
            .await
    }
}

/// Single consumer of presence transitions.
///
/// Transitions are handled one at a time in emission order, so a user's
/// online/offline broadcasts can never overtake each other.
pub struct PresenceWorker {
    rx: mpsc::UnboundedReceiver<PresenceChange>,
    tracker: PresenceTracker,
}

impl PresenceWorker {
    pub fn new(rx: mpsc::UnboundedReceiver<PresenceChange>, tracker: PresenceTracker) -> Self {
        Self { rx, tracker }
    }

    /// Process transitions until every sender is dropped
    pub async fn run(mut self) {
        tracing::info!("Presence worker started");
        while let Some(change) = self.rx.recv().await {
            self.process(change).await;
        }
        tracing::info!("Presence worker stopped");
    }

    /// Process every transition already queued, without waiting for more
    pub async fn drain(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(change) = self.rx.try_recv() {
            self.process(change).await;
            processed += 1;
        }
        processed
    }

    async fn process(&self, change: PresenceChange) {
        match self.tracker.handle(change).await {
            Ok(rooms) => {
                tracing::debug!(
                    user_id = change.user_id,
                    online = change.online,
                    rooms = rooms,
                    "Presence broadcast"
                );
            }
            Err(e) => {
                tracing::warn!(
                    user_id = change.user_id,
                    online = change.online,
                    error = %e,
                    "Presence broadcast failed"
                );
            }
        }
    }
}
