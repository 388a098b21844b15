//! Room-scoped fan-out, resolved through the store on every call.

use std::sync::Arc;

use serde::Deserialize;

use crate::connection_manager::{ConnectionRegistry, TopicKey};
use crate::domain::{RoomId, UserId};
use crate::store::{GatewayStore, StoreError};
use crate::websocket::ServerMessage;

use super::Broadcaster;

/// Why a user lost access to a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Left,
    Kicked,
    Banned,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalReason::Left => "left",
            RemovalReason::Kicked => "kicked",
            RemovalReason::Banned => "banned",
        }
    }

    fn notification(&self, room_id: RoomId) -> ServerMessage {
        match self {
            RemovalReason::Left => ServerMessage::RoomLeft { room_id },
            RemovalReason::Kicked => ServerMessage::RoomKicked { room_id },
            RemovalReason::Banned => ServerMessage::RoomBanned { room_id },
        }
    }
}

pub struct RoomFanout {
    broadcaster: Arc<Broadcaster>,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn GatewayStore>,
}

impl RoomFanout {
    pub fn new(
        broadcaster: Arc<Broadcaster>,
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn GatewayStore>,
    ) -> Self {
        Self {
            broadcaster,
            registry,
            store,
        }
    }

    /// Send to every channel topic of the room; returns frames delivered
    pub async fn broadcast_room(
        &self,
        room_id: RoomId,
        message: &ServerMessage,
    ) -> Result<usize, StoreError> {
        let channels = self.store.room_channel_ids(room_id).await?;

        let delivered = channels
            .into_iter()
            .map(|channel_id| {
                self.broadcaster
                    .broadcast_topic(&TopicKey::Channel(channel_id), message)
            })
            .sum();
        Ok(delivered)
    }

    /// Send to every room the user owns or belongs to; returns the number of rooms
    pub async fn broadcast_rooms_for_user(
        &self,
        user_id: UserId,
        message: &ServerMessage,
    ) -> Result<usize, StoreError> {
        let rooms = self.store.rooms_for_user(user_id).await?;

        for room_id in &rooms {
            self.broadcast_room(*room_id, message).await?;
        }
        Ok(rooms.len())
    }

    /// Strip the user's connections from the room's channel topics and tell
    /// every one of them why.
    ///
    /// Returns the number of subscriptions removed.
    #[tracing::instrument(skip(self), fields(reason = reason.as_str()))]
    pub async fn remove_user_from_room(
        &self,
        user_id: UserId,
        room_id: RoomId,
        reason: RemovalReason,
    ) -> Result<usize, StoreError> {
        let channels = self.store.room_channel_ids(room_id).await?;

        // In-flight subscribes compare against this epoch after they land
        self.registry.bump_revocation_epoch(user_id);

        let removed = channels
            .into_iter()
            .map(|channel_id| {
                self.registry
                    .remove_user_from_topic(user_id, TopicKey::Channel(channel_id))
            })
            .sum();

        let notified = self
            .broadcaster
            .broadcast_user_all(user_id, &reason.notification(room_id));

        tracing::info!(
            user_id = user_id,
            room_id = room_id,
            removed = removed,
            notified = notified,
            "User removed from room"
        );
        Ok(removed)
    }
}
