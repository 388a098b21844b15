use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broadcast::RemovalReason;
use crate::connection_manager::TopicKey;
use crate::domain::{ChannelId, RoomId, ThreadId, UserId};
use crate::error::Result;
use crate::server::AppState;
use crate::websocket::ServerMessage;

/// Where a published event goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PublishTarget {
    Channel { channel_id: ChannelId },
    Dm { thread_id: ThreadId },
    /// Every channel of the room
    Room { room_id: RoomId },
    /// Every room the user owns or belongs to
    UserRooms { user_id: UserId },
    /// The user's connections with the home feed on
    UserHome { user_id: UserId },
    /// Every connection of the user
    UserAll { user_id: UserId },
}

impl PublishTarget {
    fn label(&self) -> &'static str {
        match self {
            PublishTarget::Channel { .. } => "channel",
            PublishTarget::Dm { .. } => "dm",
            PublishTarget::Room { .. } => "room",
            PublishTarget::UserRooms { .. } => "user_rooms",
            PublishTarget::UserHome { .. } => "user_home",
            PublishTarget::UserAll { .. } => "user_all",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub target: PublishTarget,
    /// Server frame, sent as-is
    pub event: ServerMessage,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub success: bool,
    /// Frames queued; for `user_rooms` the number of rooms reached
    pub delivered_to: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RemovalRequest {
    pub user_id: UserId,
    pub reason: RemovalReason,
}

#[derive(Debug, Serialize)]
pub struct RemovalResponse {
    pub success: bool,
    /// Subscriptions stripped from the room's channels
    pub removed: usize,
    pub timestamp: DateTime<Utc>,
}

/// POST /api/v1/publish
#[tracing::instrument(name = "api.publish", skip(state, request), fields(target = request.target.label()))]
pub async fn publish(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>> {
    let hub = &state.hub;
    let broadcaster = hub.broadcaster();
    let event = &request.event;

    let delivered_to = match request.target {
        PublishTarget::Channel { channel_id } => {
            broadcaster.broadcast_topic(&TopicKey::Channel(channel_id), event)
        }
        PublishTarget::Dm { thread_id } => broadcaster.broadcast_topic(&TopicKey::Dm(thread_id), event),
        PublishTarget::Room { room_id } => hub.rooms().broadcast_room(room_id, event).await?,
        PublishTarget::UserRooms { user_id } => {
            hub.rooms().broadcast_rooms_for_user(user_id, event).await?
        }
        PublishTarget::UserHome { user_id } => broadcaster.broadcast_user_home(user_id, event),
        PublishTarget::UserAll { user_id } => broadcaster.broadcast_user_all(user_id, event),
    };

    Ok(Json(PublishResponse {
        success: true,
        delivered_to,
        timestamp: Utc::now(),
    }))
}

/// POST /api/v1/rooms/{room_id}/removals
#[tracing::instrument(name = "api.remove_member", skip(state, request), fields(user_id = request.user_id))]
pub async fn remove_member(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    Json(request): Json<RemovalRequest>,
) -> Result<Json<RemovalResponse>> {
    let removed = state
        .hub
        .rooms()
        .remove_user_from_room(request.user_id, room_id, request.reason)
        .await?;

    Ok(Json(RemovalResponse {
        success: true,
        removed,
        timestamp: Utc::now(),
    }))
}
