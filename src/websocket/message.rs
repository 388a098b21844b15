use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{ChannelId, RoomId, ThreadId, UserId};

/// Messages sent from client to server.
///
/// Decoding is the schema check: unknown `type` values, missing ids and
/// non-numeric ids are all rejected before any field is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe { channel_id: ChannelId },
    Unsubscribe { channel_id: ChannelId },
    SubscribeDm { thread_id: ThreadId },
    UnsubscribeDm { thread_id: ThreadId },
    SubscribeHome,
    UnsubscribeHome,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid id: {0}")]
    InvalidId(i64),
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let message: ClientMessage = serde_json::from_str(text)?;
        match message {
            ClientMessage::Subscribe { channel_id: id }
            | ClientMessage::Unsubscribe { channel_id: id }
            | ClientMessage::SubscribeDm { thread_id: id }
            | ClientMessage::UnsubscribeDm { thread_id: id }
                if id <= 0 =>
            {
                Err(ProtocolError::InvalidId(id))
            }
            other => Ok(other),
        }
    }

    /// Wire name, used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::Unsubscribe { .. } => "unsubscribe",
            ClientMessage::SubscribeDm { .. } => "subscribe_dm",
            ClientMessage::UnsubscribeDm { .. } => "unsubscribe_dm",
            ClientMessage::SubscribeHome => "subscribe_home",
            ClientMessage::UnsubscribeHome => "unsubscribe_home",
        }
    }
}

/// Error codes carried in `{"type":"error","error":<code>}` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ChannelNotFound,
    RoomBanned,
    NotMember,
    Forbidden,
    NotFriends,
    RateLimited,
    ServerError,
}

/// How a member left a room, as told to that member's clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberChange {
    Joined,
    Left,
    Kicked,
    Banned,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Hello {
        user_id: UserId,
    },
    Subscribed {
        channel_id: ChannelId,
    },
    SubscribedDm {
        thread_id: ThreadId,
    },
    SubscribedHome,
    Error {
        error: ErrorCode,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel_id: Option<ChannelId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<ThreadId>,
    },

    // Channel events
    ChannelMessageCreated {
        channel_id: ChannelId,
        message: Value,
    },
    ChannelMessageUpdated {
        channel_id: ChannelId,
        message: Value,
    },
    ChannelMessageDeleted {
        channel_id: ChannelId,
        message_id: i64,
    },
    MessageReactionsUpdated {
        channel_id: ChannelId,
        message_id: i64,
        reactions: Value,
    },
    PollUpdated {
        channel_id: ChannelId,
        message_id: i64,
        poll: Value,
    },

    // DM events
    DmMessageCreated {
        thread_id: ThreadId,
        message: Value,
    },
    DmReactionsUpdated {
        thread_id: ThreadId,
        message_id: i64,
        reactions: Value,
    },

    // Room events
    RoomMemberChanged {
        room_id: RoomId,
        user_id: UserId,
        change: MemberChange,
    },
    RoomBanChanged {
        room_id: RoomId,
        user_id: UserId,
        banned: bool,
    },
    RoomBanned {
        room_id: RoomId,
    },
    RoomUnbanned {
        room_id: RoomId,
    },
    RoomLeft {
        room_id: RoomId,
    },
    RoomKicked {
        room_id: RoomId,
    },
    RoomPresence {
        user_id: UserId,
        online: bool,
    },

    // Account-wide events (friend requests, DM thread list changes)
    HomeUpdated {
        kind: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl ServerMessage {
    pub fn error(error: ErrorCode) -> Self {
        Self::Error {
            error,
            channel_id: None,
            thread_id: None,
        }
    }

    pub fn channel_error(error: ErrorCode, channel_id: ChannelId) -> Self {
        Self::Error {
            error,
            channel_id: Some(channel_id),
            thread_id: None,
        }
    }

    pub fn dm_error(error: ErrorCode, thread_id: ThreadId) -> Self {
        Self::Error {
            error,
            channel_id: None,
            thread_id: Some(thread_id),
        }
    }
}

/// Close codes used by the gateway
pub mod close_code {
    /// Missing, invalid or expired token
    pub const UNAUTHORIZED: u16 = 4401;
    /// Origin not in the allow-list
    pub const ORIGIN_FORBIDDEN: u16 = 4403;
    /// Connection attempts or inbound traffic over the limit
    pub const RATE_LIMITED: u16 = 4429;
    /// Inbound frame over the size cap
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const SERVER_ERROR: u16 = 1011;
    /// Server shutting down
    pub const GOING_AWAY: u16 = 1001;
}
