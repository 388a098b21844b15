//! External relational store, as seen by the gateway.
//!
//! The gateway never caches an answer from here: every authorization runs the
//! queries again, and every call is fallible and asynchronous.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgGatewayStore;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StoreConfig;
use crate::domain::{ChannelId, RoomId, ThreadId, UserId};
use crate::postgres::{PostgresPool, PostgresPoolError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable")]
    Unavailable,

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<PostgresPoolError> for StoreError {
    fn from(e: PostgresPoolError) -> Self {
        match e {
            PostgresPoolError::Sqlx(e) => StoreError::Database(e),
            PostgresPoolError::CircuitOpen => StoreError::Unavailable,
            PostgresPoolError::ConnectionUnavailable(msg) => StoreError::Backend(msg),
        }
    }
}

/// Access-relevant facts about the room a channel belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomAccess {
    pub room_id: RoomId,
    pub owner_id: UserId,
    pub is_public: bool,
}

#[async_trait]
pub trait GatewayStore: Send + Sync {
    /// Room of a channel, `None` if the channel does not exist
    async fn channel_room(&self, channel_id: ChannelId) -> Result<Option<RoomAccess>, StoreError>;

    async fn is_room_banned(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError>;

    async fn is_room_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError>;

    /// Both participants of a DM thread, `None` if the thread does not exist
    async fn dm_thread_members(
        &self,
        thread_id: ThreadId,
    ) -> Result<Option<(UserId, UserId)>, StoreError>;

    /// Mutual (accepted) friendship
    async fn are_friends(&self, a: UserId, b: UserId) -> Result<bool, StoreError>;

    async fn room_channel_ids(&self, room_id: RoomId) -> Result<Vec<ChannelId>, StoreError>;

    /// Rooms the user owns or belongs to
    async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomId>, StoreError>;

    /// Backend name, as configured in `store.backend`
    fn backend(&self) -> &'static str;

    /// False while queries are known to fail fast
    fn is_available(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

/// Build the store backend named by `store.backend`
pub async fn create_store(config: &StoreConfig) -> Result<Arc<dyn GatewayStore>, StoreError> {
    match config.backend.as_str() {
        "memory" => {
            tracing::warn!("Using in-memory store; authorization data is empty until seeded");
            Ok(Arc::new(MemoryStore::new()))
        }
        "postgres" => {
            let pool = PostgresPool::new(config).await?;
            tracing::info!(url = %pool.database_url_masked(), "Using PostgreSQL store");
            Ok(Arc::new(PgGatewayStore::new(pool)))
        }
        other => Err(StoreError::Backend(format!("unknown store backend: {}", other))),
    }
}
