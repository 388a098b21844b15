//! PostgreSQL store backend

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::domain::{ChannelId, RoomId, ThreadId, UserId};
use crate::metrics::StoreMetrics;
use crate::postgres::{CircuitState, PostgresPool};

use super::{GatewayStore, RoomAccess, StoreError};

pub struct PgGatewayStore {
    pool: PostgresPool,
}

impl PgGatewayStore {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }

    /// Run one query through the circuit breaker, recording latency and errors
    async fn run<T, F, Fut>(&self, query: &'static str, operation: F) -> Result<T, StoreError>
    where
        F: FnOnce(PgPool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let started = Instant::now();
        let result = self.pool.execute_with_circuit_breaker(operation).await;
        StoreMetrics::observe(query, started.elapsed().as_secs_f64());

        result.map_err(|e| {
            StoreMetrics::record_error(query);
            tracing::warn!(query = query, error = %e, "Store query failed");
            StoreError::from(e)
        })
    }
}

#[async_trait]
impl GatewayStore for PgGatewayStore {
    async fn channel_room(&self, channel_id: ChannelId) -> Result<Option<RoomAccess>, StoreError> {
        let row = self
            .run("channel_room", |pool| async move {
                sqlx::query_as::<_, (i64, i64, bool)>(
                    "SELECT r.id, r.owner_id, r.is_public \
                     FROM channels c JOIN rooms r ON r.id = c.room_id \
                     WHERE c.id = $1",
                )
                .bind(channel_id)
                .fetch_optional(&pool)
                .await
            })
            .await?;

        Ok(row.map(|(room_id, owner_id, is_public)| RoomAccess {
            room_id,
            owner_id,
            is_public,
        }))
    }

    async fn is_room_banned(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError> {
        self.run("is_room_banned", |pool| async move {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM room_bans WHERE room_id = $1 AND user_id = $2)",
            )
            .bind(room_id)
            .bind(user_id)
            .fetch_one(&pool)
            .await
        })
        .await
    }

    async fn is_room_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError> {
        self.run("is_room_member", |pool| async move {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM room_members WHERE room_id = $1 AND user_id = $2)",
            )
            .bind(room_id)
            .bind(user_id)
            .fetch_one(&pool)
            .await
        })
        .await
    }

    async fn dm_thread_members(
        &self,
        thread_id: ThreadId,
    ) -> Result<Option<(UserId, UserId)>, StoreError> {
        self.run("dm_thread_members", |pool| async move {
            sqlx::query_as::<_, (i64, i64)>(
                "SELECT user_a_id, user_b_id FROM dm_threads WHERE id = $1",
            )
            .bind(thread_id)
            .fetch_optional(&pool)
            .await
        })
        .await
    }

    async fn are_friends(&self, a: UserId, b: UserId) -> Result<bool, StoreError> {
        self.run("are_friends", |pool| async move {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM friendships \
                 WHERE status = 'accepted' \
                 AND ((user_id = $1 AND friend_id = $2) OR (user_id = $2 AND friend_id = $1)))",
            )
            .bind(a)
            .bind(b)
            .fetch_one(&pool)
            .await
        })
        .await
    }

    async fn room_channel_ids(&self, room_id: RoomId) -> Result<Vec<ChannelId>, StoreError> {
        self.run("room_channel_ids", |pool| async move {
            sqlx::query_scalar::<_, i64>("SELECT id FROM channels WHERE room_id = $1 ORDER BY id")
                .bind(room_id)
                .fetch_all(&pool)
                .await
        })
        .await
    }

    async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomId>, StoreError> {
        self.run("rooms_for_user", |pool| async move {
            sqlx::query_scalar::<_, i64>(
                "SELECT id FROM rooms WHERE owner_id = $1 \
                 UNION \
                 SELECT room_id FROM room_members WHERE user_id = $1",
            )
            .bind(user_id)
            .fetch_all(&pool)
            .await
        })
        .await
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }

    fn is_available(&self) -> bool {
        self.pool.circuit_breaker().state() != CircuitState::Open
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
