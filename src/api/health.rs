//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::broadcast::BroadcastStats;
use crate::connection_manager::TopicCounts;
use crate::ratelimit::RateLimiterStats;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub store: StoreHealthResponse,
    pub connections: ConnectionHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct StoreHealthResponse {
    pub backend: String,
    pub available: bool,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
    pub online_users: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    pub connections: usize,
    pub online_users: usize,
    pub topics: TopicCounts,
    pub broadcasts: BroadcastStats,
    pub ratelimit: RateLimiterStats,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let conn_stats = state.hub.registry().stats();
    let store = state.hub.store();
    let store_available = store.is_available();

    // Connections stay up without the store; only new authorizations fail
    let status = if store_available { "healthy" } else { "degraded" };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        store: StoreHealthResponse {
            backend: store.backend().to_string(),
            available: store_available,
        },
        connections: ConnectionHealthResponse {
            total: conn_stats.total_connections,
            online_users: conn_stats.online_users,
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let hub_stats = state.hub.stats();

    Json(StatsResponse {
        uptime_seconds: state.start_time.elapsed().as_secs(),
        connections: hub_stats.connections.total_connections,
        online_users: hub_stats.connections.online_users,
        topics: hub_stats.connections.topics,
        broadcasts: hub_stats.broadcasts,
        ratelimit: hub_stats.ratelimit,
    })
}
