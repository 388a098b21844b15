//! Prometheus metrics for the gateway.
//!
//! - Connection metrics (opened, closed, active, users online)
//! - Inbound frame and handshake metrics
//! - Fan-out metrics (broadcasts, deliveries, dropped deliveries)
//! - Rate limiting, presence and store metrics

mod helpers;

pub use helpers::{
    encode_metrics, BroadcastMetrics, HandshakeMetrics, PresenceMetrics, RateLimitMetrics,
    StoreMetrics, WsFrameMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Histogram, HistogramVec, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "gateway";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Total number of active WebSocket connections
    pub static ref CONNECTIONS_TOTAL: IntGauge = register_int_gauge!(
        format!("{}_connections_total", METRIC_PREFIX),
        "Total number of active WebSocket connections"
    ).unwrap();

    /// Number of users with at least one open connection
    pub static ref USERS_ONLINE: IntGauge = register_int_gauge!(
        format!("{}_users_online", METRIC_PREFIX),
        "Number of users with at least one open connection"
    ).unwrap();

    /// Number of live topics by kind (channel, dm, user)
    pub static ref TOPICS_ACTIVE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_topics_active", METRIC_PREFIX),
        "Number of topics with at least one subscriber",
        &["kind"]
    ).unwrap();

    pub static ref WS_CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections accepted"
    ).unwrap();

    pub static ref WS_CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket connections closed"
    ).unwrap();

    pub static ref WS_CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_ws_connection_duration_seconds", METRIC_PREFIX),
        "Lifetime of WebSocket connections in seconds",
        vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0, 86400.0]
    ).unwrap();

    // ============================================================================
    // Protocol Metrics
    // ============================================================================

    /// Inbound frames by message type (including "invalid" and "oversize")
    pub static ref WS_FRAMES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_frames_received_total", METRIC_PREFIX),
        "Inbound WebSocket frames by type",
        &["type"]
    ).unwrap();

    /// Handshakes refused, by reason
    pub static ref HANDSHAKES_REJECTED: IntCounterVec = register_int_counter_vec!(
        format!("{}_handshakes_rejected_total", METRIC_PREFIX),
        "WebSocket handshakes refused",
        &["reason"]
    ).unwrap();

    // ============================================================================
    // Fan-out Metrics
    // ============================================================================

    pub static ref BROADCASTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_broadcasts_total", METRIC_PREFIX),
        "Broadcast operations by target",
        &["target"]
    ).unwrap();

    pub static ref MESSAGES_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_delivered_total", METRIC_PREFIX),
        "Frames queued to connections"
    ).unwrap();

    pub static ref MESSAGES_FAILED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_failed_total", METRIC_PREFIX),
        "Frames dropped because the connection queue was full or closed"
    ).unwrap();

    // ============================================================================
    // Rate Limit Metrics
    // ============================================================================

    pub static ref RATELIMIT_ALLOWED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ratelimit_allowed_total", METRIC_PREFIX),
        "Requests allowed by the rate limiter",
        &["rule"]
    ).unwrap();

    pub static ref RATELIMIT_DENIED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ratelimit_denied_total", METRIC_PREFIX),
        "Requests denied by the rate limiter",
        &["rule"]
    ).unwrap();

    // ============================================================================
    // Presence and Store Metrics
    // ============================================================================

    pub static ref PRESENCE_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_presence_transitions_total", METRIC_PREFIX),
        "User online/offline transitions",
        &["state"]
    ).unwrap();

    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_store_errors_total", METRIC_PREFIX),
        "Failed store queries",
        &["query"]
    ).unwrap();

    pub static ref STORE_QUERY_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_store_query_latency_seconds", METRIC_PREFIX),
        "Store query latency in seconds",
        &["query"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();
}
