//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    BROADCASTS_TOTAL, HANDSHAKES_REJECTED, MESSAGES_DELIVERED_TOTAL, MESSAGES_FAILED_TOTAL,
    PRESENCE_TRANSITIONS_TOTAL, RATELIMIT_ALLOWED_TOTAL, RATELIMIT_DENIED_TOTAL,
    STORE_ERRORS_TOTAL, STORE_QUERY_LATENCY, WS_FRAMES_RECEIVED,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

pub struct RateLimitMetrics;

impl RateLimitMetrics {
    pub fn record(rule: &str, allowed: bool) {
        if allowed {
            RATELIMIT_ALLOWED_TOTAL.with_label_values(&[rule]).inc();
        } else {
            RATELIMIT_DENIED_TOTAL.with_label_values(&[rule]).inc();
        }
    }
}

/// Helper struct for recording fan-out metrics
pub struct BroadcastMetrics;

impl BroadcastMetrics {
    pub fn record(target: &str, delivered: usize, failed: usize) {
        BROADCASTS_TOTAL.with_label_values(&[target]).inc();
        MESSAGES_DELIVERED_TOTAL.inc_by(delivered as u64);
        MESSAGES_FAILED_TOTAL.inc_by(failed as u64);
    }
}

pub struct WsFrameMetrics;

impl WsFrameMetrics {
    pub fn record(frame_type: &str) {
        WS_FRAMES_RECEIVED.with_label_values(&[frame_type]).inc();
    }
}

pub struct HandshakeMetrics;

impl HandshakeMetrics {
    pub fn record_rejected(reason: &str) {
        HANDSHAKES_REJECTED.with_label_values(&[reason]).inc();
    }
}

pub struct PresenceMetrics;

impl PresenceMetrics {
    pub fn record_transition(online: bool) {
        let state = if online { "online" } else { "offline" };
        PRESENCE_TRANSITIONS_TOTAL.with_label_values(&[state]).inc();
    }
}

pub struct StoreMetrics;

impl StoreMetrics {
    pub fn observe(query: &str, seconds: f64) {
        STORE_QUERY_LATENCY.with_label_values(&[query]).observe(seconds);
    }

    pub fn record_error(query: &str) {
        STORE_ERRORS_TOTAL.with_label_values(&[query]).inc();
    }
}
