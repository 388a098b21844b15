//! Graceful shutdown of live connections.
//!
//! HTTP requests are drained by `axum::serve`; upgraded sockets are not, so
//! every connection is asked to close with `1001 going away` and given a
//! short grace period to unregister.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::connection_manager::OutboundMessage;
use crate::hub::Hub;
use crate::websocket::close_code;

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long to wait for connections to unregister (default: 5 seconds)
    pub close_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownResult {
    pub clients_notified: usize,
    /// Connections still registered when the grace period ended
    pub remaining: usize,
    pub duration: Duration,
}

pub struct GracefulShutdown {
    hub: Arc<Hub>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self::with_config(hub, ShutdownConfig::default())
    }

    pub fn with_config(hub: Arc<Hub>, config: ShutdownConfig) -> Self {
        Self { hub, config }
    }

    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.hub.registry().stats().total_connections)
    )]
    pub async fn execute(&self) -> ShutdownResult {
        let start = Instant::now();

        let clients_notified = self.notify_clients();
        let remaining = self.wait_for_connections_to_close().await;

        let result = ShutdownResult {
            clients_notified,
            remaining,
            duration: start.elapsed(),
        };
        tracing::info!(
            clients_notified = result.clients_notified,
            remaining = result.remaining,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );
        result
    }

    fn notify_clients(&self) -> usize {
        self.hub
            .registry()
            .all_connections()
            .iter()
            .filter(|conn| {
                conn.try_send(OutboundMessage::Close {
                    code: close_code::GOING_AWAY,
                    reason: "server shutting down",
                })
                .is_ok()
            })
            .count()
    }

    async fn wait_for_connections_to_close(&self) -> usize {
        let registry = self.hub.registry();
        let poll = async {
            while registry.stats().total_connections > 0 {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };

        if timeout(self.config.close_timeout, poll).await.is_err() {
            let remaining = registry.stats().total_connections;
            tracing::warn!(remaining = remaining, "Connections still open after grace period");
            return remaining;
        }
        0
    }
}
