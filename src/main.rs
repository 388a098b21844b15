use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

use realtime_gateway::config::Settings;
use realtime_gateway::hub::Hub;
use realtime_gateway::server::{create_app, AppState};
use realtime_gateway::shutdown::GracefulShutdown;
use realtime_gateway::store::create_store;
use realtime_gateway::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Keep the guard alive so spans are flushed on exit
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    if settings.server.allowed_origins.is_empty() {
        tracing::warn!("server.allowed_origins is empty, accepting connections from any origin");
    }
    if settings.api.key.is_none() {
        tracing::warn!("api.key is not set, internal endpoints are unauthenticated");
    }

    let store = create_store(&settings.store).await?;
    tracing::info!(backend = %settings.store.backend, "Store initialized");

    let (hub, presence_worker) = Hub::new(settings.ratelimit.clone(), store);
    let presence_handle = tokio::spawn(presence_worker.run());

    let state = AppState::new(settings.clone(), hub.clone());
    let app = create_app(state);

    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal_handler())
    .await?;

    GracefulShutdown::new(hub.clone()).execute().await;
    hub.store().close().await;

    // The hub holds the presence sender, so the worker never ends on its own
    presence_handle.abort();
    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
