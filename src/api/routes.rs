use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::server::{api_key_auth, AppState};
use crate::triggers::{publish, remove_member};

use super::health::{health, stats};
use super::metrics::prometheus_metrics;

pub fn api_routes(state: AppState) -> Router<AppState> {
    // Everything but health and metrics requires the API key, when one is set
    let protected = Router::new()
        .route("/stats", get(stats))
        .nest(
            "/api/v1",
            Router::new()
                .route("/publish", post(publish))
                .route("/rooms/{room_id}/removals", post(remove_member)),
        )
        .route_layer(middleware::from_fn_with_state(state, api_key_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .merge(protected)
}
