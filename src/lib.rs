// Infrastructure layer (shared components)
pub mod infrastructure;

pub use infrastructure::auth;
pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;
pub use infrastructure::postgres;

// Domain layer
pub mod broadcast;
pub mod connection_manager;
pub mod domain;
pub mod hub;
pub mod presence;
pub mod ratelimit;
pub mod store;

// Application layer
pub mod api;
pub mod server;
pub mod triggers;
pub mod websocket;

// Supporting modules
pub mod shutdown;
pub mod telemetry;
