//! PostgreSQL access for authorization queries.
//!
//! Provides the connection pool and the circuit breaker guarding it.

pub mod circuit_breaker;
pub mod pool;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use pool::{PostgresPool, PostgresPoolError};
