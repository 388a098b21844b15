//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `auth`: JWT validation of connection tokens
//! - `config`: Application configuration and settings
//! - `error`: HTTP-facing error type
//! - `metrics`: Prometheus metrics and helpers
//! - `postgres`: PostgreSQL pool guarded by a circuit breaker

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod postgres;
