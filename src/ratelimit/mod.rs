//! Fixed-window rate limiting.
//!
//! Every action the gateway throttles has its own rule, so that flooding one
//! action (say `unsubscribe`) never eats the budget of another. Buckets are
//! keyed by `(rule, subject)` where the subject is a remote IP for connection
//! attempts and a user id for everything else.

mod config;
mod limiter;

pub use config::{RateLimitConfig, RuleLimit};
pub use limiter::{RateLimitResult, RateLimiter, RateLimiterStats, RateRule};
