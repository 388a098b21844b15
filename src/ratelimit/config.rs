//! Rate limiting configuration

use serde::Deserialize;

/// Window length and allowance for one rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RuleLimit {
    pub window_ms: u64,
    pub max: u32,
}

impl RuleLimit {
    pub const fn new(window_ms: u64, max: u32) -> Self {
        Self { window_ms, max }
    }

    const fn per_minute(max: u32) -> Self {
        Self::new(60_000, max)
    }
}

/// Configuration for rate limiting
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Connection attempts per remote address
    #[serde(default = "default_connect")]
    pub connect: RuleLimit,
    /// Inbound frames per user, across all of their connections
    #[serde(default = "default_message")]
    pub message: RuleLimit,
    #[serde(default = "default_subscribe")]
    pub subscribe: RuleLimit,
    #[serde(default = "default_unsubscribe")]
    pub unsubscribe: RuleLimit,
    #[serde(default = "default_subscribe")]
    pub subscribe_dm: RuleLimit,
    #[serde(default = "default_unsubscribe")]
    pub unsubscribe_dm: RuleLimit,
    #[serde(default = "default_subscribe_home")]
    pub subscribe_home: RuleLimit,
    #[serde(default = "default_unsubscribe_home")]
    pub unsubscribe_home: RuleLimit,
    /// Every Nth new bucket triggers a sweep of expired ones
    #[serde(default = "default_sweep_every")]
    pub sweep_every: u64,
    /// Upper bound on buckets removed by a single sweep
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_connect() -> RuleLimit {
    RuleLimit::per_minute(60)
}

fn default_message() -> RuleLimit {
    RuleLimit::per_minute(600)
}

fn default_subscribe() -> RuleLimit {
    RuleLimit::per_minute(120)
}

fn default_unsubscribe() -> RuleLimit {
    RuleLimit::per_minute(240)
}

fn default_subscribe_home() -> RuleLimit {
    RuleLimit::per_minute(30)
}

fn default_unsubscribe_home() -> RuleLimit {
    RuleLimit::per_minute(60)
}

fn default_sweep_every() -> u64 {
    256
}

fn default_sweep_batch() -> usize {
    1024
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            connect: default_connect(),
            message: default_message(),
            subscribe: default_subscribe(),
            unsubscribe: default_unsubscribe(),
            subscribe_dm: default_subscribe(),
            unsubscribe_dm: default_unsubscribe(),
            subscribe_home: default_subscribe_home(),
            unsubscribe_home: default_unsubscribe_home(),
            sweep_every: default_sweep_every(),
            sweep_batch: default_sweep_batch(),
        }
    }
}
