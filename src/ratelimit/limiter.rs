//! Local fixed-window rate limiter

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use serde::Serialize;

use crate::metrics::RateLimitMetrics;

use super::config::{RateLimitConfig, RuleLimit};

/// Throttled actions. Each one owns an independent set of buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateRule {
    Connect,
    Message,
    Subscribe,
    Unsubscribe,
    SubscribeDm,
    UnsubscribeDm,
    SubscribeHome,
    UnsubscribeHome,
}

impl RateRule {
    pub fn name(&self) -> &'static str {
        match self {
            RateRule::Connect => "ws_connect",
            RateRule::Message => "ws_message",
            RateRule::Subscribe => "subscribe",
            RateRule::Unsubscribe => "unsubscribe",
            RateRule::SubscribeDm => "subscribe_dm",
            RateRule::UnsubscribeDm => "unsubscribe_dm",
            RateRule::SubscribeHome => "subscribe_home",
            RateRule::UnsubscribeHome => "unsubscribe_home",
        }
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request is allowed
    Allowed { remaining: u32, window_end: i64 },
    /// Request is denied until `window_end`
    Denied { retry_after_ms: u64, window_end: i64 },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

#[derive(Debug)]
struct Bucket {
    /// Unix milliseconds at which the current window closes
    window_end: i64,
    count: u32,
}

type BucketKey = (RateRule, String);

/// Fixed-window counters keyed by `(rule, subject)`.
///
/// Buckets are created on first hit. Expired buckets are not swept by a
/// timer: every `sweep_every`-th bucket creation runs a scan that removes at
/// most `sweep_batch` expired entries.
pub struct RateLimiter {
    buckets: DashMap<BucketKey, Bucket>,
    inserts: AtomicU64,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            inserts: AtomicU64::new(0),
            config,
        }
    }

    /// Check if rate limiting is enabled
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn limit_for(&self, rule: RateRule) -> RuleLimit {
        match rule {
            RateRule::Connect => self.config.connect,
            RateRule::Message => self.config.message,
            RateRule::Subscribe => self.config.subscribe,
            RateRule::Unsubscribe => self.config.unsubscribe,
            RateRule::SubscribeDm => self.config.subscribe_dm,
            RateRule::UnsubscribeDm => self.config.unsubscribe_dm,
            RateRule::SubscribeHome => self.config.subscribe_home,
            RateRule::UnsubscribeHome => self.config.unsubscribe_home,
        }
    }

    /// Count one hit against `(rule, subject)` at the current time
    pub fn check(&self, rule: RateRule, subject: &str) -> RateLimitResult {
        self.check_at(rule, subject, now_millis())
    }

    /// Count one hit against `(rule, subject)` at `now` (Unix milliseconds)
    pub fn check_at(&self, rule: RateRule, subject: &str, now: i64) -> RateLimitResult {
        if !self.config.enabled {
            return RateLimitResult::Allowed {
                remaining: u32::MAX,
                window_end: now,
            };
        }

        let limit = self.limit_for(rule);
        let window = limit.window_ms as i64;
        let mut created = false;

        let result = {
            let mut bucket = self
                .buckets
                .entry((rule, subject.to_string()))
                .or_insert_with(|| {
                    created = true;
                    Bucket {
                        window_end: now + window,
                        count: 0,
                    }
                });

            if now >= bucket.window_end {
                bucket.window_end = now + window;
                bucket.count = 0;
            }

            if bucket.count >= limit.max {
                RateLimitResult::Denied {
                    retry_after_ms: (bucket.window_end - now).max(0) as u64,
                    window_end: bucket.window_end,
                }
            } else {
                bucket.count += 1;
                RateLimitResult::Allowed {
                    remaining: limit.max - bucket.count,
                    window_end: bucket.window_end,
                }
            }
        };

        // The entry guard is released above; sweeping while holding it would
        // deadlock on the same shard.
        if created {
            let n = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
            if self.config.sweep_every > 0 && n % self.config.sweep_every == 0 {
                self.sweep_expired(now, self.config.sweep_batch);
            }
        }

        RateLimitMetrics::record(rule.name(), result.is_allowed());
        result
    }

    /// Remove up to `budget` buckets whose window has closed
    pub fn sweep_expired(&self, now: i64, budget: usize) -> usize {
        let expired: Vec<BucketKey> = self
            .buckets
            .iter()
            .filter(|entry| now >= entry.value().window_end)
            .take(budget)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if self
                .buckets
                .remove_if(&key, |_, bucket| now >= bucket.window_end)
                .is_some()
            {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(
                removed = removed,
                remaining = self.buckets.len(),
                "Swept expired rate limit buckets"
            );
        }

        removed
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            enabled: self.config.enabled,
            buckets: self.buckets.len(),
        }
    }
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Statistics about the rate limiter
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub enabled: bool,
    pub buckets: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with(rule_limit: RuleLimit) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            subscribe: rule_limit,
            ..Default::default()
        })
    }

    #[test]
    fn test_fixed_window_allows_max_then_denies() {
        let limiter = limiter_with(RuleLimit::new(1000, 3));
        let t0 = 1_000_000;

        assert!(limiter.check_at(RateRule::Subscribe, "u1", t0).is_allowed());
        assert!(limiter.check_at(RateRule::Subscribe, "u1", t0 + 10).is_allowed());
        assert!(limiter.check_at(RateRule::Subscribe, "u1", t0 + 20).is_allowed());

        match limiter.check_at(RateRule::Subscribe, "u1", t0 + 30) {
            RateLimitResult::Denied { retry_after_ms, window_end } => {
                assert_eq!(window_end, t0 + 1000);
                assert_eq!(retry_after_ms, 970);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[test]
    fn test_window_resets_after_elapsed() {
        let limiter = limiter_with(RuleLimit::new(1000, 3));
        let t0 = 5_000;

        for i in 0..3 {
            assert!(limiter.check_at(RateRule::Subscribe, "u1", t0 + i).is_allowed());
        }
        assert!(!limiter.check_at(RateRule::Subscribe, "u1", t0 + 999).is_allowed());

        // Window end is exclusive: at exactly t0 + 1000 a fresh window opens
        match limiter.check_at(RateRule::Subscribe, "u1", t0 + 1000) {
            RateLimitResult::Allowed { remaining, window_end } => {
                assert_eq!(remaining, 2);
                assert_eq!(window_end, t0 + 2000);
            }
            other => panic!("expected fresh window, got {:?}", other),
        }
    }

    #[test]
    fn test_rules_do_not_share_budget() {
        let limiter = RateLimiter::new(RateLimitConfig {
            subscribe: RuleLimit::new(60_000, 1),
            unsubscribe: RuleLimit::new(60_000, 1),
            ..Default::default()
        });

        assert!(limiter.check_at(RateRule::Subscribe, "42", 0).is_allowed());
        assert!(!limiter.check_at(RateRule::Subscribe, "42", 1).is_allowed());
        assert!(limiter.check_at(RateRule::Unsubscribe, "42", 2).is_allowed());
    }

    #[test]
    fn test_subjects_do_not_share_budget() {
        let limiter = limiter_with(RuleLimit::new(60_000, 1));

        assert!(limiter.check_at(RateRule::Subscribe, "1", 0).is_allowed());
        assert!(!limiter.check_at(RateRule::Subscribe, "1", 0).is_allowed());
        assert!(limiter.check_at(RateRule::Subscribe, "2", 0).is_allowed());
    }

    #[test]
    fn test_rate_limiter_disabled() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            connect: RuleLimit::new(60_000, 1),
            ..Default::default()
        });

        for _ in 0..100 {
            assert!(limiter.check(RateRule::Connect, "127.0.0.1").is_allowed());
        }
        assert_eq!(limiter.stats().buckets, 0);
    }

    #[test]
    fn test_default_connect_limit() {
        let limiter = RateLimiter::new(RateLimitConfig::default());

        for i in 0..60 {
            assert!(limiter.check_at(RateRule::Connect, "10.0.0.1", i).is_allowed());
        }
        assert!(!limiter.check_at(RateRule::Connect, "10.0.0.1", 60).is_allowed());
    }

    #[test]
    fn test_sweep_is_bounded_and_skips_live_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig {
            sweep_every: 0,
            subscribe: RuleLimit::new(100, 5),
            ..Default::default()
        });

        for i in 0..10 {
            limiter.check_at(RateRule::Subscribe, &i.to_string(), 0);
        }
        limiter.check_at(RateRule::Subscribe, "live", 150);
        assert_eq!(limiter.stats().buckets, 11);

        assert_eq!(limiter.sweep_expired(150, 4), 4);
        assert_eq!(limiter.stats().buckets, 7);

        assert_eq!(limiter.sweep_expired(150, 100), 6);
        assert_eq!(limiter.stats().buckets, 1);
    }

    #[test]
    fn test_sweep_triggered_by_insertions() {
        let limiter = RateLimiter::new(RateLimitConfig {
            sweep_every: 4,
            sweep_batch: 100,
            subscribe: RuleLimit::new(10, 5),
            ..Default::default()
        });

        for i in 0..3 {
            limiter.check_at(RateRule::Subscribe, &format!("old-{}", i), 0);
        }
        assert_eq!(limiter.stats().buckets, 3);

        // Fourth creation runs the sweep; the three old windows are closed by now
        limiter.check_at(RateRule::Subscribe, "new", 50);
        assert_eq!(limiter.stats().buckets, 1);
    }
}
