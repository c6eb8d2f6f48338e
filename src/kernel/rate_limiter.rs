//! Rate limiting.
//!
//! Sliding window rate limiter keyed by principal (or any other string key).
//! The caller supplies `now`, so the limiter follows the kernel clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use super::clock::to_chrono;
use crate::types::{Error, Result};

/// Rate limit window configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub max_requests: u32,
}

impl RateLimitConfig {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
        }
    }

    /// `max_requests` per minute.
    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(Duration::from_secs(60), max_requests)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_minute(100)
    }
}

/// Sliding window for tracking requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindow {
    timestamps: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    fn evict(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - to_chrono(window);
        while let Some(&ts) = self.timestamps.front() {
            if ts <= cutoff {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Check if request is allowed under `config` and record it if so.
    pub fn check_and_record(&mut self, config: RateLimitConfig, now: DateTime<Utc>) -> Result<()> {
        self.evict(now, config.window);

        if self.timestamps.len() >= config.max_requests as usize {
            return Err(Error::quota_exceeded(format!(
                "Rate limit exceeded: {} requests per {:?}",
                config.max_requests, config.window
            )));
        }

        self.timestamps.push_back(now);
        Ok(())
    }

    /// Would a request at `now` be admitted? Does not record.
    pub fn would_admit(&self, config: RateLimitConfig, now: DateTime<Utc>) -> bool {
        let cutoff = now - to_chrono(config.window);
        let recent = self.timestamps.iter().filter(|&&ts| ts > cutoff).count();
        recent < config.max_requests as usize
    }

    /// Record a request without checking.
    pub fn record(&mut self, config: RateLimitConfig, now: DateTime<Utc>) {
        self.evict(now, config.window);
        self.timestamps.push_back(now);
    }

    pub fn count(&self, window: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - to_chrono(window);
        self.timestamps.iter().filter(|&&ts| ts > cutoff).count()
    }
}

/// Rate limiter - enforces request rate limits per key.
///
/// NOT a separate actor - owned by the security module and called via &mut self.
#[derive(Debug)]
pub struct RateLimiter {
    default_config: RateLimitConfig,
    windows: HashMap<String, SlidingWindow>,
}

impl RateLimiter {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config,
            windows: HashMap::new(),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.default_config
    }

    /// Check rate limit for `key` and record the request if allowed.
    pub fn check_rate_limit(&mut self, key: &str, now: DateTime<Utc>) -> Result<()> {
        let config = self.default_config;
        self.windows
            .entry(key.to_string())
            .or_default()
            .check_and_record(config, now)
    }

    /// Current request count for `key` within the window.
    pub fn get_current_rate(&self, key: &str, now: DateTime<Utc>) -> usize {
        self.windows
            .get(key)
            .map_or(0, |w| w.count(self.default_config.window, now))
    }

    /// Clear rate limit window for `key`.
    pub fn clear(&mut self, key: &str) {
        self.windows.remove(key);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_limit_within_window() {
        let mut limiter = RateLimiter::new(RateLimitConfig::new(Duration::from_secs(10), 3));
        let now = t0();
        for _ in 0..3 {
            limiter.check_rate_limit("p1", now).unwrap();
        }
        let err = limiter.check_rate_limit("p1", now).unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));
        assert_eq!(limiter.get_current_rate("p1", now), 3);

        // Other keys are independent.
        limiter.check_rate_limit("p2", now).unwrap();
    }

    #[test]
    fn test_window_slides() {
        let mut limiter = RateLimiter::new(RateLimitConfig::new(Duration::from_secs(10), 2));
        let start = t0();
        limiter.check_rate_limit("p", start).unwrap();
        limiter
            .check_rate_limit("p", start + chrono::Duration::seconds(5))
            .unwrap();
        assert!(limiter
            .check_rate_limit("p", start + chrono::Duration::seconds(9))
            .is_err());

        // The first request ages out at exactly the window length.
        limiter
            .check_rate_limit("p", start + chrono::Duration::seconds(10))
            .unwrap();
    }

    #[test]
    fn test_clear() {
        let mut limiter = RateLimiter::new(RateLimitConfig::per_minute(1));
        limiter.check_rate_limit("p", t0()).unwrap();
        limiter.clear("p");
        limiter.check_rate_limit("p", t0()).unwrap();
    }

    #[test]
    fn test_window_would_admit_does_not_record() {
        let config = RateLimitConfig::per_minute(1);
        let mut window = SlidingWindow::new();
        assert!(window.would_admit(config, t0()));
        assert!(window.would_admit(config, t0()));
        window.record(config, t0());
        assert!(!window.would_admit(config, t0()));
    }
}
