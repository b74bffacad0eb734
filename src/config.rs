//! Configuration management.
//!
//! Loads settings from environment variables and an optional .env file.
//! Every endpoint, credential and threshold the probes use lives here and is
//! handed to components at construction.

use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

use crate::consistency::checker::{ConsistencyConfig, FreshnessLevel};
use crate::data::models::AggregateTimeframe;
use crate::settlement::watcher::WatcherConfig;

/// Which probes the binary runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Consistency,
    Settlement,
    Load,
}

impl FromStr for Probe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "consistency" => Ok(Self::Consistency),
            "settlement" => Ok(Self::Settlement),
            "load" => Ok(Self::Load),
            _ => Err(format!("Invalid probe: {s}")),
        }
    }
}

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Settings {
    // Backend
    pub backend_base_url: String,
    pub backend_token: String,
    pub asset_id: String,
    pub order_id: String,
    pub request_timeout_secs: u64,
    pub rate_limit_per_sec: u32,
    pub max_attempts: u32,

    // Price feed
    pub feed_base_url: String,
    pub feed_instrument_path: String,
    pub feed_timeframe: String,
    pub feed_timeout_secs: u64,

    // Settlement
    pub settlement_max_wait_secs: f64,
    pub settlement_poll_interval_secs: f64,
    pub settlement_max_consecutive_failures: u32,

    // Consistency
    pub price_tolerance: Decimal,
    pub price_fresh_within_secs: f64,
    pub price_max_age_secs: f64,
    pub freshness_fail_level: String,

    // Load
    pub load_path: String,
    pub load_total_requests: usize,
    pub load_concurrency: usize,
    pub sustained_duration_secs: f64,
    pub sustained_rate_per_sec: u32,

    // Selection
    pub probes: Vec<String>,

    // Logging
    pub log_level: String,
    pub log_json: bool,
}

impl Settings {
    /// Load settings from environment variables (and .env file).
    pub fn from_env() -> Self {
        // Try to load .env file (ignore if not found).
        let _ = dotenvy::dotenv();

        Self {
            backend_base_url: env_str("BACKEND_BASE_URL", "http://localhost:3000/api/v1"),
            backend_token: env_str("BACKEND_TOKEN", ""),
            asset_id: env_str("ASSET_ID", ""),
            order_id: env_str("ORDER_ID", ""),
            request_timeout_secs: env_u64("REQUEST_TIMEOUT_SECS", 10),
            rate_limit_per_sec: env_u32("RATE_LIMIT_PER_SEC", 0),
            max_attempts: env_u32("BACKEND_MAX_ATTEMPTS", 1),

            feed_base_url: env_str("FEED_BASE_URL", ""),
            feed_instrument_path: env_str("FEED_INSTRUMENT_PATH", "idx_stc"),
            feed_timeframe: env_str("FEED_TIMEFRAME", "1s"),
            feed_timeout_secs: env_u64("FEED_TIMEOUT_SECS", 5),

            settlement_max_wait_secs: env_f64("SETTLEMENT_MAX_WAIT_SECS", 75.0),
            settlement_poll_interval_secs: env_f64("SETTLEMENT_POLL_INTERVAL_SECS", 3.0),
            settlement_max_consecutive_failures: env_u32("SETTLEMENT_MAX_CONSECUTIVE_FAILURES", 3),

            price_tolerance: env_decimal("PRICE_TOLERANCE", Decimal::new(5, 2)),
            price_fresh_within_secs: env_f64("PRICE_FRESH_WITHIN_SECS", 10.0),
            price_max_age_secs: env_f64("PRICE_MAX_AGE_SECS", 30.0),
            freshness_fail_level: env_str("FRESHNESS_FAIL_LEVEL", "expired"),

            load_path: env_str("LOAD_PATH", "/health"),
            load_total_requests: env_usize("LOAD_TOTAL_REQUESTS", 100),
            load_concurrency: env_usize("LOAD_CONCURRENCY", 10),
            sustained_duration_secs: env_f64("SUSTAINED_DURATION_SECS", 30.0),
            sustained_rate_per_sec: env_u32("SUSTAINED_RATE_PER_SEC", 5),

            probes: env_csv_default("PROBES", "consistency,settlement,load"),

            log_level: env_str("LOG_LEVEL", "info"),
            log_json: env_bool("LOG_JSON", false),
        }
    }

    /// Validate configuration for critical requirements.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let probes = self.probe_list().unwrap_or_else(|e| {
            errors.push(e);
            Vec::new()
        });

        if probes.is_empty() && errors.is_empty() {
            errors.push("PROBES must name at least one probe".to_string());
        }

        let needs_backend = probes.contains(&Probe::Settlement) || probes.contains(&Probe::Load);
        if needs_backend && self.backend_token.trim().is_empty() {
            errors.push("BACKEND_TOKEN is required for settlement and load probes".to_string());
        }

        if probes.contains(&Probe::Settlement) {
            if self.order_id.trim().is_empty() {
                errors.push("ORDER_ID is required for the settlement probe".to_string());
            }
            if !positive_secs(self.settlement_max_wait_secs) {
                errors.push("SETTLEMENT_MAX_WAIT_SECS must be a finite number > 0".to_string());
            }
            if !positive_secs(self.settlement_poll_interval_secs) {
                errors.push("SETTLEMENT_POLL_INTERVAL_SECS must be a finite number > 0".to_string());
            }
            if self.settlement_max_consecutive_failures == 0 {
                errors.push("SETTLEMENT_MAX_CONSECUTIVE_FAILURES must be > 0".to_string());
            }
        }

        if probes.contains(&Probe::Consistency) {
            if self.feed_base_url.trim().is_empty() {
                errors.push("FEED_BASE_URL is required for the consistency probe".to_string());
            }
            if let Err(e) = self.timeframe() {
                errors.push(e);
            }
            if let Err(e) = self.freshness_limit() {
                errors.push(e);
            }
            if self.price_tolerance < Decimal::ZERO {
                errors.push("PRICE_TOLERANCE must be >= 0".to_string());
            }
            if !positive_secs(self.price_fresh_within_secs)
                || !positive_secs(self.price_max_age_secs)
                || self.price_max_age_secs < self.price_fresh_within_secs
            {
                errors.push(
                    "PRICE_FRESH_WITHIN_SECS must be finite, > 0 and <= PRICE_MAX_AGE_SECS"
                        .to_string(),
                );
            }
        }

        if probes.contains(&Probe::Load) {
            if self.load_total_requests == 0 || self.load_concurrency == 0 {
                errors.push("LOAD_TOTAL_REQUESTS and LOAD_CONCURRENCY must be > 0".to_string());
            }
            if secs(self.sustained_duration_secs).is_none() {
                errors.push("SUSTAINED_DURATION_SECS must be a finite number >= 0 (0 skips)".to_string());
            } else if self.sustained_duration_secs > 0.0 && self.sustained_rate_per_sec == 0 {
                errors.push("SUSTAINED_RATE_PER_SEC must be > 0".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn probe_list(&self) -> Result<Vec<Probe>, String> {
        self.probes.iter().map(|p| p.parse()).collect()
    }

    pub fn timeframe(&self) -> Result<AggregateTimeframe, String> {
        self.feed_timeframe.parse()
    }

    /// Worst freshness level that still passes.
    pub fn freshness_limit(&self) -> Result<FreshnessLevel, String> {
        match self.freshness_fail_level.parse::<FreshnessLevel>()? {
            FreshnessLevel::Stale => Ok(FreshnessLevel::Fresh),
            FreshnessLevel::Expired => Ok(FreshnessLevel::Stale),
            FreshnessLevel::Fresh => {
                Err("FRESHNESS_FAIL_LEVEL must be stale or expired".to_string())
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_timeout_secs)
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            max_wait: secs(self.settlement_max_wait_secs).unwrap_or_default(),
            poll_interval: secs(self.settlement_poll_interval_secs).unwrap_or_default(),
            max_consecutive_failures: self.settlement_max_consecutive_failures,
        }
    }

    pub fn consistency_config(&self) -> ConsistencyConfig {
        ConsistencyConfig {
            tolerance: self.price_tolerance,
            fresh_within: secs(self.price_fresh_within_secs).unwrap_or_default(),
            max_age: secs(self.price_max_age_secs).unwrap_or_default(),
        }
    }

    pub fn sustained_duration(&self) -> Duration {
        secs(self.sustained_duration_secs).unwrap_or_default()
    }
}

/// Seconds as a `Duration`; `None` for NaN, infinite, negative or
/// out-of-range values. Invalid values reach components as zero, which they
/// reject, and `validate()` reports them first.
fn secs(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

fn positive_secs(value: f64) -> bool {
    secs(value).is_some_and(|d| !d.is_zero())
}

// =============================================================================
// Environment helpers
// =============================================================================

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(&v).ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_csv_default(key: &str, default: &str) -> Vec<String> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
