//! Data models for backend and price-feed responses.
//!
//! Wire types (`*Data`, `FeedCurrentPrice`, `OhlcBar`) mirror the JSON the
//! services return; domain values (`OrderStatusSnapshot`, `PriceSample`,
//! `LatencySample`) are what the probes reason about.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Active,
    Won,
    Lost,
    #[serde(other)]
    Unknown,
}

impl OrderStatus {
    /// Won and Lost are final; nothing transitions out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Won | Self::Lost)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Won => write!(f, "WON"),
            Self::Lost => write!(f, "LOST"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// One read of `GET /binary-orders/{id}`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatusSnapshot {
    pub order_id: String,
    pub status: OrderStatus,
    pub entry_price: Option<Decimal>,
    /// Only present once the order is terminal.
    pub exit_price: Option<Decimal>,
    /// Only present once the order is terminal.
    pub profit: Option<Decimal>,
    pub fetched_at: Instant,
}

/// `data` payload of the order endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct BinaryOrderData {
    #[serde(default)]
    pub id: Option<String>,
    pub status: OrderStatus,
    #[serde(default)]
    pub entry_price: Option<Decimal>,
    #[serde(default)]
    pub exit_price: Option<Decimal>,
    #[serde(default)]
    pub profit: Option<Decimal>,
}

impl BinaryOrderData {
    pub fn into_snapshot(self, order_id: &str, fetched_at: Instant) -> OrderStatusSnapshot {
        let terminal = self.status.is_terminal();
        OrderStatusSnapshot {
            order_id: self.id.unwrap_or_else(|| order_id.to_string()),
            status: self.status,
            entry_price: self.entry_price,
            exit_price: self.exit_price.filter(|_| terminal),
            profit: self.profit.filter(|_| terminal),
            fetched_at,
        }
    }
}

// =============================================================================
// Prices
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceSourceKind {
    Live,
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub price: Decimal,
    pub source: PriceSourceKind,
    pub observed_at: DateTime<Utc>,
}

/// `data` payload of `GET /assets/{id}/price`.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetPriceData {
    pub price: Decimal,
    #[serde(default)]
    pub datetime: Option<String>,
}

/// `{instrument}/current_price.json` on the realtime feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedCurrentPrice {
    pub price: Decimal,
    /// Unix seconds, possibly fractional.
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub datetime: Option<String>,
}

/// One bar of `{instrument}/ohlc_{tf}.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct OhlcBar {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: Option<Decimal>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub datetime: Option<String>,
}

/// Bucket sizes published by the aggregate feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateTimeframe {
    #[serde(rename = "1s")]
    OneSecond,
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl AggregateTimeframe {
    pub const ALL: [Self; 7] = [
        Self::OneSecond,
        Self::OneMinute,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::OneHour,
        Self::FourHours,
        Self::OneDay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneSecond => "1s",
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
        }
    }
}

impl fmt::Display for AggregateTimeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateTimeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Invalid timeframe: {s}"))
    }
}

/// Interpret a feed timestamp (unix seconds) or ISO datetime.
///
/// Returns `None` when neither is usable; callers fall back to fetch time.
pub fn parse_observed_at(timestamp: Option<f64>, datetime: Option<&str>) -> Option<DateTime<Utc>> {
    if let Some(ts) = timestamp.filter(|t| t.is_finite() && *t > 0.0) {
        if let Some(dt) = Utc.timestamp_millis_opt((ts * 1000.0) as i64).single() {
            return Some(dt);
        }
    }
    datetime.and_then(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

// =============================================================================
// Load
// =============================================================================

/// Outcome of one load-test request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub success: bool,
    pub elapsed_ms: f64,
}
