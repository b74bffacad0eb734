//! Cross-checks of the simulator's independently updated price feeds.
//!
//! The live tick and the latest aggregated close are written by separate
//! code paths in the simulator; if they drift apart, or the tick stops
//! moving, settlement prices become meaningless. Every check here is a
//! single read-only pass with no retries. Divergence and staleness come
//! back as values, never as errors.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::errors::ApiError;
use crate::clock::{Clock, TokioClock};
use crate::data::models::{AggregateTimeframe, LatencySample, PriceSample};
use crate::error::ProbeError;
use crate::load::stats::LoadTestSummary;

/// One price read from some source.
#[async_trait]
pub trait PriceFetcher: Send + Sync {
    async fn fetch_price(&self) -> Result<PriceSample, ApiError>;
}

/// Whether an aggregate timeframe has any bars.
#[async_trait]
pub trait TimeframeSource: Send + Sync {
    async fn has_bars(&self, timeframe: AggregateTimeframe) -> Result<bool, ApiError>;
}

/// Configuration for the consistency checker.
#[derive(Debug, Clone)]
pub struct ConsistencyConfig {
    /// Maximum allowed `|live - aggregate| / live`.
    pub tolerance: Decimal,
    /// Samples younger than this are FRESH.
    pub fresh_within: Duration,
    /// Samples at least this old are EXPIRED.
    pub max_age: Duration,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            tolerance: Decimal::new(5, 2),
            fresh_within: Duration::from_secs(10),
            max_age: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InconsistencyReason {
    MissingData,
    Divergent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyResult {
    pub consistent: bool,
    pub reason: Option<InconsistencyReason>,
    /// Absent only when a price could not be read.
    pub relative_diff: Option<Decimal>,
    pub live: Option<PriceSample>,
    pub aggregate: Option<PriceSample>,
}

impl ConsistencyResult {
    fn missing(live: Option<PriceSample>, aggregate: Option<PriceSample>) -> Self {
        Self {
            consistent: false,
            reason: Some(InconsistencyReason::MissingData),
            relative_diff: None,
            live,
            aggregate,
        }
    }
}

/// Freshness levels, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FreshnessLevel {
    Fresh,
    Stale,
    Expired,
}

impl FreshnessLevel {
    /// True if `self` is no worse than `limit`. Callers pick the limit to
    /// decide whether STALE data counts as a failure.
    pub fn at_most(self, limit: FreshnessLevel) -> bool {
        self <= limit
    }
}

impl std::str::FromStr for FreshnessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fresh" => Ok(Self::Fresh),
            "stale" => Ok(Self::Stale),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid freshness level: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreshnessReport {
    pub level: FreshnessLevel,
    pub age: Duration,
}

/// Whether the live feed is still ticking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub samples: u32,
    pub failed: u32,
    pub distinct_timestamps: usize,
    pub updating: bool,
}

/// Read latency and data age over repeated reads of one feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedSampleReport {
    pub latency: LoadTestSummary,
    /// Over successful reads only; zero if none succeeded.
    pub mean_age: Duration,
    pub max_age: Duration,
}

pub struct PriceConsistencyChecker<C = TokioClock> {
    clock: C,
    config: ConsistencyConfig,
}

impl<C: Clock> PriceConsistencyChecker<C> {
    pub fn new(clock: C, config: ConsistencyConfig) -> Self {
        Self { clock, config }
    }

    pub fn config(&self) -> &ConsistencyConfig {
        &self.config
    }

    /// Compare with the configured tolerance.
    pub async fn check(
        &self,
        live: &dyn PriceFetcher,
        aggregate: &dyn PriceFetcher,
    ) -> ConsistencyResult {
        self.compare(live, aggregate, self.config.tolerance).await
    }

    /// Read both sources and compare their prices against `tolerance`.
    pub async fn check_consistency(
        &self,
        live: &dyn PriceFetcher,
        aggregate: &dyn PriceFetcher,
        tolerance: Decimal,
    ) -> Result<ConsistencyResult, ProbeError> {
        if tolerance.is_sign_negative() {
            return Err(ProbeError::invalid("tolerance must not be negative"));
        }
        Ok(self.compare(live, aggregate, tolerance).await)
    }

    async fn compare(
        &self,
        live: &dyn PriceFetcher,
        aggregate: &dyn PriceFetcher,
        tolerance: Decimal,
    ) -> ConsistencyResult {
        let (live_res, aggregate_res) = tokio::join!(live.fetch_price(), aggregate.fetch_price());

        let live_sample = match live_res {
            Ok(s) if s.price > Decimal::ZERO => Some(s),
            Ok(s) => {
                warn!(price = %s.price, "Live price is not positive");
                None
            }
            Err(e) => {
                warn!(error = %e, "Live price unavailable");
                None
            }
        };
        let aggregate_sample = match aggregate_res {
            Ok(s) if s.price > Decimal::ZERO => Some(s),
            Ok(s) => {
                warn!(price = %s.price, "Aggregate price is not positive");
                None
            }
            Err(e) => {
                warn!(error = %e, "Aggregate price unavailable");
                None
            }
        };

        let (live_sample, aggregate_sample) = match (live_sample, aggregate_sample) {
            (Some(l), Some(a)) => (l, a),
            (l, a) => return ConsistencyResult::missing(l, a),
        };

        let relative_diff = relative_diff(live_sample.price, aggregate_sample.price);
        let consistent = relative_diff <= tolerance;

        if consistent {
            info!(
                live = %live_sample.price,
                aggregate = %aggregate_sample.price,
                relative_diff = %relative_diff,
                "Price feeds consistent"
            );
        } else {
            warn!(
                live = %live_sample.price,
                aggregate = %aggregate_sample.price,
                relative_diff = %relative_diff,
                tolerance = %tolerance,
                "Price feeds diverge"
            );
        }

        ConsistencyResult {
            consistent,
            reason: (!consistent).then_some(InconsistencyReason::Divergent),
            relative_diff: Some(relative_diff),
            live: Some(live_sample),
            aggregate: Some(aggregate_sample),
        }
    }

    /// Classify with the configured `max_age`.
    pub fn freshness(&self, sample: &PriceSample) -> FreshnessReport {
        self.classify(sample, self.config.max_age)
    }

    /// Age of `sample` against wall-clock now: FRESH below `fresh_within`,
    /// EXPIRED at or beyond `max_age`, STALE in between. Future timestamps
    /// (clock skew) count as age zero.
    pub fn check_freshness(
        &self,
        sample: &PriceSample,
        max_age: Duration,
    ) -> Result<FreshnessReport, ProbeError> {
        if max_age.is_zero() {
            return Err(ProbeError::invalid("max_age must be positive"));
        }
        Ok(self.classify(sample, max_age))
    }

    /// Read `fetcher` once and classify the sample with the configured
    /// `max_age`. A failed read is an error here, not a level.
    pub async fn fetch_freshness(
        &self,
        fetcher: &dyn PriceFetcher,
    ) -> Result<(PriceSample, FreshnessReport), ProbeError> {
        let sample = fetcher.fetch_price().await?;
        let report = self.freshness(&sample);
        Ok((sample, report))
    }

    fn age_of(&self, sample: &PriceSample) -> Duration {
        (self.clock.now_utc() - sample.observed_at)
            .max(ChronoDuration::zero())
            .to_std()
            .unwrap_or_default()
    }

    fn classify(&self, sample: &PriceSample, max_age: Duration) -> FreshnessReport {
        let age = self.age_of(sample);

        let level = if age >= max_age {
            FreshnessLevel::Expired
        } else if age >= self.config.fresh_within {
            FreshnessLevel::Stale
        } else {
            FreshnessLevel::Fresh
        };

        debug!(age_s = age.as_secs_f64(), level = ?level, "Price freshness");
        FreshnessReport { level, age }
    }

    /// Read `fetcher` `samples` times, `spacing` apart, and report whether
    /// more than one distinct observation time was seen.
    pub async fn check_updating(
        &self,
        fetcher: &dyn PriceFetcher,
        samples: u32,
        spacing: Duration,
    ) -> Result<UpdateReport, ProbeError> {
        if samples < 2 {
            return Err(ProbeError::invalid("need at least two samples to detect updates"));
        }

        let mut seen = HashSet::new();
        let mut failed = 0u32;

        for i in 0..samples {
            match fetcher.fetch_price().await {
                Ok(sample) => {
                    debug!(sample = i + 1, price = %sample.price, observed_at = %sample.observed_at, "Feed sample");
                    seen.insert(sample.observed_at);
                }
                Err(e) => {
                    warn!(sample = i + 1, error = %e, "Feed sample failed");
                    failed += 1;
                }
            }
            if i + 1 < samples {
                self.clock.sleep(spacing).await;
            }
        }

        let report = UpdateReport {
            samples,
            failed,
            distinct_timestamps: seen.len(),
            updating: seen.len() > 1,
        };
        info!(
            distinct = report.distinct_timestamps,
            failed = report.failed,
            updating = report.updating,
            "Feed update check"
        );
        Ok(report)
    }

    /// Time `samples` sequential reads of `fetcher`, `spacing` apart, and
    /// average how old the returned data was.
    pub async fn sample_feed(
        &self,
        fetcher: &dyn PriceFetcher,
        samples: u32,
        spacing: Duration,
    ) -> Result<FeedSampleReport, ProbeError> {
        if samples == 0 {
            return Err(ProbeError::invalid("samples must be positive"));
        }

        let start = self.clock.now();
        let mut latencies = Vec::with_capacity(samples as usize);
        let mut ages = Vec::with_capacity(samples as usize);

        for i in 0..samples {
            let sent = self.clock.now();
            let result = fetcher.fetch_price().await;
            let elapsed_ms = self.clock.now().saturating_duration_since(sent).as_secs_f64() * 1000.0;

            let success = match result {
                Ok(sample) => {
                    let age = self.age_of(&sample);
                    debug!(sample = i + 1, elapsed_ms, age_s = age.as_secs_f64(), "Feed read");
                    ages.push(age);
                    true
                }
                Err(e) => {
                    warn!(sample = i + 1, error = %e, elapsed_ms, "Feed read failed");
                    false
                }
            };
            latencies.push(LatencySample {
                success,
                elapsed_ms,
            });

            if i + 1 < samples {
                self.clock.sleep(spacing).await;
            }
        }

        let wall_clock = self.clock.now().saturating_duration_since(start);
        let latency = LoadTestSummary::from_samples(Uuid::new_v4(), &latencies, wall_clock);
        let mean_age = if ages.is_empty() {
            Duration::ZERO
        } else {
            ages.iter().sum::<Duration>() / ages.len() as u32
        };
        let max_age = ages.iter().max().copied().unwrap_or_default();

        info!(
            reads = samples,
            failed = latency.failed,
            mean_ms = latency.mean_ms,
            p95_ms = latency.p95_ms,
            mean_age_s = mean_age.as_secs_f64(),
            max_age_s = max_age.as_secs_f64(),
            "Feed sampling complete"
        );
        Ok(FeedSampleReport {
            latency,
            mean_age,
            max_age,
        })
    }

    /// For each timeframe, whether the aggregate feed has any bars. A failed
    /// read counts as no data.
    pub async fn check_timeframes(
        &self,
        source: &dyn TimeframeSource,
        timeframes: &[AggregateTimeframe],
    ) -> Vec<(AggregateTimeframe, bool)> {
        let mut coverage = Vec::with_capacity(timeframes.len());
        for &tf in timeframes {
            let present = match source.has_bars(tf).await {
                Ok(present) => present,
                Err(e) => {
                    warn!(timeframe = %tf, error = %e, "Timeframe read failed");
                    false
                }
            };
            debug!(timeframe = %tf, present, "Timeframe coverage");
            coverage.push((tf, present));
        }
        coverage
    }
}

/// `|live - aggregate| / live`. Caller guarantees `live > 0`.
pub fn relative_diff(live: Decimal, aggregate: Decimal) -> Decimal {
    (live - aggregate).abs() / live
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::models::PriceSourceKind;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    struct Fixed(Result<Decimal, ApiError>, PriceSourceKind);

    #[async_trait]
    impl PriceFetcher for Fixed {
        async fn fetch_price(&self) -> Result<PriceSample, ApiError> {
            self.0.clone().map(|price| PriceSample {
                price,
                source: self.1,
                observed_at: Utc::now(),
            })
        }
    }

    fn live(p: Decimal) -> Fixed {
        Fixed(Ok(p), PriceSourceKind::Live)
    }

    fn agg(p: Decimal) -> Fixed {
        Fixed(Ok(p), PriceSourceKind::Aggregate)
    }

    fn checker() -> PriceConsistencyChecker {
        PriceConsistencyChecker::new(TokioClock, ConsistencyConfig::default())
    }

    #[tokio::test]
    async fn test_within_tolerance_is_consistent() {
        // |100 - 104| / 100 = 0.04 <= 0.05
        let result = checker().check(&live(dec!(100)), &agg(dec!(104))).await;
        assert!(result.consistent);
        assert_eq!(result.reason, None);
        assert_eq!(result.relative_diff, Some(dec!(0.04)));
    }

    #[tokio::test]
    async fn test_boundary_is_consistent() {
        // Exactly at tolerance: 5 / 100 = 0.05, not greater than 0.05.
        let result = checker().check(&live(dec!(100)), &agg(dec!(95))).await;
        assert!(result.consistent);
    }

    #[tokio::test]
    async fn test_non_positive_price_is_missing_data() {
        let result = checker().check(&live(dec!(0)), &agg(dec!(100))).await;
        assert!(!result.consistent);
        assert_eq!(result.reason, Some(InconsistencyReason::MissingData));
        assert!(result.live.is_none());
        assert!(result.aggregate.is_some());
    }

    #[tokio::test]
    async fn test_failed_read_is_missing_data() {
        let timed_out = Fixed(Err(ApiError::Timeout("read".into())), PriceSourceKind::Aggregate);
        let result = checker().check(&live(dec!(100)), &timed_out).await;

        assert!(!result.consistent);
        assert_eq!(result.reason, Some(InconsistencyReason::MissingData));
        assert_eq!(result.relative_diff, None);
        assert!(result.live.is_some());
        assert!(result.aggregate.is_none());

        let down = Fixed(Err(ApiError::Network("refused".into())), PriceSourceKind::Live);
        let result = checker().check(&down, &agg(dec!(100))).await;
        assert_eq!(result.reason, Some(InconsistencyReason::MissingData));
        assert_eq!(result.relative_diff, None);
    }

    #[tokio::test]
    async fn test_negative_tolerance_rejected() {
        let result = checker()
            .check_consistency(&live(dec!(100)), &agg(dec!(100)), dec!(-0.01))
            .await;
        assert!(matches!(result, Err(ProbeError::InvalidArgument(_))));
    }

    #[test]
    fn test_future_timestamp_is_fresh() {
        let sample = PriceSample {
            price: dec!(1),
            source: PriceSourceKind::Live,
            observed_at: Utc::now() + ChronoDuration::seconds(20),
        };
        let report = checker().freshness(&sample);
        assert_eq!(report.level, FreshnessLevel::Fresh);
        assert_eq!(report.age, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_fetch_freshness_propagates_read_failure() {
        let down = Fixed(Err(ApiError::Timeout("read".into())), PriceSourceKind::Live);
        let result = checker().fetch_freshness(&down).await;
        assert!(matches!(result, Err(ProbeError::Api(ApiError::Timeout(_)))));

        let (sample, report) = checker().fetch_freshness(&live(dec!(42))).await.unwrap();
        assert_eq!(sample.price, dec!(42));
        assert_eq!(report.level, FreshnessLevel::Fresh);
    }

    /// Ticks once per read while `moving`, otherwise repeats one timestamp.
    struct Ticker {
        moving: bool,
        reads: std::sync::atomic::AtomicI64,
    }

    #[async_trait]
    impl PriceFetcher for Ticker {
        async fn fetch_price(&self) -> Result<PriceSample, ApiError> {
            let n = self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let offset = if self.moving { n } else { 0 };
            Ok(PriceSample {
                price: dec!(100),
                source: PriceSourceKind::Live,
                observed_at: chrono::DateTime::<Utc>::UNIX_EPOCH + ChronoDuration::seconds(offset),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_updating_detects_frozen_feed() {
        let moving = Ticker {
            moving: true,
            reads: 0.into(),
        };
        let report = checker()
            .check_updating(&moving, 3, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(report.updating);
        assert_eq!(report.distinct_timestamps, 3);

        let frozen = Ticker {
            moving: false,
            reads: 0.into(),
        };
        let report = checker()
            .check_updating(&frozen, 3, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!report.updating);
        assert_eq!(report.distinct_timestamps, 1);

        assert!(checker()
            .check_updating(&frozen, 1, Duration::from_secs(2))
            .await
            .is_err());
    }

    struct Bars(Vec<AggregateTimeframe>);

    #[async_trait]
    impl TimeframeSource for Bars {
        async fn has_bars(&self, timeframe: AggregateTimeframe) -> Result<bool, ApiError> {
            if timeframe == AggregateTimeframe::OneDay {
                return Err(ApiError::Network("connection reset".into()));
            }
            Ok(self.0.contains(&timeframe))
        }
    }

    #[tokio::test]
    async fn test_check_timeframes_reports_coverage() {
        let source = Bars(vec![AggregateTimeframe::OneSecond, AggregateTimeframe::OneMinute]);
        let coverage = checker()
            .check_timeframes(&source, &AggregateTimeframe::ALL)
            .await;

        assert_eq!(coverage.len(), 7);
        assert_eq!(coverage[0], (AggregateTimeframe::OneSecond, true));
        assert_eq!(coverage[1], (AggregateTimeframe::OneMinute, true));
        assert_eq!(coverage[2], (AggregateTimeframe::FiveMinutes, false));
        // A failed read is reported as missing.
        assert_eq!(coverage[6], (AggregateTimeframe::OneDay, false));
    }

    /// Takes 20 ms per read and serves data 2 s old; every third read fails.
    struct SlowFeed {
        reads: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl PriceFetcher for SlowFeed {
        async fn fetch_price(&self) -> Result<PriceSample, ApiError> {
            let n = self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if n % 3 == 2 {
                return Err(ApiError::Http {
                    status_code: 503,
                    message: "unavailable".into(),
                });
            }
            Ok(PriceSample {
                price: dec!(100),
                source: PriceSourceKind::Live,
                observed_at: Utc::now() - ChronoDuration::seconds(2),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_feed_times_reads_and_ages() {
        let feed = SlowFeed { reads: 0.into() };
        let report = checker()
            .sample_feed(&feed, 6, Duration::from_secs(1))
            .await
            .unwrap();

        // Reads 3 and 6 fail.
        assert_eq!(report.latency.total_requests, 6);
        assert_eq!(report.latency.successful, 4);
        assert!((report.latency.mean_ms - 20.0).abs() <= 2.0, "{}", report.latency.mean_ms);
        assert!(report.mean_age >= Duration::from_secs(2));
        assert!(report.max_age < Duration::from_millis(2500));

        assert!(matches!(
            checker().sample_feed(&feed, 0, Duration::ZERO).await,
            Err(ProbeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_level_ordering_policy() {
        assert!(FreshnessLevel::Fresh.at_most(FreshnessLevel::Stale));
        assert!(FreshnessLevel::Stale.at_most(FreshnessLevel::Stale));
        assert!(!FreshnessLevel::Expired.at_most(FreshnessLevel::Stale));
        assert_eq!("Stale".parse::<FreshnessLevel>().unwrap(), FreshnessLevel::Stale);
    }
}
