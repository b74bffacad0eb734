//! Latency statistics for load runs.
//!
//! Latency figures cover successful samples only; throughput counts every
//! request issued against the wall clock of the whole batch.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::data::models::LatencySample;

/// Coarse verdict on mean latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PerformanceRating {
    Excellent,
    Good,
    Acceptable,
    Slow,
}

impl PerformanceRating {
    pub fn from_mean_ms(mean_ms: f64) -> Self {
        if mean_ms < 500.0 {
            Self::Excellent
        } else if mean_ms < 1000.0 {
            Self::Good
        } else if mean_ms < 2000.0 {
            Self::Acceptable
        } else {
            Self::Slow
        }
    }
}

/// Summary of one load run. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTestSummary {
    pub run_id: Uuid,
    pub total_requests: usize,
    pub successful: usize,
    pub failed: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub throughput_rps: f64,
    pub wall_clock_secs: f64,
}

impl LoadTestSummary {
    pub fn from_samples(run_id: Uuid, samples: &[LatencySample], wall_clock: Duration) -> Self {
        let mut ok: Vec<f64> = samples
            .iter()
            .filter(|s| s.success)
            .map(|s| s.elapsed_ms)
            .collect();
        ok.sort_by(|a, b| a.total_cmp(b));

        let total_requests = samples.len();
        let successful = ok.len();
        let wall_clock_secs = wall_clock.as_secs_f64();
        let throughput_rps = if wall_clock_secs > 0.0 {
            total_requests as f64 / wall_clock_secs
        } else {
            0.0
        };

        Self {
            run_id,
            total_requests,
            successful,
            failed: total_requests - successful,
            mean_ms: mean(&ok),
            median_ms: median(&ok),
            min_ms: ok.first().copied().unwrap_or(0.0),
            max_ms: ok.last().copied().unwrap_or(0.0),
            p95_ms: percentile(&ok, 0.95),
            p99_ms: percentile(&ok, 0.99),
            throughput_rps,
            wall_clock_secs,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful as f64 / self.total_requests as f64
    }

    pub fn rating(&self) -> PerformanceRating {
        PerformanceRating::from_mean_ms(self.mean_ms)
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Median of an ascending slice; even lengths average the middle pair.
pub fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    match n {
        0 => 0.0,
        _ if n % 2 == 1 => sorted[n / 2],
        _ => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

/// Nearest-rank percentile of an ascending slice: index `floor(N * p)`,
/// clamped to the last element for small N.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64) * p).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(ms: f64) -> LatencySample {
        LatencySample {
            success: true,
            elapsed_ms: ms,
        }
    }

    fn failed(ms: f64) -> LatencySample {
        LatencySample {
            success: false,
            elapsed_ms: ms,
        }
    }

    #[test]
    fn test_percentile_indexing() {
        // N = 20: p95 index = floor(19.0) = 19, p50 index = 10.
        let sorted: Vec<f64> = (1..=20).map(f64::from).collect();
        assert_eq!(percentile(&sorted, 0.95), 20.0);
        assert_eq!(percentile(&sorted, 0.50), 11.0);
        // N = 100: p99 index = 99.
        let sorted: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&sorted, 0.99), 100.0);
        assert_eq!(percentile(&sorted, 0.95), 96.0);
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&[1.0, 2.0, 9.0]), 2.0);
        assert_eq!(median(&[1.0, 2.0, 4.0, 9.0]), 3.0);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn test_failures_excluded_from_latency() {
        // Successful: 10, 20, 30 -> mean 20. The 5000 ms failure must not count.
        let samples = [ok(30.0), failed(5000.0), ok(10.0), ok(20.0)];
        let summary =
            LoadTestSummary::from_samples(Uuid::nil(), &samples, Duration::from_secs(2));

        assert_eq!(summary.total_requests, 4);
        assert_eq!(summary.successful, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.mean_ms, 20.0);
        assert_eq!(summary.min_ms, 10.0);
        assert_eq!(summary.max_ms, 30.0);
        // Throughput counts the failure too: 4 / 2 s.
        assert_eq!(summary.throughput_rps, 2.0);
        assert_eq!(summary.success_rate(), 0.75);
    }

    #[test]
    fn test_all_failed_gives_zero_latency() {
        let samples = [failed(100.0), failed(200.0)];
        let summary =
            LoadTestSummary::from_samples(Uuid::nil(), &samples, Duration::from_secs(1));
        assert_eq!(summary.successful, 0);
        assert_eq!(summary.mean_ms, 0.0);
        assert_eq!(summary.p99_ms, 0.0);
        assert_eq!(summary.throughput_rps, 2.0);
    }

    #[test]
    fn test_rating_thresholds() {
        assert_eq!(PerformanceRating::from_mean_ms(499.0), PerformanceRating::Excellent);
        assert_eq!(PerformanceRating::from_mean_ms(500.0), PerformanceRating::Good);
        assert_eq!(PerformanceRating::from_mean_ms(1999.9), PerformanceRating::Acceptable);
        assert_eq!(PerformanceRating::from_mean_ms(2000.0), PerformanceRating::Slow);
    }
}
