//! Settlement Probe
//!
//! Black-box verification of a binary-option trading backend and its price
//! simulator.
//!
//! Probes:
//! - consistency: live tick vs aggregated close, feed freshness and liveness
//! - settlement: bounded watch of one order until WON/LOST, then re-reads
//! - load: burst and sustained request runs with latency statistics
//!
//! Exits non-zero if any selected probe fails.

use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use settlement_probe::api::client::{AssetPrice, BackendClient};
use settlement_probe::api::feed::{AggregateClose, FeedClient, LivePrice};
use settlement_probe::auth::BearerAuth;
use settlement_probe::clock::TokioClock;
use settlement_probe::config::{Probe, Settings};
use settlement_probe::consistency::checker::PriceConsistencyChecker;
use settlement_probe::data::models::AggregateTimeframe;
use settlement_probe::load::harness::LoadTestHarness;
use settlement_probe::settlement::watcher::{SettlementCheck, SettlementOutcome, SettlementWatcher};

/// Reads of the live feed when checking that it ticks.
const UPDATE_SAMPLES: u32 = 3;
const UPDATE_SPACING: Duration = Duration::from_secs(2);

/// Timed reads of the live feed for latency and data age.
const FEED_SAMPLES: u32 = 5;
const FEED_SAMPLE_SPACING: Duration = Duration::from_secs(1);

/// Verification reads after an order settles.
const CONFIRM_READS: u32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration.
    let settings = Settings::from_env();

    // Initialize logging.
    init_logging(&settings);

    info!("=== Settlement Probe ===");
    info!(
        backend = %settings.backend_base_url,
        feed = %settings.feed_base_url,
        probes = ?settings.probes,
        "Configuration loaded"
    );

    // Validate settings.
    if let Err(errors) = settings.validate() {
        for e in &errors {
            error!(error = %e, "Configuration error");
        }
        anyhow::bail!("Configuration validation failed");
    }
    let probes = settings.probe_list().map_err(anyhow::Error::msg)?;

    // Shutdown signal. Watches and sustained runs stop at their next
    // boundary; in-flight requests are left to finish.
    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                cancel_on_signal.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for ctrl+c"),
        }
    });

    let mut failed = Vec::new();
    for probe in probes {
        if cancel.is_cancelled() {
            warn!(probe = ?probe, "Skipping probe after shutdown signal");
            failed.push(probe);
            continue;
        }

        info!(probe = ?probe, "Running probe");
        let result = match probe {
            Probe::Consistency => run_consistency(&settings).await,
            Probe::Settlement => run_settlement(&settings, cancel.clone()).await,
            Probe::Load => run_load(&settings, cancel.clone()).await,
        };

        match result {
            Ok(true) => info!(probe = ?probe, "Probe passed"),
            Ok(false) => {
                warn!(probe = ?probe, "Probe failed");
                failed.push(probe);
            }
            Err(e) => {
                error!(probe = ?probe, error = %e, "Probe could not run");
                failed.push(probe);
            }
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("{} probe(s) failed: {:?}", failed.len(), failed);
    }

    info!("All probes passed");
    Ok(())
}

fn backend_client(settings: &Settings) -> anyhow::Result<BackendClient> {
    let auth = BearerAuth::new(&settings.backend_token)?;
    let client = BackendClient::new(
        auth,
        &settings.backend_base_url,
        settings.request_timeout(),
        settings.rate_limit_per_sec,
        settings.max_attempts,
    )?;
    Ok(client)
}

// =============================================================================
// Consistency
// =============================================================================

async fn run_consistency(settings: &Settings) -> anyhow::Result<bool> {
    let feed = FeedClient::new(
        &settings.feed_base_url,
        &settings.feed_instrument_path,
        settings.feed_timeout(),
    )?;
    let timeframe = settings.timeframe().map_err(anyhow::Error::msg)?;
    let freshness_limit = settings.freshness_limit().map_err(anyhow::Error::msg)?;
    let checker = PriceConsistencyChecker::new(TokioClock, settings.consistency_config());

    let live = LivePrice(&feed);
    let aggregate = AggregateClose {
        feed: &feed,
        timeframe,
    };

    let mut passed = true;

    let result = checker.check(&live, &aggregate).await;
    info!(
        consistent = result.consistent,
        reason = ?result.reason,
        relative_diff = ?result.relative_diff,
        timeframe = %timeframe,
        "Live vs aggregate"
    );
    passed &= result.consistent;

    match checker.fetch_freshness(&live).await {
        Ok((sample, report)) => {
            let ok = report.level.at_most(freshness_limit);
            info!(
                price = %sample.price,
                observed_at = %sample.observed_at,
                age_s = report.age.as_secs_f64(),
                level = ?report.level,
                ok,
                "Live feed freshness"
            );
            passed &= ok;
        }
        Err(e) => {
            warn!(error = %e, "Live feed freshness unavailable");
            passed = false;
        }
    }

    // The backend's own view of the asset price should track the simulator.
    if !settings.asset_id.is_empty() && !settings.backend_token.is_empty() {
        let client = backend_client(settings)?;
        let asset = AssetPrice {
            client: &client,
            asset_id: &settings.asset_id,
        };
        let result = checker.check(&asset, &live).await;
        info!(
            asset_id = %settings.asset_id,
            consistent = result.consistent,
            reason = ?result.reason,
            relative_diff = ?result.relative_diff,
            "Backend vs live feed"
        );
        passed &= result.consistent;
    }

    let coverage = checker
        .check_timeframes(&feed, &AggregateTimeframe::ALL)
        .await;
    let missing: Vec<String> = coverage
        .iter()
        .filter(|(_, present)| !present)
        .map(|(tf, _)| tf.to_string())
        .collect();
    info!(
        available = coverage.len() - missing.len(),
        missing = ?missing,
        "Aggregate timeframe coverage"
    );
    if coverage.iter().any(|(tf, present)| *tf == timeframe && !present) {
        warn!(timeframe = %timeframe, "Configured timeframe has no bars");
        passed = false;
    }

    let updating = checker
        .check_updating(&live, UPDATE_SAMPLES, UPDATE_SPACING)
        .await?;
    passed &= updating.updating;

    // Logged only; latency of the feed is not a pass criterion.
    checker
        .sample_feed(&live, FEED_SAMPLES, FEED_SAMPLE_SPACING)
        .await?;

    Ok(passed)
}

// =============================================================================
// Settlement
// =============================================================================

async fn run_settlement(settings: &Settings, cancel: CancellationToken) -> anyhow::Result<bool> {
    let client = backend_client(settings)?;
    let watcher = SettlementWatcher::new(client, TokioClock, settings.watcher_config())
        .with_cancellation(cancel);

    let outcome = watcher.watch(&settings.order_id).await?;
    let settlement = match &outcome {
        SettlementOutcome::Resolved(s) => s,
        other => {
            warn!(
                order_id = %settings.order_id,
                reason = ?other.failure_reason(),
                elapsed_s = other.elapsed().as_secs_f64(),
                "Order did not settle"
            );
            return Ok(false);
        }
    };

    match watcher.confirm_settlement(settlement, CONFIRM_READS).await? {
        SettlementCheck::Stable { reads } => {
            info!(order_id = %settlement.order_id, reads, "Settlement stable");
            Ok(true)
        }
        SettlementCheck::Regressed {
            field,
            expected,
            observed,
        } => {
            warn!(
                order_id = %settlement.order_id,
                field,
                expected = %expected,
                observed = %observed,
                "Settlement changed after resolution"
            );
            Ok(false)
        }
        SettlementCheck::Unverified { error } => {
            warn!(order_id = %settlement.order_id, error = %error, "Settlement could not be re-read");
            Ok(false)
        }
    }
}

// =============================================================================
// Load
// =============================================================================

async fn run_load(settings: &Settings, cancel: CancellationToken) -> anyhow::Result<bool> {
    let client = Arc::new(backend_client(settings)?);
    let harness = LoadTestHarness::new(TokioClock).with_cancellation(cancel);

    let burst_request = {
        let client = client.clone();
        let path = settings.load_path.clone();
        move || {
            let client = client.clone();
            let path = path.clone();
            async move { client.probe(Method::GET, &path, None).await }
        }
    };

    let burst = harness
        .run_burst(
            burst_request,
            settings.load_total_requests,
            settings.load_concurrency,
        )
        .await?;
    let mut passed = burst.failed == 0;

    if !settings.sustained_duration().is_zero() {
        let path = settings.load_path.clone();
        let client = client.as_ref();
        let sustained = harness
            .run_sustained(
                || client.probe(Method::GET, &path, None),
                settings.sustained_duration(),
                settings.sustained_rate_per_sec,
            )
            .await?;
        passed &= sustained.failed == 0;
    }

    Ok(passed)
}

fn init_logging(settings: &Settings) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    if settings.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}
