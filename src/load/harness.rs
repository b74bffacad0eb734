//! Load generation against a single endpoint.
//!
//! Two modes:
//! - burst: N requests through a bounded worker pool
//! - sustained: a fixed number of sequential requests every second
//!
//! A failing request is recorded as a failed sample and never aborts the
//! run. Workers hand their sample back to the orchestrator; nothing shares
//! a mutable list.

use futures::FutureExt;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, TokioClock};
use crate::data::models::LatencySample;
use crate::error::ProbeError;

use super::stats::LoadTestSummary;

pub struct LoadTestHarness<C = TokioClock> {
    clock: Arc<C>,
    cancel: CancellationToken,
}

impl<C: Clock + 'static> LoadTestHarness<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock: Arc::new(clock),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop sustained runs at the next one-second batch boundary.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Issue `total_requests` calls of `request` with at most `concurrency`
    /// in flight. Latency is timed from permit acquisition, so queueing in
    /// the pool is not counted. Dropping the returned future aborts every
    /// worker still running.
    pub async fn run_burst<F, Fut, E>(
        &self,
        request: F,
        total_requests: usize,
        concurrency: usize,
    ) -> Result<LoadTestSummary, ProbeError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if total_requests == 0 {
            return Err(ProbeError::invalid("total_requests must be positive"));
        }
        if concurrency == 0 {
            return Err(ProbeError::invalid("concurrency must be positive"));
        }

        let run_id = Uuid::new_v4();
        info!(%run_id, total_requests, concurrency, "Starting burst load run");

        let request = Arc::new(request);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let start = self.clock.now();

        let mut tasks = JoinSet::new();
        for _ in 0..total_requests {
            let request = request.clone();
            let sem = semaphore.clone();
            let clock = self.clock.clone();

            tasks.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                timed(clock.as_ref(), request.as_ref()).await
            });
        }

        let mut samples = Vec::with_capacity(total_requests);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    warn!(%run_id, error = %e, "Load worker did not complete");
                    samples.push(LatencySample {
                        success: false,
                        elapsed_ms: 0.0,
                    });
                }
            }
        }

        let wall_clock = self.clock.now().saturating_duration_since(start);
        let summary = LoadTestSummary::from_samples(run_id, &samples, wall_clock);
        log_summary("burst", &summary);
        Ok(summary)
    }

    /// Every second, issue `rate_per_second` sequential requests, then sleep
    /// out the rest of that second. A batch that overruns its second is
    /// followed immediately by the next one; lost time is not made up.
    pub async fn run_sustained<F, Fut, E>(
        &self,
        request: F,
        duration: Duration,
        rate_per_second: u32,
    ) -> Result<LoadTestSummary, ProbeError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), E>> + Send,
        E: Display,
    {
        if duration.is_zero() {
            return Err(ProbeError::invalid("duration must be positive"));
        }
        if rate_per_second == 0 {
            return Err(ProbeError::invalid("rate_per_second must be positive"));
        }

        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            duration_s = duration.as_secs_f64(),
            rate_per_second,
            "Starting sustained load run"
        );

        let one_second = Duration::from_secs(1);
        let start = self.clock.now();
        let mut samples = Vec::new();
        let mut batches = 0u32;

        while self.clock.now().saturating_duration_since(start) < duration {
            if self.cancel.is_cancelled() {
                info!(%run_id, batches, "Sustained load run cancelled");
                break;
            }

            let batch_start = self.clock.now();
            for _ in 0..rate_per_second {
                samples.push(timed(self.clock.as_ref(), &request).await);
            }
            batches += 1;

            let batch_elapsed = self.clock.now().saturating_duration_since(batch_start);
            debug!(%run_id, batch = batches, batch_ms = batch_elapsed.as_millis() as u64, "Batch complete");

            if let Some(rest) = one_second.checked_sub(batch_elapsed) {
                self.clock.sleep(rest).await;
            }
        }

        let wall_clock = self.clock.now().saturating_duration_since(start);
        let summary = LoadTestSummary::from_samples(run_id, &samples, wall_clock);
        log_summary("sustained", &summary);
        Ok(summary)
    }
}

/// Run one request and time it, up to the point of failure if it fails.
async fn timed<C, F, Fut, E>(clock: &C, request: &F) -> LatencySample
where
    C: Clock + ?Sized,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let started = clock.now();
    let result = AssertUnwindSafe(async { request().await })
        .catch_unwind()
        .await;
    let elapsed_ms = clock.now().saturating_duration_since(started).as_secs_f64() * 1000.0;

    let success = match result {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, elapsed_ms, "Load request failed");
            false
        }
        Err(_) => {
            warn!(elapsed_ms, "Load request panicked");
            false
        }
    };

    LatencySample {
        success,
        elapsed_ms,
    }
}

fn log_summary(mode: &str, summary: &LoadTestSummary) {
    info!(
        run_id = %summary.run_id,
        mode,
        total = summary.total_requests,
        successful = summary.successful,
        failed = summary.failed,
        mean_ms = summary.mean_ms,
        median_ms = summary.median_ms,
        p95_ms = summary.p95_ms,
        p99_ms = summary.p99_ms,
        throughput_rps = summary.throughput_rps,
        rating = ?summary.rating(),
        "Load run complete"
    );
}
