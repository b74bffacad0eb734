//! Bounded polling of a binary order until it settles.
//!
//! Replaces the "sleep 75 s then read once" pattern with a watch that polls
//! on a fixed schedule, stops at the first terminal status, absorbs a small
//! number of failed fetches, and gives up at a deadline. Any failed fetch
//! (transport error, non-200, malformed body, unrecognised status) is
//! retried on the next poll until the failure budget runs out.
//!
//! State machine: `WAITING -> RESOLVED | TIMED_OUT | ERRORED | CANCELLED`,
//! all terminal.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::errors::ApiError;
use crate::clock::{Clock, TokioClock};
use crate::data::models::{OrderStatus, OrderStatusSnapshot};
use crate::error::ProbeError;

/// Stand-in deadline for a `max_wait` that does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Where order snapshots come from.
#[async_trait]
pub trait OrderStatusSource: Send + Sync {
    async fn fetch_order(&self, order_id: &str) -> Result<OrderStatusSnapshot, ApiError>;
}

#[async_trait]
impl<S: OrderStatusSource + ?Sized> OrderStatusSource for Arc<S> {
    async fn fetch_order(&self, order_id: &str) -> Result<OrderStatusSnapshot, ApiError> {
        (**self).fetch_order(order_id).await
    }
}

/// Configuration for the settlement watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Overall deadline. The shortest tradable duration is 60 s, plus
    /// settlement-engine slack.
    pub max_wait: Duration,
    pub poll_interval: Duration,
    /// Back-to-back failed polls tolerated before giving up early.
    pub max_consecutive_failures: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(75),
            poll_interval: Duration::from_secs(3),
            max_consecutive_failures: 3,
        }
    }
}

/// A settled order as first observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settlement {
    pub order_id: String,
    pub status: OrderStatus,
    pub entry_price: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub profit: Option<Decimal>,
    pub elapsed: Duration,
    pub polls: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    Timeout,
    FetchError,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    Resolved(Settlement),
    /// Deadline passed with the order still pending.
    TimedOut {
        elapsed: Duration,
        polls: u32,
        last_status: Option<OrderStatus>,
    },
    /// Failure budget exhausted.
    Errored {
        elapsed: Duration,
        consecutive_failures: u32,
        last_error: ApiError,
    },
    Cancelled { elapsed: Duration, polls: u32 },
}

impl SettlementOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    pub fn settlement(&self) -> Option<&Settlement> {
        match self {
            Self::Resolved(s) => Some(s),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Resolved(_) => None,
            Self::TimedOut { .. } => Some(FailureReason::Timeout),
            Self::Errored { .. } => Some(FailureReason::FetchError),
            Self::Cancelled { .. } => Some(FailureReason::Cancelled),
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Resolved(s) => s.elapsed,
            Self::TimedOut { elapsed, .. }
            | Self::Errored { elapsed, .. }
            | Self::Cancelled { elapsed, .. } => *elapsed,
        }
    }
}

/// Result of re-reading an already settled order.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementCheck {
    Stable { reads: u32 },
    Regressed {
        field: &'static str,
        expected: String,
        observed: String,
    },
    Unverified { error: ApiError },
}

/// Watches one order at a time until it settles.
pub struct SettlementWatcher<S, C = TokioClock> {
    source: S,
    clock: C,
    config: WatcherConfig,
    cancel: CancellationToken,
}

impl<S: OrderStatusSource, C: Clock> SettlementWatcher<S, C> {
    pub fn new(source: S, clock: C, config: WatcherConfig) -> Self {
        Self {
            source,
            clock,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Abandon watches when `token` fires. Checked only between polls.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Watch with the configured deadline and interval.
    pub async fn watch(&self, order_id: &str) -> Result<SettlementOutcome, ProbeError> {
        self.await_settlement(order_id, self.config.max_wait, self.config.poll_interval)
            .await
    }

    /// Poll `order_id` at t=0 and every `poll_interval` until it is WON/LOST,
    /// `max_wait` elapses, or the failure budget runs out.
    ///
    /// Returns within `max_wait + poll_interval` plus the per-call timeout of
    /// the last fetch. Only invalid arguments produce `Err`.
    pub async fn await_settlement(
        &self,
        order_id: &str,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<SettlementOutcome, ProbeError> {
        if order_id.trim().is_empty() {
            return Err(ProbeError::invalid("order_id must not be empty"));
        }
        if max_wait.is_zero() {
            return Err(ProbeError::invalid("max_wait must be positive"));
        }
        if poll_interval.is_zero() {
            return Err(ProbeError::invalid("poll_interval must be positive"));
        }
        let max_failures = self.config.max_consecutive_failures;
        if max_failures == 0 {
            return Err(ProbeError::invalid("max_consecutive_failures must be positive"));
        }

        let start = self.clock.now();
        let deadline = start
            .checked_add(max_wait)
            .unwrap_or_else(|| start + FAR_FUTURE);
        let mut polls = 0u32;
        let mut consecutive_failures = 0u32;
        let mut last_status = None;

        info!(
            order_id = %order_id,
            max_wait_s = max_wait.as_secs_f64(),
            poll_interval_s = poll_interval.as_secs_f64(),
            "Watching order for settlement"
        );

        loop {
            polls += 1;

            let failure = match self.source.fetch_order(order_id).await {
                Ok(snapshot) if snapshot.status.is_terminal() => {
                    let elapsed = self.clock.now().saturating_duration_since(start);
                    info!(
                        order_id = %order_id,
                        status = %snapshot.status,
                        exit_price = ?snapshot.exit_price,
                        profit = ?snapshot.profit,
                        elapsed_s = elapsed.as_secs_f64(),
                        polls,
                        "Order settled"
                    );
                    return Ok(SettlementOutcome::Resolved(Settlement {
                        order_id: snapshot.order_id,
                        status: snapshot.status,
                        entry_price: snapshot.entry_price,
                        exit_price: snapshot.exit_price,
                        profit: snapshot.profit,
                        elapsed,
                        polls,
                    }));
                }
                Ok(snapshot) if snapshot.status == OrderStatus::Unknown => Some(
                    ApiError::Deserialization("unrecognised order status".to_string()),
                ),
                Ok(snapshot) => {
                    debug!(order_id = %order_id, status = %snapshot.status, polls, "Order pending");
                    last_status = Some(snapshot.status);
                    None
                }
                Err(e) => Some(e),
            };

            match failure {
                None => consecutive_failures = 0,
                Some(error) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= max_failures {
                        let elapsed = self.clock.now().saturating_duration_since(start);
                        warn!(
                            order_id = %order_id,
                            error = %error,
                            consecutive_failures,
                            elapsed_s = elapsed.as_secs_f64(),
                            "Giving up on settlement watch"
                        );
                        return Ok(SettlementOutcome::Errored {
                            elapsed,
                            consecutive_failures,
                            last_error: error,
                        });
                    }
                    warn!(
                        order_id = %order_id,
                        error = %error,
                        consecutive_failures,
                        "Order fetch failed, retrying on next poll"
                    );
                }
            }

            let now = self.clock.now();
            if now >= deadline {
                let elapsed = now.saturating_duration_since(start);
                warn!(
                    order_id = %order_id,
                    last_status = ?last_status,
                    elapsed_s = elapsed.as_secs_f64(),
                    polls,
                    "Order did not settle before deadline"
                );
                return Ok(SettlementOutcome::TimedOut {
                    elapsed,
                    polls,
                    last_status,
                });
            }

            let wake = next_boundary(start, now, poll_interval).map_or(deadline, |b| b.min(deadline));

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let elapsed = self.clock.now().saturating_duration_since(start);
                    info!(order_id = %order_id, polls, "Settlement watch cancelled");
                    return Ok(SettlementOutcome::Cancelled { elapsed, polls });
                }
                _ = self.clock.sleep(wake.saturating_duration_since(now)) => {}
            }
        }
    }

    /// Re-read a settled order `reads` times and check that status, exit
    /// price and profit stay exactly as first observed.
    pub async fn confirm_settlement(
        &self,
        settlement: &Settlement,
        reads: u32,
    ) -> Result<SettlementCheck, ProbeError> {
        if reads == 0 {
            return Err(ProbeError::invalid("reads must be positive"));
        }

        for _ in 0..reads {
            let snapshot = match self.source.fetch_order(&settlement.order_id).await {
                Ok(s) => s,
                Err(error) => return Ok(SettlementCheck::Unverified { error }),
            };

            if let Some(check) = regression(settlement, &snapshot) {
                warn!(order_id = %settlement.order_id, check = ?check, "Settled order changed");
                return Ok(check);
            }
        }

        Ok(SettlementCheck::Stable { reads })
    }
}

/// First poll boundary `start + k * interval` strictly after `now`. Missed
/// boundaries are skipped, not made up. `None` if that boundary is not
/// representable.
fn next_boundary(start: Instant, now: Instant, interval: Duration) -> Option<Instant> {
    let elapsed = now.saturating_duration_since(start).as_nanos();
    let k = elapsed / interval.as_nanos() + 1;
    let offset = u64::try_from(interval.as_nanos().checked_mul(k)?).ok()?;
    start.checked_add(Duration::from_nanos(offset))
}

fn regression(expected: &Settlement, observed: &OrderStatusSnapshot) -> Option<SettlementCheck> {
    fn render<T: std::fmt::Debug>(v: &T) -> String {
        format!("{v:?}")
    }

    if observed.status != expected.status {
        return Some(SettlementCheck::Regressed {
            field: "status",
            expected: expected.status.to_string(),
            observed: observed.status.to_string(),
        });
    }
    if observed.exit_price != expected.exit_price {
        return Some(SettlementCheck::Regressed {
            field: "exit_price",
            expected: render(&expected.exit_price),
            observed: render(&observed.exit_price),
        });
    }
    if observed.profit != expected.profit {
        return Some(SettlementCheck::Regressed {
            field: "profit",
            expected: render(&expected.profit),
            observed: render(&observed.profit),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays scripted responses; repeats the last one when exhausted.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<OrderStatus, ApiError>>>,
        calls: AtomicU32,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<OrderStatus, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OrderStatusSource for ScriptedSource {
        async fn fetch_order(&self, order_id: &str) -> Result<OrderStatusSnapshot, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    script.front().cloned().unwrap()
                }
            };
            next.map(|status| {
                let terminal = status.is_terminal();
                OrderStatusSnapshot {
                    order_id: order_id.to_string(),
                    status,
                    entry_price: Some(dec!(100)),
                    exit_price: terminal.then(|| dec!(101)),
                    profit: terminal.then(|| dec!(850)),
                    fetched_at: Instant::now(),
                }
            })
        }
    }

    /// Paused-time sleeps can round up to the next millisecond tick.
    fn assert_near(actual: Duration, expected: Duration) {
        let diff = if actual > expected { actual - expected } else { expected - actual };
        assert!(diff <= Duration::from_millis(5), "{actual:?} vs {expected:?}");
    }

    fn watcher(source: Arc<ScriptedSource>) -> SettlementWatcher<Arc<ScriptedSource>> {
        SettlementWatcher::new(source, TokioClock, WatcherConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_settles_after_a_few_polls() {
        let source = ScriptedSource::new(vec![
            Ok(OrderStatus::Active),
            Ok(OrderStatus::Active),
            Ok(OrderStatus::Lost),
        ]);
        let outcome = watcher(source.clone()).watch("ord-1").await.unwrap();

        // Polls at 0 s, 3 s, 6 s.
        let settlement = outcome.settlement().unwrap();
        assert_eq!(settlement.status, OrderStatus::Lost);
        assert_eq!(settlement.polls, 3);
        assert_near(settlement.elapsed, Duration::from_secs(6));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_resets_after_success() {
        let transient = || Err(ApiError::Timeout("slow".into()));
        let source = ScriptedSource::new(vec![
            transient(),
            transient(),
            Ok(OrderStatus::Active),
            transient(),
            transient(),
            Ok(OrderStatus::Won),
        ]);
        let outcome = watcher(source).watch("ord-2").await.unwrap();
        assert!(outcome.is_resolved());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_retried_on_next_poll() {
        // A freshly placed order may 404 until the backend catches up.
        let source = ScriptedSource::new(vec![
            Err(ApiError::Http {
                status_code: 404,
                message: "Order not found".into(),
            }),
            Ok(OrderStatus::Won),
        ]);
        let outcome = watcher(source.clone()).watch("ord-new").await.unwrap();

        let settlement = outcome.settlement().unwrap();
        assert_eq!(settlement.status, OrderStatus::Won);
        assert_eq!(settlement.polls, 2);
        assert_near(settlement.elapsed, Duration::from_secs(3));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_client_error_uses_failure_budget() {
        let source = ScriptedSource::new(vec![Err(ApiError::Http {
            status_code: 401,
            message: "Unauthorized".into(),
        })]);
        let outcome = watcher(source.clone()).watch("ord-auth").await.unwrap();

        // Failures at 0, 3, 6 s.
        match outcome {
            SettlementOutcome::Errored {
                elapsed,
                consecutive_failures,
                ..
            } => {
                assert_near(elapsed, Duration::from_secs(6));
                assert_eq!(consecutive_failures, 3);
            }
            other => panic!("expected Errored, got {other:?}"),
        }
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_durations_do_not_panic() {
        let source = ScriptedSource::new(vec![Ok(OrderStatus::Active), Ok(OrderStatus::Lost)]);
        let outcome = watcher(source)
            .await_settlement("ord-long", Duration::from_secs(u64::MAX), Duration::from_secs(3))
            .await
            .unwrap();
        assert!(outcome.is_resolved());
        assert_near(outcome.elapsed(), Duration::from_secs(3));

        // An interval past any representable instant sleeps to the deadline.
        let source = ScriptedSource::new(vec![Ok(OrderStatus::Active)]);
        let outcome = watcher(source.clone())
            .await_settlement("ord-wide", Duration::from_secs(10), Duration::from_secs(u64::MAX))
            .await
            .unwrap();
        assert_eq!(outcome.failure_reason(), Some(FailureReason::Timeout));
        assert_near(outcome.elapsed(), Duration::from_secs(10));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_status_counts_against_budget() {
        let source = ScriptedSource::new(vec![Ok(OrderStatus::Unknown)]);
        let outcome = watcher(source.clone()).watch("ord-3").await.unwrap();

        match outcome {
            SettlementOutcome::Errored {
                consecutive_failures,
                ..
            } => assert_eq!(consecutive_failures, 3),
            other => panic!("expected Errored, got {other:?}"),
        }
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_poll_lands_on_deadline() {
        // Interval 3 s, deadline 10 s: polls at 0, 3, 6, 9 and 10.
        let source = ScriptedSource::new(vec![Ok(OrderStatus::Active)]);
        let outcome = watcher(source.clone())
            .await_settlement("ord-4", Duration::from_secs(10), Duration::from_secs(3))
            .await
            .unwrap();

        match outcome {
            SettlementOutcome::TimedOut {
                elapsed,
                polls,
                last_status,
            } => {
                assert_near(elapsed, Duration::from_secs(10));
                assert_eq!(polls, 5);
                assert_eq!(last_status, Some(OrderStatus::Active));
            }
            other => panic!("expected TimedOut, got {other:?}"),
        }
        assert_eq!(source.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_between_polls() {
        let source = ScriptedSource::new(vec![Ok(OrderStatus::Active)]);
        let token = CancellationToken::new();
        let w = watcher(source.clone()).with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4500)).await;
            token.cancel();
        });

        let outcome = w.watch("ord-5").await.unwrap();
        canceller.await.unwrap();

        // Polls at 0 s and 3 s; cancelled while sleeping towards 6 s.
        match outcome {
            SettlementOutcome::Cancelled { elapsed, polls } => {
                assert_near(elapsed, Duration::from_millis(4500));
                assert_eq!(polls, 2);
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_arguments_make_no_request() {
        let source = ScriptedSource::new(vec![Ok(OrderStatus::Won)]);
        let w = watcher(source.clone());

        assert!(matches!(w.watch("").await, Err(ProbeError::InvalidArgument(_))));
        assert!(matches!(
            w.await_settlement("ord", Duration::ZERO, Duration::from_secs(1)).await,
            Err(ProbeError::InvalidArgument(_))
        ));
        assert!(matches!(
            w.await_settlement("ord", Duration::from_secs(1), Duration::ZERO).await,
            Err(ProbeError::InvalidArgument(_))
        ));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_confirm_detects_profit_change() {
        let source = ScriptedSource::new(vec![Ok(OrderStatus::Won)]);
        let w = watcher(source);
        let mut settlement = Settlement {
            order_id: "ord-6".into(),
            status: OrderStatus::Won,
            entry_price: Some(dec!(100)),
            exit_price: Some(dec!(101)),
            profit: Some(dec!(850)),
            elapsed: Duration::ZERO,
            polls: 1,
        };

        assert_eq!(
            w.confirm_settlement(&settlement, 3).await.unwrap(),
            SettlementCheck::Stable { reads: 3 }
        );

        settlement.profit = Some(dec!(800));
        match w.confirm_settlement(&settlement, 3).await.unwrap() {
            SettlementCheck::Regressed { field, .. } => assert_eq!(field, "profit"),
            other => panic!("expected Regressed, got {other:?}"),
        }
    }

    #[test]
    fn test_next_boundary_skips_missed_slots() {
        let start = Instant::now();
        let interval = Duration::from_secs(3);
        assert_eq!(next_boundary(start, start, interval), Some(start + Duration::from_secs(3)));
        assert_eq!(
            next_boundary(start, start + Duration::from_secs(3), interval),
            Some(start + Duration::from_secs(6))
        );
        assert_eq!(
            next_boundary(start, start + Duration::from_millis(7500), interval),
            Some(start + Duration::from_secs(9))
        );
        assert_eq!(next_boundary(start, start, Duration::from_secs(u64::MAX)), None);
    }
}
