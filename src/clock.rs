//! Time source used by the polling and load components.
//!
//! Monotonic time drives deadlines and latency; wall-clock time is only used
//! to age remote timestamps. `TokioClock` reads `tokio::time`, so tests that
//! run with `start_paused = true` get deterministic virtual time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic now.
    fn now(&self) -> Instant;

    /// Wall-clock now.
    fn now_utc(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

#[async_trait]
impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        (**self).now_utc()
    }

    async fn sleep(&self, duration: Duration) {
        (**self).sleep(duration).await
    }
}
