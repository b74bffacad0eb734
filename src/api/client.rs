//! Async REST client for the trading backend.
//!
//! Features:
//! - Bearer-token authentication
//! - Optional rate limiting (governor)
//! - Per-call timeout, distinct from any probe deadline
//! - Bounded retries with exponential backoff for idempotent reads
//! - Typed responses unwrapped from the `{"data": ...}` envelope

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::{Client, Method, Url};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::auth::BearerAuth;
use crate::consistency::checker::PriceFetcher;
use crate::data::models::*;
use crate::settlement::watcher::OrderStatusSource;

use super::errors::ApiError;

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Async REST client for the trading backend.
pub struct BackendClient {
    auth: BearerAuth,
    base_url: String,
    base: Url,
    client: Client,
    rate_limiter: Option<Arc<DirectRateLimiter>>,
    max_attempts: u32,
}

impl BackendClient {
    /// `rate_limit` of 0 disables client-side throttling; `max_attempts` is
    /// clamped to at least one.
    pub fn new(
        auth: BearerAuth,
        base_url: &str,
        timeout: Duration,
        rate_limit: u32,
        max_attempts: u32,
    ) -> Result<Self, ApiError> {
        let base_url = base_url.trim_end_matches('/');
        let base = Url::parse(base_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(20)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let rate_limiter = NonZeroU32::new(rate_limit)
            .map(|per_sec| Arc::new(RateLimiter::direct(Quota::per_second(per_sec))));

        Ok(Self {
            auth,
            base_url: base_url.to_string(),
            base,
            client,
            rate_limiter,
            max_attempts: max_attempts.max(1),
        })
    }

    /// Create with default settings: 10 s timeout, no throttling, one attempt.
    pub fn with_defaults(auth: BearerAuth, base_url: &str) -> Result<Self, ApiError> {
        Self::new(auth, base_url, Duration::from_secs(10), 0, 1)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // =========================================================================
    // Core request method
    // =========================================================================

    /// Base URL with `segments` appended, each percent-encoded so an id
    /// cannot escape its position in the path.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_json(&self, url: Url) -> Result<serde_json::Value, ApiError> {
        let mut last_error: Option<ApiError> = None;

        for attempt in 0..self.max_attempts {
            if let Some(limiter) = &self.rate_limiter {
                limiter.until_ready().await;
            }

            debug!(url = %url, attempt = attempt + 1, "API request");

            let result = self
                .client
                .get(url.clone())
                .headers(self.auth.to_header_map())
                .send()
                .await;

            let error = match result {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let text = response.text().await?;
                        return serde_json::from_str(&text)
                            .map_err(|e| ApiError::Deserialization(e.to_string()));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    ApiError::from_response(status.as_u16(), &body_text)
                }
                Err(e) => ApiError::from(e),
            };

            if !error.is_transient() || attempt + 1 >= self.max_attempts {
                return Err(error);
            }

            let delay_ms = 500 * 2u64.pow(attempt);
            warn!(
                error = %error,
                delay_ms,
                attempt = attempt + 1,
                "Request failed, retrying"
            );
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            last_error = Some(error);
        }

        Err(last_error.unwrap_or_else(|| ApiError::Network("no attempt made".to_string())))
    }

    fn unwrap_data(body: serde_json::Value) -> Result<serde_json::Value, ApiError> {
        match body {
            serde_json::Value::Object(mut map) => {
                map.remove("data").ok_or(ApiError::MissingField("data"))
            }
            _ => Err(ApiError::MissingField("data")),
        }
    }

    // =========================================================================
    // Order Endpoints
    // =========================================================================

    /// Read one binary order's current status.
    pub async fn get_binary_order(&self, order_id: &str) -> Result<OrderStatusSnapshot, ApiError> {
        let body = self
            .get_json(self.endpoint(&["binary-orders", order_id]))
            .await?;
        let fetched_at = Instant::now();

        let data: BinaryOrderData = serde_json::from_value(Self::unwrap_data(body)?)
            .map_err(|e| ApiError::Deserialization(e.to_string()))?;

        Ok(data.into_snapshot(order_id, fetched_at))
    }

    // =========================================================================
    // Asset Endpoints
    // =========================================================================

    /// Current price of an asset as served by the backend.
    pub async fn get_asset_price(&self, asset_id: &str) -> Result<PriceSample, ApiError> {
        let body = self
            .get_json(self.endpoint(&["assets", asset_id, "price"]))
            .await?;

        let data: AssetPriceData = serde_json::from_value(Self::unwrap_data(body)?)
            .map_err(|e| ApiError::Deserialization(e.to_string()))?;

        let observed_at = parse_observed_at(None, data.datetime.as_deref())
            .unwrap_or_else(chrono::Utc::now);

        Ok(PriceSample {
            price: data.price,
            source: PriceSourceKind::Live,
            observed_at,
        })
    }

    // =========================================================================
    // Load probing
    // =========================================================================

    /// Issue one request without retries or throttling.
    ///
    /// Succeeds only on 200/201; any other status or transport failure is
    /// an error. Used as the unit of work for load runs.
    pub async fn probe(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(), ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method, &url)
            .headers(self.auth.to_header_map());
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await?;
        let status = response.status().as_u16();
        if matches!(status, 200 | 201) {
            return Ok(());
        }

        let body_text = response.text().await.unwrap_or_default();
        Err(ApiError::from_response(status, &body_text))
    }
}

#[async_trait]
impl OrderStatusSource for BackendClient {
    async fn fetch_order(&self, order_id: &str) -> Result<OrderStatusSnapshot, ApiError> {
        self.get_binary_order(order_id).await
    }
}

/// Backend asset price as a [`PriceFetcher`].
pub struct AssetPrice<'a> {
    pub client: &'a BackendClient,
    pub asset_id: &'a str,
}

#[async_trait]
impl PriceFetcher for AssetPrice<'_> {
    async fn fetch_price(&self) -> Result<PriceSample, ApiError> {
        self.client.get_asset_price(self.asset_id).await
    }
}
