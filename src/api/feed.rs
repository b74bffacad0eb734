//! Client for the external price-simulator feed.
//!
//! The simulator publishes into a realtime database exposed over REST:
//! `{base}/{instrument}/current_price.json` for the live tick and
//! `{base}/{instrument}/ohlc_{tf}.json` for aggregated bars. Reads are
//! unauthenticated and never retried; a missing node comes back as `null`.

use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::consistency::checker::{PriceFetcher, TimeframeSource};
use crate::data::models::*;

use super::errors::ApiError;

pub struct FeedClient {
    base_url: String,
    instrument_path: String,
    client: Client,
}

impl FeedClient {
    pub fn new(base_url: &str, instrument_path: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            instrument_path: instrument_path.trim_matches('/').to_string(),
            client,
        })
    }

    fn node_url(&self, node: &str) -> String {
        format!("{}/{}/{}.json", self.base_url, self.instrument_path, node)
    }

    async fn get_json(
        &self,
        node: &str,
        params: &[(&str, &str)],
    ) -> Result<serde_json::Value, ApiError> {
        let url = self.node_url(node);
        debug!(url = %url, "Feed request");

        let response = self.client.get(&url).query(params).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ApiError::from_response(status.as_u16(), &body_text));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| ApiError::Deserialization(e.to_string()))
    }

    /// Latest simulated tick.
    pub async fn current_price(&self) -> Result<PriceSample, ApiError> {
        let body = self.get_json("current_price", &[]).await?;
        if body.is_null() {
            return Err(ApiError::MissingField("current_price"));
        }

        let tick: FeedCurrentPrice =
            serde_json::from_value(body).map_err(|e| ApiError::Deserialization(e.to_string()))?;

        let observed_at = parse_observed_at(tick.timestamp, tick.datetime.as_deref())
            .unwrap_or_else(chrono::Utc::now);

        Ok(PriceSample {
            price: tick.price,
            source: PriceSourceKind::Live,
            observed_at,
        })
    }

    /// Most recent bar for `timeframe`, keyed by its bar key. `None` when the
    /// timeframe has no bars yet.
    pub async fn latest_bar(
        &self,
        timeframe: AggregateTimeframe,
    ) -> Result<Option<(String, OhlcBar)>, ApiError> {
        let node = format!("ohlc_{}", timeframe.as_str());
        let body = self
            .get_json(&node, &[("orderBy", "\"$key\""), ("limitToLast", "1")])
            .await?;

        latest_from_bars(body)
    }

    /// Close of the latest bar as an aggregate price sample.
    pub async fn aggregate_close(
        &self,
        timeframe: AggregateTimeframe,
    ) -> Result<PriceSample, ApiError> {
        let (_, bar) = self
            .latest_bar(timeframe)
            .await?
            .ok_or(ApiError::MissingField("close"))?;

        let observed_at = parse_observed_at(bar.timestamp, bar.datetime.as_deref())
            .unwrap_or_else(chrono::Utc::now);

        Ok(PriceSample {
            price: bar.close,
            source: PriceSourceKind::Aggregate,
            observed_at,
        })
    }
}

fn latest_from_bars(body: serde_json::Value) -> Result<Option<(String, OhlcBar)>, ApiError> {
    if body.is_null() {
        return Ok(None);
    }

    let bars: BTreeMap<String, OhlcBar> =
        serde_json::from_value(body).map_err(|e| ApiError::Deserialization(e.to_string()))?;

    Ok(bars.into_iter().next_back())
}

#[async_trait]
impl TimeframeSource for FeedClient {
    async fn has_bars(&self, timeframe: AggregateTimeframe) -> Result<bool, ApiError> {
        Ok(self.latest_bar(timeframe).await?.is_some())
    }
}

/// Realtime tick as a [`PriceFetcher`].
pub struct LivePrice<'a>(pub &'a FeedClient);

#[async_trait]
impl PriceFetcher for LivePrice<'_> {
    async fn fetch_price(&self) -> Result<PriceSample, ApiError> {
        self.0.current_price().await
    }
}

/// Latest OHLC close as a [`PriceFetcher`].
pub struct AggregateClose<'a> {
    pub feed: &'a FeedClient,
    pub timeframe: AggregateTimeframe,
}

#[async_trait]
impl PriceFetcher for AggregateClose<'_> {
    async fn fetch_price(&self) -> Result<PriceSample, ApiError> {
        self.feed.aggregate_close(self.timeframe).await
    }
}
