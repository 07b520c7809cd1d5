// Garantex REST adapter: GET {base_url}/api/v2/depth?market={market}

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{debug, instrument};

use super::garantex_types::DepthResponse;
use super::{DepthSource, MarketDataError, MarketDataResult};
use crate::config::GarantexConfig;

const DEPTH_PATH: &str = "/api/v2/depth";

pub struct GarantexClient {
    http: Client,
    base_url: String, // e.g. "https://garantex.org"
}

impl GarantexClient {
    pub fn new(base_url: &str, timeout: Duration) -> MarketDataResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(MarketDataError::Network)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(cfg: &GarantexConfig) -> MarketDataResult<Self> {
        Self::new(&cfg.base_url, cfg.timeout())
    }

    fn depth_url(&self) -> String {
        format!("{}{}", self.base_url, DEPTH_PATH)
    }
}

#[async_trait::async_trait]
impl DepthSource for GarantexClient {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn fetch_depth(&self, market: &str) -> MarketDataResult<DepthResponse> {
        let resp = self
            .http
            .get(self.depth_url())
            .query(&[("market", market)])
            .send()
            .await
            .map_err(MarketDataError::Network)?;

        check_status(resp.status())?;

        // Read bytes first so a broken connection stays a network error and
        // only a bad body becomes a decode error.
        let body = resp.bytes().await.map_err(MarketDataError::Network)?;
        let depth: DepthResponse = serde_json::from_slice(&body).map_err(MarketDataError::Decode)?;

        debug!(asks = depth.asks.len(), bids = depth.bids.len(), ts = depth.timestamp, "Fetched depth");
        Ok(depth)
    }
}

fn check_status(status: StatusCode) -> MarketDataResult<()> {
    match status {
        StatusCode::OK => Ok(()),
        StatusCode::UNPROCESSABLE_ENTITY => Err(MarketDataError::InvalidMarketId),
        other => Err(MarketDataError::UnexpectedStatus {
            status: other.as_u16(),
            reason: other.canonical_reason().unwrap_or("unknown").to_string(),
        }),
    }
}
