// Shared capability + error type for market data adapters

use thiserror::Error;

use crate::market_data::adapters::garantex_types::DepthResponse;

#[derive(Debug, Error)]
pub enum MarketDataError {
    /// Upstream answered 422: it does not know the requested market.
    #[error("invalid market id")]
    InvalidMarketId,

    #[error("unexpected upstream status {status}: {reason}")]
    UnexpectedStatus { status: u16, reason: String },

    #[error("upstream request failed: {0}")]
    Network(#[source] reqwest::Error),

    #[error("could not decode upstream payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("could not convert {side} price {value:?} to decimal: {source}")]
    InvalidPrice {
        side: &'static str,
        value: String,
        #[source]
        source: rust_decimal::Error,
    },
}

pub type MarketDataResult<T> = Result<T, MarketDataError>;

/// Order-book snapshot source the rate pipeline fetches from.
#[async_trait::async_trait]
pub trait DepthSource: Send + Sync {
    async fn fetch_depth(&self, market: &str) -> MarketDataResult<DepthResponse>;
}

pub mod garantex;
pub mod garantex_types;
