// Source: https://garantex.org/api/v2/depth?market={market}
use rust_decimal::Decimal;

use super::{MarketDataError, MarketDataResult};
use crate::rates::ExchangeRate;

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct DepthResponse {
    pub timestamp: i64,
    #[serde(default)]
    pub asks: Vec<DepthLevel>, // best (lowest) first, as sorted by the venue
    #[serde(default)]
    pub bids: Vec<DepthLevel>, // best (highest) first
}

// Prices and sizes stay strings here; only the conversion below parses them.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct DepthLevel {
    pub price: String,
    #[serde(default)]
    pub volume: String,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub factor: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

impl DepthResponse {
    /// Best ask/bid as an unsaved `ExchangeRate`.
    ///
    /// Takes the first level of each side without re-sorting. An empty side
    /// yields `Decimal::ZERO`; a price that is not an exact decimal is an
    /// `InvalidPrice` error.
    pub fn to_exchange_rate(&self) -> MarketDataResult<ExchangeRate> {
        Ok(ExchangeRate {
            id: 0,
            ask_price: best_price("ask", &self.asks)?,
            bid_price: best_price("bid", &self.bids)?,
            ts: self.timestamp,
        })
    }
}

fn best_price(side: &'static str, levels: &[DepthLevel]) -> MarketDataResult<Decimal> {
    let Some(level) = levels.first() else {
        return Ok(Decimal::ZERO);
    };

    // rust_decimal skips '_' as a digit separator; upstream never sends one.
    let parsed = if level.price.contains('_') {
        Err(rust_decimal::Error::from("unexpected '_' in decimal"))
    } else {
        Decimal::from_str_exact(&level.price)
    };

    parsed.map_err(|source| MarketDataError::InvalidPrice {
        side,
        value: level.price.clone(),
        source,
    })
}
