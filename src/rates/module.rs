use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, instrument};

use crate::market_data::adapters::{DepthSource, MarketDataError};
use crate::persist::{PersistError, RateStore};
use crate::rates::ExchangeRate;

#[derive(Debug, Error)]
pub enum RateError {
    #[error("could not get exchange rate: {0}")]
    Fetch(#[source] MarketDataError),

    #[error("could not convert exchange rate to model: {0}")]
    Convert(#[source] MarketDataError),

    #[error("could not save exchange rate: {0}")]
    Save(#[source] PersistError),
}

impl RateError {
    /// True when upstream rejected the market itself (a caller mistake).
    pub fn is_invalid_market(&self) -> bool {
        matches!(self, RateError::Fetch(MarketDataError::InvalidMarketId))
    }
}

/// What the RPC layer needs from the business core.
#[async_trait]
pub trait RateProvider: Send + Sync + 'static {
    async fn get_exchange_rate(&self, market: &str) -> Result<ExchangeRate, RateError>;
}

/// Fetch → convert → persist, one straight pass per call.
///
/// Holds no per-call state: concurrent calls for the same market each hit
/// upstream and each insert their own row.
pub struct RateModule {
    depth_source: Arc<dyn DepthSource>,
    store: Arc<dyn RateStore>,
}

impl RateModule {
    pub fn new(depth_source: Arc<dyn DepthSource>, store: Arc<dyn RateStore>) -> Self {
        Self { depth_source, store }
    }
}

#[async_trait]
impl RateProvider for RateModule {
    #[instrument(skip(self))]
    async fn get_exchange_rate(&self, market: &str) -> Result<ExchangeRate, RateError> {
        let depth = self.depth_source.fetch_depth(market).await.map_err(|e| {
            error!(error = %e, "Failed to fetch exchange rate");
            RateError::Fetch(e)
        })?;

        let mut rate = depth.to_exchange_rate().map_err(|e| {
            error!(error = %e, "Failed to convert exchange rate to model");
            RateError::Convert(e)
        })?;

        self.store.save_exchange_rate(&mut rate).await.map_err(|e| {
            error!(error = %e, "Failed to save exchange rate");
            RateError::Save(e)
        })?;

        Ok(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::adapters::garantex_types::{DepthLevel, DepthResponse};
    use crate::market_data::adapters::MarketDataResult;
    use crate::persist::PersistResult;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    fn level(price: &str) -> DepthLevel {
        DepthLevel {
            price: price.to_string(),
            volume: "1".to_string(),
            amount: "1".to_string(),
            factor: "0".to_string(),
            kind: "limit".to_string(),
        }
    }

    struct FakeDepth {
        response: fn() -> MarketDataResult<DepthResponse>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeDepth {
        fn new(response: fn() -> MarketDataResult<DepthResponse>) -> Arc<Self> {
            Arc::new(Self { response, calls: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl DepthSource for FakeDepth {
        async fn fetch_depth(&self, market: &str) -> MarketDataResult<DepthResponse> {
            self.calls.lock().push(market.to_string());
            tokio::task::yield_now().await;
            (self.response)()
        }
    }

    #[derive(Default)]
    struct FakeStore {
        next_id: AtomicI64,
        saves: AtomicUsize,
        rows: Mutex<Vec<ExchangeRate>>,
        fail: bool,
    }

    #[async_trait]
    impl RateStore for FakeStore {
        async fn save_exchange_rate(&self, rate: &mut ExchangeRate) -> PersistResult<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PersistError::Closed);
            }
            rate.id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.rows.lock().push(rate.clone());
            Ok(())
        }
    }

    fn btc_rub() -> MarketDataResult<DepthResponse> {
        Ok(DepthResponse {
            timestamp: 1_700_000_000,
            asks: vec![level("95.5")],
            bids: vec![level("95.1")],
        })
    }

    #[tokio::test]
    async fn test_pipeline_persists_and_returns_rate() {
        let depth = FakeDepth::new(btc_rub);
        let store = Arc::new(FakeStore::default());
        let module = RateModule::new(depth.clone(), store.clone());

        let rate = module.get_exchange_rate("btc_rub").await.unwrap();

        assert!(rate.is_persisted());
        assert_eq!(rate.id, 1);
        assert_eq!(rate.ask_price.to_string(), "95.5");
        assert_eq!(rate.bid_price.to_string(), "95.1");
        assert_eq!(rate.ts, 1_700_000_000);
        assert_eq!(*depth.calls.lock(), vec!["btc_rub".to_string()]);

        let rows = store.rows.lock();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], rate);
    }

    #[tokio::test]
    async fn test_invalid_market_stays_distinguishable() {
        let depth = FakeDepth::new(|| Err(MarketDataError::InvalidMarketId));
        let store = Arc::new(FakeStore::default());
        let module = RateModule::new(depth, store.clone());

        let err = module.get_exchange_rate("nope").await.unwrap_err();
        assert!(err.is_invalid_market());
        assert!(matches!(err, RateError::Fetch(MarketDataError::InvalidMarketId)));
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_generic_upstream_failure_is_not_invalid_market() {
        let depth = FakeDepth::new(|| {
            Err(MarketDataError::UnexpectedStatus { status: 503, reason: "Service Unavailable".to_string() })
        });
        let store = Arc::new(FakeStore::default());
        let module = RateModule::new(depth, store.clone());

        let err = module.get_exchange_rate("btc_rub").await.unwrap_err();
        assert!(!err.is_invalid_market());
        assert!(err.to_string().starts_with("could not get exchange rate"));
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_conversion_failure_skips_save() {
        let depth = FakeDepth::new(|| {
            Ok(DepthResponse { timestamp: 1, asks: vec![level("not-a-number")], bids: vec![] })
        });
        let store = Arc::new(FakeStore::default());
        let module = RateModule::new(depth, store.clone());

        let err = module.get_exchange_rate("btc_rub").await.unwrap_err();
        assert!(matches!(err, RateError::Convert(MarketDataError::InvalidPrice { .. })));
        assert!(!err.is_invalid_market());
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_save_failure_returns_no_rate() {
        let depth = FakeDepth::new(btc_rub);
        let store = Arc::new(FakeStore { fail: true, ..Default::default() });
        let module = RateModule::new(depth, store.clone());

        let err = module.get_exchange_rate("btc_rub").await.unwrap_err();
        assert!(matches!(err, RateError::Save(PersistError::Closed)));
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
        assert!(store.rows.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_calls_each_insert_a_row() {
        let depth = FakeDepth::new(btc_rub);
        let store = Arc::new(FakeStore::default());
        let module = Arc::new(RateModule::new(depth.clone(), store.clone()));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let module = Arc::clone(&module);
                tokio::spawn(async move { module.get_exchange_rate("btc_rub").await.unwrap().id })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.sort_unstable();

        assert_eq!(ids, (1..=10).collect::<Vec<i64>>());
        assert_eq!(depth.calls.lock().len(), 10);
        assert_eq!(store.rows.lock().len(), 10);
    }
}
