pub mod types;
pub use types::*;
pub mod postgres;
pub mod tx;

use async_trait::async_trait;

use crate::rates::ExchangeRate;

#[async_trait]
pub trait RateStore: Send + Sync {
    /// Inserts one observation and writes the generated key into `rate.id`.
    async fn save_exchange_rate(&self, rate: &mut ExchangeRate) -> PersistResult<()>;
}
