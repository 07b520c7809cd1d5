use rust_decimal::Decimal;

/// A single best ask/bid observation for a market.
///
/// `id` is zero until the row has been inserted; the store writes the
/// generated key back on success. Records are never updated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExchangeRate {
    pub id: i64,
    pub ask_price: Decimal,
    pub bid_price: Decimal,
    /// Upstream timestamp in seconds, not the local observation time.
    pub ts: i64,
}

impl ExchangeRate {
    pub fn is_persisted(&self) -> bool {
        self.id != 0
    }
}
