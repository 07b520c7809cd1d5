pub mod module;
pub mod types;

pub use module::{RateError, RateModule, RateProvider};
pub use types::ExchangeRate;
