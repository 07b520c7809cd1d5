pub mod config;
pub mod market_data;
pub mod pb;
pub mod persist;
pub mod rates;
pub mod server;
pub mod telemetry;
