// Market data module entrypoint
pub mod adapters; // venue-specific fetchers (Garantex)
