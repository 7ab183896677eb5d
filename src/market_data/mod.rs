pub mod events;
pub mod stream;

// Re-export the event type for convenient access (e.g. `use crate::market_data::MarketEvent`).
pub use events::MarketEvent;
