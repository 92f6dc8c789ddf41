pub mod extra_store;
pub mod orderbook;
pub mod store;

pub use extra_store::{forward_fill, ExtraDataStore};
pub use orderbook::{OrderLevel, OrderbookBook, OrderbookSnapshot};
pub use store::{trading_day, MarketDataStore};
