// =============================================================================
// Valkyrie Data Feed: live market-data synchronization for a host charting app
// =============================================================================
//
// Historical bars arrive over HTTP through a single-flight fetch worker; live
// ticks and order-book deltas arrive over two supervised binary sockets.  The
// host queries everything through `FeedContext`.
// =============================================================================

pub mod app_state;
pub mod error;
pub mod fetch;
pub mod market_data;
pub mod notify;
pub mod rest;
pub mod runtime_config;
pub mod stream;
pub mod types;

#[cfg(test)]
mod test_support;

pub use app_state::FeedContext;
pub use error::{FeedError, FeedResult};
pub use runtime_config::RuntimeConfig;
