// =============================================================================
// Error taxonomy for the feed pipeline
// =============================================================================

use thiserror::Error;

/// Failures that the pipeline distinguishes between. None of these ever
/// escape a worker task; each is converted locally into a state change
/// (reconnect, dropped frame, empty result, invalid-symbol signal).
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("invalid symbol {symbol}: {reason}")]
    InvalidSymbol { symbol: String, reason: String },

    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),
}

impl From<prost::DecodeError> for FeedError {
    fn from(err: prost::DecodeError) -> Self {
        FeedError::Decode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::Transport(err.to_string())
    }
}

pub type FeedResult<T> = std::result::Result<T, FeedError>;
