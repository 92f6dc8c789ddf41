// =============================================================================
// Shared types used across the Valkyrie data feed
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One daily bar. `date` is the calendar-day key of the series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub frequency: f64,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub net_foreign: f64,
}

/// Most recent streaming quote for a symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveTick {
    pub symbol: String,
    pub last_price: f64,
    pub previous_close: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub value: f64,
    pub frequency: f64,
    pub net_foreign: f64,
    pub change_value: f64,
    pub change_percent: f64,
    /// Upstream timestamp, passed through verbatim.
    pub timestamp: String,
}

/// Listing entry returned by the symbol list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub sector_id: Option<String>,
    #[serde(default)]
    pub industry_id: Option<String>,
}

/// One side-data sample (ownership, financial ratio, broker flow).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Epoch seconds.
    pub ts: i64,
    pub value: Option<f64>,
}

/// Lifecycle of a persistent streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}
