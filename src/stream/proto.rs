// =============================================================================
// Binary wire messages for the persistent feed connection
// =============================================================================
//
// Messages are declared by hand with prost derives.  Server-to-client
// envelopes use distinct top-level field numbers (pong = 1, stock_data = 2,
// orderbook data = 3) so one frame classifies unambiguously: decoding it as
// the wrong envelope just yields an empty message.
// =============================================================================

use prost::Message;

use crate::error::{FeedError, FeedResult};
use crate::runtime_config::MAX_SYMBOL_LEN;
use crate::types::LiveTick;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct Handshake {
    #[prost(string, tag = "1")]
    pub user_id: String,
    #[prost(string, tag = "2")]
    pub key: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Ping {
    #[prost(string, tag = "1")]
    pub message: String,
}

/// Outbound wrapper carrying a keepalive.
#[derive(Clone, PartialEq, Message)]
pub struct WsWrapper {
    #[prost(message, optional, tag = "1")]
    pub ping: Option<Ping>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Subscriptions {
    #[prost(string, repeated, tag = "1")]
    pub livequote: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub orderbook: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SymbolSubscribe {
    #[prost(string, tag = "1")]
    pub user_id: String,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(message, optional, tag = "3")]
    pub subs: Option<Subscriptions>,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct Pong {
    #[prost(string, tag = "1")]
    pub message: String,
}

/// Handshake acknowledgement (and keepalive reply).
#[derive(Clone, PartialEq, Message)]
pub struct PongReceive {
    #[prost(message, optional, tag = "1")]
    pub pong: Option<Pong>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Change {
    #[prost(double, tag = "1")]
    pub value: f64,
    #[prost(double, tag = "2")]
    pub percentage: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct StockData {
    #[prost(string, tag = "1")]
    pub symbol: String,
    #[prost(double, tag = "2")]
    pub lastprice: f64,
    #[prost(double, tag = "3")]
    pub previous: f64,
    #[prost(double, tag = "4")]
    pub open: f64,
    #[prost(double, tag = "5")]
    pub high: f64,
    #[prost(double, tag = "6")]
    pub low: f64,
    #[prost(double, tag = "7")]
    pub volume: f64,
    #[prost(double, tag = "8")]
    pub value: f64,
    #[prost(double, tag = "9")]
    pub frequency: f64,
    #[prost(double, tag = "10")]
    pub foreignbuy: f64,
    #[prost(double, tag = "11")]
    pub foreignsell: f64,
    #[prost(message, optional, tag = "12")]
    pub change: Option<Change>,
    #[prost(string, tag = "13")]
    pub timestamp: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct StockFeed {
    #[prost(message, optional, tag = "2")]
    pub stock_data: Option<StockData>,
}

#[derive(Clone, PartialEq, Message)]
pub struct OrderbookEnvelope {
    #[prost(string, tag = "1")]
    pub symbol: String,
    /// `#O|...` text body.
    #[prost(string, tag = "2")]
    pub body: String,
    #[prost(int64, tag = "3")]
    pub sequence_number: i64,
    #[prost(string, tag = "4")]
    pub datetime: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct StockOrderbook {
    #[prost(message, optional, tag = "3")]
    pub data: Option<OrderbookEnvelope>,
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

pub fn encode_handshake(user_id: &str, key: &str) -> Vec<u8> {
    Handshake {
        user_id: user_id.to_string(),
        key: key.to_string(),
    }
    .encode_to_vec()
}

pub fn encode_ping(message: &str) -> Vec<u8> {
    WsWrapper {
        ping: Some(Ping {
            message: message.to_string(),
        }),
    }
    .encode_to_vec()
}

fn check_symbols(symbols: &[String]) -> FeedResult<()> {
    for symbol in symbols {
        if symbol.trim().is_empty() || symbol.len() > MAX_SYMBOL_LEN {
            return Err(FeedError::SubscriptionRejected(format!(
                "symbol {symbol:?} is empty or longer than {MAX_SYMBOL_LEN} bytes"
            )));
        }
    }
    Ok(())
}

/// Live-quote subscribe frames, one per batch of at most `max_per_frame`
/// symbols.  Nothing is ever silently dropped: an unusable symbol fails the
/// whole call.
pub fn encode_livequote_subscribe(
    user_id: &str,
    key: &str,
    symbols: &[String],
    max_per_frame: usize,
) -> FeedResult<Vec<Vec<u8>>> {
    if max_per_frame == 0 {
        return Err(FeedError::SubscriptionRejected(
            "max symbols per frame is zero".into(),
        ));
    }
    check_symbols(symbols)?;

    Ok(symbols
        .chunks(max_per_frame)
        .map(|batch| {
            SymbolSubscribe {
                user_id: user_id.to_string(),
                key: key.to_string(),
                subs: Some(Subscriptions {
                    livequote: batch.to_vec(),
                    orderbook: Vec::new(),
                }),
            }
            .encode_to_vec()
        })
        .collect())
}

/// Order-book subscribe for one symbol (book plus its live quote).
pub fn encode_orderbook_subscribe(user_id: &str, key: &str, symbol: &str) -> FeedResult<Vec<u8>> {
    let symbols = vec![symbol.to_string()];
    check_symbols(&symbols)?;
    Ok(SymbolSubscribe {
        user_id: user_id.to_string(),
        key: key.to_string(),
        subs: Some(Subscriptions {
            livequote: symbols.clone(),
            orderbook: symbols,
        }),
    }
    .encode_to_vec())
}

// ---------------------------------------------------------------------------
// Frame classification
// ---------------------------------------------------------------------------

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Empty frame or textual ping/pong marker.
    Heartbeat,
    /// Handshake acknowledgement.
    Ack,
    Tick(LiveTick),
    Orderbook(OrderbookEnvelope),
}

fn is_heartbeat(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return true;
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => {
            let text = text.trim();
            text.is_empty()
                || text.eq_ignore_ascii_case("ping")
                || text.eq_ignore_ascii_case("pong")
        }
        Err(_) => false,
    }
}

impl From<StockData> for LiveTick {
    fn from(data: StockData) -> Self {
        let (change_value, change_percent) = data
            .change
            .map(|c| (c.value, c.percentage))
            .unwrap_or((0.0, 0.0));
        let previous_close = if data.previous != 0.0 {
            data.previous
        } else {
            data.lastprice - change_value
        };
        LiveTick {
            symbol: data.symbol.trim().to_uppercase(),
            last_price: data.lastprice,
            previous_close,
            open: data.open,
            high: data.high,
            low: data.low,
            volume: data.volume,
            value: data.value,
            frequency: data.frequency,
            net_foreign: data.foreignbuy - data.foreignsell,
            change_value,
            change_percent,
            timestamp: data.timestamp,
        }
    }
}

/// Classify one binary frame: heartbeat, ack, order-book envelope, tick.
/// Anything else is a [`FeedError::Decode`].
pub fn decode_server_frame(bytes: &[u8]) -> FeedResult<ServerFrame> {
    if is_heartbeat(bytes) {
        return Ok(ServerFrame::Heartbeat);
    }

    if let Ok(PongReceive { pong: Some(_) }) = PongReceive::decode(bytes) {
        return Ok(ServerFrame::Ack);
    }

    if let Ok(StockOrderbook { data: Some(envelope) }) = StockOrderbook::decode(bytes) {
        if envelope.body.starts_with("#O") {
            return Ok(ServerFrame::Orderbook(envelope));
        }
    }

    match StockFeed::decode(bytes)? {
        StockFeed {
            stock_data: Some(data),
        } if !data.symbol.trim().is_empty() => Ok(ServerFrame::Tick(data.into())),
        _ => Err(FeedError::Decode(format!(
            "unrecognised frame ({} bytes)",
            bytes.len()
        ))),
    }
}

/// Server-side encoders, used by tests and local tooling.
pub fn encode_ack() -> Vec<u8> {
    PongReceive {
        pong: Some(Pong {
            message: "pong".into(),
        }),
    }
    .encode_to_vec()
}

pub fn encode_feed(data: StockData) -> Vec<u8> {
    StockFeed {
        stock_data: Some(data),
    }
    .encode_to_vec()
}

pub fn encode_orderbook_frame(symbol: &str, body: &str) -> Vec<u8> {
    StockOrderbook {
        data: Some(OrderbookEnvelope {
            symbol: symbol.to_string(),
            body: body.to_string(),
            sequence_number: 0,
            datetime: String::new(),
        }),
    }
    .encode_to_vec()
}
