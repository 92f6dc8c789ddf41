// =============================================================================
// Order Book: single active-symbol ladder with full-side replacement
// =============================================================================
//
// Stream body format (carried inside the binary envelope):
//
//   #O|<symbol>|<BID|OFFER>|price;queue;volume|...|<epoch>-<freq>&<volume>
//
// Each frame carries the complete ladder for one side, so an accepted frame
// replaces that side outright.
// =============================================================================

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::error::{FeedError, FeedResult};
use crate::types::LiveTick;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BookSide {
    Bid,
    Offer,
}

impl std::fmt::Display for BookSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bid => write!(f, "BID"),
            Self::Offer => write!(f, "OFFER"),
        }
    }
}

/// One price level.  `lot_change` is the volume delta against the previous
/// ladder and only drives display colouring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OrderLevel {
    pub price: f64,
    pub queue_count: i64,
    pub volume: i64,
    pub lot_change: i64,
}

impl OrderLevel {
    pub fn new(price: f64, queue_count: i64, volume: i64) -> Self {
        Self {
            price,
            queue_count,
            volume,
            lot_change: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BookHeader {
    pub last_price: f64,
    pub previous_close: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub value: f64,
    pub frequency: f64,
    pub change_value: f64,
    pub change_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BookAggregate {
    pub bid_frequency: i64,
    pub bid_volume: i64,
    pub offer_frequency: i64,
    pub offer_volume: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderbookSnapshot {
    pub symbol: String,
    pub company_type: String,
    pub header: BookHeader,
    pub bids: Vec<OrderLevel>,
    pub offers: Vec<OrderLevel>,
    pub aggregate: BookAggregate,
    /// Epoch seconds of the last stream footer applied.
    pub last_update_epoch: i64,
}

/// Per-side totals carried in a stream footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideFooter {
    pub epoch: i64,
    pub frequency: i64,
    pub volume: i64,
}

/// Decoded stream body: one complete side of the ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct SideUpdate {
    pub symbol: String,
    pub side: BookSide,
    pub levels: Vec<OrderLevel>,
    pub footer: Option<SideFooter>,
}

// ---------------------------------------------------------------------------
// Stream body parsing
// ---------------------------------------------------------------------------

fn parse_count(raw: &str) -> Option<i64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    cleaned
        .parse::<i64>()
        .ok()
        .or_else(|| cleaned.parse::<f64>().ok().map(|v| v as i64))
}

fn parse_footer(raw: &str) -> Option<SideFooter> {
    let (epoch, rest) = raw.split_once('-')?;
    let (frequency, volume) = rest.split_once('&')?;
    Some(SideFooter {
        epoch: parse_count(epoch)?,
        frequency: parse_count(frequency)?,
        volume: parse_count(volume)?,
    })
}

fn parse_row(raw: &str) -> Option<OrderLevel> {
    let mut fields = raw.split(';');
    let price = fields.next()?.trim().parse::<f64>().ok()?;
    let queue = parse_count(fields.next()?)?;
    let volume = parse_count(fields.next()?)?;
    Some(OrderLevel::new(price, queue, volume))
}

/// Parse an `#O|...` body.  Malformed rows are skipped; a malformed prefix,
/// symbol or side rejects the whole body.
pub fn parse_stream_body(body: &str) -> FeedResult<SideUpdate> {
    let mut parts = body.trim().split('|');

    if parts.next() != Some("#O") {
        return Err(FeedError::Decode("order-book body must start with #O".into()));
    }

    let symbol = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FeedError::Decode("order-book body has no symbol".into()))?
        .to_uppercase();

    let side = match parts.next().map(str::trim) {
        Some("BID") => BookSide::Bid,
        Some("OFFER") => BookSide::Offer,
        other => {
            return Err(FeedError::Decode(format!(
                "unknown order-book side {:?}",
                other.unwrap_or("")
            )))
        }
    };

    let mut levels = Vec::new();
    let mut footer = None;
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part.contains('-') && part.contains('&') {
            footer = parse_footer(part);
            continue;
        }
        match parse_row(part) {
            Some(level) => levels.push(level),
            None => debug!(row = %part, "skipping malformed order-book row"),
        }
    }

    Ok(SideUpdate {
        symbol,
        side,
        levels,
        footer,
    })
}

/// Attach `lot_change` to `next` against the ladder it replaces.  A price
/// missing from `prior` counts its whole volume as the change.
pub fn compute_lot_change(prior: &[OrderLevel], mut next: Vec<OrderLevel>) -> Vec<OrderLevel> {
    for level in next.iter_mut() {
        level.lot_change = match prior
            .iter()
            .find(|p| (p.price - level.price).abs() < 1e-9)
        {
            Some(old) => level.volume - old.volume,
            None => level.volume,
        };
    }
    next
}

// ---------------------------------------------------------------------------
// OrderbookBook -- state for the one active symbol
// ---------------------------------------------------------------------------

pub struct OrderbookBook {
    state: Mutex<BookState>,
}

#[derive(Default)]
struct BookState {
    active: Option<String>,
    snapshot: OrderbookSnapshot,
    /// A fetched snapshot has been installed for `active`.
    loaded: bool,
}

impl OrderbookBook {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BookState::default()),
        }
    }

    /// Make `symbol` active and clear the ladder.  Returns `false` if it was
    /// already active.
    pub fn activate(&self, symbol: &str) -> bool {
        let mut state = self.state.lock();
        if state.active.as_deref() == Some(symbol) {
            return false;
        }
        state.active = Some(symbol.to_string());
        state.snapshot = OrderbookSnapshot {
            symbol: symbol.to_string(),
            ..OrderbookSnapshot::default()
        };
        state.loaded = false;
        true
    }

    pub fn deactivate(&self) {
        let mut state = self.state.lock();
        state.active = None;
        state.snapshot = OrderbookSnapshot::default();
        state.loaded = false;
    }

    pub fn active_symbol(&self) -> Option<String> {
        self.state.lock().active.clone()
    }

    /// Whether the active symbol has a fetched snapshot behind it.
    pub fn is_loaded(&self) -> bool {
        let state = self.state.lock();
        state.active.is_some() && state.loaded
    }

    /// Install a freshly fetched snapshot if its symbol is still active.
    pub fn install_snapshot(&self, snapshot: OrderbookSnapshot) -> bool {
        let mut state = self.state.lock();
        if state.active.as_deref() != Some(snapshot.symbol.as_str()) {
            return false;
        }
        state.snapshot = snapshot;
        state.loaded = true;
        true
    }

    /// Replace one side from a stream frame.  Frames for any symbol other
    /// than the active one are discarded.
    pub fn apply_side(&self, update: &SideUpdate) -> bool {
        let mut state = self.state.lock();
        if state.active.as_deref() != Some(update.symbol.as_str()) {
            debug!(frame = %update.symbol, active = ?state.active, "stale order-book frame dropped");
            return false;
        }

        let snapshot = &mut state.snapshot;
        let prior = match update.side {
            BookSide::Bid => &snapshot.bids,
            BookSide::Offer => &snapshot.offers,
        };
        let ladder = compute_lot_change(prior, update.levels.clone());
        match update.side {
            BookSide::Bid => snapshot.bids = ladder,
            BookSide::Offer => snapshot.offers = ladder,
        }

        if let Some(footer) = update.footer {
            match update.side {
                BookSide::Bid => {
                    snapshot.aggregate.bid_frequency = footer.frequency;
                    snapshot.aggregate.bid_volume = footer.volume;
                }
                BookSide::Offer => {
                    snapshot.aggregate.offer_frequency = footer.frequency;
                    snapshot.aggregate.offer_volume = footer.volume;
                }
            }
            snapshot.last_update_epoch = footer.epoch;
        }
        true
    }

    /// Merge header fields from a tick.  Zero fields are treated as absent
    /// and never overwrite a known value.
    pub fn apply_tick(&self, tick: &LiveTick) -> bool {
        let mut state = self.state.lock();
        if state.active.as_deref() != Some(tick.symbol.as_str()) {
            return false;
        }

        let header = &mut state.snapshot.header;
        let overlay = |dst: &mut f64, src: f64| {
            if src != 0.0 {
                *dst = src;
            }
        };
        overlay(&mut header.last_price, tick.last_price);
        overlay(&mut header.previous_close, tick.previous_close);
        overlay(&mut header.open, tick.open);
        overlay(&mut header.high, tick.high);
        overlay(&mut header.low, tick.low);
        overlay(&mut header.volume, tick.volume);
        overlay(&mut header.value, tick.value);
        overlay(&mut header.frequency, tick.frequency);
        overlay(&mut header.change_value, tick.change_value);
        overlay(&mut header.change_percent, tick.change_percent);
        true
    }

    pub fn snapshot(&self) -> OrderbookSnapshot {
        self.state.lock().snapshot.clone()
    }
}

impl Default for OrderbookBook {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
