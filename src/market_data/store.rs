use std::collections::{BTreeMap, HashMap};

use chrono::{Local, NaiveDate};
use parking_lot::RwLock;
use tracing::debug;

use crate::types::{Candle, LiveTick};

/// The local calendar day used for every live-to-historical merge.
pub fn trading_day() -> NaiveDate {
    Local::now().date_naive()
}

// ---------------------------------------------------------------------------
// MarketDataStore -- historical series plus the latest live tick per symbol
// ---------------------------------------------------------------------------

/// Cache of record for bars and ticks.  One lock guards both maps; every
/// read copies out before the guard is released.
pub struct MarketDataStore {
    inner: RwLock<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    historical: HashMap<String, Vec<Candle>>,
    live: HashMap<String, LiveTick>,
}

impl MarketDataStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// Union of the stored series and `candles`, keyed by date.  A colliding
    /// date always takes the incoming bar.  Returns the resulting length.
    pub fn merge_historical(&self, symbol: &str, candles: &[Candle]) -> usize {
        let mut inner = self.inner.write();
        let existing = inner.historical.remove(symbol).unwrap_or_default();

        let mut by_date: BTreeMap<NaiveDate, Candle> =
            existing.into_iter().map(|c| (c.date, c)).collect();
        for candle in candles {
            by_date.insert(candle.date, candle.clone());
        }

        let merged: Vec<Candle> = by_date.into_values().collect();
        let len = merged.len();
        inner.historical.insert(symbol.to_string(), merged);

        debug!(symbol = %symbol, incoming = candles.len(), total = len, "historical merged");
        len
    }

    /// Replace the series outright.  An empty vector still marks the symbol
    /// as checked.
    pub fn set_historical(&self, symbol: &str, candles: Vec<Candle>) {
        let mut by_date: BTreeMap<NaiveDate, Candle> = BTreeMap::new();
        for candle in candles {
            by_date.insert(candle.date, candle);
        }
        self.inner
            .write()
            .historical
            .insert(symbol.to_string(), by_date.into_values().collect());
    }

    pub fn get_historical(&self, symbol: &str) -> Vec<Candle> {
        self.inner
            .read()
            .historical
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_historical(&self, symbol: &str) -> bool {
        self.inner.read().historical.contains_key(symbol)
    }

    pub fn update_live_tick(&self, tick: LiveTick) {
        self.inner.write().live.insert(tick.symbol.clone(), tick);
    }

    pub fn live_tick(&self, symbol: &str) -> Option<LiveTick> {
        self.inner.read().live.get(symbol).cloned()
    }

    /// Fold the live tick into today's bar, using the local calendar day.
    pub fn merge_live_to_historical(&self, symbol: &str) -> bool {
        self.merge_live_to_historical_on(symbol, trading_day())
    }

    /// Fold the live tick into the bar for `today`.
    ///
    /// * Last stored bar dated `today`: updated in place (close, widened
    ///   high/low, cumulative volume/value/frequency/net foreign).
    /// * Otherwise (new day or empty series): a new bar dated `today` is
    ///   appended, seeded from the tick.
    ///
    /// Returns `false` when there is no tick or the series was never
    /// fetched.
    pub fn merge_live_to_historical_on(&self, symbol: &str, today: NaiveDate) -> bool {
        let mut inner = self.inner.write();
        let Some(live) = inner.live.get(symbol).cloned() else {
            return false;
        };
        let Some(series) = inner.historical.get_mut(symbol) else {
            return false;
        };
        if live.last_price <= 0.0 {
            return false;
        }

        match series.last_mut() {
            Some(last) if last.date == today => {
                last.close = live.last_price;
                if live.high > 0.0 {
                    last.high = last.high.max(live.high);
                }
                if live.low > 0.0 {
                    last.low = if last.low > 0.0 {
                        last.low.min(live.low)
                    } else {
                        live.low
                    };
                }
                last.volume = live.volume;
                last.value = live.value;
                last.frequency = live.frequency;
                last.net_foreign = live.net_foreign;
            }
            Some(last) if last.date > today => {
                debug!(symbol = %symbol, last = %last.date, today = %today, "stored bar is ahead of today, live merge skipped");
                return false;
            }
            _ => {
                let seed = |v: f64| if v > 0.0 { v } else { live.last_price };
                series.push(Candle {
                    date: today,
                    open: seed(live.open),
                    high: seed(live.high).max(live.last_price),
                    low: seed(live.low).min(live.last_price),
                    close: live.last_price,
                    volume: live.volume,
                    frequency: live.frequency,
                    value: live.value,
                    net_foreign: live.net_foreign,
                });
                debug!(symbol = %symbol, date = %today, "new live bar appended");
            }
        }
        true
    }

    /// Symbols with a stored series.
    pub fn symbols(&self) -> Vec<String> {
        self.inner.read().historical.keys().cloned().collect()
    }
}

impl Default for MarketDataStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
