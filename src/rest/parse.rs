// =============================================================================
// REST payload parsing: historical bars, listings, snapshots, side data
// =============================================================================
//
// The upstream API is loose about numeric encoding: the same field may arrive
// as a JSON number, a plain string, or a comma-grouped string ("4,307").  All
// numeric reads go through the lenient helpers below.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{FeedError, FeedResult};
use crate::market_data::orderbook::{BookAggregate, BookHeader, OrderLevel, OrderbookSnapshot};
use crate::types::{Candle, DataPoint, SymbolInfo};

/// Instrument type the order-book view accepts.
pub const EQUITY_COMPANY_TYPE: &str = "Saham";

// ---------------------------------------------------------------------------
// Lenient numeric helpers
// ---------------------------------------------------------------------------

pub fn json_opt_f64(val: &Value) -> Option<f64> {
    match val {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }
}

/// Numeric field or `0.0` when missing/unparsable.
pub fn json_f64(val: &Value) -> f64 {
    json_opt_f64(val).unwrap_or(0.0)
}

pub fn json_i64(val: &Value) -> i64 {
    match val {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        _ => json_opt_f64(val).map(|f| f as i64).unwrap_or(0),
    }
}

fn json_text(val: &Value) -> Option<String> {
    match val {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_day(raw: &str) -> Option<NaiveDate> {
    let head = raw.trim().get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

fn day_epoch(date: NaiveDate) -> Option<i64> {
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}

fn is_printable_ascii(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| (0x20..0x7f).contains(&b))
}

// ---------------------------------------------------------------------------
// Historical bars & symbol list
// ---------------------------------------------------------------------------

/// Parse `{"data": {"chartbit": [...]}}` (or a top-level `chartbit`).
pub fn parse_historical(body: &str) -> Result<Vec<Candle>> {
    let root: Value = serde_json::from_str(body).context("failed to parse historical JSON")?;

    let rows = root
        .pointer("/data/chartbit")
        .and_then(Value::as_array)
        .or_else(|| root.get("chartbit").and_then(Value::as_array))
        .context("historical response has no chartbit array")?;

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(date) = row["date"].as_str().and_then(parse_day) else {
            warn!(row = %row, "skipping historical row without a valid date");
            continue;
        };
        let foreign_buy = json_f64(&row["foreignbuy"]);
        let foreign_sell = json_f64(&row["foreignsell"]);
        candles.push(Candle {
            date,
            open: json_f64(&row["open"]),
            high: json_f64(&row["high"]),
            low: json_f64(&row["low"]),
            close: json_f64(&row["close"]),
            volume: json_f64(&row["volume"]),
            frequency: json_f64(&row["frequency"]),
            value: json_f64(&row["value"]),
            net_foreign: foreign_buy - foreign_sell,
        });
    }
    Ok(candles)
}

/// Parse `{"data": [{"code", "name", "sector_id", "industry_id"}]}`.
pub fn parse_symbol_list(body: &str) -> Result<Vec<SymbolInfo>> {
    let root: Value = serde_json::from_str(body).context("failed to parse symbol list JSON")?;
    let rows = root["data"]
        .as_array()
        .context("symbol list response has no data array")?;

    let symbols = rows
        .iter()
        .filter_map(|row| {
            let code = json_text(&row["code"])?;
            let name = json_text(&row["name"])?;
            if !is_printable_ascii(&code) || !is_printable_ascii(&name) {
                return None;
            }
            Some(SymbolInfo {
                code,
                name,
                sector_id: json_text(&row["sector_id"]),
                industry_id: json_text(&row["industry_id"]),
            })
        })
        .collect();
    Ok(symbols)
}

/// Extract the socket key from `{"key": ...}` or `{"data": {"key": ...}}`.
pub fn parse_socket_key(body: &str) -> Option<String> {
    let root: Value = serde_json::from_str(body).ok()?;
    root.get("key")
        .or_else(|| root.pointer("/data/key"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Order-book snapshot
// ---------------------------------------------------------------------------

fn parse_ladder(val: &Value) -> Vec<OrderLevel> {
    val.as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let price = json_opt_f64(&row["price"])?;
                    Some(OrderLevel::new(
                        price,
                        json_i64(&row["que_num"]),
                        json_i64(&row["volume"]),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parse an order-book snapshot.  Non-equity instruments are rejected with
/// [`FeedError::InvalidSymbol`].
pub fn parse_orderbook_snapshot(body: &str, symbol: &str) -> FeedResult<OrderbookSnapshot> {
    let root: Value = serde_json::from_str(body)
        .map_err(|e| FeedError::Decode(format!("order-book snapshot JSON: {e}")))?;
    let data = &root["data"];

    let company_type = data["company_type"].as_str().unwrap_or("").trim();
    if company_type != EQUITY_COMPANY_TYPE {
        return Err(FeedError::InvalidSymbol {
            symbol: symbol.to_string(),
            reason: if company_type.is_empty() {
                "instrument type missing".to_string()
            } else {
                format!("instrument type {company_type} is not an equity")
            },
        });
    }

    let header = BookHeader {
        last_price: json_f64(&data["lastprice"]),
        previous_close: json_f64(&data["previous"]),
        open: json_f64(&data["open"]),
        high: json_f64(&data["high"]),
        low: json_f64(&data["low"]),
        volume: json_f64(&data["volume"]),
        value: json_f64(&data["value"]),
        frequency: json_f64(&data["frequency"]),
        change_value: json_f64(&data["change"]),
        change_percent: json_f64(&data["percentage_change"]),
    };

    let totals = &data["total_bid_offer"];
    let aggregate = BookAggregate {
        bid_frequency: json_i64(&totals["bid"]["freq"]),
        bid_volume: json_i64(&totals["bid"]["lot"]),
        offer_frequency: json_i64(&totals["offer"]["freq"]),
        offer_volume: json_i64(&totals["offer"]["lot"]),
    };

    let snapshot = OrderbookSnapshot {
        symbol: symbol.to_string(),
        company_type: company_type.to_string(),
        header,
        bids: parse_ladder(&data["bid"]),
        offers: parse_ladder(&data["offer"]),
        aggregate,
        last_update_epoch: 0,
    };
    debug!(
        symbol = %symbol,
        bids = snapshot.bids.len(),
        offers = snapshot.offers.len(),
        "order-book snapshot parsed"
    );
    Ok(snapshot)
}

// ---------------------------------------------------------------------------
// Side data
// ---------------------------------------------------------------------------

/// Shareholder class tracked by the ownership endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerClass {
    Individual,
    Corporate,
}

impl OwnerClass {
    fn matches(self, item_name: &str) -> bool {
        let name = item_name.to_ascii_lowercase();
        match self {
            Self::Individual => name.contains("individu"),
            Self::Corporate => name.contains("corporat") || name.contains("perusahaan"),
        }
    }
}

/// Ownership series for one shareholder class from
/// `data.legend[].{item_name, chart_data[].{unix_date, value}}`.
pub fn parse_ownership(body: &str, class: OwnerClass) -> Result<Vec<DataPoint>> {
    let root: Value = serde_json::from_str(body).context("failed to parse ownership JSON")?;
    let legend = root
        .pointer("/data/legend")
        .and_then(Value::as_array)
        .context("ownership response has no legend")?;

    let Some(entry) = legend
        .iter()
        .find(|item| item["item_name"].as_str().is_some_and(|n| class.matches(n)))
    else {
        return Ok(Vec::new());
    };

    let points = entry["chart_data"]
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let ts = json_i64(&row["unix_date"]);
                    (ts > 0).then(|| DataPoint {
                        ts,
                        value: json_opt_f64(&row["value"]),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(points)
}

/// Financial ratio series keyed by item id from
/// `data[0].ratios[].{item_id, chart_data[].{date, value}}`.
pub fn parse_financials(body: &str) -> Result<Vec<(i64, Vec<DataPoint>)>> {
    let root: Value = serde_json::from_str(body).context("failed to parse financials JSON")?;
    let ratios = root
        .pointer("/data/0/ratios")
        .and_then(Value::as_array)
        .context("financials response has no ratios")?;

    let mut out = Vec::with_capacity(ratios.len());
    for ratio in ratios {
        let item_id = json_i64(&ratio["item_id"]);
        if item_id == 0 {
            continue;
        }
        let points: Vec<DataPoint> = ratio["chart_data"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .map(|row| DataPoint {
                        ts: json_i64(&row["date"]),
                        value: json_opt_f64(&row["value"]),
                    })
                    .filter(|p| p.ts > 0)
                    .collect()
            })
            .unwrap_or_default();
        out.push((item_id, points));
    }
    Ok(out)
}

/// Broker-flow series summed per day across every broker chart in
/// `data.broker_chart_data[0].charts[].chart[].{date, value.raw}`.
pub fn parse_broker_flow(body: &str) -> Result<Vec<DataPoint>> {
    let root: Value = serde_json::from_str(body).context("failed to parse broker flow JSON")?;
    let charts = root
        .pointer("/data/broker_chart_data/0/charts")
        .and_then(Value::as_array)
        .context("broker flow response has no charts")?;

    let mut per_day: BTreeMap<i64, f64> = BTreeMap::new();
    for chart in charts {
        let Some(rows) = chart["chart"].as_array() else {
            continue;
        };
        for row in rows {
            let Some(ts) = row["date"].as_str().and_then(parse_day).and_then(day_epoch) else {
                continue;
            };
            let raw = &row["value"]["raw"];
            let value = json_opt_f64(raw).or_else(|| json_opt_f64(&row["value"]));
            if let Some(v) = value {
                *per_day.entry(ts).or_insert(0.0) += v;
            }
        }
    }

    Ok(per_day
        .into_iter()
        .map(|(ts, v)| DataPoint { ts, value: Some(v) })
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
