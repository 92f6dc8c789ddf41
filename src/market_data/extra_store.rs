use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::DataPoint;

/// Side-data series (ownership, financial ratios, broker flow) keyed by
/// `(symbol, series)`.  Only non-empty results are ever stored, so a missing
/// entry means "not fetched yet".
pub struct ExtraDataStore {
    series: RwLock<HashMap<(String, String), Vec<DataPoint>>>,
}

impl ExtraDataStore {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Store a series sorted by timestamp.
    pub fn set(&self, symbol: &str, series: &str, mut points: Vec<DataPoint>) {
        points.sort_by_key(|p| p.ts);
        self.series
            .write()
            .insert((symbol.to_string(), series.to_string()), points);
    }

    pub fn get(&self, symbol: &str, series: &str) -> Vec<DataPoint> {
        self.series
            .read()
            .get(&(symbol.to_string(), series.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn has(&self, symbol: &str, series: &str) -> bool {
        self.series
            .read()
            .contains_key(&(symbol.to_string(), series.to_string()))
    }
}

impl Default for ExtraDataStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Align a sparse ascending series onto bar timestamps.  Each bar takes the
/// most recent non-null point at or before it; bars before the first point
/// are `None`.  Ascending bars are filled in one sweep; any other order is
/// looked up bar by bar.
pub fn forward_fill(points: &[DataPoint], bar_timestamps: &[i64]) -> Vec<Option<f64>> {
    if !bar_timestamps.windows(2).all(|w| w[0] <= w[1]) {
        return bar_timestamps
            .iter()
            .map(|&ts| value_at(points, ts))
            .collect();
    }

    let mut out = Vec::with_capacity(bar_timestamps.len());
    let mut idx = 0;
    let mut current: Option<f64> = None;

    for &ts in bar_timestamps {
        while idx < points.len() && points[idx].ts <= ts {
            if points[idx].value.is_some() {
                current = points[idx].value;
            }
            idx += 1;
        }
        out.push(current);
    }
    out
}

fn value_at(points: &[DataPoint], ts: i64) -> Option<f64> {
    let upto = points.partition_point(|p| p.ts <= ts);
    points[..upto].iter().rev().find_map(|p| p.value)
}
