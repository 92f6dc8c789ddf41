// =============================================================================
// Fetch handlers: one per task kind
// =============================================================================
//
// Handlers never return errors.  A failed or empty candle fetch still leaves
// a (possibly empty) series behind so the symbol counts as checked; a failed
// side-data fetch leaves nothing, so the next access queues it again.
// =============================================================================

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tracing::{debug, warn};

use crate::fetch::task::{FetchKind, FetchTask};
use crate::market_data::{trading_day, ExtraDataStore, MarketDataStore};
use crate::rest::parse::{self, OwnerClass};
use crate::rest::MarketApi;

/// Financial ratio items requested in one call.
pub const FINANCIAL_ITEMS: &str = "21334,21535,1461,2896,1474,1516";

/// Broker codes aggregated into the retail-flow series.
pub const RETAIL_BROKERS: &[&str] = &["XC", "XL", "YP", "PD", "CC"];

const FLOW_PERIOD: &str = "RT_PERIOD_LAST_1_YEAR";

/// Store series name a task of `kind` writes to.
pub fn series_name(kind: FetchKind, extra: Option<&str>) -> String {
    match (kind, extra) {
        (FetchKind::BrokerFlow, Some(code)) => format!("BROKER_{code}"),
        _ => kind.tag().to_string(),
    }
}

/// Store series name of one financial ratio item.
pub fn financial_series(item_id: i64) -> String {
    format!("FIN_{item_id}")
}

pub struct FetchHandlers {
    api: Arc<dyn MarketApi>,
    store: Arc<MarketDataStore>,
    extra: Arc<ExtraDataStore>,
    lookback_days: i64,
}

impl FetchHandlers {
    pub fn new(
        api: Arc<dyn MarketApi>,
        store: Arc<MarketDataStore>,
        extra: Arc<ExtraDataStore>,
        lookback_days: i64,
    ) -> Self {
        Self {
            api,
            store,
            extra,
            lookback_days,
        }
    }

    /// Execute one task.  Returns the number of records written.
    pub async fn run(&self, task: FetchTask) -> usize {
        match task.kind {
            FetchKind::Candles => self.candles(task).await,
            FetchKind::OwnershipIndividual => {
                self.ownership(&task, OwnerClass::Individual).await
            }
            FetchKind::OwnershipCorporate => self.ownership(&task, OwnerClass::Corporate).await,
            FetchKind::Financials => self.financials(&task).await,
            FetchKind::RetailFlow | FetchKind::BrokerFlow => self.flow(&task).await,
        }
    }

    async fn candles(&self, task: FetchTask) -> usize {
        let symbol = task.symbol.as_str();
        let (from, to) = task.range.unwrap_or_else(|| {
            let today = trading_day();
            (today - ChronoDuration::days(self.lookback_days), today)
        });

        if !task.preload.is_empty() {
            self.store.merge_historical(symbol, &task.preload);
        }

        let fetched = match self.api.fetch_historical(symbol, from, to).await {
            Ok(candles) => candles,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "historical fetch failed");
                Vec::new()
            }
        };

        if !fetched.is_empty() {
            self.store.merge_historical(symbol, &fetched);
        }

        if task.preload.is_empty() && fetched.is_empty() && !self.store.has_historical(symbol) {
            self.store.set_historical(symbol, Vec::new());
            debug!(symbol = %symbol, "no history available, marked as checked");
        }

        fetched.len()
    }

    async fn get_or_log(&self, task: &FetchTask, path: &str) -> Option<String> {
        match self.api.get_text(path).await {
            Ok(body) => Some(body),
            Err(e) => {
                warn!(key = %task.dedup_key(), error = %e, "side-data fetch failed");
                None
            }
        }
    }

    async fn ownership(&self, task: &FetchTask, class: OwnerClass) -> usize {
        let path = format!(
            "/api/amibroker/ownership?symbol={}&value_year=60&shareholder_type=local",
            task.symbol
        );
        let Some(body) = self.get_or_log(task, &path).await else {
            return 0;
        };
        match parse::parse_ownership(&body, class) {
            Ok(points) if !points.is_empty() => {
                let n = points.len();
                self.extra
                    .set(&task.symbol, &series_name(task.kind, None), points);
                n
            }
            Ok(_) => 0,
            Err(e) => {
                warn!(key = %task.dedup_key(), error = %e, "ownership payload rejected");
                0
            }
        }
    }

    async fn financials(&self, task: &FetchTask) -> usize {
        let path = format!(
            "/api/amibroker/financials?item={}&companies={}&timeframe=5y",
            FINANCIAL_ITEMS, task.symbol
        );
        let Some(body) = self.get_or_log(task, &path).await else {
            return 0;
        };
        match parse::parse_financials(&body) {
            Ok(items) => {
                let mut written = 0;
                for (item_id, points) in items {
                    if points.is_empty() {
                        continue;
                    }
                    written += points.len();
                    self.extra
                        .set(&task.symbol, &financial_series(item_id), points);
                }
                written
            }
            Err(e) => {
                warn!(key = %task.dedup_key(), error = %e, "financials payload rejected");
                0
            }
        }
    }

    async fn flow(&self, task: &FetchTask) -> usize {
        let brokers: Vec<&str> = match (task.kind, task.extra.as_deref()) {
            (FetchKind::BrokerFlow, Some(code)) => vec![code],
            (FetchKind::BrokerFlow, None) => {
                warn!(symbol = %task.symbol, "broker flow task without broker code");
                return 0;
            }
            _ => RETAIL_BROKERS.to_vec(),
        };
        let codes: String = brokers
            .iter()
            .map(|c| format!("&broker_code={c}"))
            .collect();
        let path = format!(
            "/api/amibroker/ritelflow?symbol={}&period={}{}",
            task.symbol, FLOW_PERIOD, codes
        );

        let Some(body) = self.get_or_log(task, &path).await else {
            return 0;
        };
        match parse::parse_broker_flow(&body) {
            Ok(points) if !points.is_empty() => {
                let n = points.len();
                self.extra.set(
                    &task.symbol,
                    &series_name(task.kind, task.extra.as_deref()),
                    points,
                );
                n
            }
            Ok(_) => 0,
            Err(e) => {
                warn!(key = %task.dedup_key(), error = %e, "flow payload rejected");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    use crate::test_support::{candle, StubApi};

    fn handlers(api: StubApi) -> (FetchHandlers, Arc<MarketDataStore>, Arc<ExtraDataStore>) {
        let store = Arc::new(MarketDataStore::new());
        let extra = Arc::new(ExtraDataStore::new());
        (
            FetchHandlers::new(Arc::new(api), store.clone(), extra.clone(), 730),
            store,
            extra,
        )
    }

    fn range() -> (NaiveDate, NaiveDate) {
        (
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
        )
    }

    #[tokio::test]
    async fn failed_candle_fetch_marks_checked() {
        let (handlers, store, _) = handlers(StubApi::default());
        let (from, to) = range();
        handlers.run(FetchTask::candles("GOTO", from, to, Vec::new())).await;
        assert!(store.has_historical("GOTO"));
        assert!(store.get_historical("GOTO").is_empty());
    }

    #[tokio::test]
    async fn fetched_candles_override_preload() {
        let mut api = StubApi::default();
        api.candles.insert(
            "BBCA".into(),
            vec![candle("2024-01-02", 200.0), candle("2024-01-03", 300.0)],
        );
        let (handlers, store, _) = handlers(api);
        let (from, to) = range();
        let preload = vec![candle("2024-01-01", 1.0), candle("2024-01-02", 2.0)];
        let written = handlers.run(FetchTask::candles("BBCA", from, to, preload)).await;

        assert_eq!(written, 2);
        let closes: Vec<f64> = store.get_historical("BBCA").iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![1.0, 200.0, 300.0]);
    }

    #[tokio::test]
    async fn failed_side_fetch_leaves_no_entry() {
        let (handlers, _, extra) = handlers(StubApi::default());
        let written = handlers
            .run(FetchTask::side(FetchKind::OwnershipIndividual, "BBCA"))
            .await;
        assert_eq!(written, 0);
        assert!(!extra.has("BBCA", "OWN_INDIV"));
    }

    #[tokio::test]
    async fn ownership_written_under_class_series() {
        let api = StubApi::default().with_body(
            "/api/amibroker/ownership",
            r#"{"data":{"legend":[{"item_name":"Corporate","chart_data":[{"unix_date":"1704067200","value":40}]}]}}"#,
        );
        let (handlers, _, extra) = handlers(api);
        handlers
            .run(FetchTask::side(FetchKind::OwnershipCorporate, "BBCA"))
            .await;
        assert_eq!(extra.get("BBCA", "OWN_CORP").len(), 1);
        assert!(!extra.has("BBCA", "OWN_INDIV"));
    }

    #[tokio::test]
    async fn financials_split_per_item() {
        let api = StubApi::default().with_body(
            "/api/amibroker/financials",
            r#"{"data":[{"ratios":[
                {"item_id":21334,"chart_data":[{"date":1704067200,"value":1500}]},
                {"item_id":21535,"chart_data":[]}
            ]}]}"#,
        );
        let (handlers, _, extra) = handlers(api);
        handlers.run(FetchTask::side(FetchKind::Financials, "TLKM")).await;
        assert!(extra.has("TLKM", "FIN_21334"));
        assert!(!extra.has("TLKM", "FIN_21535"));
    }

    #[tokio::test]
    async fn broker_flow_requests_single_code() {
        let api = StubApi::default().with_body(
            "/api/amibroker/ritelflow",
            r#"{"data":{"broker_chart_data":[{"charts":[{"chart":[{"date":"2024-01-02","value":{"raw":"5"}}]}]}]}}"#,
        );
        let (handlers, _, extra) = handlers(api);
        handlers.run(FetchTask::broker_flow("BBCA", "YP")).await;
        assert_eq!(extra.get("BBCA", "BROKER_YP").len(), 1);
        assert!(!extra.has("BBCA", "RITEL"));
    }

    #[test]
    fn series_names() {
        assert_eq!(series_name(FetchKind::RetailFlow, None), "RITEL");
        assert_eq!(series_name(FetchKind::BrokerFlow, Some("YP")), "BROKER_YP");
        assert_eq!(financial_series(21334), "FIN_21334");
    }
}
