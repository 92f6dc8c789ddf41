// =============================================================================
// Feed Context: Valkyrie Data Feed
// =============================================================================
//
// Owns one instance of every service and is the only surface the host talks
// to.  All subsystems hold Arc references to the stores they write; the
// context ties them together and answers host queries from the cache,
// queuing background fetches on a miss.
//
// Thread safety:
//   - Every store manages its own interior mutability (parking_lot locks).
//   - Host calls never block on the network; misses return what is cached.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate};
use tracing::{debug, info};

use crate::fetch::handlers::{financial_series, series_name};
use crate::fetch::{FetchCoordinator, FetchHandlers, FetchKind, FetchTask};
use crate::market_data::{forward_fill, trading_day, ExtraDataStore, MarketDataStore};
use crate::notify::Notifier;
use crate::rest::MarketApi;
use crate::runtime_config::RuntimeConfig;
use crate::stream::{OrderbookClient, StreamingClient, Transport};
use crate::types::{Candle, LiveTick, SymbolInfo};

/// Financial ratio item ids behind the host-facing field names.
const SHAREHOLDERS_NUM_ITEM: i64 = 21334;
const FREE_FLOAT_ITEM: i64 = 21535;

/// Side-data field requested by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ExtraField {
    Ownership(FetchKind),
    Financial(i64),
    RetailFlow,
    Broker(String),
}

impl ExtraField {
    fn parse(field: &str) -> Option<Self> {
        match field.trim() {
            "OWN_INDIV" => Some(Self::Ownership(FetchKind::OwnershipIndividual)),
            "OWN_CORP" => Some(Self::Ownership(FetchKind::OwnershipCorporate)),
            "SHAREHOLDERS_NUM" => Some(Self::Financial(SHAREHOLDERS_NUM_ITEM)),
            "FREE_FLOAT" => Some(Self::Financial(FREE_FLOAT_ITEM)),
            "RITEL_FLOW" => Some(Self::RetailFlow),
            other => other
                .strip_prefix("BROKER_")
                .map(str::trim)
                .filter(|code| !code.is_empty())
                .map(|code| Self::Broker(code.to_uppercase())),
        }
    }

    /// Store series name plus the task that fills it.
    fn source(&self, symbol: &str) -> (String, FetchTask) {
        match self {
            Self::Ownership(kind) => (series_name(*kind, None), FetchTask::side(*kind, symbol)),
            Self::Financial(item) => (
                financial_series(*item),
                FetchTask::side(FetchKind::Financials, symbol),
            ),
            Self::RetailFlow => (
                series_name(FetchKind::RetailFlow, None),
                FetchTask::side(FetchKind::RetailFlow, symbol),
            ),
            Self::Broker(code) => (
                series_name(FetchKind::BrokerFlow, Some(code.as_str())),
                FetchTask::broker_flow(symbol, code.clone()),
            ),
        }
    }
}

fn normalize(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

pub struct FeedContext {
    pub config: RuntimeConfig,
    pub notifier: Notifier,

    // ── Caches ──────────────────────────────────────────────────────────
    pub store: Arc<MarketDataStore>,
    pub extra: Arc<ExtraDataStore>,

    // ── Services ────────────────────────────────────────────────────────
    api: Arc<dyn MarketApi>,
    pub coordinator: FetchCoordinator,
    pub streaming: StreamingClient,
    pub orderbook: OrderbookClient,

    start_time: Instant,
}

impl FeedContext {
    pub fn new(config: RuntimeConfig, api: Arc<dyn MarketApi>, transport: Arc<dyn Transport>) -> Self {
        let notifier = Notifier::new();
        let store = Arc::new(MarketDataStore::new());
        let extra = Arc::new(ExtraDataStore::new());

        let handlers = FetchHandlers::new(
            api.clone(),
            store.clone(),
            extra.clone(),
            config.history_lookback_days,
        );
        let coordinator = FetchCoordinator::new(handlers, notifier.clone(), config.fetch_delay());

        let streaming = StreamingClient::new(
            config.live_session(),
            &config.symbols,
            config.max_symbols_per_subscribe,
            api.clone(),
            transport.clone(),
            store.clone(),
            notifier.clone(),
            config.notify_throttle(),
        );
        let orderbook = OrderbookClient::new(
            config.orderbook_session(),
            api.clone(),
            transport,
            notifier.clone(),
        );

        Self {
            config,
            notifier,
            store,
            extra,
            api,
            coordinator,
            streaming,
            orderbook,
            start_time: Instant::now(),
        }
    }

    pub fn start(&self) {
        self.coordinator.start();
        self.streaming.start();
        self.orderbook.start();
        info!(symbols = self.config.symbols.len(), "feed context started");
    }

    pub async fn shutdown(&self) {
        self.orderbook.stop().await;
        self.streaming.stop().await;
        self.coordinator.stop().await;
        info!(uptime_secs = self.uptime_secs(), "feed context shut down");
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    // -------------------------------------------------------------------------
    // Host queries
    // -------------------------------------------------------------------------

    /// Bars for `symbol`.  A cache hit returns the cached series with the
    /// live tick folded in; a miss queues a fetch and returns what is there.
    pub fn quotes(&self, symbol: &str, preload: &[Candle]) -> Vec<Candle> {
        self.quotes_on(symbol, preload, trading_day())
    }

    pub fn quotes_on(&self, symbol: &str, preload: &[Candle], today: NaiveDate) -> Vec<Candle> {
        let symbol = normalize(symbol);

        if self.store.has_historical(&symbol) {
            if self.streaming.is_connected() {
                self.store.merge_live_to_historical_on(&symbol, today);
            }
            return self.store.get_historical(&symbol);
        }

        let from = preload
            .last()
            .map(|c| c.date)
            .unwrap_or_else(|| today - ChronoDuration::days(self.config.history_lookback_days));
        // Primed before submitting: the worker may finish before we return,
        // and its merge must land on top of the preload, not under it.
        if !preload.is_empty() {
            self.store.merge_historical(&symbol, preload);
        }
        let accepted = self
            .coordinator
            .submit(FetchTask::candles(symbol.as_str(), from, today, preload.to_vec()));
        debug!(symbol = %symbol, accepted, from = %from, "history requested");
        self.store.get_historical(&symbol)
    }

    pub fn recent_info(&self, symbol: &str) -> Option<LiveTick> {
        self.store.live_tick(&normalize(symbol))
    }

    pub async fn symbol_list(&self) -> Result<Vec<SymbolInfo>> {
        self.api.fetch_symbol_list().await
    }

    /// Side-data `field` aligned onto `bar_timestamps` (epoch seconds).
    /// Uncached series are queued and come back all `None`, as does any
    /// unknown field.
    pub fn extra_series(&self, symbol: &str, field: &str, bar_timestamps: &[i64]) -> Vec<Option<f64>> {
        let symbol = normalize(symbol);
        let Some(field) = ExtraField::parse(field) else {
            debug!(symbol = %symbol, field = %field, "unknown side-data field");
            return vec![None; bar_timestamps.len()];
        };

        let (series, task) = field.source(&symbol);
        if self.extra.has(&symbol, &series) {
            return forward_fill(&self.extra.get(&symbol, &series), bar_timestamps);
        }
        self.coordinator.submit(task);
        vec![None; bar_timestamps.len()]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::proto::{self, StockData};
    use crate::stream::transport::TransportEvent;
    use crate::test_support::{candle, wait_until, MockTransport, StubApi};
    use crate::types::DataPoint;

    fn context() -> FeedContext {
        let (transport, _) = MockTransport::with_links(0);
        FeedContext::new(
            RuntimeConfig::default(),
            Arc::new(StubApi::default()),
            Arc::new(transport),
        )
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn cache_miss_queues_once() {
        let ctx = context();
        assert!(ctx.quotes_on("bbca", &[], day("2024-03-01")).is_empty());
        assert!(ctx.coordinator.is_pending("CANDLES_BBCA"));
        assert!(ctx.quotes_on("BBCA", &[], day("2024-03-01")).is_empty());
        assert_eq!(ctx.coordinator.pending_len(), 1);
    }

    #[test]
    fn cache_miss_with_preload_primes_store() {
        let ctx = context();
        let preload = vec![candle("2024-02-28", 10.0), candle("2024-02-29", 11.0)];
        let bars = ctx.quotes_on("TLKM", &preload, day("2024-03-01"));
        assert_eq!(bars.len(), 2);
        assert!(ctx.store.has_historical("TLKM"));
        assert_eq!(ctx.coordinator.pending_len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetched_bars_land_on_top_of_preload() {
        let (transport, _) = MockTransport::with_links(0);
        let mut api = StubApi::default();
        api.candles.insert(
            "BBCA".into(),
            vec![candle("2024-02-29", 9_050.0), candle("2024-03-01", 9_100.0)],
        );
        let config = RuntimeConfig {
            fetch_delay_ms: 0,
            ..RuntimeConfig::default()
        };
        let ctx = FeedContext::new(config, Arc::new(api), Arc::new(transport));
        ctx.coordinator.start();

        let preload = vec![candle("2024-02-27", 8_900.0), candle("2024-02-28", 9_000.0)];
        let first = ctx.quotes_on("BBCA", &preload, day("2024-03-01"));
        assert!(first.len() >= 2);

        wait_until(|| ctx.coordinator.is_idle() && ctx.store.get_historical("BBCA").len() == 4).await;
        let bars = ctx.store.get_historical("BBCA");
        assert_eq!(bars[0].date, day("2024-02-27"));
        assert_eq!(bars[3].date, day("2024-03-01"));
        assert!((bars[3].close - 9_100.0).abs() < f64::EPSILON);

        ctx.coordinator.stop().await;
    }

    #[tokio::test]
    async fn cache_hit_with_live_stream_folds_tick() {
        let (transport, mut peers) = MockTransport::with_links(1);
        let ctx = FeedContext::new(
            RuntimeConfig::default(),
            Arc::new(StubApi::socket_key("k1")),
            Arc::new(transport),
        );
        ctx.streaming.start();

        let mut peer = peers.remove(0);
        peer.events.send(TransportEvent::Open).unwrap();
        peer.next_binary().await;
        peer.events.send(TransportEvent::Frame(proto::encode_ack())).unwrap();
        peer.next_binary().await;
        peer.events
            .send(TransportEvent::Frame(proto::encode_feed(StockData {
                symbol: "BBCA".into(),
                lastprice: 9_100.0,
                high: 9_200.0,
                low: 9_000.0,
                ..StockData::default()
            })))
            .unwrap();
        wait_until(|| ctx.recent_info("BBCA").is_some() && ctx.streaming.is_connected()).await;

        ctx.store.set_historical("BBCA", vec![candle("2024-02-29", 9_000.0)]);
        let bars = ctx.quotes_on("bbca", &[], day("2024-03-01"));
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].date, day("2024-03-01"));
        assert!((bars[1].close - 9_100.0).abs() < f64::EPSILON);
        assert!(ctx.coordinator.is_idle());

        ctx.streaming.stop().await;
    }

    #[test]
    fn cache_hit_without_stream_skips_live_overlay() {
        let ctx = context();
        ctx.store.set_historical("ASII", vec![candle("2024-02-29", 5_000.0)]);
        ctx.store.update_live_tick(LiveTick {
            symbol: "ASII".into(),
            last_price: 5_100.0,
            ..LiveTick::default()
        });
        let bars = ctx.quotes_on("ASII", &[], day("2024-03-01"));
        assert_eq!(bars.len(), 1);
        assert!(ctx.coordinator.is_idle());
        assert!((ctx.recent_info("asii").unwrap().last_price - 5_100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn extra_series_queues_on_miss_and_fills_on_hit() {
        let ctx = context();
        let bars = [100, 200, 300];

        assert_eq!(ctx.extra_series("BBCA", "FREE_FLOAT", &bars), vec![None; 3]);
        assert!(ctx.coordinator.is_pending("FINANCIALS_BBCA"));

        ctx.extra.set(
            "BBCA",
            "FIN_21535",
            vec![DataPoint { ts: 150, value: Some(42.0) }],
        );
        assert_eq!(
            ctx.extra_series("BBCA", "FREE_FLOAT", &bars),
            vec![None, Some(42.0), Some(42.0)]
        );
    }

    #[test]
    fn extra_series_routes_each_field() {
        let ctx = context();
        for field in ["OWN_INDIV", "OWN_CORP", "RITEL_FLOW", "BROKER_yp", "SHAREHOLDERS_NUM"] {
            ctx.extra_series("TLKM", field, &[1]);
        }
        for key in ["OWN_INDIV_TLKM", "OWN_CORP_TLKM", "RITEL_TLKM", "BROKER_YP_TLKM", "FINANCIALS_TLKM"] {
            assert!(ctx.coordinator.is_pending(key), "{key} not queued");
        }
        assert_eq!(ctx.coordinator.pending_len(), 5);
    }

    #[test]
    fn unknown_field_is_empty_and_queues_nothing() {
        let ctx = context();
        assert_eq!(ctx.extra_series("TLKM", "PE_RATIO", &[1, 2]), vec![None, None]);
        assert_eq!(ctx.extra_series("TLKM", "BROKER_", &[1]), vec![None]);
        assert!(ctx.coordinator.is_idle());
    }
}
