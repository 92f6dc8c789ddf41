// Shared fixtures for unit tests: canned HTTP collaborators and an in-memory
// socket transport.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::error::{FeedError, FeedResult};
use crate::rest::MarketApi;
use crate::stream::supervisor::SessionSettings;
use crate::stream::transport::{Link, Outbound, Transport, TransportEvent};
use crate::types::{Candle, SymbolInfo};

pub fn candle(date: &str, close: f64) -> Candle {
    Candle {
        date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1_000.0,
        frequency: 10.0,
        value: close * 1_000.0,
        net_foreign: 0.0,
    }
}

/// Poll `cond` until it holds, failing the test after two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn session_settings() -> SessionSettings {
    SessionSettings {
        name: "test",
        url: "wss://feed.test/ws".into(),
        user_id: "tester".into(),
        reconnect_backoff: Duration::from_millis(20),
        keepalive_interval: Duration::from_secs(60),
        keepalive_message: "ping".into(),
        handshake_timeout: Duration::from_secs(2),
        handshake_attempts: 3,
    }
}

// ---------------------------------------------------------------------------
// HTTP stubs
// ---------------------------------------------------------------------------

/// Canned responses.  `get_text` answers with the first body whose prefix
/// matches the requested path; every call is recorded in `requests`.
#[derive(Default)]
pub struct StubApi {
    pub candles: HashMap<String, Vec<Candle>>,
    pub symbols: Vec<SymbolInfo>,
    pub bodies: Vec<(String, String)>,
    pub requests: Mutex<Vec<String>>,
}

impl StubApi {
    pub fn socket_key(key: &str) -> Self {
        Self::default().with_body("/api/amibroker/socketkey", &format!(r#"{{"key":"{key}"}}"#))
    }

    pub fn with_body(mut self, prefix: &str, body: &str) -> Self {
        self.bodies.push((prefix.to_string(), body.to_string()));
        self
    }
}

#[async_trait]
impl MarketApi for StubApi {
    async fn fetch_historical(&self, symbol: &str, _from: NaiveDate, _to: NaiveDate) -> Result<Vec<Candle>> {
        self.requests.lock().push(format!("historical:{symbol}"));
        self.candles
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow!("no history for {symbol}"))
    }

    async fn fetch_symbol_list(&self) -> Result<Vec<SymbolInfo>> {
        self.requests.lock().push("symbols".into());
        Ok(self.symbols.clone())
    }

    async fn get_text(&self, path_and_query: &str) -> Result<String> {
        self.requests.lock().push(path_and_query.to_string());
        self.bodies
            .iter()
            .find(|(prefix, _)| path_and_query.starts_with(prefix.as_str()))
            .map(|(_, body)| body.clone())
            .ok_or_else(|| anyhow!("404 for {path_and_query}"))
    }
}

/// Historical fetches block until `release` is called, one per call.
pub struct GatedApi {
    candles: Vec<Candle>,
    gate: Notify,
}

impl GatedApi {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self {
            candles,
            gate: Notify::new(),
        }
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl MarketApi for GatedApi {
    async fn fetch_historical(&self, _symbol: &str, _from: NaiveDate, _to: NaiveDate) -> Result<Vec<Candle>> {
        self.gate.notified().await;
        Ok(self.candles.clone())
    }

    async fn fetch_symbol_list(&self) -> Result<Vec<SymbolInfo>> {
        Ok(Vec::new())
    }

    async fn get_text(&self, path_and_query: &str) -> Result<String> {
        Err(anyhow!("404 for {path_and_query}"))
    }
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

/// The server end of one mock link.
pub struct MockPeer {
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl MockPeer {
    pub async fn next_outbound(&mut self) -> Outbound {
        tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
            .await
            .expect("no outbound frame in time")
            .expect("client dropped the link")
    }

    pub async fn next_binary(&mut self) -> Vec<u8> {
        match self.next_outbound().await {
            Outbound::Binary(bytes) => bytes,
            Outbound::Close => panic!("expected a binary frame, got close"),
        }
    }
}

/// Hands out pre-built links in order; fails once they run out.
pub struct MockTransport {
    links: Mutex<VecDeque<Link>>,
    pub opened: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn with_links(count: usize) -> (Self, Vec<MockPeer>) {
        let mut links = VecDeque::new();
        let mut peers = Vec::new();
        for _ in 0..count {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            links.push_back(Link {
                outbound: out_tx,
                inbound: in_rx,
            });
            peers.push(MockPeer {
                events: in_tx,
                outbound: out_rx,
            });
        }
        (
            Self {
                links: Mutex::new(links),
                opened: Arc::new(AtomicUsize::new(0)),
            },
            peers,
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, _url: &str) -> FeedResult<Link> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let next = self.links.lock().pop_front();
        next.ok_or_else(|| FeedError::Transport("connection refused".into()))
    }
}
