// =============================================================================
// REST API Client: historical bars, listings, key exchange, snapshots
// =============================================================================
//
// Every request shares one reqwest client with a fixed connect/receive
// timeout.  A non-2xx status or an empty body is an error; callers decide
// how an error degrades (empty result, retry on next access).
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{debug, instrument};

use crate::rest::parse;
use crate::types::{Candle, SymbolInfo};

const USER_AGENT: &str = "ValkyrieDataFeed/1.0";

/// HTTP collaborator consumed by the fetch worker and the streaming clients.
///
/// Implementors only provide the three primitives; endpoint-specific calls
/// are built on top of `get_text`.
#[async_trait]
pub trait MarketApi: Send + Sync {
    async fn fetch_historical(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Candle>>;

    async fn fetch_symbol_list(&self) -> Result<Vec<SymbolInfo>>;

    /// GET `path_and_query` relative to the configured host.
    async fn get_text(&self, path_and_query: &str) -> Result<String>;

    /// Short-lived key required by the socket handshake.
    async fn fetch_socket_key(&self) -> Result<String> {
        let body = self.get_text("/api/amibroker/socketkey").await?;
        parse::parse_socket_key(&body).context("socket key response has no key")
    }

    async fn fetch_orderbook_snapshot(&self, symbol: &str) -> Result<String> {
        self.get_text(&format!("/api/amibroker/orderbook?symbol={symbol}"))
            .await
    }
}

/// reqwest-backed implementation of [`MarketApi`].
#[derive(Clone)]
pub struct HttpApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpApiClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl HttpApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "HttpApiClient initialised");
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl MarketApi for HttpApiClient {
    #[instrument(skip(self), name = "rest::fetch_historical")]
    async fn fetch_historical(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Candle>> {
        let path = format!(
            "/api/amibroker/historical?symbol={}&from={}&to={}",
            symbol,
            from.format("%Y-%m-%d"),
            to.format("%Y-%m-%d")
        );
        let body = self.get_text(&path).await?;
        let candles = parse::parse_historical(&body)
            .with_context(|| format!("historical payload for {symbol}"))?;

        debug!(symbol, count = candles.len(), "historical fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "rest::fetch_symbol_list")]
    async fn fetch_symbol_list(&self) -> Result<Vec<SymbolInfo>> {
        let body = self.get_text("/api/amibroker/emitenlist").await?;
        let symbols = parse::parse_symbol_list(&body)?;
        debug!(count = symbols.len(), "symbol list fetched");
        Ok(symbols)
    }

    async fn get_text(&self, path_and_query: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, path_and_query);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path_and_query} request failed"))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .with_context(|| format!("failed to read body of GET {path_and_query}"))?;

        if !status.is_success() {
            anyhow::bail!("GET {} returned {}: {}", path_and_query, status, body);
        }
        if body.trim().is_empty() {
            anyhow::bail!("GET {} returned an empty body", path_and_query);
        }
        Ok(body)
    }
}
