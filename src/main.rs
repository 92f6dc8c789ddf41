// =============================================================================
// Valkyrie Data Feed: Main Entry Point
// =============================================================================
//
// Headless runner: brings up the fetch worker and both sockets, warms the
// cache for the configured symbols and logs host events until Ctrl+C.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use valkyrie_datafeed::notify::HostEvent;
use valkyrie_datafeed::rest::HttpApiClient;
use valkyrie_datafeed::stream::WsTransport;
use valkyrie_datafeed::{FeedContext, RuntimeConfig};

const CONFIG_PATH: &str = "valkyrie_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Valkyrie Data Feed starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        let config = RuntimeConfig::default();
        if let Err(e) = config.save(CONFIG_PATH) {
            warn!(error = %e, "Failed to write default config");
        }
        config
    });
    config.apply_env();
    config.validate()?;

    info!(host = %config.host, socket = %config.socket_url, symbols = ?config.symbols, "Configuration resolved");

    // ── 2. Collaborators & context ───────────────────────────────────────
    let api = Arc::new(HttpApiClient::new(
        config.host.clone(),
        Duration::from_secs(config.http_timeout_secs),
    )?);
    let ctx = Arc::new(FeedContext::new(config, api, Arc::new(WsTransport)));

    // ── 3. Host event log ────────────────────────────────────────────────
    let mut events = ctx.notifier.subscribe();
    let event_ctx = ctx.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(HostEvent::DataChanged) => {
                    for symbol in &event_ctx.config.symbols {
                        let bars = event_ctx.quotes(symbol, &[]);
                        if let Some(tick) = event_ctx.recent_info(symbol) {
                            debug!(symbol = %symbol, bars = bars.len(), last = tick.last_price, "data changed");
                        }
                    }
                }
                Ok(HostEvent::StreamStatus(state)) => info!(state = %state, "stream status"),
                Ok(HostEvent::OrderbookLoading(symbol)) => info!(symbol = %symbol, "order book loading"),
                Ok(HostEvent::OrderbookUpdated(symbol)) => debug!(symbol = %symbol, "order book updated"),
                Ok(HostEvent::OrderbookInvalid(symbol)) => warn!(symbol = %symbol, "order book rejected symbol"),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "host event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── 4. Start services & warm cache ───────────────────────────────────
    ctx.start();

    for symbol in &ctx.config.symbols {
        ctx.quotes(symbol, &[]);
    }
    if let Some(first) = ctx.config.symbols.first() {
        let status = ctx.orderbook.request_ticker(first).await;
        info!(symbol = %first, status = ?status, "order book requested");
    }

    match ctx.symbol_list().await {
        Ok(list) => info!(count = list.len(), "symbol list loaded"),
        Err(e) => error!(error = %e, "symbol list unavailable"),
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping");
    ctx.shutdown().await;
    if let Err(e) = ctx.config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }
    info!("Valkyrie Data Feed shut down complete.");
    Ok(())
}
