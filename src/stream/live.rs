// =============================================================================
// Live-quote streaming client
// =============================================================================
//
// Subscribes the configured symbol list after every acknowledged handshake
// and writes decoded ticks into the market-data store.  Host notifications
// are throttled; the store itself always receives every tick.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::FeedResult;
use crate::market_data::MarketDataStore;
use crate::notify::{HostEvent, Notifier, Throttle};
use crate::rest::MarketApi;
use crate::stream::proto::{self, ServerFrame};
use crate::stream::supervisor::{Credentials, SessionHandler, SessionSettings, Supervisor};
use crate::stream::transport::Transport;
use crate::types::ConnectionState;

pub struct LiveQuoteHandler {
    symbols: Vec<String>,
    max_per_frame: usize,
    store: Arc<MarketDataStore>,
    notifier: Notifier,
    throttle: Throttle,
}

impl SessionHandler for LiveQuoteHandler {
    fn subscribe_frames(&self, creds: &Credentials) -> FeedResult<Vec<Vec<u8>>> {
        proto::encode_livequote_subscribe(&creds.user_id, &creds.key, &self.symbols, self.max_per_frame)
    }

    fn on_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Tick(tick) => {
                trace!(symbol = %tick.symbol, last = tick.last_price, "tick");
                self.store.update_live_tick(tick);
                if self.throttle.allow() {
                    self.notifier.notify(HostEvent::DataChanged);
                }
            }
            ServerFrame::Orderbook(env) => {
                debug!(symbol = %env.symbol, "order-book frame on live-quote session ignored");
            }
            ServerFrame::Ack | ServerFrame::Heartbeat => {}
        }
    }

    fn on_state(&self, state: ConnectionState) {
        self.notifier.notify(HostEvent::StreamStatus(state));
    }
}

/// Reconnecting live-quote client.
pub struct StreamingClient {
    supervisor: Supervisor<LiveQuoteHandler>,
}

impl StreamingClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: SessionSettings,
        symbols: &[String],
        max_per_frame: usize,
        api: Arc<dyn MarketApi>,
        transport: Arc<dyn Transport>,
        store: Arc<MarketDataStore>,
        notifier: Notifier,
        notify_interval: Duration,
    ) -> Self {
        let symbols = symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .collect();
        let handler = LiveQuoteHandler {
            symbols,
            max_per_frame,
            store,
            notifier,
            throttle: Throttle::new(notify_interval),
        };
        Self {
            supervisor: Supervisor::new(settings, api, transport, Arc::new(handler)),
        }
    }

    pub fn start(&self) {
        self.supervisor.start();
    }

    pub async fn stop(&self) {
        self.supervisor.stop().await;
    }

    pub fn is_connected(&self) -> bool {
        self.supervisor.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn symbols(&self) -> &[String] {
        &self.supervisor.handler().symbols
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
