// =============================================================================
// Order-book client: snapshot + incremental stream for one active symbol
// =============================================================================
//
// `request_ticker` fetches the JSON snapshot and makes the symbol active; the
// supervised socket then streams full-side replacements for it.  The standby
// connection stays up while no symbol is active, and re-subscribes the active
// symbol after every reconnect.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{FeedError, FeedResult};
use crate::market_data::orderbook::parse_stream_body;
use crate::market_data::{OrderbookBook, OrderbookSnapshot};
use crate::notify::{HostEvent, Notifier};
use crate::rest::parse::parse_orderbook_snapshot;
use crate::rest::MarketApi;
use crate::runtime_config::MAX_SYMBOL_LEN;
use crate::stream::proto::{self, ServerFrame};
use crate::stream::supervisor::{Credentials, SessionHandler, SessionSettings, Supervisor};
use crate::stream::transport::Transport;
use crate::types::ConnectionState;

/// Outcome of a ticker request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerStatus {
    /// Snapshot installed, stream subscription requested.
    Ready,
    /// Symbol was already active with a snapshot installed; nothing changed.
    Unchanged,
    /// Not an equity, or not a usable symbol.
    Invalid,
    /// Snapshot could not be fetched or parsed.  The symbol stays active
    /// and subscribed, and a repeat request fetches again.
    Unavailable,
}

pub struct OrderbookHandler {
    book: Arc<OrderbookBook>,
    notifier: Notifier,
}

impl SessionHandler for OrderbookHandler {
    fn subscribe_frames(&self, creds: &Credentials) -> FeedResult<Vec<Vec<u8>>> {
        match self.book.active_symbol() {
            Some(symbol) => Ok(vec![proto::encode_orderbook_subscribe(
                &creds.user_id,
                &creds.key,
                &symbol,
            )?]),
            None => Ok(Vec::new()),
        }
    }

    fn on_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Orderbook(env) => match parse_stream_body(&env.body) {
                Ok(update) => {
                    if self.book.apply_side(&update) {
                        debug!(symbol = %update.symbol, side = %update.side, levels = update.levels.len(), "order-book side replaced");
                        self.notifier.notify(HostEvent::OrderbookUpdated(update.symbol));
                    }
                }
                Err(e) => warn!(symbol = %env.symbol, error = %e, "order-book body rejected"),
            },
            ServerFrame::Tick(tick) => {
                if self.book.apply_tick(&tick) {
                    self.notifier.notify(HostEvent::OrderbookUpdated(tick.symbol));
                }
            }
            ServerFrame::Ack | ServerFrame::Heartbeat => {}
        }
    }
}

pub struct OrderbookClient {
    api: Arc<dyn MarketApi>,
    book: Arc<OrderbookBook>,
    notifier: Notifier,
    supervisor: Supervisor<OrderbookHandler>,
}

impl OrderbookClient {
    pub fn new(
        settings: SessionSettings,
        api: Arc<dyn MarketApi>,
        transport: Arc<dyn Transport>,
        notifier: Notifier,
    ) -> Self {
        let book = Arc::new(OrderbookBook::new());
        let handler = OrderbookHandler {
            book: book.clone(),
            notifier: notifier.clone(),
        };
        Self {
            supervisor: Supervisor::new(settings, api.clone(), transport, Arc::new(handler)),
            api,
            book,
            notifier,
        }
    }

    /// Bring up the standby connection.
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

    pub fn active_symbol(&self) -> Option<String> {
        self.book.active_symbol()
    }

    pub fn snapshot(&self) -> OrderbookSnapshot {
        self.book.snapshot()
    }

    /// End the viewing session.  Later frames for the old symbol are dropped.
    pub fn close_view(&self) {
        self.book.deactivate();
    }

    /// Make `symbol` the active order-book symbol.
    pub async fn request_ticker(&self, symbol: &str) -> TickerStatus {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() || symbol.len() > MAX_SYMBOL_LEN {
            warn!(symbol = %symbol, "unusable order-book symbol");
            self.notifier.notify(HostEvent::OrderbookInvalid(symbol));
            return TickerStatus::Invalid;
        }
        let fresh = self.book.activate(&symbol);
        if !fresh && self.book.is_loaded() {
            return TickerStatus::Unchanged;
        }
        self.notifier.notify(HostEvent::OrderbookLoading(symbol.clone()));

        let body = match self.api.fetch_orderbook_snapshot(&symbol).await {
            Ok(body) => body,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "order-book snapshot fetch failed");
                self.subscribe_active(&symbol);
                return TickerStatus::Unavailable;
            }
        };

        let snapshot = match parse_orderbook_snapshot(&body, &symbol) {
            Ok(snapshot) => snapshot,
            Err(FeedError::InvalidSymbol { symbol, reason }) => {
                info!(symbol = %symbol, reason = %reason, "order-book request rejected");
                self.book.deactivate();
                self.notifier.notify(HostEvent::OrderbookInvalid(symbol));
                return TickerStatus::Invalid;
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "order-book snapshot unreadable");
                self.subscribe_active(&symbol);
                return TickerStatus::Unavailable;
            }
        };

        if !self.book.install_snapshot(snapshot) {
            debug!(symbol = %symbol, "snapshot superseded by a newer request");
            return TickerStatus::Unavailable;
        }
        self.notifier.notify(HostEvent::OrderbookUpdated(symbol.clone()));
        self.subscribe_active(&symbol);
        TickerStatus::Ready
    }

    /// Ask the live session for `symbol`'s side frames.  Without an
    /// acknowledged session this is left to the next subscribe on connect.
    fn subscribe_active(&self, symbol: &str) {
        let Some(creds) = self.supervisor.credentials() else {
            return;
        };
        match proto::encode_orderbook_subscribe(&creds.user_id, &creds.key, symbol) {
            Ok(frame) => {
                if self.supervisor.send(frame) {
                    debug!(symbol = %symbol, "order-book subscribe sent");
                }
            }
            Err(e) => warn!(symbol = %symbol, error = %e, "order-book subscribe not sent"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    use crate::stream::proto::SymbolSubscribe;
    use crate::stream::transport::TransportEvent;
    use crate::test_support::{session_settings, wait_until, MockPeer, MockTransport, StubApi};

    fn snapshot_body(company_type: &str, levels: usize) -> String {
        let ladder = |base: i64, step: i64| {
            (0..levels as i64)
                .map(|i| format!(r#"{{"price":"{}","que_num":"{}","volume":"1,000"}}"#, base + step * i, i + 1))
                .collect::<Vec<_>>()
                .join(",")
        };
        format!(
            r#"{{"data":{{"company_type":"{company_type}","lastprice":9500,"previous":9450,
                "bid":[{}],"offer":[{}],
                "total_bid_offer":{{"bid":{{"freq":"1,200","lot":"45,000"}},"offer":{{"freq":"900","lot":"30,000"}}}}}}}}"#,
            ladder(9_500, -25),
            ladder(9_525, 25)
        )
    }

    fn client(api: StubApi, transport: MockTransport) -> OrderbookClient {
        shared_client(Arc::new(api), transport)
    }

    fn shared_client(api: Arc<StubApi>, transport: MockTransport) -> OrderbookClient {
        let mut settings = session_settings();
        settings.keepalive_message = "PING".into();
        OrderbookClient::new(settings, api, Arc::new(transport), Notifier::new())
    }

    async fn acknowledge(client: &OrderbookClient, peer: &mut MockPeer) {
        peer.events.send(TransportEvent::Open).unwrap();
        peer.next_binary().await;
        peer.events.send(TransportEvent::Frame(proto::encode_ack())).unwrap();
        wait_until(|| client.supervisor.is_acknowledged()).await;
    }

    fn api() -> StubApi {
        StubApi::socket_key("k1")
            .with_body("/api/amibroker/orderbook?symbol=BBCA", &snapshot_body("Saham", 20))
            .with_body("/api/amibroker/orderbook?symbol=WARX", &snapshot_body("Waran", 3))
    }

    #[tokio::test]
    async fn snapshot_then_stream_replaces_side() {
        let (transport, mut peers) = MockTransport::with_links(1);
        let client = client(api(), transport);
        client.start();

        let mut peer = peers.remove(0);
        acknowledge(&client, &mut peer).await;

        assert_eq!(client.request_ticker(" bbca ").await, TickerStatus::Ready);
        let snap = client.snapshot();
        assert_eq!(snap.bids.len(), 20);
        assert_eq!(snap.aggregate.bid_volume, 45_000);

        let sub = SymbolSubscribe::decode(peer.next_binary().await.as_slice()).unwrap();
        assert_eq!(sub.subs.unwrap().orderbook, vec!["BBCA"]);

        let body = "#O|BBCA|BID|9500;3;1200|9475;2;800|9450;1;400|9425;1;100|9400;5;50|1700000000-1300&46000";
        peer.events
            .send(TransportEvent::Frame(proto::encode_orderbook_frame("BBCA", body)))
            .unwrap();
        wait_until(|| client.snapshot().bids.len() == 5).await;
        let snap = client.snapshot();
        assert_eq!(snap.bids[0].lot_change, 200);
        assert_eq!(snap.offers.len(), 20);
        assert_eq!(snap.aggregate.bid_frequency, 1_300);
        assert_eq!(snap.last_update_epoch, 1_700_000_000);

        let stale = "#O|TLKM|BID|3900;1;10";
        peer.events
            .send(TransportEvent::Frame(proto::encode_orderbook_frame("TLKM", stale)))
            .unwrap();
        assert_eq!(client.request_ticker("BBCA").await, TickerStatus::Unchanged);
        assert_eq!(client.snapshot().bids.len(), 5);

        client.stop().await;
    }

    #[tokio::test]
    async fn non_equity_is_invalid() {
        let (transport, _peers) = MockTransport::with_links(0);
        let client = client(api(), transport);
        let mut events = client.notifier.subscribe();

        assert_eq!(client.request_ticker("WARX").await, TickerStatus::Invalid);
        assert_eq!(client.active_symbol(), None);
        assert_eq!(events.recv().await.unwrap(), HostEvent::OrderbookLoading("WARX".into()));
        assert_eq!(events.recv().await.unwrap(), HostEvent::OrderbookInvalid("WARX".into()));
    }

    #[tokio::test]
    async fn missing_snapshot_still_subscribes_and_retries() {
        let (transport, mut peers) = MockTransport::with_links(1);
        let api = Arc::new(api());
        let client = shared_client(api.clone(), transport);
        client.start();
        let mut peer = peers.remove(0);
        acknowledge(&client, &mut peer).await;

        for _ in 0..2 {
            assert_eq!(client.request_ticker("GOTO").await, TickerStatus::Unavailable);
            assert_eq!(client.active_symbol().as_deref(), Some("GOTO"));
            let sub = SymbolSubscribe::decode(peer.next_binary().await.as_slice()).unwrap();
            assert_eq!(sub.subs.unwrap().orderbook, vec!["GOTO"]);
        }
        let fetches = api
            .requests
            .lock()
            .iter()
            .filter(|path| path.as_str() == "/api/amibroker/orderbook?symbol=GOTO")
            .count();
        assert_eq!(fetches, 2);

        let body = "#O|GOTO|OFFER|70;4;9000|71;2;5000";
        peer.events
            .send(TransportEvent::Frame(proto::encode_orderbook_frame("GOTO", body)))
            .unwrap();
        wait_until(|| client.snapshot().offers.len() == 2).await;

        client.stop().await;
    }

    #[tokio::test]
    async fn blank_symbol_is_invalid_and_close_clears_book() {
        let (transport, _peers) = MockTransport::with_links(0);
        let client = client(api(), transport);
        assert_eq!(client.request_ticker("  ").await, TickerStatus::Invalid);

        assert_eq!(client.request_ticker("BBCA").await, TickerStatus::Ready);
        client.close_view();
        assert_eq!(client.active_symbol(), None);
        assert!(client.snapshot().bids.is_empty());
        assert_eq!(client.request_ticker("BBCA").await, TickerStatus::Ready);
    }

    #[tokio::test]
    async fn reconnect_resubscribes_active_symbol() {
        let (transport, mut peers) = MockTransport::with_links(1);
        let client = client(api(), transport);
        assert_eq!(client.request_ticker("BBCA").await, TickerStatus::Ready);
        client.start();

        let mut peer = peers.remove(0);
        peer.events.send(TransportEvent::Open).unwrap();
        let handshake = SymbolSubscribe::decode(peer.next_binary().await.as_slice()).unwrap();
        assert!(handshake.subs.is_none());
        peer.events.send(TransportEvent::Frame(proto::encode_ack())).unwrap();
        let sub = SymbolSubscribe::decode(peer.next_binary().await.as_slice()).unwrap();
        assert_eq!(sub.subs.unwrap().livequote, vec!["BBCA"]);

        client.stop().await;
    }
}
