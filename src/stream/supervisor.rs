// =============================================================================
// Session Supervisor: reconnecting handshake/subscribe/keepalive loop
// =============================================================================
//
// Idle -> Connecting -> Connected -> Disconnected -> (backoff) -> Connecting
//
// One maintenance task per supervisor owns the connection.  After each
// successful handshake acknowledgement a keepalive task is spawned; the
// previous one is always joined first, so at most one keepalive runs.
// Everything the protocol does with frames beyond the handshake is delegated
// to a `SessionHandler`.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{FeedError, FeedResult};
use crate::rest::MarketApi;
use crate::stream::proto::{self, ServerFrame};
use crate::stream::transport::{Link, Outbound, Transport, TransportEvent};
use crate::types::ConnectionState;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Label used in logs.
    pub name: &'static str,
    pub url: String,
    pub user_id: String,
    pub reconnect_backoff: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_message: String,
    pub handshake_timeout: Duration,
    pub handshake_attempts: u32,
}

/// Identity presented in the handshake and subscribe frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub key: String,
}

/// Protocol behaviour layered on top of the supervised connection.
pub trait SessionHandler: Send + Sync + 'static {
    /// Frames to send once the server acknowledged the handshake.
    fn subscribe_frames(&self, creds: &Credentials) -> FeedResult<Vec<Vec<u8>>>;

    /// A decoded tick or order-book frame received after acknowledgement.
    fn on_frame(&self, frame: ServerFrame);

    fn on_state(&self, _state: ConnectionState) {}
}

struct Shared<H> {
    settings: SessionSettings,
    api: Arc<dyn MarketApi>,
    transport: Arc<dyn Transport>,
    handler: Arc<H>,
    running: AtomicBool,
    connected: AtomicBool,
    acknowledged: AtomicBool,
    state: RwLock<ConnectionState>,
    stop_tx: watch::Sender<bool>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    credentials: RwLock<Option<Credentials>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

pub struct Supervisor<H: SessionHandler> {
    shared: Arc<Shared<H>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<H: SessionHandler> Supervisor<H> {
    pub fn new(
        settings: SessionSettings,
        api: Arc<dyn MarketApi>,
        transport: Arc<dyn Transport>,
        handler: Arc<H>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                settings,
                api,
                transport,
                handler,
                running: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                acknowledged: AtomicBool::new(false),
                state: RwLock::new(ConnectionState::Idle),
                stop_tx,
                outbound: Mutex::new(None),
                credentials: RwLock::new(None),
                keepalive: Mutex::new(None),
            }),
            maintenance: Mutex::new(None),
        }
    }

    /// Spawn the maintenance task.  No-op if already running.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.stop_tx.send_replace(false);
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move { shared.maintain().await });
        *self.maintenance.lock() = Some(handle);
        info!(session = self.shared.settings.name, "session supervisor started");
    }

    /// Close the transport, then join the keepalive task, then the
    /// maintenance task.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.stop_tx.send_replace(true);

        let outbound = self.shared.outbound.lock().take();
        if let Some(tx) = outbound {
            let _ = tx.send(Outbound::Close);
        }
        self.shared.connected.store(false, Ordering::SeqCst);

        let keepalive = self.shared.keepalive.lock().take();
        if let Some(handle) = keepalive {
            let _ = handle.await;
        }
        let maintenance = self.maintenance.lock().take();
        if let Some(handle) = maintenance {
            if let Err(e) = handle.await {
                warn!(session = self.shared.settings.name, error = %e, "maintenance task ended abnormally");
            }
        }
        self.shared.set_state(ConnectionState::Idle);
        info!(session = self.shared.settings.name, "session supervisor stopped");
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Connected and the handshake was acknowledged.
    pub fn is_acknowledged(&self) -> bool {
        self.is_connected() && self.shared.acknowledged.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.shared.credentials.read().clone()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.shared.handler
    }

    /// Send a frame on the acknowledged connection.  `false` when there is
    /// none; the next acknowledgement re-subscribes through the handler.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        if !self.is_acknowledged() {
            return false;
        }
        match self.shared.outbound.lock().as_ref() {
            Some(tx) => tx.send(Outbound::Binary(frame)).is_ok(),
            None => false,
        }
    }
}

impl<H: SessionHandler> Shared<H> {
    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut current = self.state.write();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            debug!(session = self.settings.name, state = %state, "connection state");
            self.handler.on_state(state);
        }
    }

    async fn maintain(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            if *stop_rx.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            if let Err(e) = self.connect_once(&mut stop_rx).await {
                warn!(session = self.settings.name, error = %e, "session ended with error");
            }
            self.end_session().await;

            let keep_going = tokio::select! {
                _ = tokio::time::sleep(self.settings.reconnect_backoff) => true,
                _ = stop_rx.wait_for(|stopping| *stopping) => false,
            };
            if !keep_going {
                break;
            }
            debug!(session = self.settings.name, "reconnecting");
        }
        debug!(session = self.settings.name, "maintenance loop exited");
    }

    async fn connect_once(&self, stop_rx: &mut watch::Receiver<bool>) -> FeedResult<()> {
        let key = tokio::select! {
            res = self.api.fetch_socket_key() => res.map_err(|e| FeedError::Fetch(format!("socket key: {e:#}")))?,
            _ = stop_rx.wait_for(|stopping| *stopping) => return Ok(()),
        };
        let creds = Credentials {
            user_id: self.settings.user_id.clone(),
            key,
        };
        *self.credentials.write() = Some(creds.clone());

        let link = tokio::select! {
            res = self.transport.open(&self.settings.url) => res?,
            _ = stop_rx.wait_for(|stopping| *stopping) => return Ok(()),
        };
        self.run_session(link, &creds, stop_rx).await
    }

    fn send_handshake(
        &self,
        outbound: &mpsc::UnboundedSender<Outbound>,
        creds: &Credentials,
    ) -> FeedResult<()> {
        outbound
            .send(Outbound::Binary(proto::encode_handshake(&creds.user_id, &creds.key)))
            .map_err(|_| FeedError::Transport("writer closed before handshake".into()))
    }

    async fn run_session(
        &self,
        link: Link,
        creds: &Credentials,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> FeedResult<()> {
        let Link {
            outbound,
            mut inbound,
        } = link;
        *self.outbound.lock() = Some(outbound.clone());

        // Dropped when this function returns, which ends the keepalive task.
        let (_alive_tx, alive_rx) = watch::channel(());

        let mut acknowledged = false;
        let mut attempts: u32 = 0;
        let mut deadline: Option<Instant> = None;

        loop {
            let handshake_deadline = if acknowledged { None } else { deadline };
            let handshake_wait = async move {
                match handshake_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let event = tokio::select! {
                ev = inbound.recv() => ev,
                _ = stop_rx.wait_for(|stopping| *stopping) => {
                    let _ = outbound.send(Outbound::Close);
                    return Ok(());
                }
                _ = handshake_wait => {
                    if attempts >= self.settings.handshake_attempts {
                        let _ = outbound.send(Outbound::Close);
                        return Err(FeedError::Transport(format!(
                            "handshake not acknowledged after {attempts} attempts"
                        )));
                    }
                    attempts += 1;
                    warn!(session = self.settings.name, attempt = attempts, "handshake not acknowledged, resending");
                    self.send_handshake(&outbound, creds)?;
                    deadline = Some(Instant::now() + self.settings.handshake_timeout);
                    continue;
                }
            };

            let Some(event) = event else {
                return Err(FeedError::Transport("transport link dropped".into()));
            };

            match event {
                TransportEvent::Open => {
                    self.connected.store(true, Ordering::SeqCst);
                    self.set_state(ConnectionState::Connected);
                    info!(session = self.settings.name, url = %self.settings.url, "socket open, sending handshake");
                    self.send_handshake(&outbound, creds)?;
                    attempts = 1;
                    deadline = Some(Instant::now() + self.settings.handshake_timeout);
                }
                TransportEvent::Frame(bytes) => match proto::decode_server_frame(&bytes) {
                    Ok(ServerFrame::Ack) if !acknowledged => {
                        acknowledged = true;
                        self.acknowledged.store(true, Ordering::SeqCst);
                        info!(session = self.settings.name, "handshake acknowledged");

                        match self.handler.subscribe_frames(creds) {
                            Ok(frames) => {
                                let count = frames.len();
                                for frame in frames {
                                    if outbound.send(Outbound::Binary(frame)).is_err() {
                                        return Err(FeedError::Transport(
                                            "writer closed during subscribe".into(),
                                        ));
                                    }
                                }
                                debug!(session = self.settings.name, frames = count, "subscribe sent");
                            }
                            Err(e) => {
                                error!(session = self.settings.name, error = %e, "subscription not sent");
                            }
                        }
                        self.spawn_keepalive(outbound.clone(), alive_rx.clone()).await;
                    }
                    Ok(ServerFrame::Ack) | Ok(ServerFrame::Heartbeat) => {}
                    Ok(frame) if acknowledged => self.handler.on_frame(frame),
                    Ok(_) => {
                        debug!(session = self.settings.name, "frame before handshake acknowledgement ignored");
                    }
                    Err(e) => {
                        warn!(session = self.settings.name, error = %e, bytes = bytes.len(), "dropping undecodable frame");
                    }
                },
                TransportEvent::Closed { code, reason } => {
                    info!(session = self.settings.name, code = ?code, reason = %reason, "socket closed");
                    return Ok(());
                }
                TransportEvent::Error(e) => {
                    return Err(FeedError::Transport(e));
                }
            }
        }
    }

    async fn spawn_keepalive(
        &self,
        outbound: mpsc::UnboundedSender<Outbound>,
        mut alive_rx: watch::Receiver<()>,
    ) {
        let previous = self.keepalive.lock().take();
        if let Some(handle) = previous {
            let _ = handle.await;
        }

        let name = self.settings.name;
        let interval = self.settings.keepalive_interval;
        let frame = proto::encode_ping(&self.settings.keepalive_message);
        let mut stop_rx = self.stop_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if outbound.send(Outbound::Binary(frame.clone())).is_err() {
                            break;
                        }
                        debug!(session = name, "keepalive sent");
                    }
                    _ = alive_rx.changed() => break,
                    _ = stop_rx.wait_for(|stopping| *stopping) => break,
                }
            }
            debug!(session = name, "keepalive exited");
        });
        *self.keepalive.lock() = Some(handle);
    }

    async fn end_session(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.acknowledged.store(false, Ordering::SeqCst);

        let outbound = self.outbound.lock().take();
        if let Some(tx) = outbound {
            let _ = tx.send(Outbound::Close);
        }
        let keepalive = self.keepalive.lock().take();
        if let Some(handle) = keepalive {
            let _ = handle.await;
        }

        self.set_state(ConnectionState::Disconnected);
        if was_connected {
            warn!(session = self.settings.name, backoff_secs = self.settings.reconnect_backoff.as_secs_f64(), "disconnected, will retry");
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

    use crate::stream::proto::WsWrapper;
    use crate::test_support::{session_settings, wait_until, MockTransport, StubApi};

    #[derive(Default)]
    struct RecordingHandler {
        frames: Mutex<Vec<ServerFrame>>,
        states: Mutex<Vec<ConnectionState>>,
    }

    impl SessionHandler for RecordingHandler {
        fn subscribe_frames(&self, _creds: &Credentials) -> FeedResult<Vec<Vec<u8>>> {
            Ok(vec![b"subscribe".to_vec()])
        }

        fn on_frame(&self, frame: ServerFrame) {
            self.frames.lock().push(frame);
        }

        fn on_state(&self, state: ConnectionState) {
            self.states.lock().push(state);
        }
    }

    fn supervisor(transport: MockTransport, attempts: u32) -> Supervisor<RecordingHandler> {
        let mut settings = session_settings();
        settings.handshake_timeout = Duration::from_millis(40);
        settings.handshake_attempts = attempts;
        Supervisor::new(
            settings,
            Arc::new(StubApi::socket_key("k1")),
            Arc::new(transport),
            Arc::new(RecordingHandler::default()),
        )
    }

    #[tokio::test]
    async fn keepalive_pings_after_ack_and_stops_on_close() {
        let (transport, mut peers) = MockTransport::with_links(1);
        let mut settings = session_settings();
        settings.keepalive_interval = Duration::from_millis(30);
        settings.reconnect_backoff = Duration::from_secs(5);
        let sup = Supervisor::new(
            settings,
            Arc::new(StubApi::socket_key("k1")),
            Arc::new(transport),
            Arc::new(RecordingHandler::default()),
        );
        sup.start();

        let mut peer = peers.remove(0);
        peer.events.send(TransportEvent::Open).unwrap();
        peer.next_binary().await;
        peer.events.send(TransportEvent::Frame(proto::encode_ack())).unwrap();
        assert_eq!(peer.next_binary().await, b"subscribe".to_vec());

        let ping = WsWrapper::decode(peer.next_binary().await.as_slice()).unwrap();
        assert_eq!(ping.ping.unwrap().message, "ping");

        peer.events
            .send(TransportEvent::Closed {
                code: Some(1000),
                reason: "bye".into(),
            })
            .unwrap();
        wait_until(|| sup.state() == ConnectionState::Disconnected).await;
        assert!(sup.shared.keepalive.lock().is_none());
        while peer.outbound.try_recv().is_ok() {}

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!matches!(peer.outbound.try_recv(), Ok(Outbound::Binary(_))));

        sup.stop().await;
    }

    #[tokio::test]
    async fn unacknowledged_handshake_is_retried_then_dropped() {
        let (transport, mut peers) = MockTransport::with_links(2);
        let opened = transport.opened.clone();
        let sup = supervisor(transport, 2);
        sup.start();

        let mut first = peers.remove(0);
        first.events.send(TransportEvent::Open).unwrap();
        let one = first.next_outbound().await;
        let two = first.next_outbound().await;
        assert_eq!(one, two);
        assert!(matches!(one, Outbound::Binary(_)));
        assert_eq!(first.next_outbound().await, Outbound::Close);

        wait_until(|| opened.load(Ordering::SeqCst) >= 2).await;
        sup.stop().await;
        assert_eq!(sup.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn frames_before_ack_are_ignored() {
        let (transport, mut peers) = MockTransport::with_links(1);
        let sup = supervisor(transport, 3);
        sup.start();

        let mut peer = peers.remove(0);
        peer.events.send(TransportEvent::Open).unwrap();
        peer.next_binary().await;

        let tick = proto::encode_feed(proto::StockData {
            symbol: "BBCA".into(),
            lastprice: 9_100.0,
            ..proto::StockData::default()
        });
        peer.events.send(TransportEvent::Frame(tick.clone())).unwrap();
        peer.events.send(TransportEvent::Frame(vec![0xff, 0xff])).unwrap();
        peer.events.send(TransportEvent::Frame(proto::encode_ack())).unwrap();
        assert_eq!(peer.next_binary().await, b"subscribe".to_vec());
        assert!(sup.is_acknowledged());

        peer.events.send(TransportEvent::Frame(tick)).unwrap();
        wait_until(|| sup.handler().frames.lock().len() == 1).await;
        assert!(matches!(sup.handler().frames.lock()[0], ServerFrame::Tick(_)));
        assert_eq!(sup.credentials().unwrap().key, "k1");

        sup.stop().await;
        let states = sup.handler().states.lock().clone();
        assert_eq!(states.first(), Some(&ConnectionState::Connecting));
        assert!(states.contains(&ConnectionState::Connected));
        assert_eq!(states.last(), Some(&ConnectionState::Idle));
    }

    #[tokio::test]
    async fn send_requires_acknowledged_session() {
        let (transport, mut peers) = MockTransport::with_links(1);
        let sup = supervisor(transport, 3);
        assert!(!sup.send(b"x".to_vec()));
        sup.start();

        let mut peer = peers.remove(0);
        peer.events.send(TransportEvent::Open).unwrap();
        peer.next_binary().await;
        wait_until(|| sup.is_connected()).await;
        assert!(!sup.send(b"x".to_vec()));

        peer.events.send(TransportEvent::Frame(proto::encode_ack())).unwrap();
        peer.next_binary().await;
        wait_until(|| sup.is_acknowledged()).await;
        assert!(sup.send(b"extra".to_vec()));
        assert_eq!(peer.next_binary().await, b"extra".to_vec());

        sup.stop().await;
        assert!(!sup.is_connected());
    }
}
