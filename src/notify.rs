// =============================================================================
// Host notification sink
// =============================================================================
//
// The host never gets called directly from a worker task.  Every state change
// is posted onto a broadcast channel that the host selects on; posting never
// blocks and a missing subscriber is not an error.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::types::ConnectionState;

const CHANNEL_CAPACITY: usize = 256;

/// Signals posted to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// Cached bars, live ticks or side data changed.
    DataChanged,
    StreamStatus(ConnectionState),
    OrderbookLoading(String),
    OrderbookUpdated(String),
    OrderbookInvalid(String),
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<HostEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.tx.subscribe()
    }

    pub fn notify(&self, event: HostEvent) {
        // No receivers is fine: the host may not be listening yet.
        let _ = self.tx.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Leading-edge rate limiter for high-frequency notifications.
pub struct Throttle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Returns `true` if the caller may fire now, and records the firing.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        match *last {
            Some(prev) if now.duration_since(prev) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
