// =============================================================================
// Fetch Coordinator: single-flight queue drained by one worker task
// =============================================================================
//
// One lock guards the pending queue, its key set and the in-flight set, so a
// key moves from "queued" to "in flight" atomically.  The worker takes tasks
// in submission order and pauses for a fixed delay between tasks; that pause
// is the only rate limit against the upstream API.
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fetch::handlers::FetchHandlers;
use crate::fetch::task::FetchTask;
use crate::notify::{HostEvent, Notifier};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<FetchTask>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
}

struct Shared {
    queue: Mutex<QueueState>,
    wake: Notify,
    stop_tx: watch::Sender<bool>,
    running: AtomicBool,
    handlers: FetchHandlers,
    notifier: Notifier,
    delay: Duration,
}

pub struct FetchCoordinator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FetchCoordinator {
    pub fn new(handlers: FetchHandlers, notifier: Notifier, delay: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                stop_tx,
                running: AtomicBool::new(false),
                handlers,
                notifier,
                delay,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Queue `task` unless its dedup key is already queued or in flight.
    /// `false` means "already being handled", not failure.
    pub fn submit(&self, task: FetchTask) -> bool {
        let key = task.dedup_key();
        {
            let mut q = self.shared.queue.lock();
            if q.in_flight.contains(&key) || q.queued.contains(&key) {
                debug!(key = %key, "fetch already pending, submission ignored");
                return false;
            }
            q.queued.insert(key.clone());
            q.pending.push_back(task);
        }
        self.shared.wake.notify_one();
        debug!(key = %key, "fetch queued");
        true
    }

    /// Spawn the worker.  No-op while it is already running.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.stop_tx.send_replace(false);
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move { shared.worker_loop().await });
        *self.worker.lock() = Some(handle);
        info!(delay_ms = self.shared.delay.as_millis() as u64, "fetch worker started");
    }

    /// Signal the worker and wait for it to exit.  A task already executing
    /// runs to completion; queued tasks stay queued.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.stop_tx.send_replace(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "fetch worker ended abnormally");
            }
        }
        info!("fetch worker stopped");
    }

    pub fn is_pending(&self, key: &str) -> bool {
        let q = self.shared.queue.lock();
        q.queued.contains(key) || q.in_flight.contains(key)
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.shared.queue.lock().in_flight.contains(key)
    }

    pub fn pending_len(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    /// Nothing queued and nothing executing.
    pub fn is_idle(&self) -> bool {
        let q = self.shared.queue.lock();
        q.pending.is_empty() && q.in_flight.is_empty()
    }
}

impl Shared {
    async fn worker_loop(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();

        while let Some((key, task)) = self.next_task(&mut stop_rx).await {
            debug!(key = %key, "fetch started");
            let written = self.handlers.run(task).await;
            self.queue.lock().in_flight.remove(&key);
            self.notifier.notify(HostEvent::DataChanged);
            debug!(key = %key, written, "fetch finished");

            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = stop_rx.wait_for(|stopping| *stopping) => break,
            }
        }
        debug!("fetch worker loop exited");
    }

    /// Wait for a task, moving its key into the in-flight set.  `None` once
    /// a stop is requested.
    async fn next_task(&self, stop_rx: &mut watch::Receiver<bool>) -> Option<(String, FetchTask)> {
        loop {
            if *stop_rx.borrow() {
                return None;
            }
            {
                let mut q = self.queue.lock();
                if let Some(task) = q.pending.pop_front() {
                    let key = task.dedup_key();
                    q.queued.remove(&key);
                    q.in_flight.insert(key.clone());
                    return Some((key, task));
                }
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = stop_rx.wait_for(|stopping| *stopping) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
