use dl_protocol::{close_codes, is_protected};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Fixed rate-limit window per peer.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);
/// Envelope ceiling within one window.
pub const RATE_CEILING: u32 = 50;
/// Stale buckets are collected on this cadence.
pub const BUCKET_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Outbound queue depth per peer.  Overflow means the peer has stopped
/// reading; copies destined for it are dropped, never queued unboundedly.
const MAILBOX_DEPTH: usize = 256;

pub const REPLACED_REASON: &str = "Replaced by new connection";

/// Commands delivered to the task that owns a peer's socket.  All writes to
/// a peer funnel through its mailbox so concurrent fan-outs cannot
/// interleave partial frames.
#[derive(Debug)]
pub enum PeerCommand {
    /// Write one serialized envelope.
    Send(String),
    /// Send a close frame and end the session.
    Close { code: u16, reason: &'static str },
}

/// Registry entry for a live peer.  `conn_id` distinguishes successive
/// connections claiming the same identity.
#[derive(Clone)]
pub struct PeerHandle {
    pub conn_id: Uuid,
    pub mailbox: mpsc::Sender<PeerCommand>,
}

pub enum RegisterOutcome {
    /// Installed.  `clients` is the registry snapshot including the
    /// newcomer; `evicted` is true when an incumbent was displaced.
    Registered { clients: Vec<String>, evicted: bool },
    /// A protected identity is already held; the newcomer must be refused.
    ProtectedInUse,
}

struct RateBucket {
    count: u32,
    window_start: Instant,
}

#[derive(Default)]
pub struct BrokerMetrics {
    pub total_connections: AtomicU64,
    pub messages_total: AtomicU64,
}

#[derive(Clone)]
pub struct AppState {
    peers: Arc<Mutex<HashMap<String, PeerHandle>>>,
    buckets: Arc<Mutex<HashMap<String, RateBucket>>>,
    by_type: Arc<Mutex<HashMap<String, u64>>>,
    pub metrics: Arc<BrokerMetrics>,
    started: Instant,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            buckets: Arc::new(Mutex::new(HashMap::new())),
            by_type: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(BrokerMetrics::default()),
            started: Instant::now(),
        }
    }

    /// Opens a mailbox for a connection about to register.
    pub fn open_mailbox() -> (mpsc::Sender<PeerCommand>, mpsc::Receiver<PeerCommand>) {
        mpsc::channel(MAILBOX_DEPTH)
    }

    /// Installs `handle` under `id`, applying the protected-identity policy:
    /// a held protected name refuses the newcomer; a held ordinary name
    /// evicts the incumbent with close code 4002.  The eviction close is
    /// sent outside the registry lock.
    pub async fn register(&self, id: &str, handle: PeerHandle) -> RegisterOutcome {
        let (prior, clients) = {
            let mut peers = self.peers.lock().await;
            if peers.contains_key(id) && is_protected(id) {
                return RegisterOutcome::ProtectedInUse;
            }
            let prior = peers.insert(id.to_owned(), handle);
            let mut clients: Vec<String> = peers.keys().cloned().collect();
            clients.sort();
            (prior, clients)
        };
        let evicted = prior.is_some();
        if let Some(prior) = prior {
            let _ = prior
                .mailbox
                .send(PeerCommand::Close {
                    code: close_codes::REPLACED,
                    reason: REPLACED_REASON,
                })
                .await;
        }
        RegisterOutcome::Registered { clients, evicted }
    }

    /// Removes the record for `id` only when `conn_id` still owns it, so a
    /// replaced connection's late close cannot deregister its successor.
    pub async fn unregister(&self, id: &str, conn_id: Uuid) -> bool {
        let mut peers = self.peers.lock().await;
        match peers.get(id) {
            Some(handle) if handle.conn_id == conn_id => {
                peers.remove(id);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, id: &str) -> Option<PeerHandle> {
        self.peers.lock().await.get(id).cloned()
    }

    /// Point-in-time copy of the registry for fan-out.  Delivery happens on
    /// the snapshot; a peer registering mid-fan-out may miss the copy.
    pub async fn snapshot(&self) -> Vec<(String, PeerHandle)> {
        self.peers
            .lock()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    pub async fn client_list(&self) -> Vec<String> {
        let mut clients: Vec<String> = self.peers.lock().await.keys().cloned().collect();
        clients.sort();
        clients
    }

    /// Posts a close command to every registered peer.  Used by the
    /// shutdown coordinator.  Sends are non-blocking so one stuck peer
    /// cannot hold up the close of every other; a peer with a full mailbox
    /// is cut off by the drain deadline instead.
    pub async fn close_all(&self, code: u16, reason: &'static str) {
        for (id, handle) in self.snapshot().await {
            match handle.mailbox.try_send(PeerCommand::Close { code, reason }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(peer = %id, "peer mailbox full, skipping close frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    // -- rate limiting ------------------------------------------------------

    /// Counts one envelope against `id`'s window.  Returns false once the
    /// ceiling is exceeded; the window resets [`RATE_WINDOW`] after its
    /// first envelope.
    pub async fn check_rate(&self, id: &str) -> bool {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(id.to_owned()).or_insert(RateBucket {
            count: 0,
            window_start: now,
        });
        if now.duration_since(bucket.window_start) >= RATE_WINDOW {
            bucket.count = 0;
            bucket.window_start = now;
        }
        bucket.count += 1;
        bucket.count <= RATE_CEILING
    }

    pub async fn drop_bucket(&self, id: &str) {
        self.buckets.lock().await.remove(id);
    }

    /// Removes buckets whose window closed more than one window ago,
    /// bounding memory for transient peers.  Returns the number removed.
    pub async fn sweep_buckets(&self) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        let now = Instant::now();
        buckets.retain(|_, bucket| now.duration_since(bucket.window_start) < 2 * RATE_WINDOW);
        before - buckets.len()
    }

    pub fn spawn_bucket_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(BUCKET_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = state.sweep_buckets().await;
                if removed > 0 {
                    debug!(removed, "swept stale rate buckets");
                }
            }
        })
    }

    // -- metrics ------------------------------------------------------------

    pub fn record_connection(&self) {
        self.metrics.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn record_envelope(&self, tag: &str) {
        self.metrics.messages_total.fetch_add(1, Ordering::Relaxed);
        *self.by_type.lock().await.entry(tag.to_owned()).or_insert(0) += 1;
    }

    pub async fn message_counts(&self) -> (u64, BTreeMap<String, u64>) {
        let by_type = self
            .by_type
            .lock()
            .await
            .iter()
            .map(|(tag, count)| (tag.clone(), *count))
            .collect();
        (self.metrics.messages_total.load(Ordering::Relaxed), by_type)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}
