//! Peer population store: every discovered peer with freshness and trust.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::transport::{AddrInfo, PeerId};

use super::discovery::{instant_after, DiscoveredPeer, Scope};

/// Records below this reliability are eligible for eviction once stale.
pub const LOW_TRUST_THRESHOLD: f64 = 0.3;

/// Reliability assigned to a newly discovered peer.
pub const INITIAL_RELIABILITY: f64 = 0.5;

const CONNECT_REWARD: f64 = 0.1;
const UNREACHABLE_PENALTY: f64 = 0.2;

/// Connection status of a known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// Never dialed.
    Unknown,
    /// Believed reachable but not currently connected.
    Connectable,
    /// Last dial failed.
    Unreachable,
    /// Live connection.
    Connected,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerStatus::Unknown => "unknown",
            PeerStatus::Connectable => "connectable",
            PeerStatus::Unreachable => "unreachable",
            PeerStatus::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Everything known about one peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Peer identity.
    pub id: PeerId,
    /// Union of all addresses ever reported for this peer.
    pub addrs: BTreeSet<SocketAddr>,
    /// First sighting.
    pub first_seen: Instant,
    /// Most recent (re)discovery or status update.
    pub last_seen: Instant,
    /// Mechanism that last reported the peer.
    pub source: String,
    /// Connection status.
    pub status: PeerStatus,
    /// Running connectability estimate in `[0.0, 1.0]`.
    pub reliability: f64,
    /// Advertised capability names.
    pub services: BTreeSet<String>,
    /// Last connection error, if any.
    pub last_error: Option<String>,
    /// Number of successful connections.
    pub connect_count: u32,
}

impl PeerRecord {
    fn new(peer: &DiscoveredPeer, source: &str, now: Instant) -> Self {
        Self {
            id: peer.id(),
            addrs: peer.info.addrs.clone(),
            first_seen: now,
            last_seen: now,
            source: source.to_owned(),
            status: PeerStatus::Unknown,
            reliability: INITIAL_RELIABILITY,
            services: peer.services.clone(),
            last_error: None,
            connect_count: 0,
        }
    }

    fn merge(&mut self, peer: &DiscoveredPeer, source: &str, now: Instant) {
        self.addrs.extend(peer.info.addrs.iter().copied());
        self.services.extend(peer.services.iter().cloned());
        self.last_seen = now;
        if self.source != source {
            self.source = source.to_owned();
        }
    }

    fn apply_status(&mut self, status: PeerStatus, error: Option<String>, now: Instant) {
        match status {
            PeerStatus::Connected => {
                self.connect_count = self.connect_count.saturating_add(1);
                self.reliability = (self.reliability + CONNECT_REWARD).min(1.0);
            }
            PeerStatus::Unreachable => {
                self.reliability = (self.reliability - UNREACHABLE_PENALTY).max(0.0);
            }
            PeerStatus::Unknown | PeerStatus::Connectable => {}
        }
        self.status = status;
        self.last_error = error;
        self.last_seen = now;
    }

    /// Stale beyond `retention` and below the trust threshold.
    pub fn is_evictable(&self, now: Instant, retention: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > retention
            && self.reliability < LOW_TRUST_THRESHOLD
    }

    /// The peer's address info.
    pub fn addr_info(&self) -> AddrInfo {
        AddrInfo {
            id: self.id,
            addrs: self.addrs.clone(),
        }
    }
}

/// Outcome of [`PeerStore::add_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// First sighting.
    Inserted,
    /// Merged into an existing record.
    Updated,
    /// Store is at capacity and the peer is new.
    Rejected,
}

/// Store limits and eviction policy.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Hard cap on distinct peers. New identities are rejected when full.
    pub max_peers: usize,
    /// How long a record survives without being seen before it may be evicted.
    pub retention: Duration,
    /// How often the eviction sweep runs.
    pub eviction_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_peers: 1000,
            retention: Duration::from_secs(600),
            eviction_interval: Duration::from_secs(600),
        }
    }
}

/// Thread-safe record of every discovered peer.
///
/// One reader/writer lock guards the map; no awaiting happens while it is
/// held, so every mutation is a single atomic step.
#[derive(Debug, Default)]
pub struct PeerStore {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
    config: StoreConfig,
}

impl PeerStore {
    /// Create an empty store.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Insert a new peer or merge into the existing record.
    pub async fn add_or_update(&self, peer: &DiscoveredPeer, source: &str) -> Upsert {
        let now = Instant::now();
        let mut peers = self.peers.write().await;
        if let Some(existing) = peers.get_mut(&peer.id()) {
            existing.merge(peer, source, now);
            trace!(peer = %peer.id(), source, addrs = existing.addrs.len(), "updated peer");
            return Upsert::Updated;
        }
        if peers.len() >= self.config.max_peers {
            debug!(peer = %peer.id(), source, max = self.config.max_peers, "peer store full, dropping new peer");
            return Upsert::Rejected;
        }
        peers.insert(peer.id(), PeerRecord::new(peer, source, now));
        Upsert::Inserted
    }

    /// Snapshot of every record.
    pub async fn get_all(&self) -> Vec<PeerRecord> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Snapshot of one record.
    pub async fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.read().await.get(id).cloned()
    }

    /// Records whose status is any of `statuses`.
    pub async fn get_by_status(&self, statuses: &[PeerStatus]) -> Vec<PeerRecord> {
        self.peers
            .read()
            .await
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect()
    }

    /// Peers that are connected or believed connectable.
    pub async fn connectable(&self) -> Vec<PeerRecord> {
        self.get_by_status(&[PeerStatus::Connectable, PeerStatus::Connected])
            .await
    }

    /// Feed a connection outcome back into a record.
    ///
    /// Returns `false` if the peer is unknown.
    pub async fn update_status(
        &self,
        id: &PeerId,
        status: PeerStatus,
        error: Option<String>,
    ) -> bool {
        let now = Instant::now();
        let mut peers = self.peers.write().await;
        match peers.get_mut(id) {
            Some(record) => {
                record.apply_status(status, error, now);
                trace!(peer = %id, %status, reliability = record.reliability, "peer status updated");
                true
            }
            None => false,
        }
    }

    /// Remove stale, low-trust records. Returns the number removed.
    pub async fn evict(&self) -> usize {
        let now = Instant::now();
        let retention = self.config.retention;
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|_, record| !record.is_evictable(now, retention));
        let removed = before - peers.len();
        let remaining = peers.len();
        drop(peers);
        if removed > 0 {
            info!(removed, remaining, "evicted stale low-trust peers");
        } else {
            debug!(removed, remaining, "eviction pass removed nothing");
        }
        removed
    }

    /// Run [`evict`](Self::evict) every `eviction_interval` until `scope` is cancelled.
    pub async fn run_eviction(&self, scope: Scope) {
        let period = self.config.eviction_interval;
        let mut interval = time::interval_at(instant_after(period), period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = scope.cancelled() => {
                    debug!("peer eviction loop stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.evict().await;
                }
            }
        }
    }

    /// Number of records.
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}
