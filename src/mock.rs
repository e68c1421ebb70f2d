//! In-memory transport, local swarm and routing table for tests and simulations.
//!
//! These let the coordinator and every mechanism run without sockets while
//! controlling reachability, latency, and lookup results.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use iroh::discovery::{Discovery as LocalSwarm, DiscoveryItem, NodeData, NodeInfo, UserData};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::swarm::dht::{ProviderStream, RoutingTable};
use crate::swarm::record::ProviderRecord;
use crate::transport::{AddrInfo, Connectedness, PeerId, Transport};
use crate::{Error, Result};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct TransportState {
    reachable: HashSet<PeerId>,
    connected: HashSet<PeerId>,
    known: HashMap<PeerId, BTreeSet<SocketAddr>>,
    attempts: Vec<(PeerId, Instant)>,
    connect_delay: Duration,
}

/// Simulated transport. Peers are unreachable until marked otherwise.
pub struct MockTransport {
    id: PeerId,
    addrs: Vec<SocketAddr>,
    state: Mutex<TransportState>,
}

impl MockTransport {
    /// Transport for the node `id`.
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            addrs: Vec::new(),
            state: Mutex::new(TransportState::default()),
        }
    }

    /// Set this node's own addresses.
    pub fn with_addrs(mut self, addrs: Vec<SocketAddr>) -> Self {
        self.addrs = addrs;
        self
    }

    /// Make dials to `id` succeed or fail.
    pub fn set_reachable(&self, id: PeerId, reachable: bool) {
        let mut state = lock(&self.state);
        if reachable {
            state.reachable.insert(id);
        } else {
            state.reachable.remove(&id);
        }
    }

    /// Delay every dial by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.state).connect_delay = delay;
    }

    /// Simulate a dropped connection.
    pub fn disconnect(&self, id: &PeerId) {
        lock(&self.state).connected.remove(id);
    }

    /// Put a peer into the address book.
    pub fn add_known(&self, info: &AddrInfo) {
        lock(&self.state)
            .known
            .entry(info.id)
            .or_default()
            .extend(info.addrs.iter().copied());
    }

    /// Every dial so far, with the time it started.
    pub fn attempts(&self) -> Vec<(PeerId, Instant)> {
        lock(&self.state).attempts.clone()
    }

    /// Dial start times for one peer.
    pub fn attempts_for(&self, id: &PeerId) -> Vec<Instant> {
        lock(&self.state)
            .attempts
            .iter()
            .filter(|(p, _)| p == id)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn local_id(&self) -> PeerId {
        self.id
    }

    fn local_addrs(&self) -> Vec<SocketAddr> {
        self.addrs.clone()
    }

    async fn known_peers(&self) -> Vec<AddrInfo> {
        lock(&self.state)
            .known
            .iter()
            .map(|(id, addrs)| AddrInfo {
                id: *id,
                addrs: addrs.clone(),
            })
            .collect()
    }

    async fn connect(&self, info: &AddrInfo) -> Result<()> {
        let delay = {
            let mut state = lock(&self.state);
            state.attempts.push((info.id, Instant::now()));
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = lock(&self.state);
        if state.reachable.contains(&info.id) {
            state.connected.insert(info.id);
            state
                .known
                .entry(info.id)
                .or_default()
                .extend(info.addrs.iter().copied());
            Ok(())
        } else {
            Err(Error::connection(format!("{} unreachable", info.id)))
        }
    }

    async fn connectedness(&self, id: &PeerId) -> Connectedness {
        if lock(&self.state).connected.contains(id) {
            Connectedness::Connected
        } else {
            Connectedness::NotConnected
        }
    }
}

/// Simulated local-network swarm. Announcements reach every subscriber.
#[derive(Debug)]
pub struct MockLocalSwarm {
    events: Mutex<Option<broadcast::Sender<DiscoveryItem>>>,
    published: Mutex<Vec<NodeData>>,
}

impl MockLocalSwarm {
    /// An open swarm with no announcements.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events: Mutex::new(Some(events)),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Deliver an announcement from `info`, optionally carrying user data.
    pub fn announce(&self, info: &AddrInfo, user_data: Option<&str>) {
        let user_data = user_data.and_then(|s| s.parse::<UserData>().ok());
        let node = NodeInfo::new(info.id)
            .with_direct_addresses(info.addrs.clone())
            .with_user_data(user_data);
        if let Some(events) = lock(&self.events).as_ref() {
            let _ = events.send(DiscoveryItem::new(node, "mock", None));
        }
    }

    /// End every subscription.
    pub fn close(&self) {
        lock(&self.events).take();
    }

    /// Node data published so far.
    pub fn published(&self) -> Vec<NodeData> {
        lock(&self.published).clone()
    }
}

impl Default for MockLocalSwarm {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSwarm for MockLocalSwarm {
    fn publish(&self, data: &NodeData) {
        lock(&self.published).push(data.clone());
    }

    fn subscribe(&self) -> Option<Pin<Box<dyn Stream<Item = DiscoveryItem> + Send + 'static>>> {
        let Some(events) = lock(&self.events).as_ref().map(broadcast::Sender::subscribe) else {
            return Some(futures_util::stream::empty().boxed());
        };
        let items = BroadcastStream::new(events).filter_map(|item| futures_util::future::ready(item.ok()));
        Some(items.boxed())
    }
}

/// Simulated routing table returning a fixed provider list.
#[derive(Default)]
pub struct MockRouting {
    providers: Mutex<Vec<AddrInfo>>,
    published: Mutex<Vec<(String, ProviderRecord)>>,
    item_delay: Duration,
    hang: bool,
    fail_bootstrap: bool,
    bootstraps: AtomicUsize,
    closed: AtomicBool,
}

impl MockRouting {
    /// Empty routing table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before each provider is yielded.
    pub fn item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    /// Keep lookup streams open after the last provider instead of ending them.
    pub fn hang_after_results(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Make bootstrap fail.
    pub fn failing_bootstrap(mut self) -> Self {
        self.fail_bootstrap = true;
        self
    }

    /// Add a provider returned by lookups.
    pub fn add_provider(&self, info: AddrInfo) {
        lock(&self.providers).push(info);
    }

    /// Records published so far.
    pub fn published(&self) -> Vec<(String, ProviderRecord)> {
        lock(&self.published).clone()
    }

    /// Number of bootstrap calls.
    pub fn bootstraps(&self) -> usize {
        self.bootstraps.load(Ordering::SeqCst)
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoutingTable for MockRouting {
    async fn bootstrap(&self) -> Result<()> {
        self.bootstraps.fetch_add(1, Ordering::SeqCst);
        if self.fail_bootstrap {
            Err(Error::dht("no bootstrap nodes reachable"))
        } else {
            Ok(())
        }
    }

    async fn provide(&self, label: &str, record: &ProviderRecord) -> Result<()> {
        lock(&self.published).push((label.to_owned(), record.clone()));
        Ok(())
    }

    fn find_providers(&self, _label: &str) -> ProviderStream {
        let providers = lock(&self.providers).clone();
        let delay = self.item_delay;
        let hang = self.hang;
        async_stream::stream! {
            for info in providers {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(info);
            }
            if hang {
                futures_util::future::pending::<()>().await;
            }
        }
        .boxed()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
