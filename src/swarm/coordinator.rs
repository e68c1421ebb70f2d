//! Discovery coordinator: drives every mechanism on a schedule and folds
//! their results into one peer store.

use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, trace, warn};

use crate::config::DiscoveryConfig;
use crate::transport::{PeerId, Transport};
use crate::{Error, Result};

use super::connect::auto_connect;
use super::dht::backend::DhtBackend;
use super::dht::publisher::DhtPublisherConfig;
use super::dht::RoutingTable;
use super::discovery::{instant_after, DiscoveredPeer, Discovery, Scope};
use super::mdns::MdnsBackend;
use super::peers::{PeerRecord, PeerStore, Upsert};
use super::seed::StaticBackend;

const EVENT_BUFFER: usize = 256;

/// A peer seen for the first time.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    /// What the mechanism reported.
    pub peer: DiscoveredPeer,
    /// Name of the mechanism that found it.
    pub source: String,
}

/// Callback invoked for every new peer.
pub type Observer = Arc<dyn Fn(&PeerEvent) + Send + Sync>;

/// Sweep scheduling.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Time between sweeps. The first sweep runs at start.
    pub sweep_interval: Duration,
    /// Peers requested from each mechanism per sweep.
    pub query_limit: usize,
    /// Bound on one mechanism's query.
    pub query_timeout: Duration,
    /// Time between population summaries.
    pub stats_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            query_limit: 10,
            query_timeout: Duration::from_secs(10),
            stats_interval: Duration::from_secs(60),
        }
    }
}

/// Filters, stores and announces peers. Shared with every sweep task.
struct Ingest {
    local: PeerId,
    store: Arc<PeerStore>,
    observers: StdRwLock<Vec<Observer>>,
    events: broadcast::Sender<PeerEvent>,
}

impl Ingest {
    async fn handle(&self, peer: DiscoveredPeer, source: &str) -> Upsert {
        if peer.id() == self.local {
            trace!(source, "Skipping self");
            return Upsert::Rejected;
        }

        let outcome = self.store.add_or_update(&peer, source).await;
        if outcome == Upsert::Inserted {
            debug!(peer = %peer.id(), source, "New peer");
            let event = PeerEvent {
                peer,
                source: source.to_owned(),
            };
            let observers = self
                .observers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for observer in observers {
                observer(&event);
            }
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        outcome
    }
}

/// Runs discovery mechanisms and maintains the peer population.
///
/// ```ignore
/// let mut coordinator = Coordinator::new(transport.local_id(), Arc::new(PeerStore::default()));
/// coordinator.add_mechanism(Arc::new(MdnsBackend::new(transport.as_ref())));
/// coordinator.add_mechanism(Arc::new(StaticBackend::new(transport.clone(), seeds)));
/// coordinator.start().await?;
/// // ...
/// coordinator.stop().await?;
/// ```
pub struct Coordinator {
    ingest: Arc<Ingest>,
    config: CoordinatorConfig,
    mechanisms: Vec<Arc<dyn Discovery>>,
    active: RwLock<Vec<Arc<dyn Discovery>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    scope: Scope,
}

impl Coordinator {
    /// Create a coordinator for the node `local` writing into `store`.
    pub fn new(local: PeerId, store: Arc<PeerStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            ingest: Arc::new(Ingest {
                local,
                store,
                observers: StdRwLock::new(Vec::new()),
                events,
            }),
            config: CoordinatorConfig::default(),
            mechanisms: Vec::new(),
            active: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            scope: Scope::new(),
        }
    }

    /// Build a coordinator with the mechanisms enabled in `config`.
    ///
    /// The DHT mechanism is only added when a routing table is supplied.
    pub fn from_config(
        config: &DiscoveryConfig,
        transport: Arc<dyn Transport>,
        routing: Option<Arc<dyn RoutingTable>>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(PeerStore::new(config.store.store_config()));
        let mut coordinator = Self::new(transport.local_id(), Arc::clone(&store))
            .with_config(config.coordinator.coordinator_config());

        if config.mdns.enabled {
            let mdns = MdnsBackend::new(transport.as_ref())
                .tag(config.mdns.service_tag.clone())
                .services(config.mdns.services.iter().cloned())
                .query_timeout(Duration::from_secs(config.mdns.query_timeout_secs));
            coordinator.add_mechanism(Arc::new(mdns));
        }

        if config.seeds.enabled && !config.seeds.addrs.is_empty() {
            let seeds = StaticBackend::new(Arc::clone(&transport), &config.seeds.addrs)
                .policy(config.seeds.policy());
            coordinator.add_mechanism(Arc::new(seeds));
        }

        if config.dht.enabled {
            match routing {
                Some(routing) => {
                    let publisher = DhtPublisherConfig {
                        publish_interval: Duration::from_secs(config.dht.advertise_interval_secs),
                    };
                    let dht = DhtBackend::with_config(
                        routing,
                        transport.as_ref(),
                        config.dht.rendezvous.clone(),
                        publisher,
                    )
                    .query_timeout(Duration::from_secs(config.dht.query_timeout_secs));
                    coordinator.add_mechanism(Arc::new(dht));
                }
                None => warn!("DHT discovery enabled but no routing table supplied"),
            }
        }

        if config.coordinator.auto_connect {
            coordinator.add_observer(auto_connect(
                transport,
                store,
                Duration::from_secs(config.coordinator.connect_timeout_secs),
            ));
        }

        Ok(coordinator)
    }

    /// Override sweep scheduling.
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a mechanism. Must be called before [`start`](Self::start).
    pub fn add_mechanism(&mut self, mechanism: Arc<dyn Discovery>) {
        info!(mechanism = mechanism.name(), "Added discovery mechanism");
        self.mechanisms.push(mechanism);
    }

    /// Call `observer` for every peer seen for the first time.
    ///
    /// Observers run on the ingesting task and must not block.
    pub fn add_observer(&self, observer: impl Fn(&PeerEvent) + Send + Sync + 'static) {
        self.ingest
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    /// Stream of peers seen for the first time from now on.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub fn subscribe(&self) -> impl Stream<Item = PeerEvent> + Send + Unpin + 'static {
        BroadcastStream::new(self.ingest.events.subscribe()).filter_map(|event| event.ok())
    }

    /// The peer store.
    pub fn store(&self) -> &Arc<PeerStore> {
        &self.ingest.store
    }

    /// Snapshot of every known peer.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.ingest.store.get_all().await
    }

    /// Snapshot of peers believed reachable.
    pub async fn connectable_peers(&self) -> Vec<PeerRecord> {
        self.ingest.store.connectable().await
    }

    /// Names of mechanisms that started successfully.
    pub async fn active_mechanisms(&self) -> Vec<&'static str> {
        self.active.read().await.iter().map(|m| m.name()).collect()
    }

    /// Ingest a peer found outside the sweep.
    ///
    /// Self is ignored. Returns whether the peer was new, merged or rejected.
    pub async fn handle_found_peer(&self, peer: DiscoveredPeer, source: &str) -> Upsert {
        self.ingest.handle(peer, source).await
    }

    /// Start every mechanism and the background loops.
    ///
    /// A mechanism that fails to start is logged and left out of sweeps.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("Coordinator already started");
            return Ok(());
        }
        if self.scope.is_cancelled() {
            return Err(Error::Shutdown(vec!["coordinator already stopped".into()]));
        }

        let mut active = Vec::with_capacity(self.mechanisms.len());
        for mechanism in &self.mechanisms {
            match mechanism.start(&self.scope).await {
                Ok(()) => {
                    info!(mechanism = mechanism.name(), "Started discovery mechanism");
                    active.push(Arc::clone(mechanism));
                }
                Err(e) => warn!(mechanism = mechanism.name(), error = %e, "Failed to start discovery mechanism"),
            }
        }
        if active.is_empty() {
            warn!("No discovery mechanisms active");
        }
        *self.active.write().await = active.clone();

        tasks.push(tokio::spawn(sweep_loop(
            active,
            Arc::clone(&self.ingest),
            self.config.clone(),
            self.scope.clone(),
        )));

        let store = Arc::clone(&self.ingest.store);
        let scope = self.scope.clone();
        tasks.push(tokio::spawn(async move { store.run_eviction(scope).await }));

        tasks.push(tokio::spawn(stats_loop(
            Arc::clone(&self.ingest.store),
            self.config.stats_interval,
            self.scope.clone(),
        )));

        info!(
            mechanisms = self.mechanisms.len(),
            sweep_interval = ?self.config.sweep_interval,
            "Discovery coordinator started"
        );
        Ok(())
    }

    /// Cancel all background work and stop every mechanism.
    ///
    /// In-flight queries are abandoned, not awaited, and never reach the
    /// store. Mechanism stop errors are collected into one error.
    pub async fn stop(&self) -> Result<()> {
        self.scope.cancel();
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }

        let mut errors = Vec::new();
        for mechanism in &self.mechanisms {
            if let Err(e) = mechanism.stop().await {
                warn!(mechanism = mechanism.name(), error = %e, "Failed to stop discovery mechanism");
                errors.push(format!("{}: {e}", mechanism.name()));
            }
        }
        self.active.write().await.clear();
        info!("Discovery coordinator stopped");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Shutdown(errors))
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

async fn sweep_loop(
    mechanisms: Vec<Arc<dyn Discovery>>,
    ingest: Arc<Ingest>,
    config: CoordinatorConfig,
    scope: Scope,
) {
    let mut ticker = time::interval(config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            _ = ticker.tick() => {}
        }
        trace!(mechanisms = mechanisms.len(), "Discovery sweep");
        // Each query runs on its own so a slow mechanism never holds up the next tick.
        for mechanism in &mechanisms {
            tokio::spawn(query(
                Arc::clone(mechanism),
                Arc::clone(&ingest),
                config.query_limit,
                config.query_timeout,
                scope.clone(),
            ));
        }
    }
}

async fn query(
    mechanism: Arc<dyn Discovery>,
    ingest: Arc<Ingest>,
    limit: usize,
    timeout: Duration,
    scope: Scope,
) {
    let name = mechanism.name();
    let bounded = scope.with_timeout(timeout);

    let result = tokio::select! {
        biased;
        _ = scope.cancelled() => return,
        res = time::timeout(timeout, mechanism.find_peers(&bounded, limit)) => res,
    };
    let peers = match result {
        Ok(Ok(peers)) => peers,
        Ok(Err(e)) => {
            warn!(mechanism = name, error = %e, "Peer query failed");
            return;
        }
        Err(_) => {
            debug!(mechanism = name, "Peer query timed out");
            return;
        }
    };

    let found = peers.len();
    let mut new = 0;
    for peer in peers {
        if scope.is_cancelled() {
            return;
        }
        if ingest.handle(peer, name).await == Upsert::Inserted {
            new += 1;
        }
    }
    if found > 0 {
        debug!(mechanism = name, found, new, "Peer query complete");
    }
}

async fn stats_loop(store: Arc<PeerStore>, period: Duration, scope: Scope) {
    let mut ticker = time::interval_at(instant_after(period), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let total = store.len().await;
        let connectable = store.connectable().await.len();
        info!(total, connectable, "Peer population");
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use iroh::SecretKey;
    use tokio::time::Instant;

    use super::*;
    use crate::mock::MockTransport;
    use crate::swarm::peers::PeerStatus;
    use crate::transport::AddrInfo;

    fn peer_id(byte: u8) -> PeerId {
        SecretKey::from_bytes(&[byte; 32]).public()
    }

    fn peer(byte: u8, addr: &str) -> DiscoveredPeer {
        AddrInfo::new(peer_id(byte))
            .with_addrs([addr.parse::<SocketAddr>().unwrap()])
            .into()
    }

    /// Mechanism returning a fixed answer after an optional delay.
    struct Canned {
        name: &'static str,
        peers: Vec<DiscoveredPeer>,
        delay: Duration,
        fail_start: bool,
        queries: AtomicUsize,
        stopped: AtomicUsize,
    }

    impl Canned {
        fn new(name: &'static str, peers: Vec<DiscoveredPeer>) -> Self {
            Self {
                name,
                peers,
                delay: Duration::ZERO,
                fail_start: false,
                queries: AtomicUsize::new(0),
                stopped: AtomicUsize::new(0),
            }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn broken(mut self) -> Self {
            self.fail_start = true;
            self
        }
    }

    #[async_trait]
    impl Discovery for Canned {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn start(&self, _scope: &Scope) -> Result<()> {
            if self.fail_start {
                return Err(Error::mechanism_start(self.name, "socket unavailable"));
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn find_peers(&self, _scope: &Scope, limit: usize) -> Result<Vec<DiscoveredPeer>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                time::sleep(self.delay).await;
            }
            Ok(self.peers.iter().take(limit).cloned().collect())
        }
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(peer_id(1), Arc::new(PeerStore::default()))
    }

    #[tokio::test]
    async fn self_is_never_stored() {
        let c = coordinator();
        assert_eq!(c.handle_found_peer(peer(1, "10.0.0.1:1"), "mdns").await, Upsert::Rejected);
        assert_eq!(c.handle_found_peer(peer(2, "10.0.0.2:1"), "mdns").await, Upsert::Inserted);
        let ids: Vec<_> = c.peers().await.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![peer_id(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_merges_addresses_across_mechanisms() {
        let mut c = coordinator();
        c.add_mechanism(Arc::new(Canned::new("mdns", vec![peer(7, "10.0.0.7:1")])));
        c.add_mechanism(Arc::new(Canned::new("static", vec![peer(7, "10.0.0.8:2")])));
        c.start().await.unwrap();
        time::sleep(Duration::from_millis(10)).await;

        let record = c.store().get(&peer_id(7)).await.unwrap();
        let addrs: Vec<String> = record.addrs.iter().map(|a| a.to_string()).collect();
        assert_eq!(addrs, vec!["10.0.0.7:1", "10.0.0.8:2"]);
        assert_eq!(c.peers().await.len(), 1);
        c.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_leaves_others_running() {
        let broken = Arc::new(Canned::new("mdns", vec![peer(3, "10.0.0.3:1")]).broken());
        let healthy = Arc::new(Canned::new("static", vec![peer(4, "10.0.0.4:1")]));
        let mut c = coordinator();
        c.add_mechanism(broken.clone());
        c.add_mechanism(healthy.clone());

        c.start().await.unwrap();
        time::sleep(Duration::from_millis(10)).await;

        assert_eq!(c.active_mechanisms().await, vec!["static"]);
        assert_eq!(broken.queries.load(Ordering::SeqCst), 0);
        assert!(c.store().get(&peer_id(4)).await.is_some());
        assert!(c.store().get(&peer_id(3)).await.is_none());
        c.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_repeat_on_interval() {
        let mechanism = Arc::new(Canned::new("static", vec![]));
        let mut c = coordinator();
        c.add_mechanism(mechanism.clone());
        c.start().await.unwrap();

        time::sleep(Duration::from_secs(61)).await;
        assert_eq!(mechanism.queries.load(Ordering::SeqCst), 3);
        c.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_mechanism_is_cut_off_and_does_not_delay_sweeps() {
        let slow = Arc::new(Canned::new("dht", vec![peer(5, "10.0.0.5:1")]).delayed(Duration::from_secs(45)));
        let fast = Arc::new(Canned::new("mdns", vec![peer(6, "10.0.0.6:1")]));
        let mut c = coordinator();
        c.add_mechanism(slow.clone());
        c.add_mechanism(fast.clone());
        c.start().await.unwrap();

        time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fast.queries.load(Ordering::SeqCst), 2);
        assert_eq!(slow.queries.load(Ordering::SeqCst), 2);

        time::sleep(Duration::from_secs(60)).await;
        assert!(c.store().get(&peer_id(5)).await.is_none());
        assert!(c.store().get(&peer_id(6)).await.is_some());
        c.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_in_flight_queries() {
        let slow = Arc::new(Canned::new("dht", vec![peer(5, "10.0.0.5:1")]).delayed(Duration::from_secs(5)));
        let mut c = coordinator();
        c.add_mechanism(slow.clone());
        c.start().await.unwrap();
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(slow.queries.load(Ordering::SeqCst), 1);

        let begun = Instant::now();
        c.stop().await.unwrap();
        assert!(begun.elapsed() < Duration::from_secs(1));
        assert_eq!(slow.stopped.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_secs(10)).await;
        assert!(c.store().is_empty().await);
    }

    #[tokio::test]
    async fn stop_collects_mechanism_errors() {
        struct Stubborn;

        #[async_trait]
        impl Discovery for Stubborn {
            fn name(&self) -> &'static str {
                "static"
            }
            async fn start(&self, _scope: &Scope) -> Result<()> {
                Ok(())
            }
            async fn stop(&self) -> Result<()> {
                Err(Error::connection("still dialing"))
            }
            async fn find_peers(&self, _scope: &Scope, _limit: usize) -> Result<Vec<DiscoveredPeer>> {
                Ok(Vec::new())
            }
        }

        let mut c = coordinator();
        c.add_mechanism(Arc::new(Stubborn));
        c.add_mechanism(Arc::new(Stubborn));
        c.start().await.unwrap();

        match c.stop().await {
            Err(Error::Shutdown(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected shutdown error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn observers_and_subscribers_see_only_new_peers() {
        let c = coordinator();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        c.add_observer(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut events = c.subscribe();

        c.handle_found_peer(peer(2, "10.0.0.2:1"), "mdns").await;
        c.handle_found_peer(peer(2, "10.0.0.2:2"), "static").await;
        c.handle_found_peer(peer(3, "10.0.0.3:1"), "dht").await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        let first = events.next().await.unwrap();
        assert_eq!(first.peer.id(), peer_id(2));
        assert_eq!(first.source, "mdns");
        assert_eq!(events.next().await.unwrap().source, "dht");
    }

    #[tokio::test(start_paused = true)]
    async fn from_config_wires_auto_connect() {
        let transport = Arc::new(MockTransport::new(peer_id(1)));
        transport.set_reachable(peer_id(2), true);

        let mut config = DiscoveryConfig::default();
        config.mdns.enabled = false;
        config.coordinator.auto_connect = true;
        let c = Coordinator::from_config(&config, transport, None).unwrap();
        assert!(c.mechanisms.is_empty());

        c.handle_found_peer(peer(2, "10.0.0.2:1"), "static").await;
        time::sleep(Duration::from_millis(10)).await;
        let record = c.store().get(&peer_id(2)).await.unwrap();
        assert_eq!(record.status, PeerStatus::Connected);
        assert_eq!(c.connectable_peers().await.len(), 1);
    }

    #[test]
    fn from_config_rejects_invalid_config() {
        let mut config = DiscoveryConfig::default();
        config.mdns.enabled = false;
        config.seeds.enabled = false;
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::new(peer_id(1)));
        assert!(matches!(
            Coordinator::from_config(&config, transport, None),
            Err(Error::Config(_))
        ));
    }
}
