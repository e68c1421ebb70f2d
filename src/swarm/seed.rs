//! Static seed list discovery with connection supervision.
//!
//! Seeds are dialed with a short retry schedule when the backend starts and
//! again on every [`find_peers`](Discovery::find_peers). Each seed that
//! connects gets one supervisor task which polls the transport and redials
//! when the link drops.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::swarm::discovery::{self, DiscoveredPeer, Discovery, Scope};
use crate::transport::{AddrInfo, Connectedness, PeerId, Transport};
use crate::{Error, Result};

/// A seed node: identity plus one dialable address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeedAddr {
    /// Seed identity.
    pub id: PeerId,
    /// Where to dial it.
    pub addr: SocketAddr,
}

impl SeedAddr {
    /// Dial target for the transport.
    pub fn addr_info(&self) -> AddrInfo {
        AddrInfo::new(self.id).with_addrs([self.addr])
    }
}

impl FromStr for SeedAddr {
    type Err = Error;

    /// Parse `<node-id>@<ip:port>`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidSeed {
            input: s.to_owned(),
            reason,
        };
        let (id, addr) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| invalid("expected <node-id>@<ip:port>".into()))?;
        let id = id
            .parse::<PeerId>()
            .map_err(|e| invalid(format!("bad node id: {e}")))?;
        let addr = addr
            .parse::<SocketAddr>()
            .map_err(|e| invalid(format!("bad address: {e}")))?;
        Ok(Self { id, addr })
    }
}

impl fmt::Display for SeedAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Retry and supervision timings.
#[derive(Debug, Clone, Copy)]
pub struct SeedPolicy {
    /// Tries per connect sweep.
    pub attempts: u32,
    /// Bound on a single try.
    pub connect_timeout: Duration,
    /// Wait before the second try. Doubles after each failure.
    pub initial_backoff: Duration,
    /// How often a supervisor checks its seed.
    pub supervise_interval: Duration,
    /// Bound on a supervisor's reconnect.
    pub reconnect_timeout: Duration,
}

impl Default for SeedPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            connect_timeout: Duration::from_secs(15),
            initial_backoff: Duration::from_secs(1),
            supervise_interval: Duration::from_secs(30),
            reconnect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
struct SeedFlags {
    connected: HashSet<PeerId>,
    dialing: HashSet<PeerId>,
    supervised: HashSet<PeerId>,
}

/// Everything a dial or supervisor task needs.
#[derive(Clone)]
struct Dialer {
    transport: Arc<dyn Transport>,
    flags: Arc<Mutex<SeedFlags>>,
    policy: SeedPolicy,
    shutdown: CancellationToken,
}

impl Dialer {
    async fn connect(&self, info: &AddrInfo, timeout: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Error::connection("shutting down")),
            res = time::timeout(timeout, self.transport.connect(info)) => {
                res.map_err(|_| Error::Timeout("seed connect"))?
            }
        }
    }

    /// Retry schedule for one seed. Spawns a supervisor on success.
    async fn dial(self, seed: SeedAddr) {
        let info = seed.addr_info();
        let mut backoff = self.policy.initial_backoff;
        let mut connected = false;

        for attempt in 1..=self.policy.attempts {
            match self.connect(&info, self.policy.connect_timeout).await {
                Ok(()) => {
                    info!(peer = %seed.id, attempt, "Connected to seed");
                    connected = true;
                    break;
                }
                Err(e) => warn!(
                    peer = %seed.id,
                    attempt,
                    max_attempts = self.policy.attempts,
                    error = %e,
                    "Failed to connect to seed"
                ),
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            if attempt < self.policy.attempts {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = time::sleep(backoff) => {}
                }
                backoff = backoff.saturating_mul(2);
            }
        }

        let supervise = {
            let mut flags = self.flags.lock().await;
            flags.dialing.remove(&seed.id);
            if connected {
                flags.connected.insert(seed.id);
                flags.supervised.insert(seed.id)
            } else {
                false
            }
        };
        if supervise {
            tokio::spawn(self.supervise(seed));
        }
    }

    async fn supervise(self, seed: SeedAddr) {
        let info = seed.addr_info();
        let period = self.policy.supervise_interval;
        let mut ticker = time::interval_at(discovery::instant_after(period), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.transport.connectedness(&seed.id).await == Connectedness::Connected {
                self.flags.lock().await.connected.insert(seed.id);
                continue;
            }

            {
                let mut flags = self.flags.lock().await;
                if flags.connected.remove(&seed.id) {
                    warn!(peer = %seed.id, "Lost connection to seed, reconnecting");
                }
                // A sweep is already dialing it.
                if !flags.dialing.insert(seed.id) {
                    continue;
                }
            }

            let res = self.connect(&info, self.policy.reconnect_timeout).await;
            let mut flags = self.flags.lock().await;
            flags.dialing.remove(&seed.id);
            match res {
                Ok(()) => {
                    flags.connected.insert(seed.id);
                    info!(peer = %seed.id, "Reconnected to seed");
                }
                Err(e) => debug!(peer = %seed.id, error = %e, "Seed reconnect failed"),
            }
        }

        self.flags.lock().await.supervised.remove(&seed.id);
    }
}

/// Static-seed discovery backend.
pub struct StaticBackend {
    seeds: RwLock<Vec<SeedAddr>>,
    dialer: Dialer,
}

impl StaticBackend {
    /// Create a backend from seed strings. Malformed entries are logged and skipped.
    pub fn new<I, S>(transport: Arc<dyn Transport>, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed = seeds.into_iter().filter_map(|s| match s.as_ref().parse::<SeedAddr>() {
            Ok(seed) => Some(seed),
            Err(e) => {
                warn!(error = %e, "Ignoring seed");
                None
            }
        });
        Self::from_seeds(transport, parsed)
    }

    /// Create a backend from parsed seeds. Duplicate identities keep the first address.
    pub fn from_seeds(transport: Arc<dyn Transport>, seeds: impl IntoIterator<Item = SeedAddr>) -> Self {
        let mut ids = HashSet::new();
        let seeds = seeds.into_iter().filter(|s| ids.insert(s.id)).collect();
        Self {
            seeds: RwLock::new(seeds),
            dialer: Dialer {
                transport,
                flags: Arc::new(Mutex::new(SeedFlags::default())),
                policy: SeedPolicy::default(),
                shutdown: CancellationToken::new(),
            },
        }
    }

    /// Override retry and supervision timings.
    pub fn policy(mut self, policy: SeedPolicy) -> Self {
        self.dialer.policy = policy;
        self
    }

    /// Add a seed at runtime. It is dialed on the next sweep.
    ///
    /// Returns `false` if a seed with the same identity already exists.
    pub async fn add_seed(&self, seed: SeedAddr) -> bool {
        let mut seeds = self.seeds.write().await;
        if seeds.iter().any(|s| s.id == seed.id) {
            return false;
        }
        info!(peer = %seed.id, addr = %seed.addr, "Added seed");
        seeds.push(seed);
        true
    }

    /// Configured seeds.
    pub async fn seeds(&self) -> Vec<SeedAddr> {
        self.seeds.read().await.clone()
    }

    /// Seeds currently marked connected.
    pub async fn connected_seeds(&self) -> Vec<PeerId> {
        self.dialer.flags.lock().await.connected.iter().copied().collect()
    }

    /// Dial every seed that is neither connected nor already being dialed.
    async fn sweep(&self) {
        if self.dialer.shutdown.is_cancelled() {
            return;
        }
        let seeds = self.seeds.read().await.clone();
        for seed in seeds {
            {
                let mut flags = self.dialer.flags.lock().await;
                if flags.connected.contains(&seed.id) || !flags.dialing.insert(seed.id) {
                    continue;
                }
            }
            tokio::spawn(self.dialer.clone().dial(seed));
        }
    }
}

#[async_trait]
impl Discovery for StaticBackend {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn start(&self, scope: &Scope) -> Result<()> {
        discovery::link(scope, &self.dialer.shutdown);
        let seeds = self.seeds.read().await.len();
        info!(seeds, "Seed discovery starting");
        self.sweep().await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.dialer.shutdown.cancel();
        info!("Seed discovery stopped");
        Ok(())
    }

    async fn find_peers(&self, scope: &Scope, limit: usize) -> Result<Vec<DiscoveredPeer>> {
        self.sweep().await;
        if scope.is_done() {
            return Ok(Vec::new());
        }

        let local = self.dialer.transport.local_id();
        let found = self
            .dialer
            .transport
            .known_peers()
            .await
            .into_iter()
            .filter(|info| info.id != local && !info.addrs.is_empty())
            .take(limit)
            .map(DiscoveredPeer::from)
            .collect();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use iroh::SecretKey;
    use tokio::time::Instant;

    use super::*;
    use crate::mock::MockTransport;

    fn peer_id(byte: u8) -> PeerId {
        SecretKey::from_bytes(&[byte; 32]).public()
    }

    fn seed(byte: u8) -> SeedAddr {
        SeedAddr {
            id: peer_id(byte),
            addr: SocketAddr::from(([10, 0, 0, byte], 4001)),
        }
    }

    fn offsets(start: Instant, attempts: &[Instant]) -> Vec<u64> {
        attempts.iter().map(|at| (*at - start).as_secs()).collect()
    }

    #[test]
    fn parses_seed_strings() {
        let s = seed(3);
        let parsed: SeedAddr = s.to_string().parse().unwrap();
        assert_eq!(parsed, s);

        for bad in ["", "no-at-sign", "zzz@10.0.0.1:4001", "@10.0.0.1:4001"] {
            let err = bad.parse::<SeedAddr>().unwrap_err();
            assert!(matches!(err, Error::InvalidSeed { .. }), "{bad}");
        }
        let missing_port = format!("{}@10.0.0.1", peer_id(3));
        assert!(missing_port.parse::<SeedAddr>().is_err());
    }

    #[tokio::test]
    async fn malformed_seeds_are_excluded() {
        let transport = Arc::new(MockTransport::new(peer_id(1)));
        let good = seed(2).to_string();
        let backend = StaticBackend::new(transport, ["garbage", good.as_str(), good.as_str()]);
        assert_eq!(backend.seeds().await, vec![seed(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_seed_backs_off_then_retries_on_demand() {
        let transport = Arc::new(MockTransport::new(peer_id(1)));
        let backend = StaticBackend::from_seeds(transport.clone(), [seed(2)]);
        let start = Instant::now();

        backend.start(&Scope::new()).await.unwrap();
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(offsets(start, &transport.attempts_for(&peer_id(2))), vec![0, 1, 3]);
        assert!(backend.connected_seeds().await.is_empty());

        backend.find_peers(&Scope::new(), 10).await.unwrap();
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            offsets(start, &transport.attempts_for(&peer_id(2))),
            vec![0, 1, 3, 10, 11, 13]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_seed_does_not_block_another() {
        let transport = Arc::new(MockTransport::new(peer_id(1)));
        transport.set_reachable(peer_id(3), true);
        let backend = StaticBackend::from_seeds(transport.clone(), [seed(2), seed(3)]);

        backend.start(&Scope::new()).await.unwrap();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.connected_seeds().await, vec![peer_id(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_reconnects_lost_seed() {
        let transport = Arc::new(MockTransport::new(peer_id(1)));
        transport.set_reachable(peer_id(2), true);
        let backend = StaticBackend::from_seeds(transport.clone(), [seed(2)]);
        let start = Instant::now();

        backend.start(&Scope::new()).await.unwrap();
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(backend.connected_seeds().await, vec![peer_id(2)]);

        transport.disconnect(&peer_id(2));
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(offsets(start, &transport.attempts_for(&peer_id(2))), vec![0, 30]);
        assert_eq!(backend.connected_seeds().await, vec![peer_id(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_clears_flag_when_reconnect_fails() {
        let transport = Arc::new(MockTransport::new(peer_id(1)));
        transport.set_reachable(peer_id(2), true);
        let backend = StaticBackend::from_seeds(transport.clone(), [seed(2)]);

        backend.start(&Scope::new()).await.unwrap();
        time::sleep(Duration::from_secs(1)).await;

        transport.set_reachable(peer_id(2), false);
        transport.disconnect(&peer_id(2));
        time::sleep(Duration::from_secs(30)).await;
        assert!(backend.connected_seeds().await.is_empty());
        assert_eq!(transport.attempts_for(&peer_id(2)).len(), 2);

        // Still supervising: the next poll tries again.
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.attempts_for(&peer_id(2)).len(), 3);
    }

    #[tokio::test]
    async fn start_runs_on_spawned_task() {
        let transport = Arc::new(MockTransport::new(peer_id(1)));
        let backend = Arc::new(StaticBackend::from_seeds(transport, [seed(2)]));
        let task = tokio::spawn({
            let backend = Arc::clone(&backend);
            async move { backend.start(&Scope::new()).await }
        });
        assert!(task.await.unwrap().is_ok());
        backend.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connected_seed_is_not_redialed_by_sweep() {
        let transport = Arc::new(MockTransport::new(peer_id(1)));
        transport.set_reachable(peer_id(2), true);
        let backend = StaticBackend::from_seeds(transport.clone(), [seed(2)]);

        backend.start(&Scope::new()).await.unwrap();
        time::sleep(Duration::from_secs(1)).await;
        backend.find_peers(&Scope::new(), 10).await.unwrap();
        backend.find_peers(&Scope::new(), 10).await.unwrap();
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.attempts_for(&peer_id(2)).len(), 1);
    }

    #[tokio::test]
    async fn find_peers_surfaces_address_book_without_self() {
        let transport = Arc::new(MockTransport::new(peer_id(1)));
        for b in 1..=5 {
            transport.add_known(&seed(b).addr_info());
        }
        let backend = StaticBackend::from_seeds(transport, []);

        let found = backend.find_peers(&Scope::new(), 10).await.unwrap();
        assert_eq!(found.len(), 4);
        assert!(found.iter().all(|p| p.id() != peer_id(1)));

        assert_eq!(backend.find_peers(&Scope::new(), 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn add_seed_dedupes_by_identity() {
        let transport = Arc::new(MockTransport::new(peer_id(1)));
        let backend = StaticBackend::from_seeds(transport, [seed(2)]);
        assert!(!backend.add_seed(seed(2)).await);
        assert!(backend.add_seed(seed(3)).await);
        assert_eq!(backend.seeds().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_retries() {
        let transport = Arc::new(MockTransport::new(peer_id(1)));
        let backend = StaticBackend::from_seeds(transport.clone(), [seed(2)]);

        backend.start(&Scope::new()).await.unwrap();
        time::sleep(Duration::from_millis(500)).await;
        backend.stop().await.unwrap();
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.attempts_for(&peer_id(2)).len(), 1);
    }
}
