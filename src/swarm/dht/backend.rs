//! DHT-based peer discovery backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::publisher::{DhtPublisher, DhtPublisherConfig};
use super::RoutingTable;
use crate::swarm::discovery::{self, DiscoveredPeer, Discovery, Scope};
use crate::transport::{AddrInfo, PeerId, Transport};
use crate::{Error, Result};

/// Rendezvous label used when none is configured.
pub const DEFAULT_RENDEZVOUS: &str = "iroh-peer-discovery";

/// Routed-lookup discovery backend.
///
/// Advertises this node under a rendezvous label and looks up everyone else
/// who did the same.
pub struct DhtBackend {
    routing: Arc<dyn RoutingTable>,
    local: PeerId,
    rendezvous: String,
    query_timeout: Duration,
    publisher: DhtPublisher,
    shutdown: CancellationToken,
}

impl DhtBackend {
    /// Create a backend advertising `transport`'s identity and addresses.
    pub fn new(
        routing: Arc<dyn RoutingTable>,
        transport: &dyn Transport,
        rendezvous: impl Into<String>,
    ) -> Self {
        Self::with_config(routing, transport, rendezvous, DhtPublisherConfig::default())
    }

    /// Create a backend with explicit publisher settings.
    pub fn with_config(
        routing: Arc<dyn RoutingTable>,
        transport: &dyn Transport,
        rendezvous: impl Into<String>,
        config: DhtPublisherConfig,
    ) -> Self {
        let rendezvous = rendezvous.into();
        let local = AddrInfo::new(transport.local_id()).with_addrs(transport.local_addrs());
        Self {
            publisher: DhtPublisher::new(Arc::clone(&routing), rendezvous.clone(), local.clone(), config),
            routing,
            local: local.id,
            rendezvous,
            query_timeout: Duration::from_secs(10),
            shutdown: CancellationToken::new(),
        }
    }

    /// Upper bound on a single lookup. Default: 10s.
    pub fn query_timeout(mut self, d: Duration) -> Self {
        self.query_timeout = d;
        self
    }

    /// The rendezvous label.
    pub fn rendezvous(&self) -> &str {
        &self.rendezvous
    }
}

#[async_trait]
impl Discovery for DhtBackend {
    fn name(&self) -> &'static str {
        "dht"
    }

    async fn start(&self, scope: &Scope) -> Result<()> {
        discovery::link(scope, &self.shutdown);
        self.routing
            .bootstrap()
            .await
            .map_err(|e| Error::mechanism_start(self.name(), e))?;
        self.publisher.start(self.shutdown.clone()).await;
        info!(rendezvous = %self.rendezvous, "DHT discovery started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown.cancel();
        self.publisher.stop().await;
        self.routing.close().await
    }

    async fn find_peers(&self, scope: &Scope, limit: usize) -> Result<Vec<DiscoveredPeer>> {
        let scope = scope.with_timeout(self.query_timeout);
        let mut stream = self.routing.find_providers(&self.rendezvous);
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        trace!(rendezvous = %self.rendezvous, limit, "searching DHT");

        while found.len() < limit {
            let next = tokio::select! {
                biased;
                _ = scope.done() => {
                    debug!(found = found.len(), "DHT lookup deadline reached");
                    break;
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(info)) => {
                    if info.id == self.local {
                        trace!("Skipping self in DHT results");
                        continue;
                    }
                    if !seen.insert(info.id) {
                        continue;
                    }
                    debug!(peer = %info.id, source = "dht", "discovered peer");
                    found.push(DiscoveredPeer::from(info));
                }
                Some(Err(e)) => debug!(error = %e, "DHT entry skipped"),
                None => break,
            }
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use iroh::SecretKey;
    use tokio::time::{self, Instant};

    use super::*;
    use crate::mock::{MockRouting, MockTransport};

    fn peer_id(byte: u8) -> PeerId {
        SecretKey::from_bytes(&[byte; 32]).public()
    }

    fn provider(byte: u8) -> AddrInfo {
        AddrInfo::new(peer_id(byte)).with_addrs([SocketAddr::from(([10, 0, 0, byte], 4001))])
    }

    fn local_transport() -> MockTransport {
        MockTransport::new(peer_id(1)).with_addrs(vec!["10.0.0.1:4001".parse().unwrap()])
    }

    #[tokio::test(start_paused = true)]
    async fn advertises_immediately_then_every_minute() {
        let routing = Arc::new(MockRouting::new());
        let backend = DhtBackend::new(routing.clone(), &local_transport(), "realm");
        let scope = Scope::new();

        backend.start(&scope).await.unwrap();
        assert_eq!(routing.bootstraps(), 1);

        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(routing.published().len(), 1);
        let (label, record) = &routing.published()[0];
        assert_eq!(label, "realm");
        assert_eq!(record.peer_id().unwrap(), peer_id(1));

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(routing.published().len(), 2);

        scope.cancel();
        time::sleep(Duration::from_secs(180)).await;
        assert_eq!(routing.published().len(), 2);
    }

    #[tokio::test]
    async fn bootstrap_failure_is_a_start_error() {
        let routing = Arc::new(MockRouting::new().failing_bootstrap());
        let backend = DhtBackend::new(routing, &local_transport(), "realm");
        let err = backend.start(&Scope::new()).await.unwrap_err();
        assert!(matches!(err, Error::MechanismStart { name: "dht", .. }));
    }

    #[tokio::test]
    async fn lookup_filters_self_dedupes_and_limits() {
        let routing = Arc::new(MockRouting::new());
        routing.add_provider(provider(1));
        routing.add_provider(provider(2));
        routing.add_provider(provider(2));
        routing.add_provider(provider(3));
        routing.add_provider(provider(4));
        let backend = DhtBackend::new(routing, &local_transport(), "realm");

        let peers = backend.find_peers(&Scope::new(), 2).await.unwrap();
        let ids: Vec<_> = peers.iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec![peer_id(2), peer_id(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_returns_partial_results_at_timeout() {
        let routing = Arc::new(MockRouting::new().hang_after_results());
        routing.add_provider(provider(5));
        let backend = DhtBackend::new(routing, &local_transport(), "realm");

        let start = Instant::now();
        let peers = backend.find_peers(&Scope::new(), 10).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_honors_shorter_caller_deadline() {
        let routing = Arc::new(MockRouting::new().item_delay(Duration::from_secs(3)));
        for b in 2..=6 {
            routing.add_provider(provider(b));
        }
        let backend = DhtBackend::new(routing, &local_transport(), "realm");

        let start = Instant::now();
        let scope = Scope::new().with_timeout(Duration::from_secs(7));
        let peers = backend.find_peers(&scope, 10).await.unwrap();
        assert_eq!(peers.len(), 2);
        assert!(start.elapsed() <= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_query_timeout_does_not_panic() {
        let routing = Arc::new(MockRouting::new().hang_after_results());
        routing.add_provider(provider(5));
        let backend = DhtBackend::new(routing, &local_transport(), "realm")
            .query_timeout(Duration::from_secs(i64::MAX as u64));

        let scope = Scope::new().with_timeout(Duration::from_secs(2));
        let peers = backend.find_peers(&scope, 10).await.unwrap();
        assert_eq!(peers.len(), 1);
    }

    #[tokio::test]
    async fn stop_closes_routing_table() {
        let routing = Arc::new(MockRouting::new());
        let backend = DhtBackend::new(routing.clone(), &local_transport(), "realm");
        backend.start(&Scope::new()).await.unwrap();
        backend.stop().await.unwrap();
        assert!(routing.is_closed());
    }
}
