//! Local-network discovery over iroh's mDNS swarm discovery.
//!
//! The node publishes its addresses together with a user-data string of the
//! form `tag,service,...`. Peers heard with the same tag are queued until the
//! next [`find_peers`](Discovery::find_peers).

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use iroh::discovery::mdns::MdnsDiscovery;
use iroh::discovery::{Discovery as LocalSwarm, DiscoveryItem, NodeData, UserData};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::swarm::discovery::{self, DiscoveredPeer, Discovery, Scope};
use crate::transport::{AddrInfo, PeerId, Transport};
use crate::{Error, Result};

/// Service tag nodes must share to see each other.
pub const SERVICE_TAG: &str = "iroh-peer-discovery";

/// Inbound announcements held between queries. Excess is dropped.
pub const QUEUE_CAPACITY: usize = 100;

const SEPARATOR: char = ',';

/// Encode a service tag and advertised services as mDNS user data.
pub fn encode_user_data<'a, I>(tag: &str, services: I) -> Result<UserData>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut text = tag.to_owned();
    for service in services {
        text.push(SEPARATOR);
        text.push_str(service);
    }
    text.parse().map_err(|e| Error::Config(format!("mdns user data: {e}")))
}

/// The peer behind a discovery event, or `None` if it does not carry `tag`.
fn peer_from_item(item: &DiscoveryItem, tag: &str) -> Option<DiscoveredPeer> {
    let user_data = item.user_data()?;
    let mut parts = user_data.as_ref().split(SEPARATOR);
    if parts.next() != Some(tag) {
        return None;
    }
    let services: Vec<String> = parts.filter(|s| !s.is_empty()).map(str::to_owned).collect();
    let info = AddrInfo::new(item.node_id()).with_addrs(item.direct_addresses().iter().copied());
    Some(DiscoveredPeer::from(info).with_services(services))
}

/// Sending half of the inbound queue, shared with the listener task.
#[derive(Clone)]
struct Inbox {
    local: PeerId,
    tx: mpsc::Sender<DiscoveredPeer>,
}

impl Inbox {
    fn offer(&self, peer: DiscoveredPeer) -> bool {
        if peer.id() == self.local {
            trace!("ignoring own announcement");
            return false;
        }
        match self.tx.try_send(peer) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(peer)) => {
                trace!(peer = %peer.id(), "announcement queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Local-broadcast discovery backend.
pub struct MdnsBackend {
    local: AddrInfo,
    services: BTreeSet<String>,
    tag: String,
    query_timeout: Duration,
    swarm: Mutex<Option<Arc<dyn LocalSwarm>>>,
    inbox: Inbox,
    queue: Mutex<mpsc::Receiver<DiscoveredPeer>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl MdnsBackend {
    /// Create a backend announcing `transport`'s identity and addresses.
    ///
    /// An [`MdnsDiscovery`] service is bound on start unless one was
    /// supplied with [`swarm`](Self::swarm).
    pub fn new(transport: &dyn Transport) -> Self {
        let local = AddrInfo::new(transport.local_id()).with_addrs(transport.local_addrs());
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            inbox: Inbox { local: local.id, tx },
            local,
            services: BTreeSet::new(),
            tag: SERVICE_TAG.to_owned(),
            query_timeout: Duration::from_secs(5),
            swarm: Mutex::new(None),
            queue: Mutex::new(rx),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Use an existing local swarm discovery service.
    pub fn swarm(mut self, swarm: Arc<dyn LocalSwarm>) -> Self {
        *self.swarm.get_mut() = Some(swarm);
        self
    }

    /// Services included in announcements.
    pub fn services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    /// Service tag. Nodes with a different tag are ignored.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Upper bound on a single drain. Default: 5s.
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Queue a peer heard on the local network.
    ///
    /// Returns `false` if the peer is this node or the queue is full.
    pub fn offer(&self, peer: DiscoveredPeer) -> bool {
        self.inbox.offer(peer)
    }

    async fn bind(&self) -> Result<Arc<dyn LocalSwarm>> {
        let mut slot = self.swarm.lock().await;
        if let Some(swarm) = slot.as_ref() {
            return Ok(Arc::clone(swarm));
        }
        let mdns = MdnsDiscovery::new(self.local.id).map_err(|e| Error::mechanism_start(self.name(), e))?;
        let swarm: Arc<dyn LocalSwarm> = Arc::new(mdns);
        *slot = Some(Arc::clone(&swarm));
        Ok(swarm)
    }
}

#[async_trait]
impl Discovery for MdnsBackend {
    fn name(&self) -> &'static str {
        "mdns"
    }

    async fn start(&self, scope: &Scope) -> Result<()> {
        let user_data =
            encode_user_data(&self.tag, &self.services).map_err(|e| Error::mechanism_start(self.name(), e))?;
        let swarm = self.bind().await?;
        let events = swarm
            .subscribe()
            .ok_or_else(|| Error::mechanism_start(self.name(), "local swarm offers no subscription"))?;

        swarm.publish(&NodeData::new(None, self.local.addrs.clone()).with_user_data(Some(user_data)));
        discovery::link(scope, &self.shutdown);

        let listen = tokio::spawn(listen_loop(
            events,
            self.tag.clone(),
            self.inbox.clone(),
            self.shutdown.clone(),
        ));
        self.tasks.lock().await.push(listen);

        info!(tag = %self.tag, addrs = self.local.addrs.len(), "local discovery started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown.cancel();
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
        self.swarm.lock().await.take();
        Ok(())
    }

    async fn find_peers(&self, scope: &Scope, limit: usize) -> Result<Vec<DiscoveredPeer>> {
        let scope = scope.with_timeout(self.query_timeout);
        let mut queue = self.queue.lock().await;
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        while found.len() < limit {
            let peer = tokio::select! {
                biased;
                _ = scope.done() => break,
                peer = queue.recv() => match peer {
                    Some(peer) => peer,
                    None => break,
                },
            };
            if seen.insert(peer.id()) {
                debug!(peer = %peer.id(), source = "mdns", "discovered peer");
                found.push(peer);
            }
        }

        Ok(found)
    }
}

async fn listen_loop<S>(mut events: S, tag: String, inbox: Inbox, shutdown: CancellationToken)
where
    S: Stream<Item = DiscoveryItem> + Unpin,
{
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = events.next() => match item {
                Some(item) => item,
                None => {
                    debug!("local swarm subscription ended");
                    break;
                }
            },
        };

        match peer_from_item(&item, &tag) {
            Some(peer) => {
                inbox.offer(peer);
            }
            None => trace!(peer = %item.node_id(), "ignoring peer without our service tag"),
        }
    }
}
