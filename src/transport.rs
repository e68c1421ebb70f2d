//! Transport seam consumed by discovery.
//!
//! Discovery never establishes secure channels itself. It asks a
//! [`Transport`] to dial, to report whether a peer is still connected, and
//! to list peers it already knows about. [`IrohTransport`] provides this over
//! an [`iroh::Endpoint`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use iroh::endpoint::Connection;
use iroh::{Endpoint, NodeAddr};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::{Error, Result};

/// Identity of a peer on the network.
pub type PeerId = iroh::PublicKey;

/// A peer identity paired with its known network addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    /// The peer's identity.
    pub id: PeerId,
    /// Deduplicated set of addresses the peer may be reached at.
    pub addrs: BTreeSet<SocketAddr>,
}

impl AddrInfo {
    /// Create an address info with no addresses.
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            addrs: BTreeSet::new(),
        }
    }

    /// Add addresses, builder style.
    pub fn with_addrs<I>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        self.addrs.extend(addrs);
        self
    }
}

impl fmt::Display for AddrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        for (i, addr) in self.addrs.iter().enumerate() {
            let sep = if i == 0 { '@' } else { ',' };
            write!(f, "{sep}{addr}")?;
        }
        Ok(())
    }
}

/// Connection state of a peer as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectedness {
    /// A live connection exists.
    Connected,
    /// No live connection.
    NotConnected,
}

/// The transport substrate used by discovery mechanisms.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// This node's identity.
    fn local_id(&self) -> PeerId;

    /// Addresses this node can be reached at.
    fn local_addrs(&self) -> Vec<SocketAddr>;

    /// Peers in the transport's own address book.
    async fn known_peers(&self) -> Vec<AddrInfo>;

    /// Dial a peer. Callers bound this with their own timeout.
    async fn connect(&self, info: &AddrInfo) -> Result<()>;

    /// Current connection state for a peer.
    async fn connectedness(&self, id: &PeerId) -> Connectedness;
}

/// [`Transport`] over an iroh endpoint.
///
/// Connections are opened on a single ALPN and tracked per peer. The address
/// book contains every peer successfully dialed plus anything fed in through
/// [`add_known_addrs`](IrohTransport::add_known_addrs). Unless pinned with
/// [`advertise`](IrohTransport::advertise), announced addresses are the
/// endpoint's direct addresses, or its bound sockets before those are known.
pub struct IrohTransport {
    endpoint: Endpoint,
    alpn: Vec<u8>,
    advertised: Vec<SocketAddr>,
    links: RwLock<HashMap<PeerId, Connection>>,
    book: RwLock<HashMap<PeerId, BTreeSet<SocketAddr>>>,
}

impl IrohTransport {
    /// Wrap an endpoint, dialing peers on `alpn`.
    pub fn new(endpoint: Endpoint, alpn: impl Into<Vec<u8>>) -> Self {
        Self {
            endpoint,
            alpn: alpn.into(),
            advertised: Vec::new(),
            links: RwLock::new(HashMap::new()),
            book: RwLock::new(HashMap::new()),
        }
    }

    /// Pin the addresses announced to other peers.
    pub fn advertise(mut self, addrs: Vec<SocketAddr>) -> Self {
        self.advertised = addrs;
        self
    }

    /// Access the endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Record addresses for a peer learned out of band.
    pub async fn add_known_addrs(&self, info: &AddrInfo) {
        if info.id == self.endpoint.node_id() {
            return;
        }
        self.book
            .write()
            .await
            .entry(info.id)
            .or_default()
            .extend(info.addrs.iter().copied());
    }

    /// Record an inbound connection accepted by the protocol layer.
    pub async fn track_incoming(&self, id: PeerId, conn: Connection) {
        self.links.write().await.insert(id, conn);
    }
}

#[async_trait]
impl Transport for IrohTransport {
    fn local_id(&self) -> PeerId {
        self.endpoint.node_id()
    }

    fn local_addrs(&self) -> Vec<SocketAddr> {
        if !self.advertised.is_empty() {
            return self.advertised.clone();
        }
        let direct: Vec<SocketAddr> = self
            .endpoint
            .direct_addresses()
            .get()
            .ok()
            .flatten()
            .map(|addrs| addrs.into_iter().map(|d| d.addr).collect())
            .unwrap_or_default();
        if !direct.is_empty() {
            return direct;
        }
        let (v4, v6) = self.endpoint.bound_sockets();
        std::iter::once(v4).chain(v6).collect()
    }

    async fn known_peers(&self) -> Vec<AddrInfo> {
        self.book
            .read()
            .await
            .iter()
            .map(|(id, addrs)| AddrInfo {
                id: *id,
                addrs: addrs.clone(),
            })
            .collect()
    }

    async fn connect(&self, info: &AddrInfo) -> Result<()> {
        if self.connectedness(&info.id).await == Connectedness::Connected {
            trace!(peer = %info.id, "already connected");
            return Ok(());
        }
        let addr = NodeAddr::new(info.id).with_direct_addresses(info.addrs.iter().copied());
        let conn = self
            .endpoint
            .connect(addr, &self.alpn)
            .await
            .map_err(|e| Error::connection(e.to_string()))?;
        debug!(peer = %info.id, "connected");
        self.links.write().await.insert(info.id, conn);
        self.add_known_addrs(info).await;
        Ok(())
    }

    async fn connectedness(&self, id: &PeerId) -> Connectedness {
        match self.links.read().await.get(id) {
            Some(conn) if conn.close_reason().is_none() => Connectedness::Connected,
            _ => Connectedness::NotConnected,
        }
    }
}
