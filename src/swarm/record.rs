//! Provider record stored in the DHT under a rendezvous label.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::transport::{AddrInfo, PeerId};
use crate::{Error, Result};

/// Content published to the routing table to advertise this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// The iroh node ID bytes (32 bytes).
    pub node_id: [u8; 32],
    /// Addresses the node can be dialed at.
    pub addrs: Vec<SocketAddr>,
    /// Unix timestamp when published.
    pub published_at: u64,
}

impl ProviderRecord {
    /// Build a record for a node, stamped with the current time.
    pub fn new(id: PeerId, addrs: Vec<SocketAddr>) -> Self {
        Self {
            node_id: *id.as_bytes(),
            addrs,
            published_at: unix_now(),
        }
    }

    /// Return the `PeerId` contained in this record.
    pub fn peer_id(&self) -> Result<PeerId> {
        PeerId::from_bytes(&self.node_id).map_err(|e| Error::dht(format!("invalid node_id in record: {e}")))
    }

    /// Convert into address info.
    pub fn addr_info(&self) -> Result<AddrInfo> {
        Ok(AddrInfo::new(self.peer_id()?).with_addrs(self.addrs.iter().copied()))
    }

    /// Encode for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode from storage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
