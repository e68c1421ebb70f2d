//! Multi-source peer discovery for iroh nodes.
//!
//! Peers are found through local-network broadcast, a static seed list and
//! the mainline DHT, then merged into one store that tracks freshness and
//! reliability.

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod mock;
pub mod swarm;
pub mod transport;

// Re-export key types
pub use config::DiscoveryConfig;
pub use error::{Error, Result};
pub use swarm::{
    Coordinator, DiscoveredPeer, Discovery, DhtBackend, MdnsBackend, PeerRecord, PeerStatus,
    PeerStore, Scope, StaticBackend,
};
pub use transport::{AddrInfo, Connectedness, IrohTransport, PeerId, Transport};
