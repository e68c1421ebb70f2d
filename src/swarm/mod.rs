//! Swarm: multi-source peer discovery.
//!
//! - Pluggable mechanisms via the [`Discovery`] trait
//! - Local broadcast, static seeds and routed lookup backends
//! - One [`PeerStore`] fed by the [`Coordinator`]

pub mod connect;
pub mod coordinator;
pub mod dht;
pub mod discovery;
pub mod mdns;
pub mod peers;
pub mod record;
pub mod seed;

pub use connect::auto_connect;
pub use coordinator::{Coordinator, CoordinatorConfig, Observer, PeerEvent};
pub use dht::backend::DhtBackend;
pub use dht::mainline_routing::{ItemStore, MainlineRouting};
pub use dht::publisher::DhtPublisherConfig;
pub use dht::RoutingTable;
pub use discovery::{DiscoveredPeer, Discovery, Scope};
pub use mdns::MdnsBackend;
pub use peers::{PeerRecord, PeerStatus, PeerStore, StoreConfig, Upsert};
pub use seed::{SeedAddr, SeedPolicy, StaticBackend};
