//! Routed lookup: advertise under a rendezvous label and find other providers.
//!
//! The DHT is consumed, not implemented here. [`RoutingTable`] is the seam;
//! [`MainlineRouting`](mainline_routing::MainlineRouting) backs it with the
//! BitTorrent mainline DHT.

pub mod backend;
pub mod mainline_routing;
pub mod publisher;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::swarm::record::ProviderRecord;
use crate::transport::AddrInfo;
use crate::Result;

/// Stream of providers found for a rendezvous label.
pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<AddrInfo>> + Send>>;

/// A distributed routing table that can store and look up providers.
#[async_trait]
pub trait RoutingTable: Send + Sync + 'static {
    /// Join the network. Called once when the mechanism starts.
    async fn bootstrap(&self) -> Result<()>;

    /// Publish `record` under `label`.
    async fn provide(&self, label: &str, record: &ProviderRecord) -> Result<()>;

    /// Look up providers for `label`. The stream ends when the lookup is exhausted.
    fn find_providers(&self, label: &str) -> ProviderStream;

    /// Release resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
