//! DHT publisher for advertising this node under a rendezvous label.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::swarm::record::ProviderRecord;
use crate::transport::AddrInfo;

use super::RoutingTable;

/// Configuration for DHT publishing.
#[derive(Debug, Clone)]
pub struct DhtPublisherConfig {
    /// How often to republish records. The first run is immediate.
    pub publish_interval: Duration,
}

impl Default for DhtPublisherConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_secs(60),
        }
    }
}

/// Publishes this node's provider record on a fixed interval.
pub struct DhtPublisher {
    routing: Arc<dyn RoutingTable>,
    label: String,
    local: AddrInfo,
    config: DhtPublisherConfig,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DhtPublisher {
    /// Create a publisher for `local` under `label`.
    pub fn new(
        routing: Arc<dyn RoutingTable>,
        label: impl Into<String>,
        local: AddrInfo,
        config: DhtPublisherConfig,
    ) -> Self {
        Self {
            routing,
            label: label.into(),
            local,
            config,
            task_handle: Mutex::new(None),
        }
    }

    /// Start the background publishing task.
    pub async fn start(&self, shutdown: CancellationToken) {
        let mut slot = self.task_handle.lock().await;
        if slot.is_some() {
            warn!("DHT publisher already started");
            return;
        }

        let routing = Arc::clone(&self.routing);
        let label = self.label.clone();
        let local = self.local.clone();
        let config = self.config.clone();

        *slot = Some(tokio::spawn(async move {
            info!(%label, "Starting DHT publisher");
            let mut interval = tokio::time::interval(config.publish_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(%label, "DHT publisher shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        publish(routing.as_ref(), &label, &local, &shutdown).await;
                    }
                }
            }
        }));
    }

    /// Stop the background task.
    pub async fn stop(&self) {
        if let Some(handle) = self.task_handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn publish(
    routing: &dyn RoutingTable,
    label: &str,
    local: &AddrInfo,
    shutdown: &CancellationToken,
) {
    let record = ProviderRecord::new(local.id, local.addrs.iter().copied().collect());
    tokio::select! {
        _ = shutdown.cancelled() => {}
        res = routing.provide(label, &record) => match res {
            Ok(()) => debug!(label, "advertised presence"),
            Err(e) => warn!(label, error = %e, "Failed to advertise presence"),
        }
    }
}
