//! Dial newly discovered peers and feed the outcome back into the store.
//!
//! Register the returned observer with
//! [`Coordinator::add_observer`](super::coordinator::Coordinator::add_observer).
//! Every new peer gets one bounded connection attempt; success marks it
//! `Connected` and raises its reliability, failure marks it `Unreachable`.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::debug;

use crate::transport::Transport;
use crate::Error;

use super::coordinator::PeerEvent;
use super::peers::{PeerStatus, PeerStore};

/// Default bound on one attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build an observer that dials each new peer in the background.
pub fn auto_connect(
    transport: Arc<dyn Transport>,
    store: Arc<PeerStore>,
    timeout: Duration,
) -> impl Fn(&PeerEvent) + Send + Sync + 'static {
    move |event: &PeerEvent| {
        let transport = Arc::clone(&transport);
        let store = Arc::clone(&store);
        let info = event.peer.info.clone();

        tokio::spawn(async move {
            let outcome = match time::timeout(timeout, transport.connect(&info)).await {
                Ok(res) => res,
                Err(_) => Err(Error::Timeout("peer connect")),
            };
            match outcome {
                Ok(()) => {
                    debug!(peer = %info.id, "Connected to discovered peer");
                    store.update_status(&info.id, PeerStatus::Connected, None).await;
                }
                Err(e) => {
                    debug!(peer = %info.id, error = %e, "Failed to connect to discovered peer");
                    store
                        .update_status(&info.id, PeerStatus::Unreachable, Some(e.to_string()))
                        .await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use iroh::SecretKey;

    use super::*;
    use crate::mock::MockTransport;
    use crate::swarm::discovery::DiscoveredPeer;
    use crate::transport::{AddrInfo, PeerId};

    fn peer_id(byte: u8) -> PeerId {
        SecretKey::from_bytes(&[byte; 32]).public()
    }

    async fn seen(store: &PeerStore, byte: u8) -> PeerEvent {
        let peer = DiscoveredPeer::from(
            AddrInfo::new(peer_id(byte)).with_addrs(["10.0.0.9:4001".parse().unwrap()]),
        );
        store.add_or_update(&peer, "static").await;
        PeerEvent {
            peer,
            source: "static".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn records_success_and_failure() {
        let transport = Arc::new(MockTransport::new(peer_id(1)));
        transport.set_reachable(peer_id(2), true);
        let store = Arc::new(PeerStore::default());
        let observer = auto_connect(transport, store.clone(), DEFAULT_CONNECT_TIMEOUT);

        observer(&seen(&store, 2).await);
        observer(&seen(&store, 3).await);
        time::sleep(Duration::from_millis(10)).await;

        let good = store.get(&peer_id(2)).await.unwrap();
        assert_eq!(good.status, PeerStatus::Connected);
        assert_eq!(good.connect_count, 1);

        let bad = store.get(&peer_id(3)).await.unwrap();
        assert_eq!(bad.status, PeerStatus::Unreachable);
        assert!(bad.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_dial_counts_as_unreachable() {
        let transport = Arc::new(MockTransport::new(peer_id(1)));
        transport.set_reachable(peer_id(2), true);
        transport.set_connect_delay(Duration::from_secs(30));
        let store = Arc::new(PeerStore::default());
        let observer = auto_connect(transport, store.clone(), Duration::from_secs(10));

        observer(&seen(&store, 2).await);
        time::sleep(Duration::from_secs(11)).await;

        let record = store.get(&peer_id(2)).await.unwrap();
        assert_eq!(record.status, PeerStatus::Unreachable);
        assert!(record.last_error.unwrap().contains("timed out"));
    }
}
