//! [`RoutingTable`] over the BitTorrent mainline DHT.
//!
//! Mainline stores signed mutable items addressed by public key and salt.
//! Every node that knows a rendezvous label derives the same keypairs, so
//! providers share a fixed number of slots per label and unix minute. A
//! publisher claims the first slot, starting from one picked by its node id,
//! that is empty or already holds its own record. A lookup reads every slot
//! of the current and previous minute.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use mainline::{Dht, MutableItem, SigningKey};
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use crate::swarm::record::{unix_now, ProviderRecord};
use crate::{Error, Result};

use super::{ProviderStream, RoutingTable};

/// Provider slots per label and minute.
pub const DEFAULT_SLOTS: u8 = 16;

/// Storage for signed mutable items. Implemented by [`Dht`].
///
/// Calls block; [`MainlineRouting`] runs them on the blocking pool.
pub trait ItemStore: Send + Sync + 'static {
    /// Whether the store can reach the network.
    fn bootstrapped(&self) -> bool {
        true
    }

    /// The most recent item under `public_key` and `salt`.
    fn get(&self, public_key: &[u8; 32], salt: &[u8]) -> Option<MutableItem>;

    /// Store a signed item.
    fn put(&self, item: MutableItem) -> Result<()>;
}

impl ItemStore for Dht {
    fn bootstrapped(&self) -> bool {
        Dht::bootstrapped(self)
    }

    fn get(&self, public_key: &[u8; 32], salt: &[u8]) -> Option<MutableItem> {
        self.get_mutable_most_recent(public_key, Some(salt))
    }

    fn put(&self, item: MutableItem) -> Result<()> {
        self.put_mutable(item, None).map(drop).map_err(Error::dht)
    }
}

/// One provider slot: a shared keypair and salt.
struct Slot {
    key: SigningKey,
    salt: Vec<u8>,
}

impl Slot {
    fn derive(label: &[u8], minute: u64, index: u8) -> Self {
        let digest = |domain: &[u8]| -> [u8; 32] {
            Sha256::new()
                .chain_update(domain)
                .chain_update((label.len() as u64).to_le_bytes())
                .chain_update(label)
                .chain_update(minute.to_le_bytes())
                .chain_update([index])
                .finalize()
                .into()
        };
        Self {
            key: SigningKey::from_bytes(&digest(b"iroh-peer-discovery/slot-key/v2")),
            salt: digest(b"iroh-peer-discovery/slot-salt/v2").to_vec(),
        }
    }

    fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }
}

fn unix_minute(offset: i64) -> u64 {
    (unix_now() / 60).saturating_add_signed(offset)
}

/// Slot a node tries first, spread by node id and minute.
fn first_slot(node_id: &[u8; 32], minute: u64, slots: u8) -> u8 {
    let mut head = [0u8; 8];
    head.copy_from_slice(&node_id[..8]);
    ((u64::from_le_bytes(head) ^ minute) % u64::from(slots)) as u8
}

/// Mainline-backed routing table.
#[derive(Clone)]
pub struct MainlineRouting {
    store: Arc<dyn ItemStore>,
    slots: u8,
}

impl MainlineRouting {
    /// Start a new DHT client.
    pub fn client() -> Result<Self> {
        let dht = Dht::client().map_err(|e| Error::dht(format!("DHT client: {e}")))?;
        Ok(Self::with_store(Arc::new(dht)))
    }

    /// Wrap an existing item store, usually a shared [`Dht`].
    pub fn with_store(store: Arc<dyn ItemStore>) -> Self {
        Self {
            store,
            slots: DEFAULT_SLOTS,
        }
    }

    /// Provider slots per label and minute. Default: 16.
    pub fn slots(mut self, slots: u8) -> Self {
        self.slots = slots.max(1);
        self
    }
}

/// Claim a slot for `record`. Returns the slot index.
fn claim(store: &dyn ItemStore, label: &[u8], record: &ProviderRecord, slots: u8) -> Result<u8> {
    let minute = unix_minute(0);
    let value = record.to_bytes()?;
    let start = first_slot(&record.node_id, minute, slots);

    for step in 0..slots {
        let index = ((u16::from(start) + u16::from(step)) % u16::from(slots)) as u8;
        let slot = Slot::derive(label, minute, index);
        let current = store.get(&slot.public_key(), &slot.salt);
        let taken = current.as_ref().is_some_and(|item| {
            ProviderRecord::from_bytes(item.value()).is_ok_and(|held| held.node_id != record.node_id)
        });
        if taken {
            trace!(index, "slot held by another provider");
            continue;
        }

        let seq = current
            .map_or(0, |item| item.seq().saturating_add(1))
            .max(record.published_at as i64);
        store.put(MutableItem::new(slot.key, &value, seq, Some(slot.salt.as_slice())))?;
        return Ok(index);
    }

    Err(Error::dht(format!("all {slots} provider slots are taken")))
}

/// Read one slot, or `None` if it is empty or unreadable.
async fn read_slot(store: Arc<dyn ItemStore>, label: Arc<[u8]>, minute: u64, index: u8) -> Option<ProviderRecord> {
    let item = tokio::task::spawn_blocking(move || {
        let slot = Slot::derive(&label, minute, index);
        store.get(&slot.public_key(), &slot.salt)
    })
    .await
    .ok()
    .flatten()?;

    match ProviderRecord::from_bytes(item.value()) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(minute, index, error = %e, "Failed to decode DHT record");
            None
        }
    }
}

#[async_trait]
impl RoutingTable for MainlineRouting {
    async fn bootstrap(&self) -> Result<()> {
        let store = Arc::clone(&self.store);
        let bootstrapped = tokio::task::spawn_blocking(move || store.bootstrapped())
            .await
            .map_err(Error::dht)?;
        if bootstrapped {
            Ok(())
        } else {
            Err(Error::dht("bootstrap reached no nodes"))
        }
    }

    async fn provide(&self, label: &str, record: &ProviderRecord) -> Result<()> {
        let store = Arc::clone(&self.store);
        let key = label.as_bytes().to_vec();
        let owned = record.clone();
        let slots = self.slots;
        let index = tokio::task::spawn_blocking(move || claim(store.as_ref(), &key, &owned, slots))
            .await
            .map_err(Error::dht)??;
        debug!(label, index, "Published DHT record");
        Ok(())
    }

    fn find_providers(&self, label: &str) -> ProviderStream {
        let store = Arc::clone(&self.store);
        let label: Arc<[u8]> = label.as_bytes().into();
        let slots = self.slots;
        async_stream::stream! {
            for offset in [0i64, -1] {
                let minute = unix_minute(offset);
                let mut reads: FuturesUnordered<_> = (0..slots)
                    .map(|index| read_slot(Arc::clone(&store), Arc::clone(&label), minute, index))
                    .collect();
                while let Some(found) = reads.next().await {
                    if let Some(record) = found {
                        yield record.addr_info();
                    }
                }
            }
        }
        .boxed()
    }
}
