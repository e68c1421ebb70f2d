//! Configuration for the discovery subsystem.
//!
//! Resolution order: environment variables → config file → defaults.
//! Durations are whole seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::swarm::coordinator::CoordinatorConfig;
use crate::swarm::dht::backend::DEFAULT_RENDEZVOUS;
use crate::swarm::mdns::SERVICE_TAG;
use crate::swarm::peers::StoreConfig;
use crate::swarm::seed::SeedPolicy;
use crate::{Error, Result};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "PEER_DISCOVERY_";

/// Upper bound on every interval and timeout, one year.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Local-network broadcast.
    pub mdns: MdnsConfig,
    /// Static seed list.
    pub seeds: SeedsConfig,
    /// Routed lookup over the mainline DHT.
    pub dht: DhtConfig,
    /// Sweep scheduling.
    pub coordinator: CoordinatorSettings,
    /// Peer population limits.
    pub store: StoreSettings,
}

/// Local-network broadcast settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MdnsConfig {
    /// Whether this mechanism runs.
    pub enabled: bool,
    /// Nodes only see others announcing the same tag.
    pub service_tag: String,
    /// Longest a single drain of the inbound queue may take.
    pub query_timeout_secs: u64,
    /// Service names to advertise.
    pub services: Vec<String>,
}

/// Static seed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedsConfig {
    /// Whether this mechanism runs.
    pub enabled: bool,
    /// Seeds as `<node-id>@<ip:port>`.
    pub addrs: Vec<String>,
    /// Tries per connect sweep.
    pub attempts: u32,
    /// Bound on a single try.
    pub connect_timeout_secs: u64,
    /// First backoff; doubles after each failed try.
    pub initial_backoff_secs: u64,
    /// How often a connected seed is checked.
    pub supervise_interval_secs: u64,
    /// Bound on a supervisor's reconnect.
    pub reconnect_timeout_secs: u64,
}

/// Routed lookup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Whether this mechanism runs.
    pub enabled: bool,
    /// Label every node advertises under.
    pub rendezvous: String,
    /// Time between provider record publications.
    pub advertise_interval_secs: u64,
    /// Bound on a single lookup.
    pub query_timeout_secs: u64,
}

/// Coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Time between sweeps.
    pub sweep_interval_secs: u64,
    /// Peers requested from each mechanism per sweep.
    pub query_limit: usize,
    /// Bound on one mechanism's query.
    pub query_timeout_secs: u64,
    /// Time between population summaries.
    pub stats_interval_secs: u64,
    /// Dial every newly discovered peer and record the outcome.
    pub auto_connect: bool,
    /// Bound on an auto-connect dial.
    pub connect_timeout_secs: u64,
}

/// Peer store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// New identities are rejected beyond this many records.
    pub max_peers: usize,
    /// Idle time after which a low-trust peer is evicted.
    pub retention_secs: u64,
    /// Time between eviction passes.
    pub eviction_interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_tag: SERVICE_TAG.to_owned(),
            query_timeout_secs: 5,
            services: Vec::new(),
        }
    }
}

impl Default for SeedsConfig {
    fn default() -> Self {
        let policy = SeedPolicy::default();
        Self {
            enabled: true,
            addrs: Vec::new(),
            attempts: policy.attempts,
            connect_timeout_secs: policy.connect_timeout.as_secs(),
            initial_backoff_secs: policy.initial_backoff.as_secs(),
            supervise_interval_secs: policy.supervise_interval.as_secs(),
            reconnect_timeout_secs: policy.reconnect_timeout.as_secs(),
        }
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rendezvous: DEFAULT_RENDEZVOUS.to_owned(),
            advertise_interval_secs: 60,
            query_timeout_secs: 10,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            query_limit: 10,
            query_timeout_secs: 10,
            stats_interval_secs: 60,
            auto_connect: false,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            max_peers: store.max_peers,
            retention_secs: store.retention.as_secs(),
            eviction_interval_secs: store.eviction_interval.as_secs(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl SeedsConfig {
    /// Retry and supervision timings.
    pub fn policy(&self) -> SeedPolicy {
        SeedPolicy {
            attempts: self.attempts,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            initial_backoff: Duration::from_secs(self.initial_backoff_secs),
            supervise_interval: Duration::from_secs(self.supervise_interval_secs),
            reconnect_timeout: Duration::from_secs(self.reconnect_timeout_secs),
        }
    }
}

impl CoordinatorSettings {
    /// Scheduling for the coordinator.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            query_limit: self.query_limit,
            query_timeout: Duration::from_secs(self.query_timeout_secs),
            stats_interval: Duration::from_secs(self.stats_interval_secs),
        }
    }
}

impl StoreSettings {
    /// Store limits.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_peers: self.max_peers,
            retention: Duration::from_secs(self.retention_secs),
            eviction_interval: Duration::from_secs(self.eviction_interval_secs),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DiscoveryConfig {
    /// Load from a TOML file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without applying overrides or validating.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply `PEER_DISCOVERY_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok());
    }

    /// Apply overrides from any key lookup. Keys are given without the prefix.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |key: &str| lookup(key).map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1"));

        if let Some(v) = flag("ENABLE_MDNS") {
            self.mdns.enabled = v;
        }
        if let Some(v) = flag("ENABLE_SEEDS") {
            self.seeds.enabled = v;
        }
        if let Some(v) = flag("ENABLE_DHT") {
            self.dht.enabled = v;
        }
        if let Some(v) = flag("AUTO_CONNECT") {
            self.coordinator.auto_connect = v;
        }
        if let Some(v) = lookup("MDNS_SERVICE_TAG") {
            self.mdns.service_tag = v;
        }
        if let Some(v) = lookup("DHT_RENDEZVOUS") {
            self.dht.rendezvous = v;
        }
        if let Some(v) = lookup("SEEDS") {
            self.seeds.addrs = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(v) = lookup("MAX_PEERS").and_then(|v| v.parse().ok()) {
            self.store.max_peers = v;
        }
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if !self.mdns.enabled && !self.seeds.enabled && !self.dht.enabled {
            return Err(Error::Config("at least one discovery mechanism must be enabled".into()));
        }

        let intervals = [
            ("coordinator.sweep_interval_secs", self.coordinator.sweep_interval_secs),
            ("coordinator.query_timeout_secs", self.coordinator.query_timeout_secs),
            ("coordinator.stats_interval_secs", self.coordinator.stats_interval_secs),
            ("store.eviction_interval_secs", self.store.eviction_interval_secs),
        ];
        for (name, secs) in intervals {
            if secs == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        for (name, secs) in self.durations() {
            if secs > MAX_DURATION_SECS {
                return Err(Error::Config(format!("{name} must be at most {MAX_DURATION_SECS}")));
            }
        }
        if self.coordinator.query_limit == 0 {
            return Err(Error::Config("coordinator.query_limit must be greater than zero".into()));
        }
        if self.store.max_peers == 0 {
            return Err(Error::Config("store.max_peers must be greater than zero".into()));
        }

        if self.mdns.enabled {
            if self.mdns.service_tag.is_empty() || self.mdns.service_tag.contains(',') {
                return Err(Error::Config("mdns.service_tag must be non-empty and free of commas".into()));
            }
            if self.mdns.services.iter().any(|s| s.is_empty() || s.contains(',')) {
                return Err(Error::Config("mdns.services must be non-empty and free of commas".into()));
            }
        }
        if self.seeds.enabled && (self.seeds.attempts == 0 || self.seeds.supervise_interval_secs == 0) {
            return Err(Error::Config("seeds.attempts and seeds.supervise_interval_secs must be non-zero".into()));
        }
        if self.dht.enabled {
            if self.dht.advertise_interval_secs == 0 {
                return Err(Error::Config("dht.advertise_interval_secs must be greater than zero".into()));
            }
            if self.dht.rendezvous.is_empty() {
                return Err(Error::Config("dht.rendezvous must not be empty".into()));
            }
        }
        Ok(())
    }

    fn durations(&self) -> [(&'static str, u64); 13] {
        [
            ("mdns.query_timeout_secs", self.mdns.query_timeout_secs),
            ("seeds.connect_timeout_secs", self.seeds.connect_timeout_secs),
            ("seeds.initial_backoff_secs", self.seeds.initial_backoff_secs),
            ("seeds.supervise_interval_secs", self.seeds.supervise_interval_secs),
            ("seeds.reconnect_timeout_secs", self.seeds.reconnect_timeout_secs),
            ("dht.advertise_interval_secs", self.dht.advertise_interval_secs),
            ("dht.query_timeout_secs", self.dht.query_timeout_secs),
            ("coordinator.sweep_interval_secs", self.coordinator.sweep_interval_secs),
            ("coordinator.query_timeout_secs", self.coordinator.query_timeout_secs),
            ("coordinator.stats_interval_secs", self.coordinator.stats_interval_secs),
            ("coordinator.connect_timeout_secs", self.coordinator.connect_timeout_secs),
            ("store.retention_secs", self.store.retention_secs),
            ("store.eviction_interval_secs", self.store.eviction_interval_secs),
        ]
    }
}
