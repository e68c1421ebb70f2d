//! Pluggable discovery mechanisms and the scope they run under.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::transport::{AddrInfo, PeerId};
use crate::Result;

/// A peer as returned by a discovery mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    /// Identity and addresses.
    pub info: AddrInfo,
    /// Capability names the peer advertised, if the mechanism carries them.
    pub services: BTreeSet<String>,
}

impl DiscoveredPeer {
    /// The peer's identity.
    pub fn id(&self) -> PeerId {
        self.info.id
    }

    /// Attach advertised services.
    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services.extend(services.into_iter().map(Into::into));
        self
    }
}

impl From<AddrInfo> for DiscoveredPeer {
    fn from(info: AddrInfo) -> Self {
        Self {
            info,
            services: BTreeSet::new(),
        }
    }
}

/// Cancellable lifetime scope with an optional deadline.
///
/// Child scopes are cancelled with their parent. A deadline only ever
/// shrinks when deriving a child.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Scope {
    /// A fresh root scope with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// The underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Derive a child scope sharing this scope's deadline.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child scope that expires after `timeout` at the latest.
    ///
    /// A timeout too large for the clock adds no deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = match (self.deadline, Instant::now().checked_add(timeout)) {
            (Some(existing), Some(candidate)) => Some(existing.min(candidate)),
            (existing, None) => existing,
            (None, candidate) => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this scope and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether this scope was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether this scope was cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the scope is cancelled or expired.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Resolves once the scope is cancelled, ignoring the deadline.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Roughly thirty years, the horizon used when a delay overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The instant `delay` from now, clamped to a far-future instant on overflow.
pub(crate) fn instant_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Cancel `child` when `parent` is cancelled.
///
/// Backends create their own token at construction so they can be stopped
/// individually, and tie it to the coordinator's scope on start.
pub(crate) fn link(parent: &Scope, child: &CancellationToken) {
    let parent = parent.token.clone();
    let child = child.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = parent.cancelled() => child.cancel(),
            _ = child.cancelled() => {}
        }
    });
}

/// A pluggable peer discovery mechanism.
///
/// A failing [`start`](Discovery::start) only disables that mechanism.
/// [`find_peers`](Discovery::find_peers) returns at most `limit` peers and
/// must return whatever it has when the scope expires rather than failing.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Human-readable name for logging (e.g. "dht", "mdns").
    fn name(&self) -> &'static str;

    /// Start background work. Tasks must exit when `scope` is cancelled.
    async fn start(&self, scope: &Scope) -> Result<()>;

    /// Stop background work and release resources.
    async fn stop(&self) -> Result<()>;

    /// Query for peers now.
    async fn find_peers(&self, scope: &Scope, limit: usize) -> Result<Vec<DiscoveredPeer>>;
}
