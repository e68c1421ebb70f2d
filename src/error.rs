//! Error types for iroh-peer-discovery.

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A discovery mechanism failed to start. Only that mechanism is disabled.
    #[error("failed to start discovery mechanism {name}: {reason}")]
    MechanismStart {
        /// Mechanism name.
        name: &'static str,
        /// Why it failed.
        reason: String,
    },

    /// Connection error for a single peer.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A network-facing call ran past its time bound.
    #[error("timed out: {0}")]
    Timeout(&'static str),

    /// A seed address could not be parsed.
    #[error("invalid seed address {input:?}: {reason}")]
    InvalidSeed {
        /// The raw seed string.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire encoding error.
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// Routing table (DHT) error.
    #[error("DHT error: {0}")]
    Dht(String),

    /// One or more mechanisms failed to stop cleanly.
    #[error("shutdown errors: {}", .0.join("; "))]
    Shutdown(Vec<String>),
}

impl Error {
    /// Create a connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a mechanism start error.
    pub fn mechanism_start<S: ToString>(name: &'static str, reason: S) -> Self {
        Self::MechanismStart {
            name,
            reason: reason.to_string(),
        }
    }

    /// Create a DHT error.
    pub fn dht<S: ToString>(reason: S) -> Self {
        Self::Dht(reason.to_string())
    }
}
