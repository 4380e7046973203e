//! Error types for linkmond

use thiserror::Error;

/// Link monitor daemon errors
#[derive(Error, Debug)]
pub enum LinkMonitorError {
    /// Configuration error (invalid or self-inconsistent config)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistent store error
    #[error("Config store error: {0}")]
    Store(String),

    /// Key-value store error
    #[error("KV store error: {0}")]
    KvStore(String),

    /// Netlink error
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// Operation referenced an interface the monitor does not know
    #[error("Unknown interface: {0}")]
    UnknownInterface(String),

    /// Operation referenced an adjacency the monitor does not know
    #[error("Unknown adjacency: {node} over {if_name}")]
    UnknownAdjacency {
        /// Remote node name
        node: String,
        /// Local interface name
        if_name: String,
    },

    /// The monitor is shutting down; the request was not served
    #[error("Link monitor is shutting down")]
    ShuttingDown,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type for linkmond operations
pub type Result<T> = std::result::Result<T, LinkMonitorError>;
