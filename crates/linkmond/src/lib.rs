//! Link Monitor Daemon
//!
//! Convergence point between the OS network stack, the neighbor prober and
//! the routing key-value store. Consumes kernel link/address events and
//! prober neighbor events; publishes per-area adjacency databases and peer
//! deltas to the KV store, interface database snapshots to the prober/FIB,
//! and redistributed prefixes to the prefix manager. Operator overrides
//! (drains, metric overrides) persist across restarts.

pub mod adjacency;
pub mod allocator;
pub mod backoff;
pub mod config;
pub mod error;
pub mod interface;
pub mod kv;
pub mod monitor;
pub mod netlink;
pub mod store;
pub mod throttle;
pub mod types;

pub use adjacency::{AdjacencyTable, UpOutcome};
pub use allocator::LabelAllocator;
pub use backoff::ExponentialBackoff;
pub use config::{AreaConfig, Config, KvConfig};
pub use error::{LinkMonitorError, Result};
pub use interface::{InterfaceEntry, InterfaceFilter, InterfaceTable, NameSetFilter};
pub use kv::{KvStoreClient, MemKvStore, RedisKvStore, SharedKvStore};
pub use monitor::{LinkMonitor, LinkMonitorHandle, OutboundQueues, OutboundReceivers};
pub use netlink::{LinkProvider, MockLinkProvider};
pub use store::{ConfigStore, FileConfigStore, MemConfigStore, SharedConfigStore};
pub use throttle::Throttle;
pub use types::*;
