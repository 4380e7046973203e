//! Core types for the link monitor
//!
//! Wire shapes for the adjacency database published to the KV store, the
//! interface/prefix/peer queue messages, and the persisted operator state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::LinkMonitorError;

/// Base link metric used when no RTT measurement or override applies
pub const DEFAULT_LINK_METRIC: u32 = 1;

/// Source tag attached to prefix updates emitted by this daemon
pub const PREFIX_SOURCE: &str = "linkmond";

/// KV key prefix for per-area adjacency databases
pub const ADJ_DB_KEY_PREFIX: &str = "adj:";

/// KV key prefix for per-area node label claims
pub const NODE_LABEL_KEY_PREFIX: &str = "nodeLabel:";

/// Well-known identifier of the persisted `LinkMonitorState` blob
pub const STATE_STORE_KEY: &str = "link-monitor-state";

/// Derive a link metric from a measured round-trip time.
///
/// Sub-100µs links all collapse to the base metric so that short links do
/// not flap the metric on measurement noise.
pub fn metric_from_rtt(rtt_us: u64) -> u32 {
    std::cmp::max(DEFAULT_LINK_METRIC as u64, rtt_us / 100) as u32
}

/// An interface address in CIDR form (e.g. "fe80::1/64", "10.0.0.1/31").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CidrNetwork {
    /// Interface address
    pub addr: IpAddr,
    /// Prefix length in bits
    pub prefix_len: u8,
}

impl CidrNetwork {
    /// Creates a network, validating the prefix length for the family.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, LinkMonitorError> {
        let max_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max_len {
            return Err(LinkMonitorError::Config(format!(
                "prefix length {} exceeds maximum {} for {}",
                prefix_len, max_len, addr
            )));
        }
        Ok(Self { addr, prefix_len })
    }

    /// Returns true for an IPv4 network.
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Returns true for an IPv6 link-local address (fe80::/10).
    pub fn is_link_local(&self) -> bool {
        match self.addr {
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
            IpAddr::V4(v4) => v4.is_link_local(),
        }
    }

    /// Returns true for a loopback address.
    pub fn is_loopback(&self) -> bool {
        self.addr.is_loopback()
    }
}

impl fmt::Display for CidrNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for CidrNetwork {
    type Err = LinkMonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .rsplit_once('/')
            .ok_or_else(|| LinkMonitorError::Config(format!("invalid network: {}", s)))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| LinkMonitorError::Config(format!("invalid address: {}", s)))?;
        let prefix_len: u8 = len
            .parse()
            .map_err(|_| LinkMonitorError::Config(format!("invalid prefix length: {}", s)))?;
        Self::new(addr, prefix_len)
    }
}

/// Control-plane endpoint of a remote node, used to form a KV peering session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    /// Address the remote node's KV store listens on
    pub peer_addr: IpAddr,
    /// Control-plane port
    pub ctrl_port: u16,
    /// Identifier of the remote control-plane instance
    pub instance_id: String,
}

impl PeerSpec {
    /// Creates a peer spec.
    pub fn new(peer_addr: IpAddr, ctrl_port: u16, instance_id: impl Into<String>) -> Self {
        Self {
            peer_addr,
            ctrl_port,
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for PeerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.peer_addr, self.ctrl_port)
    }
}

/// Identity of an adjacency: (remote node name, local interface name).
pub type AdjacencyKey = (String, String);

/// A published adjacency record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjacency {
    /// Remote node name
    pub other_node_name: String,
    /// Local interface the adjacency is formed over
    pub if_name: String,
    /// Remote interface name
    pub other_if_name: String,
    /// Link metric used by route computation
    pub metric: u32,
    /// Adjacency segment label (0 unless segment routing is enabled)
    pub adj_label: u32,
    /// Set when the local interface is drained
    pub overloaded: bool,
    /// Last measured round-trip time in microseconds
    pub rtt_us: u64,
    /// Unix timestamp (seconds) of the last refresh
    pub timestamp: u64,
}

/// Adjacency table entry: published record plus session bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjacencyValue {
    /// Control-plane endpoint of the remote node
    pub peer_spec: PeerSpec,
    /// The published record
    pub adjacency: Adjacency,
    /// True while the remote node is inside a graceful-restart window
    pub restarting: bool,
    /// Area the adjacency belongs to; immutable for the life of the entry
    pub area: String,
}

/// Per-area adjacency database, serialized into the KV store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjacencyDatabase {
    /// Name of the node publishing the database
    pub node: String,
    /// Node-level drain flag
    pub overloaded: bool,
    /// Node segment label claimed for this area (0 if unallocated)
    pub node_label: u32,
    /// Area this database describes
    pub area: String,
    /// Adjacencies in the area, with effective metrics applied
    pub adjacencies: Vec<Adjacency>,
}

/// Snapshot of one interface, as carried on the interface-update queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    /// Interface name
    pub name: String,
    /// OS interface index
    pub if_index: u32,
    /// Operational up flag
    pub is_up: bool,
    /// Up, not drained, and past its flap backoff
    pub usable: bool,
    /// Interface metric (override or default)
    pub metric: u32,
    /// Addresses assigned to the interface
    pub networks: Vec<CidrNetwork>,
}

/// Full interface database snapshot published to the prober and FIB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDatabase {
    /// Name of the node publishing the snapshot
    pub node: String,
    /// Interfaces keyed by name
    pub interfaces: BTreeMap<String, InterfaceSnapshot>,
}

/// How redistributed prefixes should be programmed by downstream nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixForwardingType {
    /// Plain IP forwarding
    Ip,
    /// Segment-routing MPLS forwarding
    SrMpls,
}

impl Default for PrefixForwardingType {
    fn default() -> Self {
        PrefixForwardingType::Ip
    }
}

/// Path computation algorithm for redistributed prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixForwardingAlgorithm {
    /// Shortest path with equal-cost multipath
    SpEcmp,
    /// 2-shortest-path edge-disjoint with equal-cost multipath
    Ksp2EdEcmp,
}

impl Default for PrefixForwardingAlgorithm {
    fn default() -> Self {
        PrefixForwardingAlgorithm::SpEcmp
    }
}

/// A prefix advertised into the routing domain on behalf of an interface.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrefixEntry {
    /// The prefix itself
    pub network: CidrNetwork,
    /// Subsystem that originated the advertisement
    pub source: String,
    /// Forwarding type for downstream programming
    pub forwarding_type: PrefixForwardingType,
    /// Path algorithm for downstream programming
    pub forwarding_algorithm: PrefixForwardingAlgorithm,
}

/// Message on the prefix-update queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrefixUpdate {
    /// Advertise (add or refresh) the carried prefixes
    Advertise(Vec<PrefixEntry>),
    /// Withdraw the carried prefixes
    Withdraw(Vec<PrefixEntry>),
}

/// Per-area peer delta announced to the KV store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerUpdate {
    /// Area the delta applies to
    pub area: String,
    /// Peers to add or update, keyed by remote node name
    pub peers_to_add: BTreeMap<String, PeerSpec>,
    /// Remote node names to delete
    pub peers_to_del: Vec<String>,
}

impl PeerUpdate {
    /// Returns true when the delta carries no change.
    pub fn is_empty(&self) -> bool {
        self.peers_to_add.is_empty() && self.peers_to_del.is_empty()
    }
}

/// Kind of a neighbor event delivered by the prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborEventKind {
    /// Neighbor discovered or re-confirmed
    Up,
    /// Neighbor lost
    Down,
    /// Neighbor announced a graceful restart
    Restarting,
    /// Measured round-trip time changed
    RttChange,
}

impl NeighborEventKind {
    /// Event name used in log samples.
    pub fn as_str(&self) -> &'static str {
        match self {
            NeighborEventKind::Up => "NEIGHBOR_UP",
            NeighborEventKind::Down => "NEIGHBOR_DOWN",
            NeighborEventKind::Restarting => "NEIGHBOR_RESTARTING",
            NeighborEventKind::RttChange => "NEIGHBOR_RTT_CHANGE",
        }
    }
}

/// A neighbor event from the prober queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEvent {
    /// Event kind
    pub kind: NeighborEventKind,
    /// Remote node name
    pub remote_node: String,
    /// Remote interface name
    pub remote_if_name: String,
    /// Local interface the neighbor was heard on
    pub local_if_name: String,
    /// Control-plane endpoint of the remote node
    pub peer_spec: PeerSpec,
    /// Measured round-trip time in microseconds
    pub rtt_us: u64,
    /// Area the neighbor belongs to
    pub area: String,
}

/// A platform event from the netlink queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetlinkEvent {
    /// Link state changed
    Link {
        /// Interface name
        name: String,
        /// OS interface index
        if_index: u32,
        /// Operational up flag
        is_up: bool,
    },
    /// Address added or removed
    Addr {
        /// OS interface index
        if_index: u32,
        /// The address with prefix length
        network: CidrNetwork,
        /// True for add, false for remove
        is_add: bool,
    },
}

/// Structured event record emitted on the log-sample queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSample {
    /// Event name (e.g. "NEIGHBOR_UP", "IFACE_DOWN", "PEER_ADD")
    pub event: String,
    /// Unix timestamp in milliseconds
    pub timestamp_ms: u64,
    /// Free-form string fields
    pub fields: BTreeMap<String, String>,
}

impl LogSample {
    /// Creates a sample stamped with the current time.
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            timestamp_ms: unix_time_ms(),
            fields: BTreeMap::new(),
        }
    }

    /// Attaches a string field.
    pub fn with(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }
}

/// Operator state persisted across restarts.
///
/// Rewritten on every operator change, before any advertisement goes out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkMonitorState {
    /// Node-level drain flag
    pub node_overloaded: bool,
    /// Interfaces drained by the operator
    pub overloaded_links: BTreeSet<String>,
    /// Per-interface metric overrides
    pub link_metric_overrides: BTreeMap<String, u32>,
    /// Per-(interface, remote node) adjacency metric overrides
    pub adj_metric_overrides: BTreeMap<String, BTreeMap<String, u32>>,
    /// Node labels claimed per area
    pub node_labels: BTreeMap<String, u32>,
    /// Blob version for forward compatibility
    pub version: u32,
}

impl LinkMonitorState {
    /// Current blob version.
    pub const VERSION: u32 = 1;

    /// Returns the adjacency metric override for (interface, node), if any.
    pub fn adj_metric_override(&self, if_name: &str, node: &str) -> Option<u32> {
        self.adj_metric_overrides
            .get(if_name)
            .and_then(|m| m.get(node))
            .copied()
    }

    /// Sets or clears the adjacency metric override for (interface, node).
    ///
    /// Returns true if the state changed.
    pub fn set_adj_metric_override(
        &mut self,
        if_name: &str,
        node: &str,
        metric: Option<u32>,
    ) -> bool {
        match metric {
            Some(m) => {
                let by_node = self.adj_metric_overrides.entry(if_name.to_string()).or_default();
                by_node.insert(node.to_string(), m) != Some(m)
            }
            None => {
                let Some(by_node) = self.adj_metric_overrides.get_mut(if_name) else {
                    return false;
                };
                let removed = by_node.remove(node).is_some();
                if by_node.is_empty() {
                    self.adj_metric_overrides.remove(if_name);
                }
                removed
            }
        }
    }
}

/// Information about one OS link, as enumerated through the platform handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Interface name
    pub name: String,
    /// OS interface index
    pub if_index: u32,
    /// Operational up flag
    pub is_up: bool,
}

/// Information about one OS address, as enumerated through the platform handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    /// OS interface index the address is assigned to
    pub if_index: u32,
    /// The address with prefix length
    pub network: CidrNetwork,
}

/// Current Unix time in milliseconds.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current Unix time in seconds.
pub fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse_and_display() {
        let net: CidrNetwork = "fe80::1/64".parse().unwrap();
        assert!(!net.is_ipv4());
        assert!(net.is_link_local());
        assert_eq!(net.to_string(), "fe80::1/64");

        let v4: CidrNetwork = "10.0.0.1/31".parse().unwrap();
        assert!(v4.is_ipv4());
        assert!(!v4.is_link_local());
    }

    #[test]
    fn test_cidr_invalid_prefix_len() {
        assert!("10.0.0.0/33".parse::<CidrNetwork>().is_err());
        assert!("2001:db8::/129".parse::<CidrNetwork>().is_err());
        assert!("10.0.0.0".parse::<CidrNetwork>().is_err());
    }

    #[test]
    fn test_metric_from_rtt() {
        assert_eq!(metric_from_rtt(0), DEFAULT_LINK_METRIC);
        assert_eq!(metric_from_rtt(99), DEFAULT_LINK_METRIC);
        assert_eq!(metric_from_rtt(1000), 10);
        assert_eq!(metric_from_rtt(25_000), 250);
    }

    #[test]
    fn test_peer_update_is_empty() {
        let update = PeerUpdate {
            area: "0".to_string(),
            peers_to_add: BTreeMap::new(),
            peers_to_del: vec![],
        };
        assert!(update.is_empty());
    }

    #[test]
    fn test_state_adj_override_roundtrip() {
        let mut state = LinkMonitorState::default();
        assert!(state.set_adj_metric_override("et1", "N2", Some(42)));
        assert_eq!(state.adj_metric_override("et1", "N2"), Some(42));

        // same value again is a no-op
        assert!(!state.set_adj_metric_override("et1", "N2", Some(42)));

        assert!(state.set_adj_metric_override("et1", "N2", None));
        assert_eq!(state.adj_metric_override("et1", "N2"), None);
        assert!(state.adj_metric_overrides.is_empty());

        // clearing a missing override is a no-op
        assert!(!state.set_adj_metric_override("et1", "N2", None));
    }

    #[test]
    fn test_state_serde_roundtrip() {
        let mut state = LinkMonitorState {
            node_overloaded: true,
            version: LinkMonitorState::VERSION,
            ..Default::default()
        };
        state.overloaded_links.insert("et1".to_string());
        state.link_metric_overrides.insert("et2".to_string(), 7);
        state.set_adj_metric_override("et1", "N2", Some(11));
        state.node_labels.insert("0".to_string(), 101);

        let blob = serde_json::to_string(&state).unwrap();
        let parsed: LinkMonitorState = serde_json::from_str(&blob).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_log_sample_fields() {
        let sample = LogSample::new("NEIGHBOR_UP")
            .with("node", "N2")
            .with("area", "0");
        assert_eq!(sample.event, "NEIGHBOR_UP");
        assert_eq!(sample.fields.get("node").map(String::as_str), Some("N2"));
        assert_eq!(sample.fields.get("area").map(String::as_str), Some("0"));
    }

    #[test]
    fn test_neighbor_event_kind_names() {
        assert_eq!(NeighborEventKind::Up.as_str(), "NEIGHBOR_UP");
        assert_eq!(NeighborEventKind::Restarting.as_str(), "NEIGHBOR_RESTARTING");
    }
}
