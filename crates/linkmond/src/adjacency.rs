//! Adjacency table: per-(neighbor, interface) lifecycle and peer derivation.
//!
//! Entries are created on neighbor up, removed on neighbor down, and flagged
//! (not removed) during a remote graceful restart so that downstream nodes
//! keep their routes and the KV session can re-establish without a teardown.

use std::collections::BTreeMap;
use tracing::debug;

use crate::types::{
    metric_from_rtt, unix_time_secs, Adjacency, AdjacencyKey, AdjacencyValue, PeerSpec,
};

/// Outcome of a neighbor-up application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpOutcome {
    /// A new entry was inserted (or an existing one replaced wholesale)
    Inserted,
    /// An identical peer spec already existed; restarting cleared, timestamps
    /// refreshed, nothing else touched
    Refreshed,
}

/// Table of currently active adjacencies.
///
/// Keyed by (remote node name, local interface name); kept ordered so that
/// the lexicographically-smallest-interface tie-break in peer derivation
/// falls out of plain iteration.
#[derive(Debug, Default)]
pub struct AdjacencyTable {
    entries: BTreeMap<AdjacencyKey, AdjacencyValue>,
}

impl AdjacencyTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a neighbor-up event.
    ///
    /// If an entry already exists with an identical peer spec, only the
    /// restarting flag and timestamp are touched; otherwise the entry is
    /// inserted (replacing any stale one under the same key).
    pub fn apply_up(&mut self, key: AdjacencyKey, value: AdjacencyValue) -> UpOutcome {
        if let Some(existing) = self.entries.get_mut(&key) {
            if existing.peer_spec == value.peer_spec {
                existing.restarting = false;
                existing.adjacency.timestamp = unix_time_secs();
                return UpOutcome::Refreshed;
            }
        }
        self.entries.insert(key, value);
        UpOutcome::Inserted
    }

    /// Marks an adjacency as restarting. Returns false for unknown keys.
    pub fn mark_restarting(&mut self, node: &str, if_name: &str) -> bool {
        match self.entries.get_mut(&(node.to_string(), if_name.to_string())) {
            Some(value) => {
                value.restarting = true;
                true
            }
            None => false,
        }
    }

    /// Removes an adjacency, returning the removed value.
    pub fn remove(&mut self, node: &str, if_name: &str) -> Option<AdjacencyValue> {
        let removed = self.entries.remove(&(node.to_string(), if_name.to_string()));
        if removed.is_some() {
            debug!(node, if_name, "Removed adjacency");
        }
        removed
    }

    /// Applies a measured RTT to an adjacency.
    ///
    /// The metric follows only when RTT-derived metrics are enabled.
    /// Returns false for unknown keys.
    pub fn update_rtt(&mut self, node: &str, if_name: &str, rtt_us: u64, use_rtt_metric: bool) -> bool {
        match self.entries.get_mut(&(node.to_string(), if_name.to_string())) {
            Some(value) => {
                value.adjacency.rtt_us = rtt_us;
                if use_rtt_metric {
                    value.adjacency.metric = metric_from_rtt(rtt_us);
                }
                true
            }
            None => false,
        }
    }

    /// Looks up an adjacency.
    pub fn get(&self, node: &str, if_name: &str) -> Option<&AdjacencyValue> {
        self.entries.get(&(node.to_string(), if_name.to_string()))
    }

    /// Returns true when the (node, interface) adjacency exists.
    pub fn contains(&self, node: &str, if_name: &str) -> bool {
        self.get(node, if_name).is_some()
    }

    /// Iterates adjacencies belonging to an area.
    pub fn iter_area<'a>(
        &'a self,
        area: &'a str,
    ) -> impl Iterator<Item = (&'a AdjacencyKey, &'a AdjacencyValue)> {
        self.entries.iter().filter(move |(_, v)| v.area == area)
    }

    /// Number of adjacencies.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no adjacencies exist.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Derives the peer map for an area.
    ///
    /// One peer per remote node: every adjacency in the area whose local
    /// interface is usable contributes, and when a node is reachable over
    /// several interfaces the lexicographically smallest interface name
    /// wins. Restarting adjacencies stay in the derivation so a graceful
    /// restart never tears the peer down.
    pub fn peers_for_area<F>(&self, area: &str, mut usable: F) -> BTreeMap<String, PeerSpec>
    where
        F: FnMut(&str) -> bool,
    {
        let mut peers = BTreeMap::new();
        // entries iterate ordered by (node, if_name), so the first interface
        // seen for a node is the smallest
        for ((node, if_name), value) in &self.entries {
            if value.area != area || !usable(if_name) {
                continue;
            }
            peers
                .entry(node.clone())
                .or_insert_with(|| value.peer_spec.clone());
        }
        peers
    }
}

/// Builds the published record for a fresh neighbor-up event.
pub fn adjacency_from_event(
    remote_node: &str,
    remote_if_name: &str,
    local_if_name: &str,
    rtt_us: u64,
    use_rtt_metric: bool,
) -> Adjacency {
    let metric = if use_rtt_metric {
        metric_from_rtt(rtt_us)
    } else {
        crate::types::DEFAULT_LINK_METRIC
    };
    Adjacency {
        other_node_name: remote_node.to_string(),
        if_name: local_if_name.to_string(),
        other_if_name: remote_if_name.to_string(),
        metric,
        adj_label: 0,
        overloaded: false,
        rtt_us,
        timestamp: unix_time_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn spec(addr: &str, port: u16) -> PeerSpec {
        PeerSpec::new(addr.parse::<IpAddr>().unwrap(), port, "kv")
    }

    fn value(node: &str, if_name: &str, area: &str, addr: &str, port: u16) -> AdjacencyValue {
        AdjacencyValue {
            peer_spec: spec(addr, port),
            adjacency: adjacency_from_event(node, "remote0", if_name, 1000, true),
            restarting: false,
            area: area.to_string(),
        }
    }

    fn key(node: &str, if_name: &str) -> AdjacencyKey {
        (node.to_string(), if_name.to_string())
    }

    #[test]
    fn test_apply_up_insert_then_refresh() {
        let mut table = AdjacencyTable::new();
        let outcome = table.apply_up(key("N2", "et1"), value("N2", "et1", "0", "fe80::2", 60002));
        assert_eq!(outcome, UpOutcome::Inserted);

        table.mark_restarting("N2", "et1");
        assert!(table.get("N2", "et1").unwrap().restarting);

        // identical peer spec: refresh clears restarting
        let outcome = table.apply_up(key("N2", "et1"), value("N2", "et1", "0", "fe80::2", 60002));
        assert_eq!(outcome, UpOutcome::Refreshed);
        assert!(!table.get("N2", "et1").unwrap().restarting);
    }

    #[test]
    fn test_apply_up_replaces_on_new_spec() {
        let mut table = AdjacencyTable::new();
        table.apply_up(key("N2", "et1"), value("N2", "et1", "0", "fe80::2", 60002));

        let outcome = table.apply_up(key("N2", "et1"), value("N2", "et1", "0", "fe80::22", 60002));
        assert_eq!(outcome, UpOutcome::Inserted);
        assert_eq!(
            table.get("N2", "et1").unwrap().peer_spec,
            spec("fe80::22", 60002)
        );
    }

    #[test]
    fn test_remove() {
        let mut table = AdjacencyTable::new();
        table.apply_up(key("N2", "et1"), value("N2", "et1", "0", "fe80::2", 60002));
        assert!(table.remove("N2", "et1").is_some());
        assert!(table.remove("N2", "et1").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_mark_restarting_unknown() {
        let mut table = AdjacencyTable::new();
        assert!(!table.mark_restarting("N9", "et1"));
    }

    #[test]
    fn test_update_rtt_metric_modes() {
        let mut table = AdjacencyTable::new();
        table.apply_up(key("N2", "et1"), value("N2", "et1", "0", "fe80::2", 60002));

        assert!(table.update_rtt("N2", "et1", 5_000, true));
        let adj = &table.get("N2", "et1").unwrap().adjacency;
        assert_eq!(adj.rtt_us, 5_000);
        assert_eq!(adj.metric, 50);

        // metric frozen when rtt-metric mode is off
        assert!(table.update_rtt("N2", "et1", 9_000, false));
        let adj = &table.get("N2", "et1").unwrap().adjacency;
        assert_eq!(adj.rtt_us, 9_000);
        assert_eq!(adj.metric, 50);

        assert!(!table.update_rtt("N9", "et1", 1_000, true));
    }

    #[test]
    fn test_peers_min_ifname_tie_break() {
        let mut table = AdjacencyTable::new();
        table.apply_up(key("N2", "et2"), value("N2", "et2", "0", "fe80::b", 60002));
        table.apply_up(key("N2", "et1"), value("N2", "et1", "0", "fe80::a", 60002));
        table.apply_up(key("N3", "et5"), value("N3", "et5", "0", "fe80::c", 60002));

        let peers = table.peers_for_area("0", |_| true);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers["N2"], spec("fe80::a", 60002));
        assert_eq!(peers["N3"], spec("fe80::c", 60002));
    }

    #[test]
    fn test_peers_filter_area_and_usable() {
        let mut table = AdjacencyTable::new();
        table.apply_up(key("N2", "et1"), value("N2", "et1", "0", "fe80::a", 60002));
        table.apply_up(key("N3", "et2"), value("N3", "et2", "1", "fe80::b", 60002));

        let peers = table.peers_for_area("0", |_| true);
        assert_eq!(peers.len(), 1);
        assert!(peers.contains_key("N2"));

        // unusable interface drops the peer, falling back to the next interface
        table.apply_up(key("N2", "et3"), value("N2", "et3", "0", "fe80::d", 60002));
        let peers = table.peers_for_area("0", |if_name| if_name != "et1");
        assert_eq!(peers["N2"], spec("fe80::d", 60002));
    }

    #[test]
    fn test_peers_keep_restarting() {
        let mut table = AdjacencyTable::new();
        table.apply_up(key("N2", "et1"), value("N2", "et1", "0", "fe80::a", 60002));
        table.mark_restarting("N2", "et1");

        let peers = table.peers_for_area("0", |_| true);
        assert!(peers.contains_key("N2"));
    }

    #[test]
    fn test_iter_area() {
        let mut table = AdjacencyTable::new();
        table.apply_up(key("N2", "et1"), value("N2", "et1", "0", "fe80::a", 60002));
        table.apply_up(key("N3", "et2"), value("N3", "et2", "1", "fe80::b", 60002));

        assert_eq!(table.iter_area("0").count(), 1);
        assert_eq!(table.iter_area("1").count(), 1);
        assert_eq!(table.iter_area("2").count(), 0);
    }
}
