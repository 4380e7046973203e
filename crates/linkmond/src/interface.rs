//! Interface table: per-interface liveness, addresses and flap backoff.
//!
//! Link and address events from the platform funnel through this table; a
//! periodic full resync reconciles it against the OS inventory. Usability
//! (up, past backoff) feeds both the interface database snapshots and the
//! peer derivation.

use regex::RegexSet;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::backoff::ExponentialBackoff;
use crate::error::{LinkMonitorError, Result};
use crate::types::{AddrInfo, CidrNetwork, LinkInfo};

/// Include/exclude regex filter over interface names.
///
/// A name qualifies iff it matches the include set (or the include set is
/// empty) and does not match the exclude set.
#[derive(Debug)]
pub struct InterfaceFilter {
    include: RegexSet,
    exclude: RegexSet,
}

impl InterfaceFilter {
    /// Builds a filter from raw regex lists.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let include = RegexSet::new(include)
            .map_err(|e| LinkMonitorError::Config(format!("invalid include regex: {}", e)))?;
        let exclude = RegexSet::new(exclude)
            .map_err(|e| LinkMonitorError::Config(format!("invalid exclude regex: {}", e)))?;
        Ok(Self { include, exclude })
    }

    /// Returns true when the interface name qualifies.
    pub fn matches(&self, name: &str) -> bool {
        if self.exclude.is_match(name) {
            return false;
        }
        self.include.is_empty() || self.include.is_match(name)
    }
}

/// Name-set filter built from a single regex list; matches nothing when empty.
#[derive(Debug)]
pub struct NameSetFilter {
    set: RegexSet,
}

impl NameSetFilter {
    /// Builds the filter from a raw regex list.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let set = RegexSet::new(patterns)
            .map_err(|e| LinkMonitorError::Config(format!("invalid regex: {}", e)))?;
        Ok(Self { set })
    }

    /// Returns true when the name matches any pattern.
    pub fn matches(&self, name: &str) -> bool {
        self.set.is_match(name)
    }
}

/// Outcome of applying a link event to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkUpdate {
    /// Entry created by this event
    Created,
    /// The up flag flipped
    Transition {
        /// Previous up flag
        was_up: bool,
    },
    /// Nothing changed
    NoChange,
}

/// State of one monitored interface.
#[derive(Debug)]
pub struct InterfaceEntry {
    /// Interface name
    pub name: String,
    /// OS interface index
    pub if_index: u32,
    /// Operational up flag
    pub is_up: bool,
    /// Addresses currently assigned
    pub networks: BTreeSet<CidrNetwork>,
    backoff: ExponentialBackoff,
}

impl InterfaceEntry {
    fn new(name: String, if_index: u32, is_up: bool, init: Duration, max: Duration) -> Self {
        Self {
            name,
            if_index,
            is_up,
            networks: BTreeSet::new(),
            backoff: ExponentialBackoff::new(init, max),
        }
    }

    /// Up and past its flap backoff. Drain state is layered on by the caller.
    pub fn is_active(&self, now: Instant) -> bool {
        self.is_up && self.backoff.can_try_now(now)
    }

    /// Remaining backoff time, zero when stable.
    pub fn backoff_remaining(&self, now: Instant) -> Duration {
        self.backoff.time_remaining(now)
    }

    /// Current backoff interval (zero before the first flap).
    pub fn backoff_interval(&self) -> Duration {
        self.backoff.current_interval()
    }
}

/// Table of all monitored interfaces, including down ones.
#[derive(Debug)]
pub struct InterfaceTable {
    entries: BTreeMap<String, InterfaceEntry>,
    /// Index-to-name cache for resolving address events
    index_to_name: HashMap<u32, String>,
    linkflap_init_backoff: Duration,
    linkflap_max_backoff: Duration,
}

impl InterfaceTable {
    /// Creates an empty table with the configured flap backoff bounds.
    pub fn new(linkflap_init_backoff: Duration, linkflap_max_backoff: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            index_to_name: HashMap::new(),
            linkflap_init_backoff,
            linkflap_max_backoff,
        }
    }

    /// Applies a link event. The caller has already regex-filtered the name.
    ///
    /// A down-to-up transition arms the flap backoff: the interface becomes
    /// usable only once the backoff deadline passes.
    pub fn update_link(&mut self, name: &str, if_index: u32, is_up: bool, now: Instant) -> LinkUpdate {
        self.index_to_name.insert(if_index, name.to_string());

        match self.entries.get_mut(name) {
            None => {
                let mut entry = InterfaceEntry::new(
                    name.to_string(),
                    if_index,
                    is_up,
                    self.linkflap_init_backoff,
                    self.linkflap_max_backoff,
                );
                if is_up {
                    entry.backoff.report_error(now);
                }
                self.entries.insert(name.to_string(), entry);
                LinkUpdate::Created
            }
            Some(entry) => {
                entry.if_index = if_index;
                if entry.is_up == is_up {
                    return LinkUpdate::NoChange;
                }
                let was_up = entry.is_up;
                entry.is_up = is_up;
                if is_up {
                    entry.backoff.report_error(now);
                }
                LinkUpdate::Transition { was_up }
            }
        }
    }

    /// Applies an address event. Unknown indices are dropped; the next
    /// periodic resync picks the address up.
    ///
    /// Returns true when the address set changed.
    pub fn apply_addr_event(&mut self, if_index: u32, network: CidrNetwork, is_add: bool) -> bool {
        let Some(name) = self.index_to_name.get(&if_index) else {
            trace!(if_index, %network, "Address event for unknown index, dropping");
            return false;
        };
        let Some(entry) = self.entries.get_mut(name) else {
            return false;
        };
        let changed = if is_add {
            entry.networks.insert(network)
        } else {
            entry.networks.remove(&network)
        };
        if changed {
            debug!(interface = %entry.name, %network, is_add, "Address set changed");
        }
        changed
    }

    /// Reconciles the table against a full OS inventory.
    ///
    /// Entries absent from the inventory are marked down. Entries present
    /// but no longer qualifying the filter are removed. Address sets are
    /// replaced wholesale. Idempotent.
    ///
    /// Returns true when anything changed.
    pub fn reconcile(
        &mut self,
        links: &[LinkInfo],
        addrs: &[AddrInfo],
        filter: &InterfaceFilter,
        now: Instant,
    ) -> bool {
        let mut changed = false;

        let inventory: HashMap<&str, &LinkInfo> =
            links.iter().map(|l| (l.name.as_str(), l)).collect();

        // Drop entries excluded by the current filter; mark vanished ones down.
        let names: Vec<String> = self.entries.keys().cloned().collect();
        for name in names {
            match inventory.get(name.as_str()) {
                Some(_) if !filter.matches(&name) => {
                    debug!(interface = %name, "Removing interface excluded by filter");
                    if let Some(entry) = self.entries.remove(&name) {
                        self.index_to_name.remove(&entry.if_index);
                    }
                    changed = true;
                }
                None => {
                    if let Some(entry) = self.entries.get_mut(&name) {
                        if entry.is_up {
                            debug!(interface = %name, "Interface gone from inventory, marking down");
                            entry.is_up = false;
                            changed = true;
                        }
                    }
                }
                Some(_) => {}
            }
        }

        // Upsert qualifying links.
        for link in links {
            if !filter.matches(&link.name) {
                continue;
            }
            match self.update_link(&link.name, link.if_index, link.is_up, now) {
                LinkUpdate::NoChange => {}
                _ => changed = true,
            }
        }

        // Replace address sets wholesale.
        let mut by_index: HashMap<u32, BTreeSet<CidrNetwork>> = HashMap::new();
        for addr in addrs {
            by_index.entry(addr.if_index).or_default().insert(addr.network);
        }
        for entry in self.entries.values_mut() {
            let networks = by_index.remove(&entry.if_index).unwrap_or_default();
            if entry.networks != networks {
                entry.networks = networks;
                changed = true;
            }
        }

        changed
    }

    /// Looks up an entry by name.
    pub fn get(&self, name: &str) -> Option<&InterfaceEntry> {
        self.entries.get(name)
    }

    /// Returns true when the interface exists.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Iterates all entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = &InterfaceEntry> {
        self.entries.values()
    }

    /// Number of tracked interfaces.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no interfaces are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Minimum remaining backoff across interfaces still in backoff.
    ///
    /// None when every interface is stable; the advertise retry timer is
    /// armed at this delay.
    pub fn retry_time_on_unstable(&self, now: Instant) -> Option<Duration> {
        self.entries
            .values()
            .map(|e| e.backoff_remaining(now))
            .filter(|d| !d.is_zero())
            .min()
    }

    /// Addresses of usable interfaces matching the redistribute filter.
    ///
    /// Link-local and loopback addresses never qualify; IPv4 addresses only
    /// when `enable_v4`.
    pub fn redistribute_networks(
        &self,
        redistribute: &NameSetFilter,
        enable_v4: bool,
        now: Instant,
    ) -> Vec<CidrNetwork> {
        self.entries
            .values()
            .filter(|e| e.is_active(now) && redistribute.matches(&e.name))
            .flat_map(|e| e.networks.iter().copied())
            .filter(|n| !n.is_link_local() && !n.is_loopback())
            .filter(|n| enable_v4 || !n.is_ipv4())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INIT: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_millis(800);

    fn table() -> InterfaceTable {
        InterfaceTable::new(INIT, MAX)
    }

    fn net(s: &str) -> CidrNetwork {
        s.parse().unwrap()
    }

    fn all_filter() -> InterfaceFilter {
        InterfaceFilter::new(&[], &[]).unwrap()
    }

    #[test]
    fn test_filter_include_exclude() {
        let filter =
            InterfaceFilter::new(&["et.*".to_string()], &["et9".to_string()]).unwrap();
        assert!(filter.matches("et1"));
        assert!(!filter.matches("lo"));
        assert!(!filter.matches("et9"));

        // empty include matches everything except excluded
        let open = InterfaceFilter::new(&[], &["lo".to_string()]).unwrap();
        assert!(open.matches("anything"));
        assert!(!open.matches("lo"));
    }

    #[test]
    fn test_name_set_filter_empty_matches_nothing() {
        let filter = NameSetFilter::new(&[]).unwrap();
        assert!(!filter.matches("et1"));
    }

    #[test]
    fn test_link_up_arms_backoff() {
        let mut table = table();
        let now = Instant::now();
        assert_eq!(table.update_link("et1", 3, true, now), LinkUpdate::Created);

        let entry = table.get("et1").unwrap();
        assert!(entry.is_up);
        assert!(!entry.is_active(now));
        assert!(entry.is_active(now + INIT));
    }

    #[test]
    fn test_flap_doubles_backoff() {
        let mut table = table();
        let mut now = Instant::now();
        table.update_link("et1", 3, true, now);
        assert_eq!(table.get("et1").unwrap().backoff_interval(), INIT);

        now += Duration::from_millis(50);
        assert_eq!(
            table.update_link("et1", 3, false, now),
            LinkUpdate::Transition { was_up: true }
        );
        now += Duration::from_millis(50);
        assert_eq!(
            table.update_link("et1", 3, true, now),
            LinkUpdate::Transition { was_up: false }
        );
        assert_eq!(table.get("et1").unwrap().backoff_interval(), INIT * 2);
        assert!(!table.get("et1").unwrap().is_active(now + INIT));
        assert!(table.get("et1").unwrap().is_active(now + INIT * 2));
    }

    #[test]
    fn test_backoff_resets_after_stable_period() {
        let mut table = table();
        let mut now = Instant::now();
        table.update_link("et1", 3, true, now);
        now += Duration::from_millis(10);
        table.update_link("et1", 3, false, now);
        now += Duration::from_millis(10);
        table.update_link("et1", 3, true, now);
        assert_eq!(table.get("et1").unwrap().backoff_interval(), INIT * 2);

        // stable for longer than the max backoff, then flap again
        now += MAX + Duration::from_millis(1);
        table.update_link("et1", 3, false, now);
        now += Duration::from_millis(1);
        table.update_link("et1", 3, true, now);
        assert_eq!(table.get("et1").unwrap().backoff_interval(), INIT);
    }

    #[test]
    fn test_duplicate_link_event_no_change() {
        let mut table = table();
        let now = Instant::now();
        table.update_link("et1", 3, true, now);
        assert_eq!(table.update_link("et1", 3, true, now), LinkUpdate::NoChange);
    }

    #[test]
    fn test_addr_event_resolves_index() {
        let mut table = table();
        let now = Instant::now();
        table.update_link("et1", 3, true, now);

        assert!(table.apply_addr_event(3, net("fe80::1/64"), true));
        assert!(table.get("et1").unwrap().networks.contains(&net("fe80::1/64")));

        assert!(table.apply_addr_event(3, net("fe80::1/64"), false));
        assert!(table.get("et1").unwrap().networks.is_empty());
    }

    #[test]
    fn test_addr_event_unknown_index_dropped() {
        let mut table = table();
        assert!(!table.apply_addr_event(99, net("fe80::1/64"), true));
    }

    #[test]
    fn test_reconcile_marks_vanished_down() {
        let mut table = table();
        let now = Instant::now();
        table.update_link("et1", 3, true, now);
        table.update_link("et2", 4, true, now);

        let links = vec![LinkInfo {
            name: "et1".to_string(),
            if_index: 3,
            is_up: true,
        }];
        assert!(table.reconcile(&links, &[], &all_filter(), now));
        assert!(table.get("et1").unwrap().is_up);
        assert!(!table.get("et2").unwrap().is_up);
    }

    #[test]
    fn test_reconcile_removes_excluded() {
        let mut table = table();
        let now = Instant::now();
        table.update_link("et1", 3, true, now);
        table.update_link("lo", 1, true, now);

        let filter = InterfaceFilter::new(&["et.*".to_string()], &[]).unwrap();
        let links = vec![
            LinkInfo {
                name: "et1".to_string(),
                if_index: 3,
                is_up: true,
            },
            LinkInfo {
                name: "lo".to_string(),
                if_index: 1,
                is_up: true,
            },
        ];
        table.reconcile(&links, &[], &filter, now);
        assert!(table.contains("et1"));
        assert!(!table.contains("lo"));
    }

    #[test]
    fn test_reconcile_replaces_addresses_and_is_idempotent() {
        let mut table = table();
        let now = Instant::now();
        table.update_link("et1", 3, true, now);
        table.apply_addr_event(3, net("fe80::9/64"), true);

        let links = vec![LinkInfo {
            name: "et1".to_string(),
            if_index: 3,
            is_up: true,
        }];
        let addrs = vec![AddrInfo {
            if_index: 3,
            network: net("fe80::1/64"),
        }];
        assert!(table.reconcile(&links, &addrs, &all_filter(), now));
        let networks: Vec<_> = table.get("et1").unwrap().networks.iter().copied().collect();
        assert_eq!(networks, vec![net("fe80::1/64")]);

        // second run with the same inventory changes nothing
        assert!(!table.reconcile(&links, &addrs, &all_filter(), now));
    }

    #[test]
    fn test_retry_time_on_unstable() {
        let mut table = table();
        let now = Instant::now();
        assert_eq!(table.retry_time_on_unstable(now), None);

        table.update_link("et1", 3, true, now);
        let remaining = table.retry_time_on_unstable(now).unwrap();
        assert_eq!(remaining, INIT);
        assert_eq!(table.retry_time_on_unstable(now + INIT), None);
    }

    #[test]
    fn test_redistribute_networks() {
        let mut table = table();
        let now = Instant::now();
        table.update_link("et1", 3, true, now);
        table.update_link("po1", 4, true, now);
        table.apply_addr_event(3, net("10.0.0.1/31"), true);
        table.apply_addr_event(3, net("fe80::1/64"), true);
        table.apply_addr_event(3, net("2001:db8::1/64"), true);
        table.apply_addr_event(4, net("10.1.0.1/31"), true);

        let redistribute = NameSetFilter::new(&["et.*".to_string()]).unwrap();
        let stable = now + INIT;

        let networks = table.redistribute_networks(&redistribute, true, stable);
        assert_eq!(networks, vec![net("10.0.0.1/31"), net("2001:db8::1/64")]);

        // v4 disabled drops the IPv4 address
        let v6_only = table.redistribute_networks(&redistribute, false, stable);
        assert_eq!(v6_only, vec![net("2001:db8::1/64")]);

        // interfaces still in backoff do not redistribute
        assert!(table.redistribute_networks(&redistribute, true, now).is_empty());
    }
}
