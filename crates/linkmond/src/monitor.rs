//! The link monitor event loop.
//!
//! Single-task cooperative loop over three inbound channels (neighbor
//! events, netlink events, control commands) and a small set of timers
//! (initial adjacency hold, two advertisement throttles, interface-backoff
//! retry, periodic resync, KV TTL refresh, label-allocation retry). All
//! tables live on this task; control callers talk to it through
//! [`LinkMonitorHandle`] and get oneshot completions back.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::adjacency::{adjacency_from_event, AdjacencyTable};
use crate::allocator::LabelAllocator;
use crate::backoff::ExponentialBackoff;
use crate::config::Config;
use crate::error::{LinkMonitorError, Result};
use crate::interface::{InterfaceFilter, InterfaceTable, LinkUpdate, NameSetFilter};
use crate::kv::KvStoreClient;
use crate::netlink::LinkProvider;
use crate::store::ConfigStore;
use crate::throttle::Throttle;
use crate::types::{
    AdjacencyDatabase, AdjacencyValue, InterfaceDatabase, InterfaceSnapshot, LinkInfo,
    LinkMonitorState, LogSample, NeighborEvent, NeighborEventKind, NetlinkEvent, PeerSpec,
    PeerUpdate, PrefixEntry, PrefixUpdate, ADJ_DB_KEY_PREFIX, DEFAULT_LINK_METRIC,
};

/// Backoff bounds for KV publish retries
const KV_RETRY_INIT: Duration = Duration::from_millis(100);
const KV_RETRY_MAX: Duration = Duration::from_secs(5);

/// Backoff bounds for platform resync and label-allocation retries
const RETRY_INIT: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(60);

type Responder<T> = oneshot::Sender<Result<T>>;

/// Control-surface commands posted to the event loop.
pub enum Command {
    /// Drain or undrain the node; takes effect immediately
    SetNodeOverload {
        /// Target drain state
        overloaded: bool,
        /// Completion
        resp: Responder<()>,
    },
    /// Drain or undrain one interface; advertisement is throttled
    SetInterfaceOverload {
        /// Interface name
        if_name: String,
        /// Target drain state
        overloaded: bool,
        /// Completion
        resp: Responder<()>,
    },
    /// Set or clear an interface metric override; throttled
    SetLinkMetric {
        /// Interface name
        if_name: String,
        /// Override, None clears
        metric: Option<u32>,
        /// Completion
        resp: Responder<()>,
    },
    /// Set or clear an adjacency metric override; throttled
    SetAdjacencyMetric {
        /// Local interface name
        if_name: String,
        /// Remote node name
        node: String,
        /// Override, None clears
        metric: Option<u32>,
        /// Completion
        resp: Responder<()>,
    },
    /// Snapshot of the interface table
    GetInterfaces {
        /// Completion with the snapshot
        resp: Responder<InterfaceDatabase>,
    },
    /// Per-area adjacency databases as they would be published
    GetAdjacencies {
        /// Completion with the databases
        resp: Responder<Vec<AdjacencyDatabase>>,
    },
    /// Raw OS link inventory through the platform handle
    GetLinks {
        /// Completion with the links
        resp: Responder<Vec<LinkInfo>>,
    },
    /// Stop the event loop
    Stop {
        /// Completion
        resp: Responder<()>,
    },
}

/// Cloneable handle for control-surface calls into the running monitor.
#[derive(Clone)]
pub struct LinkMonitorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl LinkMonitorHandle {
    async fn request<T>(&self, make: impl FnOnce(Responder<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .map_err(|_| LinkMonitorError::ShuttingDown)?;
        rx.await.map_err(|_| LinkMonitorError::ShuttingDown)?
    }

    /// Drains or undrains the node. Not throttled.
    pub async fn set_node_overload(&self, overloaded: bool) -> Result<()> {
        self.request(|resp| Command::SetNodeOverload { overloaded, resp })
            .await
    }

    /// Drains or undrains one interface.
    pub async fn set_interface_overload(&self, if_name: &str, overloaded: bool) -> Result<()> {
        let if_name = if_name.to_string();
        self.request(|resp| Command::SetInterfaceOverload {
            if_name,
            overloaded,
            resp,
        })
        .await
    }

    /// Sets or clears an interface metric override.
    pub async fn set_link_metric(&self, if_name: &str, metric: Option<u32>) -> Result<()> {
        let if_name = if_name.to_string();
        self.request(|resp| Command::SetLinkMetric {
            if_name,
            metric,
            resp,
        })
        .await
    }

    /// Sets or clears an adjacency metric override.
    pub async fn set_adjacency_metric(
        &self,
        if_name: &str,
        node: &str,
        metric: Option<u32>,
    ) -> Result<()> {
        let if_name = if_name.to_string();
        let node = node.to_string();
        self.request(|resp| Command::SetAdjacencyMetric {
            if_name,
            node,
            metric,
            resp,
        })
        .await
    }

    /// Dumps the interface table.
    pub async fn get_interfaces(&self) -> Result<InterfaceDatabase> {
        self.request(|resp| Command::GetInterfaces { resp }).await
    }

    /// Dumps the per-area adjacency databases.
    pub async fn get_adjacencies(&self) -> Result<Vec<AdjacencyDatabase>> {
        self.request(|resp| Command::GetAdjacencies { resp }).await
    }

    /// Dumps the raw OS link inventory.
    pub async fn get_links(&self) -> Result<Vec<LinkInfo>> {
        self.request(|resp| Command::GetLinks { resp }).await
    }

    /// Stops the monitor; pending control calls fail with a shutting-down
    /// error.
    pub async fn stop(&self) -> Result<()> {
        self.request(|resp| Command::Stop { resp }).await
    }
}

/// Producer ends of the monitor's outbound queues.
pub struct OutboundQueues {
    /// Full interface database snapshots
    pub interface_updates: mpsc::UnboundedSender<InterfaceDatabase>,
    /// Redistributed prefix advertisements and withdrawals
    pub prefix_updates: mpsc::UnboundedSender<PrefixUpdate>,
    /// Per-area peer deltas
    pub peer_updates: mpsc::UnboundedSender<PeerUpdate>,
    /// Structured event records
    pub log_samples: mpsc::UnboundedSender<LogSample>,
}

/// Consumer ends of the monitor's outbound queues.
pub struct OutboundReceivers {
    /// Full interface database snapshots
    pub interface_updates: mpsc::UnboundedReceiver<InterfaceDatabase>,
    /// Redistributed prefix advertisements and withdrawals
    pub prefix_updates: mpsc::UnboundedReceiver<PrefixUpdate>,
    /// Per-area peer deltas
    pub peer_updates: mpsc::UnboundedReceiver<PeerUpdate>,
    /// Structured event records
    pub log_samples: mpsc::UnboundedReceiver<LogSample>,
}

impl OutboundQueues {
    /// Creates all four queues, returning both ends.
    pub fn channel() -> (OutboundQueues, OutboundReceivers) {
        let (interface_tx, interface_rx) = mpsc::unbounded_channel();
        let (prefix_tx, prefix_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        (
            OutboundQueues {
                interface_updates: interface_tx,
                prefix_updates: prefix_tx,
                peer_updates: peer_tx,
                log_samples: log_tx,
            },
            OutboundReceivers {
                interface_updates: interface_rx,
                prefix_updates: prefix_rx,
                peer_updates: peer_rx,
                log_samples: log_rx,
            },
        )
    }
}

/// Compiled membership matchers for one area.
struct AreaMatcher {
    neighbors: NameSetFilter,
    interfaces: NameSetFilter,
}

/// The link monitor.
///
/// Owns the interface and adjacency tables, the announced peer and prefix
/// sets, and the persisted operator state. The KV store, config store and
/// platform handle are capabilities passed at construction; their owners
/// outlive the monitor.
pub struct LinkMonitor {
    config: Config,
    filter: InterfaceFilter,
    redistribute: NameSetFilter,
    area_matchers: HashMap<String, AreaMatcher>,

    state: LinkMonitorState,
    interfaces: InterfaceTable,
    adjacencies: AdjacencyTable,
    /// Peer map last announced, per area
    announced_peers: HashMap<String, BTreeMap<String, PeerSpec>>,
    /// Redistributed prefixes last announced
    announced_redist: BTreeSet<PrefixEntry>,

    kv: Box<dyn KvStoreClient>,
    store: Box<dyn ConfigStore>,
    links: Box<dyn LinkProvider>,
    out: OutboundQueues,
    cmd_rx: mpsc::UnboundedReceiver<Command>,

    adj_throttle: Throttle,
    iface_throttle: Throttle,
    /// Peer reconciliation rides the next adjacency-throttle fire
    peers_dirty: bool,
    kv_backoff: ExponentialBackoff,
    sync_backoff: ExponentialBackoff,
    label_backoff: ExponentialBackoff,

    adj_hold_until: Option<Instant>,
    iface_retry_at: Option<Instant>,
    label_retry_at: Option<Instant>,
    sync_at: Instant,
    ttl_refresh_at: Instant,
    stopping: bool,
}

impl LinkMonitor {
    /// Creates a monitor and its control handle.
    ///
    /// Fails on a self-inconsistent configuration; the caller is expected
    /// to abort startup.
    pub fn new(
        config: Config,
        kv: Box<dyn KvStoreClient>,
        store: Box<dyn ConfigStore>,
        links: Box<dyn LinkProvider>,
        out: OutboundQueues,
    ) -> Result<(Self, LinkMonitorHandle)> {
        config.validate()?;
        let filter = InterfaceFilter::new(
            &config.include_interface_regexes,
            &config.exclude_interface_regexes,
        )?;
        let redistribute = NameSetFilter::new(&config.redistribute_interface_regexes)?;
        let mut area_matchers = HashMap::new();
        for area in &config.areas {
            area_matchers.insert(
                area.id.clone(),
                AreaMatcher {
                    neighbors: NameSetFilter::new(&area.neighbor_regexes)?,
                    interfaces: NameSetFilter::new(&area.interface_regexes)?,
                },
            );
        }
        let interfaces =
            InterfaceTable::new(config.linkflap_init_backoff(), config.linkflap_max_backoff());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let now = Instant::now();
        let monitor = Self {
            adj_throttle: Throttle::new(config.advertise_throttle()),
            iface_throttle: Throttle::new(config.advertise_throttle()),
            kv_backoff: ExponentialBackoff::new(KV_RETRY_INIT, KV_RETRY_MAX),
            sync_backoff: ExponentialBackoff::new(RETRY_INIT, RETRY_MAX),
            label_backoff: ExponentialBackoff::new(RETRY_INIT, RETRY_MAX),
            sync_at: now + config.sync_interval(),
            ttl_refresh_at: now + config.kv_key_ttl() / 3,
            filter,
            redistribute,
            area_matchers,
            state: LinkMonitorState::default(),
            interfaces,
            adjacencies: AdjacencyTable::new(),
            announced_peers: HashMap::new(),
            announced_redist: BTreeSet::new(),
            kv,
            store,
            links,
            out,
            cmd_rx,
            peers_dirty: false,
            adj_hold_until: None,
            iface_retry_at: None,
            label_retry_at: None,
            stopping: false,
            config,
        };
        Ok((monitor, LinkMonitorHandle { tx: cmd_tx }))
    }

    /// Runs the event loop to completion.
    ///
    /// Returns once stopped via the handle or once every inbound channel
    /// has closed. Fatal initialization failures (store unreadable,
    /// platform enumeration broken) are returned to the caller.
    pub async fn run(
        mut self,
        mut neighbor_rx: mpsc::UnboundedReceiver<NeighborEvent>,
        mut netlink_rx: mpsc::UnboundedReceiver<NetlinkEvent>,
    ) -> Result<()> {
        self.initialize().await?;
        info!(
            node = %self.config.node_id,
            domain = %self.config.domain,
            areas = self.config.areas.len(),
            "Link monitor running"
        );

        let mut neighbor_open = true;
        let mut netlink_open = true;
        let mut cmd_open = true;

        while !self.stopping && (neighbor_open || netlink_open || cmd_open) {
            let deadline = self.next_deadline();
            tokio::select! {
                event = neighbor_rx.recv(), if neighbor_open => match event {
                    Some(event) => self.process_neighbor_event(event).await,
                    None => neighbor_open = false,
                },
                event = netlink_rx.recv(), if netlink_open => match event {
                    Some(event) => self.process_netlink_event(event).await,
                    None => netlink_open = false,
                },
                command = self.cmd_rx.recv(), if cmd_open => match command {
                    Some(command) => self.process_command(command).await,
                    None => cmd_open = false,
                },
                _ = tokio::time::sleep_until(deadline) => self.process_timers().await,
            }
        }

        self.shutdown().await
    }

    /// Loads persisted state, applies the startup drain policy, performs the
    /// initial interface discovery and arms the adjacency hold timer.
    async fn initialize(&mut self) -> Result<()> {
        let persisted = self.store.load().await?;
        let had_state = persisted.is_some();
        self.state = persisted.unwrap_or_default();
        self.state.version = LinkMonitorState::VERSION;

        if !had_state {
            self.state.node_overloaded = self.config.assume_drained;
            self.store.save(&self.state).await?;
            info!(
                node_overloaded = self.state.node_overloaded,
                "No persisted state, initialized drain state from policy"
            );
        } else if self.config.override_drain_state
            && self.state.node_overloaded != self.config.assume_drained
        {
            self.state.node_overloaded = self.config.assume_drained;
            self.store.save(&self.state).await?;
            info!(
                node_overloaded = self.state.node_overloaded,
                "Drain state overridden by policy"
            );
        }

        // Initial discovery failure is fatal: the platform socket is unusable.
        self.sync_interfaces().await?;

        let now = Instant::now();
        self.adj_hold_until = Some(now + self.config.adj_hold_time());
        self.iface_throttle.arm(now);
        Ok(())
    }

    // ---- inbound: neighbor events -------------------------------------

    async fn process_neighbor_event(&mut self, event: NeighborEvent) {
        let Some(matcher) = self.area_matchers.get(&event.area) else {
            warn!(
                area = %event.area,
                node = %event.remote_node,
                "Neighbor event for unconfigured area, dropping"
            );
            return;
        };
        if !matcher.neighbors.matches(&event.remote_node)
            || !matcher.interfaces.matches(&event.local_if_name)
        {
            warn!(
                area = %event.area,
                node = %event.remote_node,
                interface = %event.local_if_name,
                "Neighbor event outside area membership, dropping"
            );
            return;
        }
        self.log_neighbor_event(&event);
        match event.kind {
            NeighborEventKind::Up => self.neighbor_up(event).await,
            NeighborEventKind::Down => self.neighbor_down(event),
            NeighborEventKind::Restarting => self.neighbor_restarting(event),
            NeighborEventKind::RttChange => self.neighbor_rtt_change(event),
        }
    }

    async fn neighbor_up(&mut self, event: NeighborEvent) {
        let key = (event.remote_node.clone(), event.local_if_name.clone());
        let adjacency = adjacency_from_event(
            &event.remote_node,
            &event.remote_if_name,
            &event.local_if_name,
            event.rtt_us,
            self.config.use_rtt_metric,
        );
        let value = AdjacencyValue {
            peer_spec: event.peer_spec.clone(),
            adjacency,
            restarting: false,
            area: event.area.clone(),
        };
        let outcome = self.adjacencies.apply_up(key, value);
        debug!(
            node = %event.remote_node,
            if_name = %event.local_if_name,
            area = %event.area,
            ?outcome,
            "Neighbor up"
        );

        // Announce this peer right away so the KV session can form; the
        // adjacency database itself rides the throttle. The explicit peer
        // also covers restarts whose RESTARTING signal we never saw.
        let mut up_peers = BTreeMap::new();
        up_peers.insert(event.remote_node.clone(), event.peer_spec.clone());
        self.advertise_kv_peers(&event.area, up_peers).await;

        self.adj_throttle.arm(Instant::now());
    }

    fn neighbor_down(&mut self, event: NeighborEvent) {
        if self
            .adjacencies
            .remove(&event.remote_node, &event.local_if_name)
            .is_none()
        {
            debug!(
                node = %event.remote_node,
                if_name = %event.local_if_name,
                "Down event for unknown adjacency, ignoring"
            );
            return;
        }
        let now = Instant::now();
        self.peers_dirty = true;
        self.adj_throttle.arm(now);
    }

    fn neighbor_restarting(&mut self, event: NeighborEvent) {
        // Keep the adjacency published and the peer announced throughout the
        // restart window; only a subsequent up/down event changes anything.
        if !self
            .adjacencies
            .mark_restarting(&event.remote_node, &event.local_if_name)
        {
            debug!(
                node = %event.remote_node,
                if_name = %event.local_if_name,
                "Restarting event for unknown adjacency, ignoring"
            );
        }
    }

    fn neighbor_rtt_change(&mut self, event: NeighborEvent) {
        let updated = self.adjacencies.update_rtt(
            &event.remote_node,
            &event.local_if_name,
            event.rtt_us,
            self.config.use_rtt_metric,
        );
        if updated {
            self.adj_throttle.arm(Instant::now());
        }
    }

    // ---- inbound: netlink events --------------------------------------

    async fn process_netlink_event(&mut self, event: NetlinkEvent) {
        let now = Instant::now();
        match event {
            NetlinkEvent::Link {
                name,
                if_index,
                is_up,
            } => {
                if !self.filter.matches(&name) {
                    trace!(interface = %name, "Link event filtered by regex");
                    return;
                }
                match self.interfaces.update_link(&name, if_index, is_up, now) {
                    LinkUpdate::NoChange => {}
                    LinkUpdate::Created => {
                        self.log_link_event(&name, !is_up, is_up, now);
                        self.on_interface_change(now);
                    }
                    LinkUpdate::Transition { was_up } => {
                        self.log_link_event(&name, was_up, is_up, now);
                        self.on_interface_change(now);
                    }
                }
            }
            NetlinkEvent::Addr {
                if_index,
                network,
                is_add,
            } => {
                if self.interfaces.apply_addr_event(if_index, network, is_add) {
                    self.iface_throttle.arm(now);
                }
            }
        }
    }

    /// A link transition changes usability: snapshots, redistributed
    /// prefixes, the adjacency databases and the derived peer sets all may
    /// shift, each behind its throttle.
    fn on_interface_change(&mut self, now: Instant) {
        self.iface_throttle.arm(now);
        self.peers_dirty = true;
        self.adj_throttle.arm(now);
    }

    // ---- control surface ----------------------------------------------

    async fn process_command(&mut self, command: Command) {
        match command {
            Command::SetNodeOverload { overloaded, resp } => {
                let result = self.set_node_overload(overloaded).await;
                let _ = resp.send(result);
            }
            Command::SetInterfaceOverload {
                if_name,
                overloaded,
                resp,
            } => {
                let result = self.set_interface_overload(&if_name, overloaded).await;
                let _ = resp.send(result);
            }
            Command::SetLinkMetric {
                if_name,
                metric,
                resp,
            } => {
                let result = self.set_link_metric(&if_name, metric).await;
                let _ = resp.send(result);
            }
            Command::SetAdjacencyMetric {
                if_name,
                node,
                metric,
                resp,
            } => {
                let result = self.set_adjacency_metric(&if_name, &node, metric).await;
                let _ = resp.send(result);
            }
            Command::GetInterfaces { resp } => {
                let db = self.build_interface_database(Instant::now());
                let _ = resp.send(Ok(db));
            }
            Command::GetAdjacencies { resp } => {
                let dbs = self
                    .config
                    .area_ids()
                    .iter()
                    .map(|area| self.build_adjacency_database(area))
                    .collect();
                let _ = resp.send(Ok(dbs));
            }
            Command::GetLinks { resp } => {
                let result = self.links.get_all_links().await;
                let _ = resp.send(result);
            }
            Command::Stop { resp } => {
                self.stopping = true;
                let _ = resp.send(Ok(()));
            }
        }
    }

    /// Node drain. Persisted first, then advertised immediately (the one
    /// un-throttled mutation: the operator wants the drain visible now).
    async fn set_node_overload(&mut self, overloaded: bool) -> Result<()> {
        if self.state.node_overloaded == overloaded {
            return Ok(());
        }
        let mut next = self.state.clone();
        next.node_overloaded = overloaded;
        self.store.save(&next).await?;
        self.state = next;

        let event = if overloaded { "NODE_DRAIN" } else { "NODE_UNDRAIN" };
        info!(overloaded, "Node overload changed");
        self.emit_log(LogSample::new(event).with("node", &self.config.node_id));

        self.advertise_adjacencies().await;
        Ok(())
    }

    async fn set_interface_overload(&mut self, if_name: &str, overloaded: bool) -> Result<()> {
        if !self.interfaces.contains(if_name) {
            return Err(LinkMonitorError::UnknownInterface(if_name.to_string()));
        }
        if self.state.overloaded_links.contains(if_name) == overloaded {
            return Ok(());
        }
        let mut next = self.state.clone();
        if overloaded {
            next.overloaded_links.insert(if_name.to_string());
        } else {
            next.overloaded_links.remove(if_name);
        }
        self.store.save(&next).await?;
        self.state = next;

        let event = if overloaded { "IFACE_DRAIN" } else { "IFACE_UNDRAIN" };
        info!(interface = if_name, overloaded, "Interface overload changed");
        self.emit_log(LogSample::new(event).with("interface", if_name));

        self.on_interface_change(Instant::now());
        Ok(())
    }

    async fn set_link_metric(&mut self, if_name: &str, metric: Option<u32>) -> Result<()> {
        if !self.interfaces.contains(if_name) {
            return Err(LinkMonitorError::UnknownInterface(if_name.to_string()));
        }
        if self.state.link_metric_overrides.get(if_name).copied() == metric {
            return Ok(());
        }
        let mut next = self.state.clone();
        match metric {
            Some(m) => {
                next.link_metric_overrides.insert(if_name.to_string(), m);
            }
            None => {
                next.link_metric_overrides.remove(if_name);
            }
        }
        self.store.save(&next).await?;
        self.state = next;

        info!(interface = if_name, ?metric, "Link metric override changed");
        let now = Instant::now();
        self.iface_throttle.arm(now);
        self.adj_throttle.arm(now);
        Ok(())
    }

    async fn set_adjacency_metric(
        &mut self,
        if_name: &str,
        node: &str,
        metric: Option<u32>,
    ) -> Result<()> {
        if !self.adjacencies.contains(node, if_name) {
            return Err(LinkMonitorError::UnknownAdjacency {
                node: node.to_string(),
                if_name: if_name.to_string(),
            });
        }
        if self.state.adj_metric_override(if_name, node) == metric {
            return Ok(());
        }
        let mut next = self.state.clone();
        next.set_adj_metric_override(if_name, node, metric);
        self.store.save(&next).await?;
        self.state = next;

        info!(interface = if_name, node, ?metric, "Adjacency metric override changed");
        self.adj_throttle.arm(Instant::now());
        Ok(())
    }

    // ---- timers --------------------------------------------------------

    /// The next instant anything needs to run. The resync timer is always
    /// armed, so there is always a deadline.
    fn next_deadline(&self) -> Instant {
        let mut deadline = self.sync_at.min(self.ttl_refresh_at);
        let mut consider = |t: Option<Instant>| {
            if let Some(t) = t {
                deadline = deadline.min(t);
            }
        };
        consider(self.adj_hold_until);
        consider(self.adj_throttle.deadline());
        consider(self.iface_throttle.deadline());
        consider(self.iface_retry_at);
        consider(self.label_retry_at);
        deadline
    }

    async fn process_timers(&mut self) {
        let now = Instant::now();

        if self.adj_hold_until.map_or(false, |t| t <= now) {
            self.adj_hold_until = None;
            self.on_hold_expired().await;
        }

        if self.adj_throttle.take_due(now) {
            if std::mem::take(&mut self.peers_dirty) {
                self.advertise_kv_peers_all().await;
            }
            self.advertise_adjacencies().await;
        }

        if self.iface_throttle.take_due(now) {
            self.advertise_iface_addr(now);
        }

        if self.iface_retry_at.map_or(false, |t| t <= now) {
            // an interface left backoff: snapshots and peer derivation change
            self.iface_retry_at = None;
            self.peers_dirty = true;
            self.adj_throttle.arm(now);
            self.advertise_iface_addr(now);
        }

        if self.sync_at <= now {
            self.scheduled_sync().await;
        }

        if self.ttl_refresh_at <= now {
            self.ttl_refresh_at = now + self.config.kv_key_ttl() / 3;
            if let Err(e) = self.kv.refresh_owned(self.config.kv_key_ttl()).await {
                warn!(error = %e, "KV TTL refresh failed");
            }
        }

        if self.label_retry_at.map_or(false, |t| t <= now) {
            self.label_retry_at = None;
            self.allocate_labels().await;
        }
    }

    /// Initial hold expiry: claim node labels over the established peer
    /// set, then open the gates in publish order (peers first so sessions
    /// exist when the databases land).
    async fn on_hold_expired(&mut self) {
        info!("Initial adjacency hold expired, starting advertisement");
        self.allocate_labels().await;
        self.advertise_kv_peers_all().await;
        self.advertise_adjacencies().await;
        self.advertise_iface_addr(Instant::now());
    }

    fn hold_active(&self, now: Instant) -> bool {
        self.adj_hold_until.map_or(false, |t| t > now)
    }

    async fn scheduled_sync(&mut self) {
        match self.sync_interfaces().await {
            Ok(changed) => {
                self.sync_backoff.report_success();
                self.sync_at = Instant::now() + self.config.sync_interval();
                if changed {
                    debug!("Periodic interface resync applied changes");
                }
            }
            Err(e) => {
                let now = Instant::now();
                self.sync_backoff.report_error(now);
                self.sync_at = now + self.sync_backoff.current_interval();
                warn!(
                    error = %e,
                    retry_ms = self.sync_backoff.current_interval().as_millis() as u64,
                    "Interface resync failed, backing off"
                );
            }
        }
    }

    /// Pulls the full inventory through the platform handle and reconciles.
    async fn sync_interfaces(&mut self) -> Result<bool> {
        let links = self.links.get_all_links().await?;
        let addrs = self.links.get_all_addresses().await?;
        let now = Instant::now();
        let changed = self.interfaces.reconcile(&links, &addrs, &self.filter, now);
        if changed {
            self.on_interface_change(now);
        }
        Ok(changed)
    }

    async fn allocate_labels(&mut self) {
        if !self.config.enable_segment_routing {
            return;
        }
        let ttl = self.config.kv_key_ttl();
        let mut changed = false;
        let mut failed = false;

        for area in self.config.area_ids() {
            let preferred = self.state.node_labels.get(&area).copied();
            let allocator = LabelAllocator::new(&area, &self.config.node_id);
            match allocator.allocate(self.kv.as_mut(), preferred, ttl).await {
                Ok(label) => {
                    if self.state.node_labels.insert(area.clone(), label) != Some(label) {
                        changed = true;
                    }
                }
                Err(e) => {
                    warn!(area = %area, error = %e, "Node label allocation failed, will retry");
                    failed = true;
                }
            }
        }

        if changed {
            if let Err(e) = self.store.save(&self.state).await {
                warn!(error = %e, "Failed to persist node labels, will retry");
                failed = true;
            }
            self.adj_throttle.arm(Instant::now());
        }

        if failed {
            let now = Instant::now();
            self.label_backoff.report_error(now);
            self.label_retry_at = Some(now + self.label_backoff.current_interval());
        } else {
            self.label_backoff.report_success();
        }
    }

    // ---- advertisement -------------------------------------------------

    /// Publishes the per-area adjacency databases to the KV store.
    ///
    /// A publish failure is transient I/O: logged, backed off and retried
    /// through the throttle; never surfaced to control callers.
    async fn advertise_adjacencies(&mut self) {
        let now = Instant::now();
        if self.hold_active(now) {
            return;
        }
        let ttl = self.config.kv_key_ttl();
        let key = format!("{}{}", ADJ_DB_KEY_PREFIX, self.config.node_id);
        let mut failed = false;

        for area in self.config.area_ids() {
            let db = self.build_adjacency_database(&area);
            let blob = match serde_json::to_string(&db) {
                Ok(blob) => blob,
                Err(e) => {
                    warn!(area = %area, error = %e, "Cannot serialize adjacency database");
                    continue;
                }
            };
            if let Err(e) = self.kv.persist_key(&area, &key, blob, ttl).await {
                warn!(area = %area, error = %e, "Adjacency publish failed");
                failed = true;
            }
        }

        if failed {
            let now = Instant::now();
            self.kv_backoff.report_error(now);
            self.adj_throttle
                .arm_after(now, self.kv_backoff.current_interval());
        } else {
            self.kv_backoff.report_success();
            trace!("Advertised adjacency databases");
        }
    }

    /// Reconciles and announces the peer delta for one area.
    ///
    /// `up_peers` are unioned into the add set regardless of the diff, to
    /// recover peers whose restart we never observed.
    async fn advertise_kv_peers(&mut self, area: &str, up_peers: BTreeMap<String, PeerSpec>) {
        let now = Instant::now();
        if self.hold_active(now) {
            return;
        }

        let desired = {
            let interfaces = &self.interfaces;
            let overloaded = &self.state.overloaded_links;
            self.adjacencies.peers_for_area(area, |if_name| {
                interfaces.get(if_name).map_or(false, |e| e.is_active(now))
                    && !overloaded.contains(if_name)
            })
        };

        let mut update = PeerUpdate {
            area: area.to_string(),
            peers_to_add: BTreeMap::new(),
            peers_to_del: Vec::new(),
        };
        {
            let announced = self.announced_peers.entry(area.to_string()).or_default();
            for (node, spec) in &desired {
                if announced.get(node) != Some(spec) {
                    update.peers_to_add.insert(node.clone(), spec.clone());
                }
            }
            update.peers_to_del = announced
                .keys()
                .filter(|node| !desired.contains_key(*node))
                .cloned()
                .collect();
            for (node, spec) in up_peers {
                update.peers_to_add.insert(node, spec);
            }
            if update.is_empty() {
                return;
            }
            for node in &update.peers_to_del {
                announced.remove(node);
            }
            for (node, spec) in &update.peers_to_add {
                announced.insert(node.clone(), spec.clone());
            }
        }

        self.log_peer_events(&update);
        let _ = self.out.peer_updates.send(update);
    }

    async fn advertise_kv_peers_all(&mut self) {
        for area in self.config.area_ids() {
            self.advertise_kv_peers(&area, BTreeMap::new()).await;
        }
    }

    /// Emits the interface database snapshot and the redistributed prefix
    /// delta; re-arms the retry timer while any interface sits in backoff.
    fn advertise_iface_addr(&mut self, now: Instant) {
        let db = self.build_interface_database(now);
        let _ = self.out.interface_updates.send(db);

        let current: BTreeSet<PrefixEntry> = self
            .interfaces
            .redistribute_networks(&self.redistribute, self.config.enable_v4, now)
            .into_iter()
            .map(|network| PrefixEntry {
                network,
                source: crate::types::PREFIX_SOURCE.to_string(),
                forwarding_type: self.config.prefix_forwarding_type,
                forwarding_algorithm: self.config.prefix_forwarding_algorithm,
            })
            .collect();

        let withdrawn: Vec<PrefixEntry> = self
            .announced_redist
            .difference(&current)
            .cloned()
            .collect();
        if !withdrawn.is_empty() {
            let _ = self.out.prefix_updates.send(PrefixUpdate::Withdraw(withdrawn));
        }
        if !current.is_empty() {
            let _ = self
                .out
                .prefix_updates
                .send(PrefixUpdate::Advertise(current.iter().cloned().collect()));
        }
        self.announced_redist = current;

        if let Some(delay) = self.interfaces.retry_time_on_unstable(now) {
            self.iface_retry_at = Some(now + delay);
        }
    }

    fn build_interface_database(&self, now: Instant) -> InterfaceDatabase {
        let mut interfaces = BTreeMap::new();
        for entry in self.interfaces.iter() {
            let usable = entry.is_active(now) && !self.state.overloaded_links.contains(&entry.name);
            let metric = self
                .state
                .link_metric_overrides
                .get(&entry.name)
                .copied()
                .unwrap_or(DEFAULT_LINK_METRIC);
            interfaces.insert(
                entry.name.clone(),
                InterfaceSnapshot {
                    name: entry.name.clone(),
                    if_index: entry.if_index,
                    is_up: entry.is_up,
                    usable,
                    metric,
                    networks: entry.networks.iter().copied().collect(),
                },
            );
        }
        InterfaceDatabase {
            node: self.config.node_id.clone(),
            interfaces,
        }
    }

    /// Builds one area's database with effective metrics and drain flags.
    ///
    /// Effective metric: adjacency override, else interface override, else
    /// the base (RTT-derived or constant) metric. Drains are dedicated
    /// flags; the metric itself is left alone.
    fn build_adjacency_database(&self, area: &str) -> AdjacencyDatabase {
        let mut adjacencies = Vec::new();
        for ((node, if_name), value) in self.adjacencies.iter_area(area) {
            let mut adjacency = value.adjacency.clone();
            adjacency.metric = self
                .state
                .adj_metric_override(if_name, node)
                .or_else(|| self.state.link_metric_overrides.get(if_name).copied())
                .unwrap_or(adjacency.metric);
            adjacency.overloaded = self.state.overloaded_links.contains(if_name);
            adjacencies.push(adjacency);
        }
        AdjacencyDatabase {
            node: self.config.node_id.clone(),
            overloaded: self.state.node_overloaded,
            node_label: self.state.node_labels.get(area).copied().unwrap_or(0),
            area: area.to_string(),
            adjacencies,
        }
    }

    // ---- logging -------------------------------------------------------

    fn emit_log(&self, sample: LogSample) {
        let _ = self.out.log_samples.send(sample);
    }

    fn log_neighbor_event(&self, event: &NeighborEvent) {
        info!(
            kind = event.kind.as_str(),
            node = %event.remote_node,
            interface = %event.local_if_name,
            area = %event.area,
            "Neighbor event"
        );
        self.emit_log(
            LogSample::new(event.kind.as_str())
                .with("node", &event.remote_node)
                .with("interface", &event.local_if_name)
                .with("remote_interface", &event.remote_if_name)
                .with("area", &event.area),
        );
    }

    fn log_link_event(&self, name: &str, was_up: bool, is_up: bool, now: Instant) {
        let backoff_ms = self
            .interfaces
            .get(name)
            .map(|e| e.backoff_remaining(now).as_millis() as u64)
            .unwrap_or(0);
        info!(interface = name, was_up, is_up, backoff_ms, "Link event");
        self.emit_log(
            LogSample::new(if is_up { "IFACE_UP" } else { "IFACE_DOWN" })
                .with("interface", name)
                .with("backoff_ms", backoff_ms),
        );
    }

    fn log_peer_events(&self, update: &PeerUpdate) {
        for (node, spec) in &update.peers_to_add {
            self.emit_log(
                LogSample::new("PEER_ADD")
                    .with("node", node)
                    .with("peer_addr", spec)
                    .with("area", &update.area),
            );
        }
        for node in &update.peers_to_del {
            self.emit_log(
                LogSample::new("PEER_DEL")
                    .with("node", node)
                    .with("area", &update.area),
            );
        }
    }

    // ---- shutdown ------------------------------------------------------

    /// Drains pending fires with the final state, closes the KV client and
    /// fails whatever control calls are still queued.
    async fn shutdown(&mut self) -> Result<()> {
        info!("Link monitor stopping");

        if self.adj_throttle.is_armed() || self.peers_dirty {
            self.adj_throttle.cancel();
            if std::mem::take(&mut self.peers_dirty) {
                self.advertise_kv_peers_all().await;
            }
            self.advertise_adjacencies().await;
        }
        if self.iface_throttle.is_armed() {
            self.iface_throttle.cancel();
            self.advertise_iface_addr(Instant::now());
        }
        self.iface_retry_at = None;
        self.label_retry_at = None;

        if let Err(e) = self.kv.close().await {
            warn!(error = %e, "KV client close failed");
        }

        self.cmd_rx.close();
        while let Ok(command) = self.cmd_rx.try_recv() {
            fail_command(command);
        }
        Ok(())
    }
}

fn fail_command(command: Command) {
    match command {
        Command::SetNodeOverload { resp, .. } => {
            let _ = resp.send(Err(LinkMonitorError::ShuttingDown));
        }
        Command::SetInterfaceOverload { resp, .. } => {
            let _ = resp.send(Err(LinkMonitorError::ShuttingDown));
        }
        Command::SetLinkMetric { resp, .. } => {
            let _ = resp.send(Err(LinkMonitorError::ShuttingDown));
        }
        Command::SetAdjacencyMetric { resp, .. } => {
            let _ = resp.send(Err(LinkMonitorError::ShuttingDown));
        }
        Command::GetInterfaces { resp } => {
            let _ = resp.send(Err(LinkMonitorError::ShuttingDown));
        }
        Command::GetAdjacencies { resp } => {
            let _ = resp.send(Err(LinkMonitorError::ShuttingDown));
        }
        Command::GetLinks { resp } => {
            let _ = resp.send(Err(LinkMonitorError::ShuttingDown));
        }
        Command::Stop { resp } => {
            let _ = resp.send(Ok(()));
        }
    }
}
