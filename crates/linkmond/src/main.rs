//! Link Monitor Daemon
//!
//! Entry point for linkmond. Wires the platform event pump, the KV store
//! client and the persistent state store into the monitor's event loop and
//! runs it until SIGINT/SIGTERM.

use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use routelink_linkmond::monitor::{LinkMonitor, OutboundQueues, OutboundReceivers};
use routelink_linkmond::{Config, FileConfigStore, NeighborEvent, RedisKvStore};

#[cfg(target_os = "linux")]
use routelink_linkmond::netlink::{NetlinkEventSocket, NetlinkLinkProvider};
#[cfg(not(target_os = "linux"))]
use routelink_linkmond::MockLinkProvider;
#[cfg(target_os = "linux")]
use routelink_linkmond::NetlinkEvent;

const DEFAULT_CONFIG_PATH: &str = "/etc/routelink/linkmond.conf";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config_path =
        std::env::var("LINKMOND_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(Path::new(&config_path))?;
    info!(node = %config.node_id, config = %config_path, "Starting link monitor daemon");

    run_daemon(config).await?;

    info!("Link monitor daemon exiting");
    Ok(())
}

/// Structured logging with an environment-driven filter.
fn init_logging() {
    let env_filter = std::env::var("LINKMOND_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .with_target(true)
        .init();
}

async fn run_daemon(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let kv = RedisKvStore::connect(&config.kv.host, config.kv.port).await?;
    let store = FileConfigStore::new(&config.state_file);

    let (netlink_tx, netlink_rx) = mpsc::unbounded_channel();
    let (neighbor_tx, neighbor_rx) = mpsc::unbounded_channel::<NeighborEvent>();
    let (queues, receivers) = OutboundQueues::channel();

    #[cfg(target_os = "linux")]
    let links = NetlinkLinkProvider::new()?;
    #[cfg(not(target_os = "linux"))]
    let links = MockLinkProvider::new();

    #[cfg(target_os = "linux")]
    spawn_netlink_pump(netlink_tx.clone())?;
    #[cfg(not(target_os = "linux"))]
    let _ = &netlink_tx;

    let (monitor, handle) = LinkMonitor::new(
        config,
        Box::new(kv),
        Box::new(store),
        Box::new(links),
        queues,
    )?;

    spawn_queue_taps(receivers);

    let monitor_task = tokio::spawn(monitor.run(neighbor_rx, netlink_rx));

    // The neighbor prober attaches here in a full deployment; hold its
    // sender so the queue stays open for the life of the process.
    let _neighbor_tx = neighbor_tx;

    tokio::signal::ctrl_c().await.ok();
    info!("Signal received, stopping link monitor");
    if let Err(e) = handle.stop().await {
        warn!(error = %e, "Stop request failed");
    }

    monitor_task.await??;
    Ok(())
}

/// Pumps kernel link/address notifications into the monitor's netlink queue
/// from a dedicated blocking task.
#[cfg(target_os = "linux")]
fn spawn_netlink_pump(
    tx: mpsc::UnboundedSender<NetlinkEvent>,
) -> routelink_linkmond::Result<()> {
    let mut socket = NetlinkEventSocket::new()?;
    tokio::task::spawn_blocking(move || loop {
        match socket.recv_events() {
            Ok(events) => {
                for event in events {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Netlink receive failed");
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        }
    });
    Ok(())
}

/// Keeps the outbound queues drained. The prober, FIB, prefix manager and
/// log sink attach to these in a full deployment.
fn spawn_queue_taps(receivers: OutboundReceivers) {
    let OutboundReceivers {
        mut interface_updates,
        mut prefix_updates,
        mut peer_updates,
        mut log_samples,
    } = receivers;

    tokio::spawn(async move {
        while let Some(db) = interface_updates.recv().await {
            debug!(interfaces = db.interfaces.len(), "Interface database update");
        }
    });
    tokio::spawn(async move {
        while let Some(update) = prefix_updates.recv().await {
            debug!(?update, "Prefix update");
        }
    });
    tokio::spawn(async move {
        while let Some(update) = peer_updates.recv().await {
            debug!(
                area = %update.area,
                adds = update.peers_to_add.len(),
                dels = update.peers_to_del.len(),
                "Peer update"
            );
        }
    });
    tokio::spawn(async move {
        while let Some(sample) = log_samples.recv().await {
            debug!(event = %sample.event, "Log sample");
        }
    });
}
