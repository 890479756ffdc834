//! Cluster time sync daemon
//!
//! Runs either the relay (one per cluster) or a game node that keeps its
//! clock in step with the cluster's time authority and pushes time to its
//! own clients.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use config::{ConfigWatcher, DaemonSettings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use timesync_relay::{RelayRouter, RelayServer, HEARTBEAT_INTERVAL};
use timesync_sessions::{ClientServer, RelayLink, SessionRegistry, RECONNECT_DELAY};
use timesync_timing::{ClockAuthority, SharedConfig, SystemClock, WallClock, CYCLE_MS};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

/// Process mode
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Relay mode - routes sync traffic between nodes
    Relay,
    /// Node mode - syncs its clock and serves clients
    Node,
}

/// Cluster time sync daemon
#[derive(Parser, Debug)]
#[command(name = "timesync")]
#[command(about = "Leader/follower wall-clock sync for game server clusters", long_about = None)]
struct Args {
    /// Process mode (relay or node)
    #[arg(long, value_enum, default_value = "node")]
    mode: Mode,

    /// Node id announced to the relay (node mode)
    #[arg(long, default_value = "node-1")]
    node_id: String,

    /// Initial time authority (relay mode)
    #[arg(long)]
    authority: Option<String>,

    /// Relay address: bind address in relay mode, target in node mode
    #[arg(long, default_value = "127.0.0.1:9400")]
    relay_addr: String,

    /// Client WebSocket bind address (node mode)
    #[arg(long, default_value = "127.0.0.1:9401")]
    client_addr: String,

    /// Time sync config file, reloaded when it changes (node mode)
    #[arg(long, default_value = "./timesync.json")]
    config: PathBuf,

    /// Config file poll interval in milliseconds
    #[arg(long, default_value = "1000")]
    config_poll_ms: u64,

    /// Seconds between authority heartbeats (relay mode)
    #[arg(long, default_value_t = HEARTBEAT_INTERVAL.as_secs())]
    heartbeat_secs: u64,

    /// Seconds between stats log lines
    #[arg(long, default_value = "30")]
    stats_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn settings(&self) -> DaemonSettings {
        DaemonSettings {
            relay_addr: self.relay_addr.clone(),
            client_addr: self.client_addr.clone(),
            config_path: self.config.clone(),
            config_poll_ms: self.config_poll_ms.max(1),
            stats_interval_secs: self.stats_interval_secs.max(1),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.mode {
        Mode::Relay => run_relay(args).await,
        Mode::Node => run_node(args).await,
    }
}

/// Run in relay mode - route sync traffic and accept operator commands
async fn run_relay(args: Args) -> Result<()> {
    let settings = args.settings();
    tracing::info!("Starting time sync relay");
    tracing::info!("  Listen: {}", settings.relay_addr);
    tracing::info!("  Authority: {}", args.authority.as_deref().unwrap_or("<unassigned>"));
    tracing::info!("  Heartbeat: {}s", args.heartbeat_secs);

    let router = Arc::new(RelayRouter::new(args.authority.as_deref()));
    let server = RelayServer::new(router.clone());
    server.start(&settings.relay_addr).await?;

    let heartbeat = server.spawn_heartbeat(Duration::from_secs(args.heartbeat_secs.max(1)));
    let console = timesync_relay::spawn_console(router.clone());

    let stats_router = router.clone();
    let stats_period = Duration::from_secs(settings.stats_interval_secs);
    let stats_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(stats_period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let stats = stats_router.stats();
            tracing::info!(
                "Relay: {} nodes, authority {}, {} fanned out, {} forwarded, {} dropped",
                stats.connected_peers,
                stats.authority.as_deref().unwrap_or("<unassigned>"),
                stats.fanned_out,
                stats.forwarded,
                stats.dropped
            );
        }
    });

    tracing::info!("Relay running. Type 'help' for operator commands.");
    tracing::info!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    heartbeat.abort();
    console.abort();
    stats_task.abort();
    tracing::info!("Relay stopped");

    Ok(())
}

/// Run in node mode - keep the clock in sync and serve clients
async fn run_node(args: Args) -> Result<()> {
    let settings = args.settings();
    tracing::info!("Starting time sync node {}", args.node_id);
    tracing::info!("  Relay: {}", settings.relay_addr);
    tracing::info!("  Clients: {}", settings.client_addr);
    tracing::info!("  Cycle: {}ms ({}Hz)", CYCLE_MS, 1000 / CYCLE_MS);

    let shared_config = Arc::new(SharedConfig::new());
    let mut watcher = ConfigWatcher::new(settings.config_path.clone());
    tracing::info!("  Config: {:?}", watcher.path());
    watcher.poll(&shared_config);

    let clock = Arc::new(SystemClock);
    let sessions = Arc::new(SessionRegistry::new());
    let relay_link = Arc::new(RelayLink::new(args.node_id.clone()));

    // A second authority in this process is a wiring bug
    let authority = ClockAuthority::builder(args.node_id.clone(), shared_config.clone())
        .clock(clock.clone())
        .network(relay_link.clone())
        .clients(sessions.clone())
        .build()?;

    let link_task = relay_link.spawn(&settings.relay_addr, authority.clone(), RECONNECT_DELAY);

    let client_server = ClientServer::new(authority.clone(), sessions.clone());
    client_server.start(&settings.client_addr).await?;

    // Config hot reload
    let reload_authority = authority.clone();
    let reload_config = shared_config.clone();
    let poll_period = Duration::from_millis(settings.config_poll_ms);
    let reload_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Some(config) = watcher.poll(&reload_config) {
                reload_authority.apply_config(&config);
            }
        }
    });

    // Simulation cycle
    let tick_authority = authority.clone();
    let tick_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(CYCLE_MS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            tick_authority.tick(clock.now_ms());
        }
    });

    let stats_authority = authority.clone();
    let stats_link = relay_link.clone();
    let stats_period = Duration::from_secs(settings.stats_interval_secs);
    let stats_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(stats_period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let stats = stats_authority.stats();
            tracing::info!(
                "Clock {} ({:?}): offset {}ms, {} clients tracked, relay {} ({} connections)",
                stats.node_id,
                stats.role,
                stats.network_offset_ms,
                stats.tracked_clients,
                if stats_link.is_connected() { "up" } else { "down" },
                stats_link.connections()
            );
            if let Ok(json) = serde_json::to_string(&stats) {
                tracing::debug!("Clock stats: {}", json);
            }
        }
    });

    tracing::info!("Node running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    tick_task.abort();
    reload_task.abort();
    stats_task.abort();
    link_task.abort();
    tracing::info!(
        "Node stopped at cluster time {}",
        chrono::DateTime::from_timestamp_millis(authority.get_current_time())
            .map(|t| t.to_rfc3339())
            .unwrap_or_default()
    );

    Ok(())
}
