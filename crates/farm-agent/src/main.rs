//! Device Farm Agent
//!
//! Host daemon for a screen-mirroring device farm.
//!
//! - Loads pool, retry and tier settings from an optional TOML file
//! - Connects every configured device in one batch
//! - Keeps the session pool swept of idle sessions
//! - Serves pool and batch status over HTTP when `--status-addr` is set
//! - In `--simulate N` mode, connects N in-memory devices instead of TCP

mod devices;
mod status;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{watch, RwLock};
use tracing_subscriber::EnvFilter;

use farm_core::{
    BatchEvent, BatchReport, ConnectionPool, Connector, DeviceId, FarmConfig, Orchestrator,
    PoolEvent, PortMap, SimulatedConnector, TcpConnector,
};

/// Device farm host agent.
#[derive(Parser, Debug)]
#[command(name = "farm-agent", about = "Screen-mirroring device farm agent")]
struct Cli {
    /// TOML config file (pool, retry, tiers and `[[devices]]`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Forwarded port of a device, as ID=PORT. Repeatable.
    #[arg(long = "device", value_name = "ID=PORT")]
    devices: Vec<String>,

    /// Connect N simulated in-memory devices instead of TCP ones.
    #[arg(long, value_name = "N")]
    simulate: Option<usize>,

    /// Per-channel accept delay of simulated devices, in milliseconds.
    #[arg(long, default_value_t = 50)]
    sim_connect_delay_ms: u64,

    /// Status server listen address (`/api/status`, `/metrics`).
    #[arg(long)]
    status_addr: Option<String>,

    /// Exit once the batch completes instead of waiting for Ctrl-C.
    #[arg(long, default_value_t = false)]
    once: bool,
}

/// Shared agent state accessible from all tasks.
pub struct AgentState {
    pub simulate: bool,
    pub pool: Arc<ConnectionPool>,
    pub orchestrator: Orchestrator,
    pub last_batch: RwLock<Option<BatchReport>>,
    pub started_at: std::time::Instant,
}

impl AgentState {
    pub fn new(config: &FarmConfig, connector: Arc<dyn Connector>, simulate: bool) -> Arc<Self> {
        let pool = Arc::new(ConnectionPool::from_config(config, connector));
        let orchestrator = Orchestrator::new(config, pool.clone());
        Arc::new(AgentState {
            simulate,
            pool,
            orchestrator,
            last_batch: RwLock::new(None),
            started_at: std::time::Instant::now(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let (config, file_devices) = match &cli.config {
        Some(path) => (FarmConfig::load(path)?, devices::load(path)?),
        None => (FarmConfig::default(), Vec::new()),
    };

    let (connector, batch): (Arc<dyn Connector>, Vec<DeviceId>) = match cli.simulate {
        Some(n) => {
            let sim = SimulatedConnector::fleet(
                "sim",
                n,
                Duration::from_millis(cli.sim_connect_delay_ms),
            );
            let ids = sim.device_ids();
            (Arc::new(sim), ids)
        }
        None => {
            let overrides = cli
                .devices
                .iter()
                .map(|arg| devices::parse_device_arg(arg))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let entries = devices::merge(file_devices, overrides);
            let ports = Arc::new(PortMap::new());
            for entry in &entries {
                ports.assign(entry.id.clone(), entry.port);
            }
            let ids = entries.into_iter().map(|e| e.id).collect();
            (Arc::new(TcpConnector::new(ports)), ids)
        }
    };

    tracing::info!(
        devices = batch.len(),
        simulate = cli.simulate.is_some(),
        max_connections = config.pool.max_connections,
        handshake_timeout_ms = config.handshake_timeout.as_millis() as u64,
        "farm-agent starting"
    );
    if batch.is_empty() {
        tracing::warn!("no devices configured; use --device ID=PORT, a [[devices]] table or --simulate N");
    }

    let state = AgentState::new(&config, connector, cli.simulate.is_some());

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Task 1: Idle sweeper ────────────────────────────────────
    let sweeper = state
        .pool
        .spawn_sweeper(config.pool.cleanup_interval, shutdown_rx.clone());

    // ── Task 2: Event log ───────────────────────────────────────
    let log_handle = tokio::spawn(log_events(
        state.orchestrator.subscribe(),
        state.pool.subscribe(),
        shutdown_rx.clone(),
    ));

    // ── Task 3: Status server (HTTP) ────────────────────────────
    let status_handle = match &cli.status_addr {
        Some(addr) => {
            let addr: SocketAddr = addr.parse()?;
            let status_state = state.clone();
            Some(tokio::spawn(async move { status::run(status_state, addr).await }))
        }
        None => None,
    };
    let status_task = async move {
        match status_handle {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(status_task);

    // ── Task 4: Connection batch ────────────────────────────────
    let batch_state = state.clone();
    let mut batch_handle = tokio::spawn(async move {
        let report = batch_state.orchestrator.connect_devices(batch).await;
        *batch_state.last_batch.write().await = Some(report.clone());
        report
    });
    let mut batch_done = false;

    // ── Shutdown handling ───────────────────────────────────────
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            result = &mut batch_handle, if !batch_done => {
                batch_done = true;
                match result {
                    Ok(report) => {
                        summarize(&report);
                        if cli.once {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("batch task failed: {e}");
                        break;
                    }
                }
            }
            result = &mut status_task => {
                match result {
                    Ok(Ok(())) => tracing::warn!("status server exited"),
                    Ok(Err(e)) => tracing::error!("status server failed: {e:#}"),
                    Err(e) => tracing::error!("status task failed: {e}"),
                }
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
    let _ = log_handle.await;

    tracing::info!(sessions = state.pool.total_count(), "farm-agent stopped");
    Ok(())
}

fn summarize(report: &BatchReport) {
    tracing::info!(
        batch = report.batch,
        successful = report.successful,
        failed = report.failed,
        tier = %report.profile.tier_label,
        cap = report.concurrency_cap,
        "device batch finished"
    );
    for abandoned in &report.abandoned {
        tracing::warn!(device = %abandoned.id, error = %abandoned.error, "device abandoned");
    }
}

/// Mirror batch and pool events into the log until shutdown.
async fn log_events(
    mut batch: broadcast::Receiver<BatchEvent>,
    mut pool: broadcast::Receiver<PoolEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = batch.recv() => match event {
                Ok(BatchEvent::Progress(p)) => tracing::debug!(
                    batch = p.batch,
                    completed = p.completed,
                    total = p.total,
                    failed = p.failed,
                    active = p.active,
                    queued = p.queued,
                    "batch progress"
                ),
                Ok(BatchEvent::StateChanged { id, state, attempt, .. }) => {
                    tracing::debug!(device = %id, %state, attempt, "device state")
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "batch event log lagged"),
                Err(RecvError::Closed) => return,
            },
            event = pool.recv() => match event {
                Ok(event) => tracing::debug!(?event, "pool event"),
                Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "pool event log lagged"),
                Err(RecvError::Closed) => return,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
