//! devsimd — the devsim cluster node daemon.
//!
//! Every node runs the same binary against a shared state database. Nodes
//! discover each other through heartbeat records and split the devices of
//! every enabled simulation through partition leases.
//!
//! # Usage
//!
//! ```text
//! devsimd --config devsimd.toml run
//! devsimd --config devsimd.toml simulation put --file simulation.json
//! devsimd --config devsimd.toml simulation list
//! devsimd --config devsimd.toml simulation delete --id sim-1
//! ```

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use devsim_agent::{Agent, DeviceModelCatalog, SimulatedActorFactory};
use devsim_cluster::StoreDevicePartitions;
use devsim_state::{Simulation, StateStore};

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "devsimd", about = "devsim cluster node daemon")]
struct Cli {
    /// Path to the daemon configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory from the configuration.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Join the cluster and simulate this node's share of devices.
    Run,

    /// Manage stored simulations.
    Simulation {
        #[command(subcommand)]
        command: SimulationCommand,
    },
}

#[derive(Subcommand)]
enum SimulationCommand {
    /// Store a simulation definition read from a JSON file.
    Put {
        #[arg(long)]
        file: PathBuf,
    },
    /// List stored simulations.
    List,
    /// Delete a simulation and its partitions.
    Delete {
        #[arg(long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,devsimd=debug,devsim=debug")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }

    match cli.command {
        Command::Run => run(config).await,
        Command::Simulation { command } => {
            let state = open_state(&config)?;
            match command {
                SimulationCommand::Put { file } => put_simulation(&state, &file),
                SimulationCommand::List => list_simulations(&state),
                SimulationCommand::Delete { id } => delete_simulation(&state, &id),
            }
        }
    }
}

fn open_state(config: &DaemonConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.node.data_dir)?;
    let db_path = config.db_path();
    let state = StateStore::open(&db_path)
        .with_context(|| format!("failed to open state database {}", db_path.display()))?;
    info!(path = ?db_path, "state store opened");
    Ok(state)
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let state = open_state(&config)?;
    let node_id = config.node_id();
    info!(%node_id, "devsim daemon starting");

    let catalog = DeviceModelCatalog::new(config.device_models.clone());
    if catalog.is_empty() {
        warn!("no device models configured, every device will be skipped");
    } else {
        info!(models = catalog.len(), "device model catalog loaded");
    }

    let agent = Agent::new(
        state,
        node_id,
        config.clustering.clone(),
        config.intervals.clone(),
        Arc::new(catalog),
        Arc::new(SimulatedActorFactory),
    )?
    .with_rate_limits(config.rate_limits.clone());
    let agent = Arc::new(agent);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let agent_handle = tokio::spawn({
        let agent = agent.clone();
        async move { agent.run(shutdown_rx).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    agent_handle.await?;
    info!("devsim daemon stopped");
    Ok(())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn put_simulation(state: &StateStore, file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let mut simulation: Simulation = serde_json::from_str(&content)?;
    let now = epoch_secs();

    // Partitions are computed once; a redefinition keeps them.
    match state.get_simulation(&simulation.id)? {
        Some(existing) => {
            simulation.created_at = existing.created_at;
            simulation.partitioning_complete = existing.partitioning_complete;
        }
        None => {
            simulation.created_at = now;
            simulation.partitioning_complete = false;
        }
    }
    simulation.modified_at = now;

    state.put_simulation(&simulation)?;
    info!(
        simulation_id = %simulation.id,
        enabled = simulation.enabled,
        devices = simulation.device_count(),
        "simulation stored"
    );
    Ok(())
}

fn list_simulations(state: &StateStore) -> anyhow::Result<()> {
    for simulation in state.list_simulations()? {
        let partitions = state.list_partitions(&simulation.id)?;
        let now = epoch_secs();
        let summary = serde_json::json!({
            "id": simulation.id,
            "name": simulation.name,
            "enabled": simulation.enabled,
            "devices": simulation.device_count(),
            "partitioning_complete": simulation.partitioning_complete,
            "partitions": partitions.len(),
            "leased_partitions": partitions.iter().filter(|p| p.is_leased(now)).count(),
        });
        println!("{summary}");
    }
    Ok(())
}

fn delete_simulation(state: &StateStore, simulation_id: &str) -> anyhow::Result<()> {
    let partitions = StoreDevicePartitions::new(state.clone(), "devsimd-cli");
    let deleted_partitions = partitions.delete_all(simulation_id)?;
    let deleted = state.delete_simulation(simulation_id)?;
    if !deleted {
        warn!(%simulation_id, "simulation not found");
    }
    info!(%simulation_id, deleted_partitions, "simulation deleted");
    Ok(())
}
