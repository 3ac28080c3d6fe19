//! Agent — the per-node loop that keeps simulation managers in step with
//! the simulations stored in the cluster.
//!
//! Four independent timers drive it:
//!
//! - **sync**: start a manager for every enabled simulation, tear down the
//!   managers of disabled or deleted ones. The master node also partitions
//!   new simulations and removes stale node records.
//! - **assign**: claim free partitions for every manager.
//! - **hold**: renew the leases every manager holds.
//! - **throttle**: recompute rate limits from the cluster size.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use devsim_cluster::{ClusterNodes, ClusteringConfig, StoreClusterNodes, StoreDevicePartitions};
use devsim_state::{NodeId, Simulation, SimulationId, StateStore};
use devsim_throttle::{RateLimiting, RateLimitingConfig};

use crate::actors::{ActorFactory, ActorMaps};
use crate::error::{AgentError, AgentResult};
use crate::manager::SimulationManager;
use crate::models::DeviceModels;

/// Manager over the shared state store.
pub type StoreSimulationManager = SimulationManager<StoreDevicePartitions, StoreClusterNodes>;

/// `[intervals]` section of the daemon configuration, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentIntervals {
    /// Also refreshes this node's heartbeat, so it must be shorter than
    /// `node_record_max_age_secs`.
    pub sync_secs: u64,
    pub assign_secs: u64,
    /// Must be shorter than `partition_lease_secs`.
    pub hold_secs: u64,
    pub throttle_secs: u64,
}

impl Default for AgentIntervals {
    fn default() -> Self {
        Self {
            sync_secs: 10,
            assign_secs: 5,
            hold_secs: 15,
            throttle_secs: 30,
        }
    }
}

impl AgentIntervals {
    /// Reject intervals that let leases or heartbeats lapse between two
    /// refreshes.
    pub fn validate(&self, clustering: &ClusteringConfig) -> AgentResult<()> {
        if self.hold_secs.max(1) >= clustering.partition_lease_secs {
            return Err(AgentError::InvalidConfig(format!(
                "hold_secs ({}) must be shorter than partition_lease_secs ({})",
                self.hold_secs, clustering.partition_lease_secs
            )));
        }
        if self.sync_secs.max(1) >= clustering.node_record_max_age_secs {
            return Err(AgentError::InvalidConfig(format!(
                "sync_secs ({}) must be shorter than node_record_max_age_secs ({})",
                self.sync_secs, clustering.node_record_max_age_secs
            )));
        }
        Ok(())
    }
}

fn every(secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

pub struct Agent {
    state: StateStore,
    nodes: StoreClusterNodes,
    partitions: StoreDevicePartitions,
    models: Arc<dyn DeviceModels>,
    factory: Arc<dyn ActorFactory>,
    clustering: ClusteringConfig,
    rate_limits: RateLimitingConfig,
    intervals: AgentIntervals,
    actors: ActorMaps,
    managers: RwLock<HashMap<SimulationId, Arc<StoreSimulationManager>>>,
}

impl Agent {
    pub fn new(
        state: StateStore,
        node_id: impl Into<NodeId>,
        clustering: ClusteringConfig,
        intervals: AgentIntervals,
        models: Arc<dyn DeviceModels>,
        factory: Arc<dyn ActorFactory>,
    ) -> AgentResult<Self> {
        clustering.validate()?;
        intervals.validate(&clustering)?;
        let node_id = node_id.into();

        let nodes = StoreClusterNodes::new(state.clone(), node_id.clone())
            .with_max_age(clustering.node_record_max_age());
        let partitions = StoreDevicePartitions::new(state.clone(), node_id)
            .with_lease(clustering.partition_lease())
            .with_max_partition_size(clustering.max_partition_size);

        Ok(Self {
            state,
            nodes,
            partitions,
            models,
            factory,
            clustering,
            rate_limits: RateLimitingConfig::default(),
            intervals,
            actors: ActorMaps::new(),
            managers: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_rate_limits(mut self, rate_limits: RateLimitingConfig) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    pub fn node_id(&self) -> &str {
        self.nodes.node_id()
    }

    /// Actor maps shared by every simulation on this node.
    pub fn actors(&self) -> &ActorMaps {
        &self.actors
    }

    /// Ids of the simulations with a running manager, sorted.
    pub async fn simulation_ids(&self) -> Vec<SimulationId> {
        let mut ids: Vec<_> = self.managers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn manager(&self, simulation_id: &str) -> Option<Arc<StoreSimulationManager>> {
        self.managers.read().await.get(simulation_id).cloned()
    }

    async fn all_managers(&self) -> Vec<Arc<StoreSimulationManager>> {
        self.managers.read().await.values().cloned().collect()
    }

    /// Reconcile running managers with the stored simulations.
    pub async fn sync_simulations(&self) -> AgentResult<()> {
        let simulations = self.state.list_simulations()?;
        let is_master = self.nodes.self_is_master().await?;

        if is_master {
            match self.nodes.remove_stale_nodes().await {
                Ok(removed) if !removed.is_empty() => {
                    info!(count = removed.len(), "stale nodes removed")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to remove stale nodes"),
            }
        }

        let wanted: HashSet<&str> = simulations
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.id.as_str())
            .collect();

        let retired: Vec<_> = {
            let mut managers = self.managers.write().await;
            let ids: Vec<SimulationId> = managers
                .keys()
                .filter(|id| !wanted.contains(id.as_str()))
                .cloned()
                .collect();
            ids.iter().filter_map(|id| managers.remove(id)).collect()
        };
        for manager in retired {
            manager.tear_down().await;
        }

        for simulation in simulations.into_iter().filter(|s| s.enabled) {
            if self.managers.read().await.contains_key(&simulation.id) {
                continue;
            }
            let Some(simulation) = self.ready_to_run(simulation, is_master)? else {
                continue;
            };
            self.start_manager(simulation).await?;
        }

        Ok(())
    }

    /// Partition the simulation if needed. `None` while it has no partitions
    /// this node may use yet.
    fn ready_to_run(
        &self,
        simulation: Simulation,
        is_master: bool,
    ) -> AgentResult<Option<Simulation>> {
        if simulation.partitioning_complete {
            return Ok(Some(simulation));
        }
        if !is_master {
            debug!(simulation_id = %simulation.id, "waiting for master to partition simulation");
            return Ok(None);
        }

        if let Err(e) = self.partitions.create(&simulation) {
            warn!(simulation_id = %simulation.id, error = %e, "failed to partition simulation");
            return Ok(None);
        }
        Ok(self.state.get_simulation(&simulation.id)?)
    }

    async fn start_manager(&self, simulation: Simulation) -> AgentResult<()> {
        let simulation_id = simulation.id.clone();
        let devices = simulation.device_count();

        let manager = SimulationManager::new(
            self.partitions.clone(),
            self.nodes.clone(),
            self.models.clone(),
            self.factory.clone(),
            Arc::new(RateLimiting::new(self.rate_limits.clone())),
        )
        .with_max_devices_per_node(self.clustering.max_devices_per_node);
        manager.init(simulation, self.actors.clone())?;
        manager.update_throttling_limits().await?;

        self.managers
            .write()
            .await
            .insert(simulation_id.clone(), Arc::new(manager));
        info!(%simulation_id, devices, "simulation started on node");
        Ok(())
    }

    /// Run one assignment cycle for every simulation. Returns the number of
    /// partitions acquired.
    pub async fn assign_partitions(&self) -> usize {
        let mut acquired = 0;
        for manager in self.all_managers().await {
            match manager.assign_new_partitions().await {
                Ok(n) => acquired += n,
                Err(e) => warn!(
                    simulation_id = manager.simulation_id().unwrap_or_default(),
                    error = %e,
                    "partition assignment failed"
                ),
            }
        }
        acquired
    }

    pub async fn hold_partitions(&self) {
        for manager in self.all_managers().await {
            if let Err(e) = manager.hold_assigned_partitions().await {
                warn!(
                    simulation_id = manager.simulation_id().unwrap_or_default(),
                    error = %e,
                    "partition renewal failed"
                );
            }
        }
    }

    pub async fn update_throttling(&self) {
        for manager in self.all_managers().await {
            if let Err(e) = manager.update_throttling_limits().await {
                warn!(
                    simulation_id = manager.simulation_id().unwrap_or_default(),
                    error = %e,
                    "rate limit update failed"
                );
            }
        }
    }

    /// Drive all timers until `shutdown` flips, then tear everything down.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut sync = every(self.intervals.sync_secs);
        let mut assign = every(self.intervals.assign_secs);
        let mut hold = every(self.intervals.hold_secs);
        let mut throttle = every(self.intervals.throttle_secs);

        info!(node_id = %self.node_id(), intervals = ?self.intervals, "agent started");

        loop {
            tokio::select! {
                _ = sync.tick() => {
                    if let Err(e) = self.sync_simulations().await {
                        error!(error = %e, "simulation sync failed");
                    }
                }
                _ = assign.tick() => {
                    self.assign_partitions().await;
                }
                _ = hold.tick() => {
                    self.hold_partitions().await;
                }
                _ = throttle.tick() => {
                    self.update_throttling().await;
                }
                _ = shutdown.changed() => {
                    info!("agent shutting down");
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    /// Tear down every manager and leave the cluster.
    pub async fn shutdown(&self) {
        let managers: Vec<_> = self.managers.write().await.drain().map(|(_, m)| m).collect();
        for manager in managers {
            manager.tear_down().await;
        }
        if let Err(e) = self.nodes.leave().await {
            warn!(error = %e, "failed to leave cluster");
        }
    }
}
