//! SimulationManager — runs one simulation's share of devices on this node.
//!
//! The manager never decides which devices it runs. It claims partition
//! leases from the shared store, starts actors for the devices of every
//! partition it wins, renews those leases and stops the actors of any
//! partition whose lease it loses. Node capacity is the only local policy:
//! a partition is claimed only if all of its devices fit.
//!
//! ```text
//! init ──► assign_new_partitions ◄─┐
//!               │                  │ (periodic)
//!               ▼                  │
//!          hold_assigned_partitions┘
//!               │
//!          tear_down (terminal)
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use devsim_cluster::{ClusterNodes, ClusteringConfig, DevicePartitions};
use devsim_state::{DevicesPartition, PartitionId, Simulation};
use devsim_throttle::RateLimiting;

use crate::actors::{ActorFactory, ActorKind, ActorMaps};
use crate::error::{AgentError, AgentResult};
use crate::models::DeviceModels;

/// Set once by `init`.
struct Running {
    simulation: Simulation,
    actors: ActorMaps,
}

pub struct SimulationManager<P, N> {
    partitions: P,
    nodes: N,
    models: Arc<dyn DeviceModels>,
    factory: Arc<dyn ActorFactory>,
    rate_limiting: Arc<RateLimiting>,
    max_devices_per_node: usize,
    running: OnceLock<Running>,
    /// Partitions this manager holds a lease on.
    assigned: RwLock<BTreeMap<PartitionId, DevicesPartition>>,
    torn_down: AtomicBool,
}

impl<P, N> SimulationManager<P, N>
where
    P: DevicePartitions,
    N: ClusterNodes,
{
    pub fn new(
        partitions: P,
        nodes: N,
        models: Arc<dyn DeviceModels>,
        factory: Arc<dyn ActorFactory>,
        rate_limiting: Arc<RateLimiting>,
    ) -> Self {
        Self {
            partitions,
            nodes,
            models,
            factory,
            rate_limiting,
            max_devices_per_node: ClusteringConfig::default().max_devices_per_node,
            running: OnceLock::new(),
            assigned: RwLock::new(BTreeMap::new()),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Set the number of devices this node may simulate across all
    /// simulations sharing its actor maps.
    pub fn with_max_devices_per_node(mut self, max_devices: usize) -> Self {
        self.max_devices_per_node = max_devices;
        self
    }

    /// Bind the manager to a simulation and the node's actor maps.
    pub fn init(&self, simulation: Simulation, actors: ActorMaps) -> AgentResult<()> {
        let simulation_id = simulation.id.clone();
        self.running
            .set(Running { simulation, actors })
            .map_err(|_| AgentError::AlreadyInitialized(simulation_id.clone()))?;
        info!(%simulation_id, "simulation manager initialized");
        Ok(())
    }

    fn running(&self) -> AgentResult<&Running> {
        self.running.get().ok_or(AgentError::NotInitialized)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub fn simulation_id(&self) -> Option<&str> {
        self.running.get().map(|r| r.simulation.id.as_str())
    }

    pub fn rate_limiting(&self) -> &Arc<RateLimiting> {
        &self.rate_limiting
    }

    /// Ids of the partitions currently held, in order.
    pub async fn assigned_partition_ids(&self) -> Vec<PartitionId> {
        self.assigned.read().await.keys().cloned().collect()
    }

    /// Devices of this simulation with running actors.
    pub async fn device_count(&self) -> usize {
        let Some(running) = self.running.get() else {
            return 0;
        };
        self.assigned
            .read()
            .await
            .values()
            .flat_map(|partition| partition.devices())
            .filter(|(_, device_id)| running.actors.contains(ActorKind::State, device_id))
            .count()
    }

    /// Claim free partitions while they fit in the node's capacity, and
    /// start actors for their devices. Returns the number of partitions
    /// acquired.
    ///
    /// Losing a claim race is skipped silently. A store failure aborts the
    /// cycle; partitions already acquired in it are kept.
    pub async fn assign_new_partitions(&self) -> AgentResult<usize> {
        let running = self.running()?;
        let simulation_id = running.simulation.id.as_str();
        if self.is_torn_down() {
            return Ok(0);
        }

        if running.actors.device_count() >= self.max_devices_per_node {
            debug!(
                %simulation_id,
                max = self.max_devices_per_node,
                "node at capacity, not assigning"
            );
            return Ok(0);
        }

        let candidates = self.partitions.get_unassigned(simulation_id).await?;
        let mut acquired = 0;

        for partition in candidates {
            let backed = running.actors.device_count();
            if backed + partition.device_count() > self.max_devices_per_node {
                debug!(
                    %simulation_id,
                    partition_id = %partition.id,
                    backed,
                    max = self.max_devices_per_node,
                    "partition does not fit, stopping assignment"
                );
                break;
            }

            if !self.partitions.try_to_assign_partition(&partition.id).await? {
                debug!(partition_id = %partition.id, "partition taken by another node");
                continue;
            }

            let devices = self.create_actors(running, &partition);

            let mut assigned = self.assigned.write().await;
            if self.is_torn_down() {
                // tear_down already drained the map; undo this one here.
                drop(assigned);
                self.remove_actors(running, &partition);
                self.partitions.release(&partition.id).await?;
                break;
            }
            info!(%simulation_id, partition_id = %partition.id, devices, "partition assigned");
            assigned.insert(partition.id.clone(), partition);
            acquired += 1;
        }

        Ok(acquired)
    }

    /// Renew the lease of every held partition. Partitions whose lease
    /// could not be renewed have their actors stopped and are returned.
    ///
    /// A store failure on one partition does not stop the others; the
    /// first failure is returned after all partitions were tried.
    pub async fn hold_assigned_partitions(&self) -> AgentResult<Vec<PartitionId>> {
        let running = self.running()?;
        if self.is_torn_down() {
            return Ok(Vec::new());
        }

        let held = self.assigned_partition_ids().await;
        let mut lost = Vec::new();
        let mut failure = None;

        for partition_id in held {
            match self.partitions.try_to_keep_partition(&partition_id).await {
                Ok(true) => {}
                Ok(false) => lost.push(partition_id),
                Err(e) => {
                    warn!(%partition_id, error = %e, "failed to renew partition lease");
                    failure.get_or_insert(e);
                }
            }
        }

        if !lost.is_empty() {
            let mut assigned = self.assigned.write().await;
            for partition_id in &lost {
                if let Some(partition) = assigned.remove(partition_id) {
                    let devices = self.remove_actors(running, &partition);
                    warn!(
                        simulation_id = %running.simulation.id,
                        %partition_id,
                        devices,
                        "partition lease lost, actors stopped"
                    );
                }
            }
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(lost),
        }
    }

    /// Recompute this node's share of the rate limits from the current
    /// cluster size. When membership cannot be read the previous limits
    /// stay in place.
    pub async fn update_throttling_limits(&self) -> AgentResult<()> {
        self.running()?;

        let ids = match self.nodes.get_sorted_id_list().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "cluster membership unavailable, keeping rate limits");
                return Ok(());
            }
        };
        if ids.is_empty() {
            warn!("cluster membership is empty, keeping rate limits");
            return Ok(());
        }

        self.rate_limiting.change_cluster_size(ids.len())?;
        Ok(())
    }

    /// Stop every actor of this simulation and release all held leases.
    /// Safe to call more than once; later calls do nothing.
    /// Before `init` there is nothing to stop and the call is ignored.
    pub async fn tear_down(&self) {
        let Some(running) = self.running.get() else {
            return;
        };
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let held = std::mem::take(&mut *self.assigned.write().await);
        let partitions = held.len();
        let mut devices = 0;

        for (partition_id, partition) in held {
            devices += self.remove_actors(running, &partition);
            if let Err(e) = self.partitions.release(&partition_id).await {
                warn!(
                    %partition_id,
                    error = %e,
                    "failed to release partition, lease will expire"
                );
            }
        }

        info!(
            simulation_id = %running.simulation.id,
            partitions,
            devices,
            "simulation manager torn down"
        );
    }

    /// Start the four actors of every device in the partition. Devices
    /// whose model cannot be resolved are skipped.
    fn create_actors(&self, running: &Running, partition: &DevicesPartition) -> usize {
        let mut created = 0;

        for (model_id, device_ids) in &partition.device_ids_by_model {
            let model = match self.models.get_with_override(model_id, &running.simulation) {
                Ok(model) => model,
                Err(e) => {
                    warn!(
                        partition_id = %partition.id,
                        %model_id,
                        skipped = device_ids.len(),
                        error = %e,
                        "device model unavailable, skipping devices"
                    );
                    continue;
                }
            };

            for device_id in device_ids {
                for kind in ActorKind::ALL {
                    let actor = self.factory.create(kind, &self.rate_limiting);
                    let previous = running.actors.insert(kind, device_id, actor.clone());
                    if let Some(previous) = previous {
                        previous.stop();
                    }
                    actor.start(device_id, &model);
                }
                created += 1;
            }
        }

        created
    }

    fn remove_actors(&self, running: &Running, partition: &DevicesPartition) -> usize {
        partition
            .devices()
            .filter(|(_, device_id)| running.actors.remove_device(device_id) > 0)
            .count()
    }
}
