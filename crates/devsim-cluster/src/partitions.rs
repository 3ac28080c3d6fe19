//! Device partitions and their leases.
//!
//! A simulation's devices are split once into fixed-size partitions. Nodes
//! never own a partition outright: they hold a lease with an expiry, taken
//! and extended through single conditional writes in the shared store.
//! Two nodes racing for the same partition cannot both win, which is the
//! only mutual-exclusion guarantee the rest of the system relies on.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, info};

use devsim_state::{DevicesPartition, NodeId, Simulation, StateStore};

use crate::epoch_secs;
use crate::error::{ClusterError, ClusterResult};

/// Lease-based access to the partitions of a simulation.
///
/// `false` from `try_to_assign_partition` or `try_to_keep_partition` means
/// another node won the race (or the lease was lost); it is an expected
/// outcome, not an error. Errors are infrastructure failures.
pub trait DevicePartitions: Send + Sync {
    /// Partitions of the simulation with no live lease.
    fn get_unassigned(
        &self,
        simulation_id: &str,
    ) -> impl Future<Output = ClusterResult<Vec<DevicesPartition>>> + Send;

    /// Claim the lease of a partition if it is free or expired.
    fn try_to_assign_partition(
        &self,
        partition_id: &str,
    ) -> impl Future<Output = ClusterResult<bool>> + Send;

    /// Extend this node's lease on a partition.
    fn try_to_keep_partition(
        &self,
        partition_id: &str,
    ) -> impl Future<Output = ClusterResult<bool>> + Send;

    /// Give up this node's lease on a partition before it expires.
    fn release(&self, partition_id: &str) -> impl Future<Output = ClusterResult<bool>> + Send;
}

/// `DevicePartitions` backed by the shared `StateStore`.
#[derive(Clone)]
pub struct StoreDevicePartitions {
    state: StateStore,
    node_id: NodeId,
    lease: Duration,
    max_partition_size: usize,
}

impl StoreDevicePartitions {
    pub fn new(state: StateStore, node_id: impl Into<NodeId>) -> Self {
        Self {
            state,
            node_id: node_id.into(),
            lease: Duration::from_secs(60),
            max_partition_size: 1000,
        }
    }

    /// Set the lease duration used by claims and renewals.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set the maximum number of devices per partition.
    pub fn with_max_partition_size(mut self, size: usize) -> Self {
        self.max_partition_size = size;
        self
    }

    /// Split a simulation into partitions and store them.
    ///
    /// Does nothing if the simulation already has partitions. Marks the
    /// simulation as partitioned either way. Returns the number of
    /// partitions written by this call.
    pub fn create(&self, simulation: &Simulation) -> ClusterResult<usize> {
        if self.max_partition_size == 0 {
            return Err(ClusterError::InvalidConfig(
                "max_partition_size must be at least 1".to_string(),
            ));
        }

        let partitions = partition_devices(simulation, self.max_partition_size);
        let created = self.state.create_partitions(&simulation.id, &partitions)?;

        match self.state.mark_partitioning_complete(&simulation.id) {
            Ok(()) => {}
            Err(devsim_state::StateError::NotFound(_)) => {
                return Err(ClusterError::SimulationNotFound(simulation.id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        if created > 0 {
            info!(
                simulation_id = %simulation.id,
                partitions = created,
                devices = simulation.device_count(),
                "simulation partitioned"
            );
        } else {
            debug!(simulation_id = %simulation.id, "simulation already partitioned");
        }
        Ok(created)
    }

    /// Delete every partition of a simulation.
    pub fn delete_all(&self, simulation_id: &str) -> ClusterResult<u32> {
        let deleted = self.state.delete_partitions_for_simulation(simulation_id)?;
        info!(%simulation_id, deleted, "partitions deleted");
        Ok(deleted)
    }

    fn lease_secs(&self) -> u64 {
        self.lease.as_secs().max(1)
    }
}

impl DevicePartitions for StoreDevicePartitions {
    async fn get_unassigned(&self, simulation_id: &str) -> ClusterResult<Vec<DevicesPartition>> {
        let partitions = self
            .state
            .list_unassigned_partitions(simulation_id, epoch_secs())?;
        debug!(%simulation_id, count = partitions.len(), "unassigned partitions");
        Ok(partitions)
    }

    async fn try_to_assign_partition(&self, partition_id: &str) -> ClusterResult<bool> {
        let claimed = self.state.claim_partition(
            partition_id,
            &self.node_id,
            epoch_secs(),
            self.lease_secs(),
        )?;
        debug!(%partition_id, node_id = %self.node_id, claimed, "partition claim");
        Ok(claimed)
    }

    async fn try_to_keep_partition(&self, partition_id: &str) -> ClusterResult<bool> {
        let kept = self.state.renew_partition(
            partition_id,
            &self.node_id,
            epoch_secs(),
            self.lease_secs(),
        )?;
        if !kept {
            debug!(%partition_id, node_id = %self.node_id, "partition lease lost");
        }
        Ok(kept)
    }

    async fn release(&self, partition_id: &str) -> ClusterResult<bool> {
        let released = self.state.release_partition(partition_id, &self.node_id)?;
        debug!(%partition_id, node_id = %self.node_id, released, "partition released");
        Ok(released)
    }
}

/// Split the devices of a simulation into partitions of at most `max_size`.
///
/// Devices are taken in model declaration order, so the same definition
/// always yields the same partitions.
pub fn partition_devices(simulation: &Simulation, max_size: usize) -> Vec<DevicesPartition> {
    let max_size = max_size.max(1);
    let devices = simulation.device_ids();

    devices
        .chunks(max_size)
        .enumerate()
        .map(|(index, chunk)| {
            let mut by_model: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for (model_id, device_id) in chunk {
                by_model
                    .entry(model_id.clone())
                    .or_default()
                    .push(device_id.clone());
            }
            DevicesPartition {
                id: DevicesPartition::make_id(&simulation.id, index),
                simulation_id: simulation.id.clone(),
                device_ids_by_model: by_model,
                lease_owner: None,
                lease_expires_at: 0,
            }
        })
        .collect()
}
