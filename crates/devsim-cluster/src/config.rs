//! Clustering settings shared by membership, partitioning and the agent.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};

/// `[clustering]` section of the daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusteringConfig {
    /// A node whose last heartbeat is older than this is considered gone.
    pub node_record_max_age_secs: u64,
    /// Lifetime of a partition lease; renewals extend it by this much.
    pub partition_lease_secs: u64,
    /// Maximum number of devices in one partition.
    pub max_partition_size: usize,
    /// Maximum number of devices a single node may simulate at once.
    pub max_devices_per_node: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            node_record_max_age_secs: 20,
            partition_lease_secs: 60,
            max_partition_size: 1000,
            max_devices_per_node: 20_000,
        }
    }
}

impl ClusteringConfig {
    pub fn node_record_max_age(&self) -> Duration {
        Duration::from_secs(self.node_record_max_age_secs)
    }

    pub fn partition_lease(&self) -> Duration {
        Duration::from_secs(self.partition_lease_secs)
    }

    /// Reject settings the cluster cannot operate with.
    pub fn validate(&self) -> ClusterResult<()> {
        if self.max_partition_size == 0 {
            return Err(ClusterError::InvalidConfig(
                "max_partition_size must be at least 1".to_string(),
            ));
        }
        if self.partition_lease_secs == 0 {
            return Err(ClusterError::InvalidConfig(
                "partition_lease_secs must be at least 1".to_string(),
            ));
        }
        if self.max_devices_per_node < self.max_partition_size {
            return Err(ClusterError::InvalidConfig(format!(
                "max_devices_per_node ({}) is smaller than max_partition_size ({})",
                self.max_devices_per_node, self.max_partition_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ClusteringConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_partition_size_rejected() {
        let config = ClusteringConfig {
            max_partition_size: 0,
            ..ClusteringConfig::default()
        };
        assert!(matches!(config.validate(), Err(ClusterError::InvalidConfig(_))));
    }

    #[test]
    fn node_capacity_must_fit_one_partition() {
        let config = ClusteringConfig {
            max_partition_size: 100,
            max_devices_per_node: 50,
            ..ClusteringConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
