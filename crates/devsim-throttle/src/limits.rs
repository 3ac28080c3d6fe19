//! Node-local share of the account ceilings.

use crate::config::RateLimitingConfig;
use crate::error::{ThrottleError, ThrottleResult};

/// The limits this node applies, derived from the account ceilings and the
/// current cluster size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub cluster_size: usize,
    pub registry_operations_per_minute: u32,
    pub twin_reads_per_second: u32,
    pub twin_writes_per_second: u32,
    pub connections_per_second: u32,
    pub device_messages_per_second: u32,
    pub device_messages_per_day: u64,
}

impl RateLimitSettings {
    /// The full ceilings, for a node that is alone in its cluster.
    pub fn single_node(ceilings: &RateLimitingConfig) -> Self {
        Self {
            cluster_size: 1,
            registry_operations_per_minute: ceilings.registry_operations_per_minute,
            twin_reads_per_second: ceilings.twin_reads_per_second,
            twin_writes_per_second: ceilings.twin_writes_per_second,
            connections_per_second: ceilings.connections_per_second,
            device_messages_per_second: ceilings.device_messages_per_second,
            device_messages_per_day: ceilings.device_messages_per_day,
        }
    }

    /// Divide every ceiling by `cluster_size`.
    ///
    /// Shares round down, with a floor of one so that a large cluster never
    /// starves. A zero ceiling stays zero.
    pub fn for_cluster(ceilings: &RateLimitingConfig, cluster_size: usize) -> ThrottleResult<Self> {
        if cluster_size == 0 {
            return Err(ThrottleError::InvalidClusterSize(cluster_size));
        }
        let n = cluster_size as u64;
        let share32 = |ceiling: u32| share(u64::from(ceiling), n) as u32;

        Ok(Self {
            cluster_size,
            registry_operations_per_minute: share32(ceilings.registry_operations_per_minute),
            twin_reads_per_second: share32(ceilings.twin_reads_per_second),
            twin_writes_per_second: share32(ceilings.twin_writes_per_second),
            connections_per_second: share32(ceilings.connections_per_second),
            device_messages_per_second: share32(ceilings.device_messages_per_second),
            device_messages_per_day: share(ceilings.device_messages_per_day, n),
        })
    }
}

fn share(ceiling: u64, nodes: u64) -> u64 {
    if ceiling == 0 {
        0
    } else {
        (ceiling / nodes).max(1)
    }
}
