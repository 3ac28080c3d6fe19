//! Account-wide quota ceilings.

use serde::{Deserialize, Serialize};

/// `[rate_limits]` section of the daemon configuration.
///
/// Values are totals for the whole account, shared by every node. The
/// defaults match a mid-size hub tier. A ceiling of zero disables
/// throttling for that resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitingConfig {
    pub registry_operations_per_minute: u32,
    pub twin_reads_per_second: u32,
    pub twin_writes_per_second: u32,
    pub connections_per_second: u32,
    pub device_messages_per_second: u32,
    pub device_messages_per_day: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            registry_operations_per_minute: 100,
            twin_reads_per_second: 10,
            twin_writes_per_second: 10,
            connections_per_second: 120,
            device_messages_per_second: 120,
            device_messages_per_day: 6_000_000,
        }
    }
}
