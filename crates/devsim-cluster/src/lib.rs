//! devsim-cluster — the state shared between the nodes of a simulation cluster.
//!
//! Two services, both thin layers over the shared `StateStore`:
//!
//! ```text
//! ClusterNodes (nodes.rs)
//!   ├── get_sorted_id_list() → refreshes own heartbeat, returns live ids
//!   ├── self_is_master()     → first id of the sorted list
//!   └── remove_stale_nodes() → deletes records with old heartbeats
//!
//! DevicePartitions (partitions.rs)
//!   ├── create()                   → deterministic bucketing of device ids
//!   ├── get_unassigned()           → partitions without a live lease
//!   ├── try_to_assign_partition()  → atomic claim
//!   ├── try_to_keep_partition()    → atomic renew
//!   └── release()                  → atomic release
//! ```
//!
//! Both are exposed as traits so the simulation manager can be driven
//! against other stores (or test doubles). Every method is a potential
//! network round trip and therefore returns a future.

pub mod config;
pub mod error;
pub mod nodes;
pub mod partitions;

pub use config::ClusteringConfig;
pub use error::{ClusterError, ClusterResult};
pub use nodes::{ClusterNodes, StoreClusterNodes, generate_node_id};
pub use partitions::{DevicePartitions, StoreDevicePartitions, partition_devices};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix epoch in seconds.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
