//! redb table definitions for the devsim state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Simulation definitions keyed by `{simulation_id}`.
pub const SIMULATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("simulations");

/// Device partitions (and their lease) keyed by `{simulation_id}:{index}`.
pub const PARTITIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("partitions");

/// Cluster node heartbeats keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
