//! StateStore — redb-backed state persistence for devsim.
//!
//! Provides typed operations over simulations, device partitions and
//! cluster nodes. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).
//!
//! Lease operations never read in one transaction and write in another:
//! the check and the update happen inside the same write transaction.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SIMULATIONS).map_err(map_err!(Table))?;
        txn.open_table(PARTITIONS).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// List values whose key starts with `prefix` (empty prefix lists all).
    fn list<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
        Ok(results)
    }

    fn delete(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-modify-write a single partition inside one write transaction.
    ///
    /// `update` returns whether the record should be written back. When it
    /// returns false (or the partition does not exist) the transaction is
    /// aborted and nothing changes.
    fn update_partition<F>(&self, partition_id: &str, update: F) -> StateResult<bool>
    where
        F: FnOnce(&mut DevicesPartition) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let written = {
            let mut table = txn.open_table(PARTITIONS).map_err(map_err!(Table))?;
            let current = table
                .get(partition_id)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());

            match current {
                Some(bytes) => {
                    let mut partition: DevicesPartition =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    if update(&mut partition) {
                        let value =
                            serde_json::to_vec(&partition).map_err(map_err!(Serialize))?;
                        table
                            .insert(partition_id, value.as_slice())
                            .map_err(map_err!(Write))?;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if written {
            txn.commit().map_err(map_err!(Transaction))?;
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(written)
    }

    // ── Simulations ────────────────────────────────────────────────

    /// Insert or replace a simulation definition.
    pub fn put_simulation(&self, simulation: &Simulation) -> StateResult<()> {
        simulation.validate_ids()?;
        self.put(SIMULATIONS, &simulation.id, simulation)?;
        debug!(simulation_id = %simulation.id, "simulation stored");
        Ok(())
    }

    /// Get a simulation by ID.
    pub fn get_simulation(&self, simulation_id: &str) -> StateResult<Option<Simulation>> {
        self.get(SIMULATIONS, simulation_id)
    }

    /// List all simulations, ordered by ID.
    pub fn list_simulations(&self) -> StateResult<Vec<Simulation>> {
        self.list(SIMULATIONS, "")
    }

    /// Delete a simulation by ID. Returns true if it existed.
    pub fn delete_simulation(&self, simulation_id: &str) -> StateResult<bool> {
        let existed = self.delete(SIMULATIONS, simulation_id)?;
        debug!(%simulation_id, existed, "simulation deleted");
        Ok(existed)
    }

    /// Flag a simulation as fully partitioned.
    ///
    /// Fails with `NotFound` when the simulation no longer exists.
    pub fn mark_partitioning_complete(&self, simulation_id: &str) -> StateResult<()> {
        let mut simulation = self
            .get_simulation(simulation_id)?
            .ok_or_else(|| StateError::NotFound(format!("simulation {simulation_id}")))?;
        if !simulation.partitioning_complete {
            simulation.partitioning_complete = true;
            self.put_simulation(&simulation)?;
        }
        Ok(())
    }

    // ── Partitions ─────────────────────────────────────────────────

    /// Store the partitions of a simulation, unless some already exist.
    ///
    /// The existence check and the inserts share one write transaction, so
    /// two nodes racing to partition the same simulation cannot both write.
    /// Returns the number of partitions stored by this call (0 when the
    /// simulation was already partitioned).
    pub fn create_partitions(
        &self,
        simulation_id: &str,
        partitions: &[DevicesPartition],
    ) -> StateResult<usize> {
        check_id("simulation", simulation_id)?;
        let prefix = DevicesPartition::simulation_prefix(simulation_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let created = {
            let mut table = txn.open_table(PARTITIONS).map_err(map_err!(Table))?;
            let exists = match table.range(prefix.as_str()..).map_err(map_err!(Read))?.next() {
                Some(entry) => {
                    let (key, _) = entry.map_err(map_err!(Read))?;
                    key.value().starts_with(&prefix)
                }
                None => false,
            };

            if exists {
                0
            } else {
                for partition in partitions {
                    let value = serde_json::to_vec(partition).map_err(map_err!(Serialize))?;
                    table
                        .insert(partition.id.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                }
                partitions.len()
            }
        };

        if created > 0 {
            txn.commit().map_err(map_err!(Transaction))?;
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        debug!(%simulation_id, created, "partitions stored");
        Ok(created)
    }

    /// Get a partition by ID.
    pub fn get_partition(&self, partition_id: &str) -> StateResult<Option<DevicesPartition>> {
        self.get(PARTITIONS, partition_id)
    }

    /// List all partitions of a simulation.
    pub fn list_partitions(&self, simulation_id: &str) -> StateResult<Vec<DevicesPartition>> {
        self.list(PARTITIONS, &DevicesPartition::simulation_prefix(simulation_id))
    }

    /// List the partitions of a simulation with no live lease at `now`.
    pub fn list_unassigned_partitions(
        &self,
        simulation_id: &str,
        now: u64,
    ) -> StateResult<Vec<DevicesPartition>> {
        let partitions = self.list_partitions(simulation_id)?;
        Ok(partitions.into_iter().filter(|p| !p.is_leased(now)).collect())
    }

    /// Delete all partitions of a simulation. Returns number deleted.
    pub fn delete_partitions_for_simulation(&self, simulation_id: &str) -> StateResult<u32> {
        let prefix = DevicesPartition::simulation_prefix(simulation_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = {
            let mut table = txn.open_table(PARTITIONS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                keys.push(key.value().to_string());
            }
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            keys.len() as u32
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%simulation_id, count, "partitions deleted");
        Ok(count)
    }

    /// Take the lease of a partition if nobody holds a live one.
    ///
    /// Returns false when another lease is still live at `now`, including one
    /// held by `owner` itself, or when the partition does not exist.
    pub fn claim_partition(
        &self,
        partition_id: &str,
        owner: &str,
        now: u64,
        lease_secs: u64,
    ) -> StateResult<bool> {
        self.update_partition(partition_id, |partition| {
            if partition.is_leased(now) {
                return false;
            }
            partition.lease_owner = Some(owner.to_string());
            partition.lease_expires_at = now + lease_secs;
            true
        })
    }

    /// Extend a lease held by `owner`.
    ///
    /// Returns false when `owner` is not the recorded lease owner, i.e. the
    /// lease was never held, was released, or was reclaimed by another node.
    pub fn renew_partition(
        &self,
        partition_id: &str,
        owner: &str,
        now: u64,
        lease_secs: u64,
    ) -> StateResult<bool> {
        self.update_partition(partition_id, |partition| {
            if !partition.is_owned_by(owner) {
                return false;
            }
            partition.lease_expires_at = now + lease_secs;
            true
        })
    }

    /// Drop a lease held by `owner`. Returns false if `owner` did not hold it.
    pub fn release_partition(&self, partition_id: &str, owner: &str) -> StateResult<bool> {
        self.update_partition(partition_id, |partition| {
            if !partition.is_owned_by(owner) {
                return false;
            }
            partition.lease_owner = None;
            partition.lease_expires_at = 0;
            true
        })
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node record.
    pub fn put_node(&self, node: &NodeRecord) -> StateResult<()> {
        self.put(NODES, &node.id, node)
    }

    /// Refresh the heartbeat of a node, registering it if unknown.
    pub fn heartbeat_node(&self, node_id: &str, now: u64) -> StateResult<NodeRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let current = table
                .get(node_id)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());

            let record = match current {
                Some(bytes) => {
                    let mut node: NodeRecord =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    node.last_heartbeat = now;
                    node
                }
                None => NodeRecord {
                    id: node_id.to_string(),
                    started_at: now,
                    last_heartbeat: now,
                },
            };
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(node_id, value.as_slice())
                .map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    /// Get a node by ID.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeRecord>> {
        self.get(NODES, node_id)
    }

    /// List all nodes, ordered by ID.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        self.list(NODES, "")
    }

    /// Delete a node by ID. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        self.delete(NODES, node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn test_simulation(id: &str) -> Simulation {
        Simulation {
            id: id.to_string(),
            name: format!("{id} fleet"),
            enabled: true,
            device_models: vec![DeviceModelRef {
                id: "chiller".to_string(),
                count: 4,
                model_override: None,
            }],
            partitioning_complete: false,
            iot_hub_connection_strings: vec!["HostName=hub;SharedAccessKey=...".to_string()],
            statistics: SimulationStatistics::default(),
            created_at: 1000,
            modified_at: 1000,
        }
    }

    fn test_partition(simulation_id: &str, index: usize) -> DevicesPartition {
        let mut devices = BTreeMap::new();
        devices.insert(
            "chiller".to_string(),
            vec![generate_device_id(simulation_id, "chiller", index as u32)],
        );
        DevicesPartition {
            id: DevicesPartition::make_id(simulation_id, index),
            simulation_id: simulation_id.to_string(),
            device_ids_by_model: devices,
            lease_owner: None,
            lease_expires_at: 0,
        }
    }

    fn store_with_partitions(simulation_id: &str, count: usize) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        let partitions: Vec<_> = (0..count).map(|i| test_partition(simulation_id, i)).collect();
        store.create_partitions(simulation_id, &partitions).unwrap();
        store
    }

    // ── Simulations ────────────────────────────────────────────────

    #[test]
    fn simulation_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let sim = test_simulation("sim-1");

        store.put_simulation(&sim).unwrap();
        assert_eq!(store.get_simulation("sim-1").unwrap(), Some(sim));
        assert!(store.get_simulation("nope").unwrap().is_none());
    }

    #[test]
    fn simulation_list_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_simulation(&test_simulation("b")).unwrap();
        store.put_simulation(&test_simulation("a")).unwrap();

        let ids: Vec<_> = store
            .list_simulations()
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(store.delete_simulation("a").unwrap());
        assert!(!store.delete_simulation("a").unwrap());
        assert_eq!(store.list_simulations().unwrap().len(), 1);
    }

    #[test]
    fn mark_partitioning_complete_sets_flag() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_simulation(&test_simulation("sim-1")).unwrap();

        store.mark_partitioning_complete("sim-1").unwrap();
        assert!(store.get_simulation("sim-1").unwrap().unwrap().partitioning_complete);

        let missing = store.mark_partitioning_complete("gone");
        assert!(matches!(missing, Err(StateError::NotFound(_))));
    }

    // ── Partitions ─────────────────────────────────────────────────

    #[test]
    fn create_partitions_only_once() {
        let store = StateStore::open_in_memory().unwrap();
        let first: Vec<_> = (0..3).map(|i| test_partition("sim-1", i)).collect();
        let second: Vec<_> = (0..5).map(|i| test_partition("sim-1", i)).collect();

        assert_eq!(store.create_partitions("sim-1", &first).unwrap(), 3);
        assert_eq!(store.create_partitions("sim-1", &second).unwrap(), 0);
        assert_eq!(store.list_partitions("sim-1").unwrap().len(), 3);
    }

    #[test]
    fn partitions_are_scoped_by_simulation() {
        let store = StateStore::open_in_memory().unwrap();
        let a: Vec<_> = (0..2).map(|i| test_partition("sim-1", i)).collect();
        let b: Vec<_> = (0..3).map(|i| test_partition("sim-10", i)).collect();
        store.create_partitions("sim-1", &a).unwrap();
        store.create_partitions("sim-10", &b).unwrap();

        assert_eq!(store.list_partitions("sim-1").unwrap().len(), 2);
        assert_eq!(store.list_partitions("sim-10").unwrap().len(), 3);

        assert_eq!(store.delete_partitions_for_simulation("sim-1").unwrap(), 2);
        assert!(store.list_partitions("sim-1").unwrap().is_empty());
        assert_eq!(store.list_partitions("sim-10").unwrap().len(), 3);
    }

    #[test]
    fn ids_with_separators_are_not_stored() {
        let store = StateStore::open_in_memory().unwrap();

        let result = store.put_simulation(&test_simulation("a:b"));
        assert!(matches!(result, Err(StateError::InvalidId(_))));
        assert!(store.get_simulation("a:b").unwrap().is_none());

        let partitions = vec![test_partition("a:b", 0)];
        let result = store.create_partitions("a:b", &partitions);
        assert!(matches!(result, Err(StateError::InvalidId(_))));

        // `a` is still partitioned on its own.
        store.create_partitions("a", &[test_partition("a", 0)]).unwrap();
        assert_eq!(store.list_partitions("a").unwrap().len(), 1);
    }

    #[test]
    fn claim_is_exclusive_while_lease_is_live() {
        let store = store_with_partitions("sim-1", 1);

        assert!(store.claim_partition("sim-1:0", "node-a", 1000, 60).unwrap());
        assert!(!store.claim_partition("sim-1:0", "node-b", 1010, 60).unwrap());
        assert!(!store.claim_partition("sim-1:0", "node-a", 1010, 60).unwrap());

        let partition = store.get_partition("sim-1:0").unwrap().unwrap();
        assert_eq!(partition.lease_owner.as_deref(), Some("node-a"));
        assert_eq!(partition.lease_expires_at, 1060);
    }

    #[test]
    fn expired_lease_can_be_reclaimed() {
        let store = store_with_partitions("sim-1", 1);

        assert!(store.claim_partition("sim-1:0", "node-a", 1000, 60).unwrap());
        assert!(store.claim_partition("sim-1:0", "node-b", 1060, 60).unwrap());

        // The previous owner can no longer renew.
        assert!(!store.renew_partition("sim-1:0", "node-a", 1061, 60).unwrap());
        assert!(store.renew_partition("sim-1:0", "node-b", 1061, 60).unwrap());
    }

    #[test]
    fn renew_requires_ownership() {
        let store = store_with_partitions("sim-1", 1);

        assert!(!store.renew_partition("sim-1:0", "node-a", 1000, 60).unwrap());
        store.claim_partition("sim-1:0", "node-a", 1000, 60).unwrap();
        assert!(store.renew_partition("sim-1:0", "node-a", 1030, 60).unwrap());
        assert_eq!(
            store.get_partition("sim-1:0").unwrap().unwrap().lease_expires_at,
            1090
        );
    }

    #[test]
    fn release_clears_lease_for_owner_only() {
        let store = store_with_partitions("sim-1", 1);
        store.claim_partition("sim-1:0", "node-a", 1000, 60).unwrap();

        assert!(!store.release_partition("sim-1:0", "node-b").unwrap());
        assert!(store.release_partition("sim-1:0", "node-a").unwrap());
        assert!(!store.release_partition("sim-1:0", "node-a").unwrap());

        let unassigned = store.list_unassigned_partitions("sim-1", 1001).unwrap();
        assert_eq!(unassigned.len(), 1);
    }

    #[test]
    fn lease_operations_on_missing_partition_return_false() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(!store.claim_partition("nope:0", "node-a", 1000, 60).unwrap());
        assert!(!store.renew_partition("nope:0", "node-a", 1000, 60).unwrap());
        assert!(!store.release_partition("nope:0", "node-a").unwrap());
    }

    #[test]
    fn list_unassigned_skips_live_leases() {
        let store = store_with_partitions("sim-1", 4);
        store.claim_partition("sim-1:1", "node-a", 1000, 60).unwrap();
        store.claim_partition("sim-1:2", "node-a", 900, 60).unwrap();

        let ids: Vec<_> = store
            .list_unassigned_partitions("sim-1", 1000)
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["sim-1:0", "sim-1:2", "sim-1:3"]);
    }

    // ── Nodes ──────────────────────────────────────────────────────

    #[test]
    fn heartbeat_registers_then_refreshes() {
        let store = StateStore::open_in_memory().unwrap();

        let first = store.heartbeat_node("node-a", 1000).unwrap();
        assert_eq!(first.started_at, 1000);

        let second = store.heartbeat_node("node-a", 1010).unwrap();
        assert_eq!(second.started_at, 1000);
        assert_eq!(second.last_heartbeat, 1010);
        assert_eq!(store.get_node("node-a").unwrap(), Some(second));
    }

    #[test]
    fn node_list_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.heartbeat_node("node-b", 1000).unwrap();
        store.heartbeat_node("node-a", 1000).unwrap();

        let ids: Vec<_> = store.list_nodes().unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["node-a", "node-b"]);

        assert!(store.delete_node("node-a").unwrap());
        assert!(store.get_node("node-a").unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_simulation(&test_simulation("sim-1")).unwrap();
            store
                .create_partitions("sim-1", &[test_partition("sim-1", 0)])
                .unwrap();
            store.claim_partition("sim-1:0", "node-a", 1000, 60).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_simulation("sim-1").unwrap().is_some());
        let partition = store.get_partition("sim-1:0").unwrap().unwrap();
        assert!(partition.is_owned_by("node-a"));
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_simulations().unwrap().is_empty());
        assert!(store.list_nodes().unwrap().is_empty());
        assert!(store.list_partitions("any").unwrap().is_empty());
        assert_eq!(store.delete_partitions_for_simulation("any").unwrap(), 0);
        assert!(!store.delete_simulation("nope").unwrap());
        assert!(!store.delete_node("nope").unwrap());
    }
}
