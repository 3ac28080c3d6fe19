//! Cluster membership — which nodes are alive right now.
//!
//! Every node keeps a heartbeat record in the shared store. Reading the
//! member list refreshes the caller's own record first, so a node that
//! stops polling (crashed, partitioned away) drops out of everyone's view
//! once its record is older than `node_record_max_age`.
//!
//! The list is returned sorted, so every node derives the same cluster size
//! and the same master (the first id) from the same snapshot, without a
//! leader election.

use std::collections::BTreeSet;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use devsim_state::{NodeId, StateStore};

use crate::epoch_secs;
use crate::error::ClusterResult;

/// Read access to cluster membership.
pub trait ClusterNodes: Send + Sync {
    /// This node's id.
    fn node_id(&self) -> &str;

    /// Refresh this node's heartbeat and return the ids of all live nodes.
    fn get_sorted_id_list(&self) -> impl Future<Output = ClusterResult<BTreeSet<NodeId>>> + Send;

    /// Delete the records of nodes that stopped sending heartbeats.
    fn remove_stale_nodes(&self) -> impl Future<Output = ClusterResult<Vec<NodeId>>> + Send;

    /// Remove this node from the cluster.
    fn leave(&self) -> impl Future<Output = ClusterResult<()>> + Send;

    /// Whether this node currently sorts first among live nodes.
    fn self_is_master(&self) -> impl Future<Output = ClusterResult<bool>> + Send {
        async move {
            let ids = self.get_sorted_id_list().await?;
            Ok(ids.first().map(String::as_str) == Some(self.node_id()))
        }
    }
}

/// `ClusterNodes` backed by the shared `StateStore`.
#[derive(Clone)]
pub struct StoreClusterNodes {
    state: StateStore,
    node_id: NodeId,
    max_age: Duration,
}

impl StoreClusterNodes {
    pub fn new(state: StateStore, node_id: impl Into<NodeId>) -> Self {
        Self {
            state,
            node_id: node_id.into(),
            max_age: Duration::from_secs(20),
        }
    }

    /// Set how long a node stays live without a heartbeat.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Register (or refresh) this node's heartbeat record.
    pub fn keep_alive(&self) -> ClusterResult<()> {
        let record = self.state.heartbeat_node(&self.node_id, epoch_secs())?;
        debug!(node_id = %record.id, last_heartbeat = record.last_heartbeat, "heartbeat stored");
        Ok(())
    }

    fn live_ids(&self) -> ClusterResult<BTreeSet<NodeId>> {
        let now = epoch_secs();
        let max_age = self.max_age.as_secs();
        Ok(self
            .state
            .list_nodes()?
            .into_iter()
            .filter(|n| n.is_alive(now, max_age))
            .map(|n| n.id)
            .collect())
    }
}

impl ClusterNodes for StoreClusterNodes {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn get_sorted_id_list(&self) -> ClusterResult<BTreeSet<NodeId>> {
        self.keep_alive()?;
        self.live_ids()
    }

    async fn remove_stale_nodes(&self) -> ClusterResult<Vec<NodeId>> {
        let now = epoch_secs();
        let max_age = self.max_age.as_secs();
        let mut removed = Vec::new();

        for node in self.state.list_nodes()? {
            if node.id == self.node_id || node.is_alive(now, max_age) {
                continue;
            }
            if self.state.delete_node(&node.id)? {
                warn!(
                    node_id = %node.id,
                    last_heartbeat = node.last_heartbeat,
                    "removed stale node"
                );
                removed.push(node.id);
            }
        }

        Ok(removed)
    }

    async fn leave(&self) -> ClusterResult<()> {
        if self.state.delete_node(&self.node_id)? {
            info!(node_id = %self.node_id, "node left cluster");
        }
        Ok(())
    }
}

/// Generate a node ID unique to this process.
pub fn generate_node_id() -> NodeId {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::process::id().hash(&mut hasher);
    SEQUENCE.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    format!("node-{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devsim_state::NodeRecord;

    fn test_state() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn listing_registers_self() {
        let nodes = StoreClusterNodes::new(test_state(), "node-a");

        let ids = nodes.get_sorted_id_list().await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["node-a"]);
    }

    #[tokio::test]
    async fn every_node_sees_the_same_order() {
        let state = test_state();
        let c = StoreClusterNodes::new(state.clone(), "node-c");
        let a = StoreClusterNodes::new(state.clone(), "node-a");
        let b = StoreClusterNodes::new(state, "node-b");

        c.keep_alive().unwrap();
        a.keep_alive().unwrap();

        let from_b = b.get_sorted_id_list().await.unwrap();
        let from_c = c.get_sorted_id_list().await.unwrap();
        assert_eq!(from_b, from_c);
        assert_eq!(
            from_b.into_iter().collect::<Vec<_>>(),
            vec!["node-a", "node-b", "node-c"]
        );
    }

    #[tokio::test]
    async fn stale_nodes_are_not_live() {
        let state = test_state();
        state
            .put_node(&NodeRecord {
                id: "node-old".to_string(),
                started_at: 1000,
                last_heartbeat: 1000, // Very old.
            })
            .unwrap();

        let nodes = StoreClusterNodes::new(state, "node-a");
        let ids = nodes.get_sorted_id_list().await.unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains("node-a"));
    }

    #[tokio::test]
    async fn master_is_first_sorted_id() {
        let state = test_state();
        let a = StoreClusterNodes::new(state.clone(), "node-a");
        let b = StoreClusterNodes::new(state, "node-b");
        a.keep_alive().unwrap();
        b.keep_alive().unwrap();

        assert!(a.self_is_master().await.unwrap());
        assert!(!b.self_is_master().await.unwrap());
    }

    #[tokio::test]
    async fn remove_stale_nodes_keeps_live_ones() {
        let state = test_state();
        state
            .put_node(&NodeRecord {
                id: "node-old".to_string(),
                started_at: 1000,
                last_heartbeat: 1000,
            })
            .unwrap();
        let nodes = StoreClusterNodes::new(state.clone(), "node-a");
        nodes.keep_alive().unwrap();

        let removed = nodes.remove_stale_nodes().await.unwrap();
        assert_eq!(removed, vec!["node-old"]);
        assert!(state.get_node("node-a").unwrap().is_some());
        assert!(state.get_node("node-old").unwrap().is_none());
    }

    #[tokio::test]
    async fn leave_removes_own_record() {
        let state = test_state();
        let nodes = StoreClusterNodes::new(state.clone(), "node-a");
        nodes.keep_alive().unwrap();

        nodes.leave().await.unwrap();
        assert!(state.get_node("node-a").unwrap().is_none());
    }

    #[test]
    fn generated_ids_are_distinct() {
        let first = generate_node_id();
        let second = generate_node_id();
        assert!(first.starts_with("node-"));
        assert_ne!(first, second);
    }
}
