//! Domain types for the devsim state store.
//!
//! These types represent the records shared across the cluster: simulation
//! definitions, device partitions with their lease, and node heartbeats.
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{StateError, StateResult};

/// Unique identifier for a simulation.
pub type SimulationId = String;

/// Unique identifier for a device partition (`{simulation_id}:{index}`).
pub type PartitionId = String;

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Unique identifier for a simulated device.
pub type DeviceId = String;

/// Separators used to build partition ids (`:`) and device ids (`.`).
pub const RESERVED_ID_CHARS: [char; 2] = [':', '.'];

/// Reject ids that are empty or contain a reserved separator.
pub fn check_id(kind: &str, id: &str) -> StateResult<()> {
    if id.is_empty() {
        return Err(StateError::InvalidId(format!("{kind} id is empty")));
    }
    if let Some(c) = id.chars().find(|c| RESERVED_ID_CHARS.contains(c)) {
        return Err(StateError::InvalidId(format!(
            "{kind} id {id:?} contains reserved character {c:?}"
        )));
    }
    Ok(())
}

// ── Simulation ───────────────────────────────────────────────────

/// A simulation definition, as written by the simulation storage service.
///
/// The cluster engine only reads it; the one field it writes back is
/// `partitioning_complete`, once the device partitions exist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Simulation {
    pub id: SimulationId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub device_models: Vec<DeviceModelRef>,
    #[serde(default)]
    pub partitioning_complete: bool,
    /// Connection strings, already redacted by the storage service.
    #[serde(default)]
    pub iot_hub_connection_strings: Vec<String>,
    #[serde(default)]
    pub statistics: SimulationStatistics,
    /// Unix timestamp (seconds) when the simulation was created.
    #[serde(default)]
    pub created_at: u64,
    /// Unix timestamp (seconds) when the simulation was last modified.
    #[serde(default)]
    pub modified_at: u64,
}

/// Reference to a device model and how many devices of it to simulate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceModelRef {
    pub id: String,
    pub count: u32,
    #[serde(default, rename = "override", skip_serializing_if = "Option::is_none")]
    pub model_override: Option<DeviceModelOverride>,
}

/// Per-simulation adjustments applied on top of a catalog device model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeviceModelOverride {
    /// Replaces the interval of every telemetry message, in seconds.
    pub telemetry_interval_secs: Option<u64>,
}

/// Last statistics snapshot recorded for a simulation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SimulationStatistics {
    pub total_messages_sent: u64,
    pub average_messages_per_second: f64,
}

impl Simulation {
    /// Generate the ids of every device in the simulation.
    ///
    /// Models are visited in declaration order, models with a zero count are
    /// skipped. The result is deterministic for a given definition.
    pub fn device_ids(&self) -> Vec<(String, DeviceId)> {
        self.device_models
            .iter()
            .filter(|model| model.count > 0)
            .flat_map(|model| {
                (0..model.count).map(move |index| {
                    (
                        model.id.clone(),
                        generate_device_id(&self.id, &model.id, index),
                    )
                })
            })
            .collect()
    }

    /// Total number of devices declared by the simulation.
    pub fn device_count(&self) -> u64 {
        self.device_models.iter().map(|m| u64::from(m.count)).sum()
    }

    /// Check that the simulation and model ids can be embedded in partition
    /// and device ids without two records producing the same key.
    pub fn validate_ids(&self) -> StateResult<()> {
        check_id("simulation", &self.id)?;
        let mut seen = HashSet::new();
        for model in &self.device_models {
            check_id("device model", &model.id)?;
            if !seen.insert(model.id.as_str()) {
                return Err(StateError::InvalidId(format!(
                    "device model {:?} listed twice in simulation {:?}",
                    model.id, self.id
                )));
            }
        }
        Ok(())
    }

    /// Find the model reference with the given id.
    pub fn model_ref(&self, model_id: &str) -> Option<&DeviceModelRef> {
        self.device_models.iter().find(|m| m.id == model_id)
    }
}

/// Build the id of the `index`-th device of a model in a simulation.
pub fn generate_device_id(simulation_id: &str, model_id: &str, index: u32) -> DeviceId {
    format!("{simulation_id}.{model_id}.{index}")
}

// ── Partitions ───────────────────────────────────────────────────

/// A fixed slice of a simulation's devices, the unit of work distribution.
///
/// The device lists never change after creation. The lease fields are the
/// only mutable part and are only written through the store's lease
/// operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DevicesPartition {
    pub id: PartitionId,
    pub simulation_id: SimulationId,
    /// Device ids grouped by device model id.
    pub device_ids_by_model: BTreeMap<String, Vec<DeviceId>>,
    /// Node currently holding the lease, if any.
    #[serde(default)]
    pub lease_owner: Option<NodeId>,
    /// Unix timestamp (seconds) when the lease expires.
    #[serde(default)]
    pub lease_expires_at: u64,
}

impl DevicesPartition {
    /// Build the partition id for the `index`-th partition of a simulation.
    pub fn make_id(simulation_id: &str, index: usize) -> PartitionId {
        format!("{simulation_id}:{index}")
    }

    /// Key prefix shared by all partitions of a simulation.
    pub fn simulation_prefix(simulation_id: &str) -> String {
        format!("{simulation_id}:")
    }

    /// Number of devices in the partition.
    pub fn device_count(&self) -> usize {
        self.device_ids_by_model.values().map(Vec::len).sum()
    }

    /// Iterate `(model_id, device_id)` pairs.
    pub fn devices(&self) -> impl Iterator<Item = (&str, &str)> {
        self.device_ids_by_model.iter().flat_map(|(model, ids)| {
            ids.iter().map(move |id| (model.as_str(), id.as_str()))
        })
    }

    /// Whether some node holds a lease that has not expired at `now`.
    pub fn is_leased(&self, now: u64) -> bool {
        self.lease_owner.is_some() && self.lease_expires_at > now
    }

    /// Whether `node_id` is the recorded lease owner (expired or not).
    pub fn is_owned_by(&self, node_id: &str) -> bool {
        self.lease_owner.as_deref() == Some(node_id)
    }
}

// ── Nodes ────────────────────────────────────────────────────────

/// Heartbeat record proving a node is alive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    /// Unix timestamp when the node first registered.
    pub started_at: u64,
    /// Unix timestamp of last heartbeat.
    pub last_heartbeat: u64,
}

impl NodeRecord {
    /// Whether the last heartbeat is within `max_age_secs` of `now`.
    pub fn is_alive(&self, now: u64, max_age_secs: u64) -> bool {
        now.saturating_sub(self.last_heartbeat) <= max_age_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulation() -> Simulation {
        Simulation {
            id: "sim-1".to_string(),
            name: "fleet".to_string(),
            enabled: true,
            device_models: vec![
                DeviceModelRef {
                    id: "chiller".to_string(),
                    count: 2,
                    model_override: None,
                },
                DeviceModelRef {
                    id: "elevator".to_string(),
                    count: 0,
                    model_override: None,
                },
                DeviceModelRef {
                    id: "truck".to_string(),
                    count: 1,
                    model_override: None,
                },
            ],
            partitioning_complete: false,
            iot_hub_connection_strings: vec![],
            statistics: SimulationStatistics::default(),
            created_at: 1000,
            modified_at: 1000,
        }
    }

    #[test]
    fn device_ids_follow_model_order_and_skip_empty_models() {
        let ids: Vec<String> = simulation().device_ids().into_iter().map(|(_, id)| id).collect();
        assert_eq!(
            ids,
            vec!["sim-1.chiller.0", "sim-1.chiller.1", "sim-1.truck.0"]
        );
    }

    #[test]
    fn separators_are_rejected_in_ids() {
        let mut sim = simulation();
        assert!(sim.validate_ids().is_ok());

        sim.id = "a:b".to_string();
        assert!(matches!(sim.validate_ids(), Err(StateError::InvalidId(_))));

        // `a` + `b.c` would produce the same device ids as `a.b` + `c`.
        sim.id = "a".to_string();
        sim.device_models[0].id = "b.c".to_string();
        assert!(matches!(sim.validate_ids(), Err(StateError::InvalidId(_))));
    }

    #[test]
    fn duplicate_models_are_rejected() {
        let mut sim = simulation();
        sim.device_models[1].id = "chiller".to_string();
        assert!(sim.validate_ids().is_err());
    }

    #[test]
    fn empty_id_is_rejected() {
        assert!(check_id("simulation", "").is_err());
        assert!(check_id("simulation", "sim-1").is_ok());
    }

    #[test]
    fn device_count_sums_models() {
        assert_eq!(simulation().device_count(), 3);
    }

    #[test]
    fn simulation_json_accepts_override_key() {
        let json = r#"{
            "id": "s",
            "enabled": true,
            "device_models": [
                {"id": "m", "count": 3, "override": {"telemetry_interval_secs": 5}}
            ]
        }"#;
        let sim: Simulation = serde_json::from_str(json).unwrap();
        let model = sim.model_ref("m").unwrap();
        assert_eq!(
            model.model_override.as_ref().unwrap().telemetry_interval_secs,
            Some(5)
        );
        assert!(!sim.partitioning_complete);
    }

    #[test]
    fn lease_state() {
        let mut partition = DevicesPartition {
            id: DevicesPartition::make_id("sim-1", 0),
            simulation_id: "sim-1".to_string(),
            device_ids_by_model: BTreeMap::new(),
            lease_owner: None,
            lease_expires_at: 0,
        };
        assert_eq!(partition.id, "sim-1:0");
        assert!(!partition.is_leased(100));

        partition.lease_owner = Some("node-a".to_string());
        partition.lease_expires_at = 150;
        assert!(partition.is_leased(100));
        assert!(!partition.is_leased(150));
        assert!(partition.is_owned_by("node-a"));
        assert!(!partition.is_owned_by("node-b"));
    }

    #[test]
    fn node_liveness_window() {
        let node = NodeRecord {
            id: "node-a".to_string(),
            started_at: 1000,
            last_heartbeat: 1000,
        };
        assert!(node.is_alive(1030, 30));
        assert!(!node.is_alive(1031, 30));
    }
}
