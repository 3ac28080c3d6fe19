//! `devsimd.toml` — daemon configuration.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working single-node setup.
//!
//! ```toml
//! [node]
//! id = "node-1"
//! data_dir = "/var/lib/devsim"
//!
//! [clustering]
//! partition_lease_secs = 60
//! max_devices_per_node = 20000
//!
//! [rate_limits]
//! device_messages_per_second = 120
//!
//! [intervals]
//! hold_secs = 15
//!
//! [[device_models]]
//! id = "chiller"
//! name = "Chiller"
//! telemetry = [{ interval_secs = 10, template = "{\"temperature\":${temperature}}" }]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use devsim_agent::{AgentIntervals, DeviceModel};
use devsim_cluster::{ClusteringConfig, generate_node_id};
use devsim_throttle::RateLimitingConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub node: NodeConfig,
    pub clustering: ClusteringConfig,
    pub rate_limits: RateLimitingConfig,
    pub intervals: AgentIntervals,
    pub device_models: Vec<DeviceModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Fixed node id. Generated per process when absent.
    pub id: Option<String>,
    /// Directory holding the state database.
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            data_dir: PathBuf::from("/var/lib/devsim"),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.clustering.validate()?;
        self.intervals.validate(&self.clustering)?;
        Ok(())
    }

    pub fn node_id(&self) -> String {
        self.node.id.clone().unwrap_or_else(generate_node_id)
    }

    pub fn db_path(&self) -> PathBuf {
        self.node.data_dir.join("devsim.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.clustering.partition_lease_secs, 60);
        assert!(config.device_models.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[node]
id = "node-1"
data_dir = "/tmp/devsim"

[clustering]
max_partition_size = 50
max_devices_per_node = 500

[rate_limits]
device_messages_per_second = 100

[intervals]
hold_secs = 5

[[device_models]]
id = "chiller"
name = "Chiller"
telemetry = [{ interval_secs = 10 }]

[[device_models]]
id = "truck"
"#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node_id(), "node-1");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/devsim/devsim.redb"));
        assert_eq!(config.clustering.max_partition_size, 50);
        // Unset fields keep their defaults.
        assert_eq!(config.clustering.partition_lease_secs, 60);
        assert_eq!(config.rate_limits.device_messages_per_second, 100);
        assert_eq!(config.intervals.hold_secs, 5);
        assert_eq!(config.intervals.sync_secs, 10);
        assert_eq!(config.device_models.len(), 2);
        assert_eq!(config.device_models[0].telemetry[0].interval_secs, 10);
        assert!(config.device_models[1].telemetry.is_empty());
    }

    #[test]
    fn generated_node_id_when_unset() {
        let config = DaemonConfig::default();
        assert!(config.node_id().starts_with("node-"));
    }

    #[test]
    fn from_file_rejects_invalid_clustering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devsimd.toml");
        std::fs::write(&path, "[clustering]\nmax_partition_size = 0\n").unwrap();

        assert!(DaemonConfig::from_file(&path).is_err());
    }

    #[test]
    fn from_file_rejects_intervals_longer_than_lease() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devsimd.toml");
        let toml_str = r#"
[clustering]
partition_lease_secs = 10
node_record_max_age_secs = 5

[intervals]
hold_secs = 60
sync_secs = 30
throttle_secs = 30
"#;
        std::fs::write(&path, toml_str).unwrap();

        let err = DaemonConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("hold_secs"), "{err}");
    }

    #[test]
    fn default_config_is_valid() {
        DaemonConfig::default().validate().unwrap();
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devsimd.toml");
        std::fs::write(&path, "[node]\nid = \"node-7\"\n").unwrap();

        let config = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(config.node.id.as_deref(), Some("node-7"));
    }
}
