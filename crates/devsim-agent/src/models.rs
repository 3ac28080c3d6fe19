//! Device model catalog.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use devsim_state::Simulation;

use crate::error::{AgentError, AgentResult};

/// Behavior definition shared by all devices of one model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceModel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub telemetry: Vec<TelemetryMessage>,
}

/// A message a device sends on a fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryMessage {
    pub interval_secs: u64,
    #[serde(default)]
    pub template: String,
}

/// Resolves the model a device should run within a simulation.
pub trait DeviceModels: Send + Sync {
    /// The catalog model with the simulation's override applied.
    ///
    /// Fails with `ModelNotFound` when the catalog lacks the model or the
    /// simulation no longer references it.
    fn get_with_override(&self, model_id: &str, simulation: &Simulation)
    -> AgentResult<DeviceModel>;
}

/// In-memory catalog, loaded from the daemon configuration.
#[derive(Debug, Clone, Default)]
pub struct DeviceModelCatalog {
    models: HashMap<String, DeviceModel>,
}

impl DeviceModelCatalog {
    pub fn new(models: impl IntoIterator<Item = DeviceModel>) -> Self {
        Self {
            models: models.into_iter().map(|m| (m.id.clone(), m)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl DeviceModels for DeviceModelCatalog {
    fn get_with_override(
        &self,
        model_id: &str,
        simulation: &Simulation,
    ) -> AgentResult<DeviceModel> {
        let not_found = || AgentError::ModelNotFound {
            model_id: model_id.to_string(),
            simulation_id: simulation.id.clone(),
        };

        let reference = simulation.model_ref(model_id).ok_or_else(not_found)?;
        let mut model = self.models.get(model_id).cloned().ok_or_else(not_found)?;

        if let Some(model_override) = &reference.model_override
            && let Some(interval) = model_override.telemetry_interval_secs
        {
            for message in &mut model.telemetry {
                message.interval_secs = interval;
            }
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devsim_state::{DeviceModelOverride, DeviceModelRef};

    fn chiller() -> DeviceModel {
        DeviceModel {
            id: "chiller".to_string(),
            name: "Chiller".to_string(),
            telemetry: vec![TelemetryMessage {
                interval_secs: 10,
                template: "{\"temperature\":${temperature}}".to_string(),
            }],
        }
    }

    fn simulation(model_override: Option<DeviceModelOverride>) -> Simulation {
        Simulation {
            id: "sim-1".to_string(),
            name: String::new(),
            enabled: true,
            device_models: vec![DeviceModelRef {
                id: "chiller".to_string(),
                count: 1,
                model_override,
            }],
            partitioning_complete: true,
            iot_hub_connection_strings: Vec::new(),
            statistics: Default::default(),
            created_at: 0,
            modified_at: 0,
        }
    }

    #[test]
    fn returns_catalog_model_without_override() {
        let catalog = DeviceModelCatalog::new([chiller()]);
        let model = catalog.get_with_override("chiller", &simulation(None)).unwrap();
        assert_eq!(model, chiller());
    }

    #[test]
    fn override_replaces_telemetry_interval() {
        let catalog = DeviceModelCatalog::new([chiller()]);
        let sim = simulation(Some(DeviceModelOverride {
            telemetry_interval_secs: Some(2),
        }));

        let model = catalog.get_with_override("chiller", &sim).unwrap();
        assert_eq!(model.telemetry[0].interval_secs, 2);
    }

    #[test]
    fn unknown_catalog_model_is_not_found() {
        let catalog = DeviceModelCatalog::default();
        let result = catalog.get_with_override("chiller", &simulation(None));
        assert!(matches!(result, Err(AgentError::ModelNotFound { .. })));
    }

    #[test]
    fn model_not_referenced_by_simulation_is_not_found() {
        let mut truck = chiller();
        truck.id = "truck".to_string();
        let catalog = DeviceModelCatalog::new([chiller(), truck]);

        let result = catalog.get_with_override("truck", &simulation(None));
        assert!(matches!(result, Err(AgentError::ModelNotFound { .. })));
    }
}
