//! devsim-agent — runs a node's share of every active simulation.
//!
//! ```text
//! Agent (agent.rs)
//!   ├── sync_simulations()  → one SimulationManager per enabled simulation
//!   └── run()               → sync / assign / hold / throttle timers
//!
//! SimulationManager (manager.rs)
//!   ├── assign_new_partitions()     → claim leases, start device actors
//!   ├── hold_assigned_partitions()  → renew leases, stop actors of lost ones
//!   ├── update_throttling_limits()  → rate limits follow cluster size
//!   └── tear_down()                 → stop actors, release leases
//! ```
//!
//! Device behavior is pluggable: `ActorFactory` builds the four actors of a
//! device, `DeviceModels` resolves the model they run.

pub mod actors;
pub mod agent;
pub mod error;
pub mod manager;
pub mod models;

pub use actors::{
    ActorFactory, ActorKind, ActorMaps, DeviceActor, SimulatedActor, SimulatedActorFactory,
};
pub use agent::{Agent, AgentIntervals, StoreSimulationManager};
pub use error::{AgentError, AgentResult};
pub use manager::SimulationManager;
pub use models::{DeviceModel, DeviceModelCatalog, DeviceModels, TelemetryMessage};
