//! Device actors and the node-wide maps that hold them.
//!
//! Every simulated device is backed by four actors: one keeps its state,
//! one its hub connection, one its reported properties and one sends its
//! telemetry. The actor logic itself is pluggable through `ActorFactory`;
//! this module only tracks which actors exist on the node. Actors draw
//! their hub calls from the simulation's `RateLimiting`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tracing::{debug, trace};

use devsim_state::DeviceId;
use devsim_throttle::{RateLimiting, Resource};

use crate::models::DeviceModel;

/// The four actors backing one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorKind {
    State,
    Connection,
    Properties,
    Telemetry,
}

impl ActorKind {
    pub const ALL: [ActorKind; 4] = [
        ActorKind::State,
        ActorKind::Connection,
        ActorKind::Properties,
        ActorKind::Telemetry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::State => "state",
            ActorKind::Connection => "connection",
            ActorKind::Properties => "properties",
            ActorKind::Telemetry => "telemetry",
        }
    }

    /// The rate-limited call an actor of this kind makes when it starts.
    pub fn resource(&self) -> Option<Resource> {
        match self {
            ActorKind::State => None,
            ActorKind::Connection => Some(Resource::Connection),
            ActorKind::Properties => Some(Resource::TwinWrite),
            ActorKind::Telemetry => Some(Resource::DeviceMessage),
        }
    }
}

impl std::fmt::Display for ActorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running piece of device behavior.
pub trait DeviceActor: Send + Sync {
    fn start(&self, device_id: &str, model: &DeviceModel);
    fn stop(&self);
}

/// Builds actors for newly assigned devices.
pub trait ActorFactory: Send + Sync {
    fn create(&self, kind: ActorKind, rate_limiting: &Arc<RateLimiting>) -> Arc<dyn DeviceActor>;
}

type ActorMap = DashMap<DeviceId, Arc<dyn DeviceActor>>;

/// Actors running on this node, one map per kind, keyed by device id.
///
/// Clones share the same maps. Device ids embed the simulation id, so all
/// simulations on a node can share one set of maps.
#[derive(Clone, Default)]
pub struct ActorMaps {
    state: Arc<ActorMap>,
    connection: Arc<ActorMap>,
    properties: Arc<ActorMap>,
    telemetry: Arc<ActorMap>,
}

impl ActorMaps {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: ActorKind) -> &ActorMap {
        match kind {
            ActorKind::State => &self.state,
            ActorKind::Connection => &self.connection,
            ActorKind::Properties => &self.properties,
            ActorKind::Telemetry => &self.telemetry,
        }
    }

    /// Number of actors of one kind.
    pub fn len(&self, kind: ActorKind) -> usize {
        self.map(kind).len()
    }

    /// Number of devices simulated on this node.
    pub fn device_count(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        ActorKind::ALL.iter().all(|kind| self.map(*kind).is_empty())
    }

    pub fn contains(&self, kind: ActorKind, device_id: &str) -> bool {
        self.map(kind).contains_key(device_id)
    }

    /// Insert an actor, returning the one it replaced.
    pub fn insert(
        &self,
        kind: ActorKind,
        device_id: impl Into<DeviceId>,
        actor: Arc<dyn DeviceActor>,
    ) -> Option<Arc<dyn DeviceActor>> {
        self.map(kind).insert(device_id.into(), actor)
    }

    /// Stop and remove every actor of a device. Returns how many were removed.
    pub fn remove_device(&self, device_id: &str) -> usize {
        let mut removed = 0;
        for kind in ActorKind::ALL {
            if let Some((_, actor)) = self.map(kind).remove(device_id) {
                actor.stop();
                removed += 1;
            }
        }
        removed
    }
}

/// Actor that only records its lifecycle in the log.
///
/// Starting counts the kind's hub call against the rate limits, so node
/// admission behaves as it would with a hub-connected implementation.
pub struct SimulatedActor {
    kind: ActorKind,
    rate_limiting: Arc<RateLimiting>,
    running: AtomicBool,
}

impl SimulatedActor {
    pub fn new(kind: ActorKind, rate_limiting: Arc<RateLimiting>) -> Self {
        Self {
            kind,
            rate_limiting,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl DeviceActor for SimulatedActor {
    fn start(&self, device_id: &str, model: &DeviceModel) {
        self.running.store(true, Ordering::Release);
        let admitted = self
            .kind
            .resource()
            .is_none_or(|resource| self.rate_limiting.try_acquire(resource));
        if !admitted {
            debug!(kind = %self.kind, %device_id, "rate limit reached, first call deferred");
        }
        trace!(
            kind = %self.kind,
            %device_id,
            model_id = %model.id,
            telemetry_messages = model.telemetry.len(),
            admitted,
            "actor started"
        );
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            trace!(kind = %self.kind, "actor stopped");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedActorFactory;

impl ActorFactory for SimulatedActorFactory {
    fn create(&self, kind: ActorKind, rate_limiting: &Arc<RateLimiting>) -> Arc<dyn DeviceActor> {
        trace!(%kind, "creating simulated actor");
        Arc::new(SimulatedActor::new(kind, rate_limiting.clone()))
    }
}
