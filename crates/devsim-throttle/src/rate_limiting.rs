//! RateLimiting — holds this node's current limits and admits calls
//! against them.
//!
//! Admission uses fixed windows: each resource counts calls since its
//! window opened and refuses once the count reaches the limit. The limit
//! is read from the current settings on every call, so a cluster size
//! change applies to the very next call.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RateLimitingConfig;
use crate::error::ThrottleResult;
use crate::limits::RateLimitSettings;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// A rate-limited kind of call to the device-management endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    RegistryOperation,
    TwinRead,
    TwinWrite,
    Connection,
    DeviceMessage,
}

/// Call counter for one window.
#[derive(Debug)]
struct Window {
    period: Duration,
    opened: Instant,
    used: u64,
}

impl Window {
    fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            opened: now,
            used: 0,
        }
    }

    fn closes_at(&self) -> Instant {
        self.opened + self.period
    }

    fn roll(&mut self, now: Instant) {
        if now >= self.closes_at() {
            self.opened = now;
            self.used = 0;
        }
    }
}

#[derive(Debug)]
struct Windows {
    registry_operations: Window,
    twin_reads: Window,
    twin_writes: Window,
    connections: Window,
    messages_per_second: Window,
    messages_per_day: Window,
}

impl Windows {
    fn new(now: Instant) -> Self {
        Self {
            registry_operations: Window::new(MINUTE, now),
            twin_reads: Window::new(SECOND, now),
            twin_writes: Window::new(SECOND, now),
            connections: Window::new(SECOND, now),
            messages_per_second: Window::new(SECOND, now),
            messages_per_day: Window::new(DAY, now),
        }
    }
}

/// This node's share of the account quotas.
pub struct RateLimiting {
    ceilings: RateLimitingConfig,
    settings: ArcSwap<RateLimitSettings>,
    windows: Mutex<Windows>,
}

impl RateLimiting {
    /// Start with the whole ceiling, as if this node were alone.
    pub fn new(ceilings: RateLimitingConfig) -> Self {
        let settings = RateLimitSettings::single_node(&ceilings);
        Self {
            ceilings,
            settings: ArcSwap::from_pointee(settings),
            windows: Mutex::new(Windows::new(Instant::now())),
        }
    }

    /// The account-wide ceilings this node shares.
    pub fn ceilings(&self) -> &RateLimitingConfig {
        &self.ceilings
    }

    /// Snapshot of the limits currently applied.
    pub fn settings(&self) -> Arc<RateLimitSettings> {
        self.settings.load_full()
    }

    /// The cluster size the current limits were computed for.
    pub fn cluster_size(&self) -> usize {
        self.settings.load().cluster_size
    }

    /// Recompute the local limits for a cluster of `cluster_size` nodes.
    pub fn change_cluster_size(&self, cluster_size: usize) -> ThrottleResult<()> {
        let settings = RateLimitSettings::for_cluster(&self.ceilings, cluster_size)?;
        let messages_per_second = settings.device_messages_per_second;
        let previous = self.settings.swap(Arc::new(settings));

        if previous.cluster_size != cluster_size {
            info!(
                from = previous.cluster_size,
                to = cluster_size,
                messages_per_second,
                "cluster size changed, rate limits updated"
            );
        } else {
            debug!(cluster_size, "rate limits unchanged");
        }
        Ok(())
    }

    /// Count one call against `resource` if the current windows allow it.
    pub fn try_acquire(&self, resource: Resource) -> bool {
        self.reserve(resource, Instant::now()).is_ok()
    }

    /// Wait until a call against `resource` is allowed, then count it.
    pub async fn acquire(&self, resource: Resource) {
        loop {
            match self.reserve(resource, Instant::now()) {
                Ok(()) => return,
                Err(retry_at) => {
                    debug!(?resource, "rate limit reached, waiting");
                    tokio::time::sleep_until(retry_at).await;
                }
            }
        }
    }

    /// Count a call, or return when the blocking window closes.
    fn reserve(&self, resource: Resource, now: Instant) -> Result<(), Instant> {
        let settings = self.settings.load();
        let mut windows = self.windows.lock();
        let w = &mut *windows;

        let mut checks: Vec<(&mut Window, u64)> = match resource {
            Resource::RegistryOperation => vec![(
                &mut w.registry_operations,
                u64::from(settings.registry_operations_per_minute),
            )],
            Resource::TwinRead => {
                vec![(&mut w.twin_reads, u64::from(settings.twin_reads_per_second))]
            }
            Resource::TwinWrite => {
                vec![(&mut w.twin_writes, u64::from(settings.twin_writes_per_second))]
            }
            Resource::Connection => {
                vec![(&mut w.connections, u64::from(settings.connections_per_second))]
            }
            Resource::DeviceMessage => vec![
                (
                    &mut w.messages_per_second,
                    u64::from(settings.device_messages_per_second),
                ),
                (&mut w.messages_per_day, settings.device_messages_per_day),
            ],
        };

        // Zero means not throttled.
        checks.retain(|(_, limit)| *limit > 0);

        let mut blocked_until: Option<Instant> = None;
        for (window, limit) in checks.iter_mut() {
            window.roll(now);
            if window.used >= *limit {
                let closes = window.closes_at();
                blocked_until = Some(blocked_until.map_or(closes, |b| b.max(closes)));
            }
        }
        if let Some(retry_at) = blocked_until {
            return Err(retry_at);
        }

        for (window, _) in checks.iter_mut() {
            window.used += 1;
        }
        Ok(())
    }
}
