//! devsim-throttle — per-node share of the account-wide call quotas.
//!
//! The device-management endpoint enforces quotas per account (hub tier),
//! not per caller. Every node of the cluster therefore limits itself to
//! `ceiling / cluster_size` of each quota, and recomputes that share when
//! the cluster grows or shrinks.
//!
//! # Tracked resources
//!
//! ```text
//! registry operations   per minute
//! twin reads            per second
//! twin writes           per second
//! connections           per second
//! device messages       per second and per day
//! ```
//!
//! `RateLimiting::change_cluster_size` swaps the whole settings object at
//! once (`arc-swap`), so callers in the middle of a rate-limited call see
//! either the old or the new limits, never a mix.

pub mod config;
pub mod error;
pub mod limits;
pub mod rate_limiting;

pub use config::RateLimitingConfig;
pub use error::{ThrottleError, ThrottleResult};
pub use limits::RateLimitSettings;
pub use rate_limiting::{RateLimiting, Resource};
