//! devsim-state — embedded state store for devsim.
//!
//! Backed by [redb](https://docs.rs/redb), holds the records shared by every
//! node of a simulation cluster: simulation definitions, device partitions
//! (with their leases) and cluster node heartbeats.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Partition keys follow `{simulation_id}:{index}` so a prefix scan returns
//! every partition of one simulation.
//!
//! Lease operations (`claim_partition`, `renew_partition`,
//! `release_partition`) each run inside a single write transaction. redb
//! admits one writer at a time, so the read-check-write inside the
//! transaction behaves as a compare-and-swap.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks and simulated nodes.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
