//! track-core: pure fusion and storage-decision library for aircraft and
//! vessel telemetry.
//!
//! No async and no I/O: only algorithms and concurrent in-memory state. The
//! `track-server` crate wires these pieces to HTTP providers, SQLite and
//! subscriber sessions.

pub mod config;
pub mod dedup;
pub mod fusion;
pub mod gate;
pub mod geo;
pub mod providers;
pub mod subscription;
pub mod types;

// Re-export commonly used types at crate root
pub use dedup::{DedupVerdict, Deduplicator};
pub use fusion::{FusionEngine, FusionOutcome, SourcePriorityTable};
pub use gate::{GateDecision, PersistReason, StateStore, StorageGate};
pub use geo::BoundingBox;
pub use subscription::{Confirmation, SubscriptionRegistry};
pub use types::*;
