//! Provisioning core for NPC players spread across a global store and
//! per-world stores.
//!
//! Creating an NPC writes to two independent databases with no shared
//! transaction. The core runs that write as a saga: every step is
//! checkpointed in a durable ledger record, and a reconciler later resolves
//! records a crash or failure left in flight by probing both stores.
//!
//! # Flow
//!
//! ```text
//! Provisioner
//!     |-- PlacementAllocator  -> occupied-tile snapshot -> coordinates
//!     |-- Orchestrator        -> ledger: pending .. completed
//!     |       |-- WorldStore:  account + settlement + fields + tile (1 txn)
//!     |       +-- GlobalStore: player + ai_config (1 txn)
//!     |-- BatchScheduler      -> instant part now, deferred spawn_batches
//!     +-- Reconciler          -> stuck records -> completed | failed | blocked
//! ```
//!
//! # Modules
//!
//! - [`config`] -- YAML configuration with environment overrides
//! - [`error`] -- Error types per component
//! - [`registry`] -- World registry and per-world connection cache
//! - [`placement`] -- Spawn location sampling
//! - [`orchestrator`] -- The provisioning saga for one NPC
//! - [`reconciler`] -- Recovery of stuck ledger records
//! - [`scheduler`] -- Bulk spawn plans and deferred batches
//! - [`provisioner`] -- Service facade over all of the above

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod placement;
pub mod provisioner;
pub mod reconciler;
pub mod registry;
pub mod scheduler;

#[cfg(test)]
mod test_support;

pub use config::{ConfigError, LogFormat, ProvisionerConfig};
pub use error::{
    MigrateError, PlacementError, ProvisionError, ReconcileError, RegistryError, ScheduleError,
    StoreCallError,
};
pub use orchestrator::Orchestrator;
pub use placement::{PlacementAllocator, PlacementParams};
pub use provisioner::{MigrationReport, Provisioner};
pub use reconciler::{ReconcileReport, Reconciler};
pub use registry::{WorldConnector, WorldRegistry};
pub use scheduler::{BatchScheduler, BulkOutcome, DueBatchReport, SpawnFailure, SpawnOutcome};
