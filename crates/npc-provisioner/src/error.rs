//! Error type for the command-line entry point.

use npc_core::{
    ConfigError, MigrateError, PlacementError, ProvisionError, ReconcileError, RegistryError,
    ScheduleError, StoreCallError,
};
use npc_db::DbError;

/// Any failure that ends a command.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// The configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The global store could not be reached.
    #[error("failed to connect to global store: {0}")]
    Connect(#[from] DbError),

    /// Provisioning one NPC failed.
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// Placement failed.
    #[error(transparent)]
    Placement(#[from] PlacementError),

    /// Planning or executing a bulk spawn failed.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Reconciliation or an operator ledger action failed.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// The world registry could not be updated.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A ledger read failed.
    #[error(transparent)]
    Store(#[from] StoreCallError),

    /// Migrations failed.
    #[error(transparent)]
    Migrate(#[from] MigrateError),

    /// The result could not be rendered.
    #[error("failed to render output: {0}")]
    Output(#[from] serde_json::Error),
}
