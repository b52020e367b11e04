//! Error types for the provisioning core.
//!
//! Every store call made by the core runs under a timeout (see [`bounded`]);
//! its failure is a [`StoreCallError`]. The per-component enums classify
//! where in the saga the failure happened, because that decides whether
//! anything was left behind for the reconciler.

use std::future::Future;
use std::time::Duration;

use npc_db::DbError;
use npc_types::{Coordinates, ProvisioningId, ProvisioningStatus, TransitionError, WorldId};

/// A single store call failed or ran out of time.
#[derive(Debug, thiserror::Error)]
pub enum StoreCallError {
    /// The store reported an error. The call's transaction rolled back
    /// unless [`DbError::is_outcome_unknown`] says otherwise.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The call did not finish within the configured bound. Whether it
    /// committed is unknown.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Which call timed out.
        operation: &'static str,
        /// The bound that elapsed.
        after: Duration,
    },
}

impl StoreCallError {
    /// Whether the call may have committed despite failing: it timed out,
    /// or the connection broke during `COMMIT`.
    pub const fn is_outcome_unknown(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Db(err) => err.is_outcome_unknown(),
        }
    }

    /// Whether the call lost a race for a map tile.
    pub const fn is_tile_conflict(&self) -> bool {
        matches!(self, Self::Db(err) if err.is_tile_conflict())
    }
}

/// Run a store call under a timeout.
pub(crate) async fn bounded<T, F>(
    limit: Duration,
    operation: &'static str,
    call: F,
) -> Result<T, StoreCallError>
where
    F: Future<Output = Result<T, DbError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(StoreCallError::Db),
        Err(_elapsed) => Err(StoreCallError::Timeout {
            operation,
            after: limit,
        }),
    }
}

/// Errors from the world registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The world is not registered, or is registered but inactive.
    #[error("world {0} not found or inactive")]
    WorldNotFound(WorldId),

    /// The registry lookup or the per-world connection failed.
    #[error("world {world_id}: {source}")]
    Store {
        /// World being resolved.
        world_id: WorldId,
        /// Underlying failure.
        source: StoreCallError,
    },
}

/// Errors from the placement allocator.
#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    /// The target world could not be resolved.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The occupied-tile snapshot could not be read.
    #[error("failed to read occupied tiles: {0}")]
    Store(#[from] StoreCallError),

    /// Too many samples collided for one point.
    #[error(
        "placement exhausted after {attempts} attempts for one point ({placed} of {requested} placed)"
    )]
    Exhausted {
        /// Points placed before giving up.
        placed: u32,
        /// Points requested.
        requested: u32,
        /// Attempts made for the failing point.
        attempts: u32,
    },

    /// The parameters describe an empty or malformed sampling area.
    #[error("invalid placement parameters: {0}")]
    InvalidParams(String),
}

/// Errors from provisioning one NPC.
///
/// Variants carrying a `record_id` refer to a ledger record that exists.
/// Whether it is terminal depends on the variant; see each.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The world could not be resolved. Nothing was written.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// No location was given and none could be allocated. Nothing was
    /// written.
    #[error(transparent)]
    Placement(#[from] PlacementError),

    /// The request attributes are unusable. Nothing was written.
    #[error("invalid NPC attributes: {0}")]
    InvalidAttributes(String),

    /// The tile was claimed by someone else first. The record is `failed`
    /// and nothing else was written.
    #[error("record {record_id}: tile {coordinates} already occupied")]
    TileConflict {
        /// Ledger record of the attempt.
        record_id: ProvisioningId,
        /// The contested tile.
        coordinates: Coordinates,
    },

    /// The per-world write failed. On a definite failure the record is
    /// `failed`; when the outcome is unknown (a timeout, or a connection
    /// lost during `COMMIT`) it is left for the reconciler.
    #[error("record {record_id}: per-world write failed: {source}")]
    PerWorldWriteFailed {
        /// Ledger record of the attempt.
        record_id: ProvisioningId,
        /// Underlying failure.
        source: StoreCallError,
    },

    /// The global write failed after the per-world commit. The record is
    /// left non-terminal for the reconciler.
    #[error("record {record_id}: global write failed: {source}")]
    GlobalWriteFailed {
        /// Ledger record of the attempt.
        record_id: ProvisioningId,
        /// Underlying failure.
        source: StoreCallError,
    },

    /// A ledger write failed. The record, if it was created, is left
    /// non-terminal for the reconciler.
    #[error("record {record_id}: ledger unavailable: {source}")]
    LedgerUnavailable {
        /// Ledger record of the attempt.
        record_id: ProvisioningId,
        /// Underlying failure.
        source: StoreCallError,
    },

    /// The saga tried an illegal state change.
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl ProvisionError {
    /// The ledger record this failure concerns, if one was created.
    pub const fn record_id(&self) -> Option<ProvisioningId> {
        match self {
            Self::TileConflict { record_id, .. }
            | Self::PerWorldWriteFailed { record_id, .. }
            | Self::GlobalWriteFailed { record_id, .. }
            | Self::LedgerUnavailable { record_id, .. } => Some(*record_id),
            Self::Registry(_)
            | Self::Placement(_)
            | Self::InvalidAttributes(_)
            | Self::Transition(_) => None,
        }
    }

    /// Whether retrying with a fresh location could succeed.
    pub const fn is_tile_conflict(&self) -> bool {
        matches!(self, Self::TileConflict { .. })
    }

    /// Whether the world itself is unusable, so every attempt against it
    /// will fail the same way.
    pub const fn is_world_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Registry(RegistryError::WorldNotFound(_))
                | Self::Placement(PlacementError::Registry(RegistryError::WorldNotFound(_)))
        )
    }
}

/// Errors from a reconciliation pass or an operator action on the ledger.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The ledger could not be read or written.
    #[error("ledger unavailable: {0}")]
    Ledger(#[from] StoreCallError),

    /// No record has this id.
    #[error("provisioning record {0} not found")]
    RecordNotFound(ProvisioningId),

    /// Unblock was requested for a record that is not blocked.
    #[error("record {id} is {status}, not blocked")]
    NotBlocked {
        /// Record id.
        id: ProvisioningId,
        /// Its current status.
        status: ProvisioningStatus,
    },
}

/// Errors from batch planning and execution.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// No built-in or configured preset has this name.
    #[error("unknown spawn preset {0:?}")]
    UnknownPreset(String),

    /// The preset's shares are inconsistent.
    #[error("invalid spawn preset {name:?}: {reason}")]
    InvalidPreset {
        /// Preset name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The count overflowed while splitting into batches.
    #[error("spawn count {0} too large to split")]
    CountOverflow(u32),

    /// The target world could not be resolved.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Deferred batches could not be persisted or updated.
    #[error("spawn batch store unavailable: {0}")]
    Store(#[from] StoreCallError),
}

/// Errors from applying schema migrations.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// The global schema could not be migrated.
    #[error("global store migration failed: {0}")]
    Global(#[source] DbError),

    /// The world registry could not be read.
    #[error("world listing failed: {0}")]
    Listing(#[source] StoreCallError),

    /// A registered world's store could not be opened.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A world's schema could not be migrated.
    #[error("world {world_id} migration failed: {source}")]
    World {
        /// World being migrated.
        world_id: WorldId,
        /// Underlying failure.
        source: DbError,
    },
}
