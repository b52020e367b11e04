//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`] which wraps the underlying
//! [`sqlx`] errors with additional context about which operation failed.

use npc_types::{Coordinates, ParseEnumError, ProvisioningId, ProvisioningStatus};

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The connection failed while the transaction was committing. The
    /// server may or may not have applied it.
    #[error("Commit outcome unknown: {0}")]
    CommitOutcomeUnknown(#[source] sqlx::Error),

    /// A stored enum column held an unknown value.
    #[error("Invalid column value: {0}")]
    InvalidColumn(#[from] ParseEnumError),

    /// A stored integer did not fit the domain type.
    #[error("Column {column} out of range: {value}")]
    OutOfRange {
        /// Column name.
        column: &'static str,
        /// Offending value.
        value: i64,
    },

    /// The map tile is already claimed by another settlement.
    #[error("Tile {0} is already occupied")]
    TileOccupied(Coordinates),

    /// A ledger write found the record in a different state than expected.
    #[error("Provisioning record {id} is no longer {expected}")]
    StaleRecord {
        /// The record.
        id: ProvisioningId,
        /// Status the writer expected to replace.
        expected: ProvisioningStatus,
    },

    /// A row the operation depends on does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A failure injected into an in-memory store.
    #[error("Injected failure: {0}")]
    Injected(&'static str),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DbError {
    /// Whether this error means the tile was taken by a concurrent claim.
    pub const fn is_tile_conflict(&self) -> bool {
        matches!(self, Self::TileOccupied(_))
    }

    /// Whether the write may have been applied despite the error.
    pub const fn is_outcome_unknown(&self) -> bool {
        matches!(self, Self::CommitOutcomeUnknown(_))
    }
}

/// Convert a stored `INTEGER` into a `u32`.
pub(crate) fn column_u32(column: &'static str, value: i32) -> Result<u32, DbError> {
    u32::try_from(value).ok().ok_or(DbError::OutOfRange {
        column,
        value: i64::from(value),
    })
}

/// Convert a `u32` into a storable `INTEGER`.
pub(crate) fn db_i32(column: &'static str, value: u32) -> Result<i32, DbError> {
    i32::try_from(value).ok().ok_or(DbError::OutOfRange {
        column,
        value: i64::from(value),
    })
}
