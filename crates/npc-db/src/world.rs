//! Per-world store handle.

use std::collections::BTreeSet;

use npc_types::{AccountId, Coordinates, ProvisioningId, SettlementId};

use crate::error::DbError;
use crate::memory::MemoryWorldStore;
use crate::postgres::PostgresPool;
use crate::settlement_store::{FootprintRemoval, SettlementSeed, SettlementStore, WorldFootprint};

/// One world's game database: accounts, settlements, resource fields, and
/// map tiles.
#[derive(Debug, Clone)]
pub enum WorldStore {
    /// A `PostgreSQL` database.
    Postgres(PostgresPool),
    /// The in-memory backend.
    Memory(MemoryWorldStore),
}

impl WorldStore {
    /// Apply the per-world schema migrations. A no-op for the in-memory store.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        match self {
            Self::Postgres(pg) => pg.migrate().await,
            Self::Memory(_) => Ok(()),
        }
    }

    /// Close the underlying connections.
    pub async fn close(&self) {
        if let Self::Postgres(pg) = self {
            pg.close().await;
        }
    }

    /// Write an NPC's account, capital, fields, and tile claim atomically.
    ///
    /// Returns [`DbError::TileOccupied`] if the tile was taken.
    pub async fn commit_footprint(&self, seed: &SettlementSeed) -> Result<(), DbError> {
        match self {
            Self::Postgres(pg) => SettlementStore::new(pg.pool()).commit_footprint(seed).await,
            Self::Memory(mem) => mem.commit_footprint(seed).await,
        }
    }

    /// Look up what exists of one provisioning attempt.
    pub async fn probe_footprint(
        &self,
        provisioning_id: ProvisioningId,
        account_id: Option<AccountId>,
        settlement_id: Option<SettlementId>,
    ) -> Result<WorldFootprint, DbError> {
        match self {
            Self::Postgres(pg) => {
                SettlementStore::new(pg.pool())
                    .probe_footprint(provisioning_id, account_id, settlement_id)
                    .await
            }
            Self::Memory(mem) => {
                mem.probe_footprint(provisioning_id, account_id, settlement_id)
                    .await
            }
        }
    }

    /// Delete an attempt's rows atomically, freeing its tiles.
    pub async fn remove_footprint(
        &self,
        account_id: Option<AccountId>,
        settlement_id: Option<SettlementId>,
    ) -> Result<FootprintRemoval, DbError> {
        match self {
            Self::Postgres(pg) => {
                SettlementStore::new(pg.pool())
                    .remove_footprint(account_id, settlement_id)
                    .await
            }
            Self::Memory(mem) => mem.remove_footprint(account_id, settlement_id).await,
        }
    }

    /// Occupied tiles within a square of half-width `radius` around `center`.
    pub async fn occupied_tiles(
        &self,
        center: Coordinates,
        radius: u32,
    ) -> Result<BTreeSet<Coordinates>, DbError> {
        match self {
            Self::Postgres(pg) => {
                SettlementStore::new(pg.pool())
                    .occupied_tiles(center, radius)
                    .await
            }
            Self::Memory(mem) => mem.occupied_tiles(center, radius).await,
        }
    }
}
