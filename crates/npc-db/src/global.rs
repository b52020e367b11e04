//! Global store handle.
//!
//! [`GlobalStore`] dispatches every global-store operation to either a
//! `PostgreSQL` pool or the in-memory backend, so callers never depend on
//! the concrete store.

use chrono::{DateTime, Utc};
use npc_types::{
    AccountId, PlayerId, ProvisioningId, ProvisioningRecord, ProvisioningStatus, SpawnBatchId,
    WorldDescriptor, WorldId,
};

use crate::batch_store::{BatchStore, SpawnBatchRecord};
use crate::error::DbError;
use crate::ledger_store::LedgerStore;
use crate::memory::MemoryGlobalStore;
use crate::player_store::{NewPlayer, PlayerRecord, PlayerRemoval, PlayerStore};
use crate::postgres::PostgresPool;
use crate::registry_store::RegistryStore;

/// The global store: players, AI configuration, the world registry, the
/// provisioning ledger, and spawn batches.
#[derive(Debug, Clone)]
pub enum GlobalStore {
    /// A `PostgreSQL` database.
    Postgres(PostgresPool),
    /// The in-memory backend.
    Memory(MemoryGlobalStore),
}

impl GlobalStore {
    /// Apply the global schema migrations. A no-op for the in-memory store.
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

    // ---------------------------------------------------------------------
    // Ledger
    // ---------------------------------------------------------------------

    /// Create a provisioning record.
    pub async fn insert_record(&self, record: &ProvisioningRecord) -> Result<(), DbError> {
        match self {
            Self::Postgres(pg) => LedgerStore::new(pg.pool()).insert(record).await,
            Self::Memory(mem) => mem.insert_record(record).await,
        }
    }

    /// Overwrite a record if its stored status is still `expected`.
    ///
    /// Returns [`DbError::StaleRecord`] if another writer moved it first.
    pub async fn save_record(
        &self,
        record: &ProvisioningRecord,
        expected: ProvisioningStatus,
    ) -> Result<(), DbError> {
        match self {
            Self::Postgres(pg) => LedgerStore::new(pg.pool()).save(record, expected).await,
            Self::Memory(mem) => mem.save_record(record, expected).await,
        }
    }

    /// Fetch one record.
    pub async fn get_record(
        &self,
        id: ProvisioningId,
    ) -> Result<Option<ProvisioningRecord>, DbError> {
        match self {
            Self::Postgres(pg) => LedgerStore::new(pg.pool()).get(id).await,
            Self::Memory(mem) => Ok(mem.get_record(id).await),
        }
    }

    /// Non-terminal records last updated before `updated_before`, oldest
    /// first.
    pub async fn list_in_flight(
        &self,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ProvisioningRecord>, DbError> {
        match self {
            Self::Postgres(pg) => {
                LedgerStore::new(pg.pool())
                    .list_in_flight(updated_before, limit)
                    .await
            }
            Self::Memory(mem) => Ok(mem.list_in_flight(updated_before, limit).await),
        }
    }

    /// Most recent records, optionally filtered by status.
    pub async fn list_records(
        &self,
        status: Option<ProvisioningStatus>,
        limit: u32,
    ) -> Result<Vec<ProvisioningRecord>, DbError> {
        match self {
            Self::Postgres(pg) => LedgerStore::new(pg.pool()).list(status, limit).await,
            Self::Memory(mem) => Ok(mem.list_records(status, limit).await),
        }
    }

    // ---------------------------------------------------------------------
    // Players
    // ---------------------------------------------------------------------

    /// Insert a player and its AI configuration in one transaction.
    pub async fn insert_player(&self, player: &NewPlayer) -> Result<(), DbError> {
        match self {
            Self::Postgres(pg) => PlayerStore::new(pg.pool()).insert_with_ai(player).await,
            Self::Memory(mem) => mem.insert_player(player).await,
        }
    }

    /// Fetch a player by id.
    pub async fn get_player(&self, id: PlayerId) -> Result<Option<PlayerRecord>, DbError> {
        match self {
            Self::Postgres(pg) => PlayerStore::new(pg.pool()).get(id).await,
            Self::Memory(mem) => mem.get_player(id).await,
        }
    }

    /// Find the player created by a provisioning attempt.
    pub async fn find_player_by_provisioning(
        &self,
        provisioning_id: ProvisioningId,
    ) -> Result<Option<PlayerRecord>, DbError> {
        match self {
            Self::Postgres(pg) => {
                PlayerStore::new(pg.pool())
                    .find_by_provisioning(provisioning_id)
                    .await
            }
            Self::Memory(mem) => mem.find_player_by_provisioning(provisioning_id).await,
        }
    }

    /// Find the player linked to a per-world account.
    pub async fn find_player_by_account(
        &self,
        world_id: WorldId,
        account_id: AccountId,
    ) -> Result<Option<PlayerRecord>, DbError> {
        match self {
            Self::Postgres(pg) => {
                PlayerStore::new(pg.pool())
                    .find_by_account(world_id, account_id)
                    .await
            }
            Self::Memory(mem) => mem.find_player_by_account(world_id, account_id).await,
        }
    }

    /// Delete a player and its AI configuration in one transaction.
    pub async fn delete_player(&self, id: PlayerId) -> Result<PlayerRemoval, DbError> {
        match self {
            Self::Postgres(pg) => PlayerStore::new(pg.pool()).delete_with_ai(id).await,
            Self::Memory(mem) => mem.delete_player(id).await,
        }
    }

    // ---------------------------------------------------------------------
    // World registry
    // ---------------------------------------------------------------------

    /// Register a world or update its descriptor.
    pub async fn upsert_world(&self, world: &WorldDescriptor) -> Result<(), DbError> {
        match self {
            Self::Postgres(pg) => RegistryStore::new(pg.pool()).upsert(world).await,
            Self::Memory(mem) => {
                mem.upsert_world(world).await;
                Ok(())
            }
        }
    }

    /// Fetch a world descriptor.
    pub async fn get_world(&self, id: WorldId) -> Result<Option<WorldDescriptor>, DbError> {
        match self {
            Self::Postgres(pg) => RegistryStore::new(pg.pool()).get(id).await,
            Self::Memory(mem) => Ok(mem.get_world(id).await),
        }
    }

    /// Every registered world.
    pub async fn list_worlds(&self) -> Result<Vec<WorldDescriptor>, DbError> {
        match self {
            Self::Postgres(pg) => RegistryStore::new(pg.pool()).list().await,
            Self::Memory(mem) => Ok(mem.list_worlds().await),
        }
    }

    // ---------------------------------------------------------------------
    // Spawn batches
    // ---------------------------------------------------------------------

    /// Persist deferred batches in one transaction.
    pub async fn insert_batches(&self, batches: &[SpawnBatchRecord]) -> Result<(), DbError> {
        match self {
            Self::Postgres(pg) => BatchStore::new(pg.pool()).insert_all(batches).await,
            Self::Memory(mem) => {
                mem.insert_batches(batches).await;
                Ok(())
            }
        }
    }

    /// Claimable batches, earliest due first: pending ones due by `now` and
    /// running ones whose claim is no later than `stale_before`.
    pub async fn due_batches(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<SpawnBatchRecord>, DbError> {
        match self {
            Self::Postgres(pg) => {
                BatchStore::new(pg.pool())
                    .list_due(now, stale_before, limit)
                    .await
            }
            Self::Memory(mem) => Ok(mem.due_batches(now, stale_before, limit).await),
        }
    }

    /// Claim a pending or stale running batch. `false` if someone else
    /// holds it.
    pub async fn claim_batch(
        &self,
        id: SpawnBatchId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        match self {
            Self::Postgres(pg) => BatchStore::new(pg.pool()).claim(id, now, stale_before).await,
            Self::Memory(mem) => Ok(mem.claim_batch(id, now, stale_before).await),
        }
    }

    /// Mark a batch done with its outcome counts.
    pub async fn finish_batch(
        &self,
        id: SpawnBatchId,
        provisioned: u32,
        failed: u32,
    ) -> Result<(), DbError> {
        match self {
            Self::Postgres(pg) => {
                BatchStore::new(pg.pool())
                    .finish(id, provisioned, failed)
                    .await
            }
            Self::Memory(mem) => mem.finish_batch(id, provisioned, failed).await,
        }
    }

    /// Every batch of a world, in due order.
    pub async fn batches_for_world(
        &self,
        world_id: WorldId,
    ) -> Result<Vec<SpawnBatchRecord>, DbError> {
        match self {
            Self::Postgres(pg) => BatchStore::new(pg.pool()).list_for_world(world_id).await,
            Self::Memory(mem) => Ok(mem.batches_for_world(world_id).await),
        }
    }
}
