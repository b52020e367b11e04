//! Provisioning ledger persistence in the global store.
//!
//! One row per provisioning attempt. Writes after the initial insert are
//! compare-and-set on the status the writer last observed, so the
//! orchestrator and the reconciler can never silently overwrite each other.

use chrono::{DateTime, Utc};
use npc_types::{
    AccountId, Coordinates, NpcAttributes, PlayerId, ProvisioningId, ProvisioningRecord,
    ProvisioningStatus, SettlementId, WorldId,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{DbError, column_u32, db_i32};

/// Column list shared by every `SELECT` on `provisioning_records`.
const RECORD_COLUMNS: &str = "id, world_id, status, npc_name, faction, difficulty, personality, \
     per_world_account_id, per_world_settlement_id, global_player_id, coord_x, coord_y, \
     error_message, retry_count, created_at, updated_at, completed_at";

/// Operations on the `provisioning_records` table.
pub struct LedgerStore<'a> {
    pool: &'a PgPool,
}

impl<'a> LedgerStore<'a> {
    /// Create a new ledger store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Insert a freshly created record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the insert fails.
    pub async fn insert(&self, record: &ProvisioningRecord) -> Result<(), DbError> {
        let (coord_x, coord_y) = split_coordinates(record.coordinates);
        sqlx::query(
            r"INSERT INTO provisioning_records (id, world_id, status, npc_name, faction, difficulty, personality, per_world_account_id, per_world_settlement_id, global_player_id, coord_x, coord_y, error_message, retry_count, created_at, updated_at, completed_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(record.id.into_inner())
        .bind(record.world_id.into_inner())
        .bind(record.status.as_str())
        .bind(&record.attributes.name)
        .bind(record.attributes.faction.as_str())
        .bind(record.attributes.difficulty.as_str())
        .bind(record.attributes.personality.as_str())
        .bind(record.per_world_account_id.map(AccountId::into_inner))
        .bind(record.per_world_settlement_id.map(SettlementId::into_inner))
        .bind(record.global_player_id.map(PlayerId::into_inner))
        .bind(coord_x)
        .bind(coord_y)
        .bind(record.error_message.as_deref())
        .bind(db_i32("retry_count", record.retry_count)?)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.completed_at)
        .execute(self.pool)
        .await?;

        tracing::debug!(record_id = %record.id, world_id = %record.world_id, "Inserted provisioning record");
        Ok(())
    }

    /// Overwrite the mutable columns of a record, but only if its stored
    /// status is still `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::StaleRecord`] if the stored status differs, or
    /// [`DbError::Postgres`] if the update fails.
    pub async fn save(
        &self,
        record: &ProvisioningRecord,
        expected: ProvisioningStatus,
    ) -> Result<(), DbError> {
        let (coord_x, coord_y) = split_coordinates(record.coordinates);
        let result = sqlx::query(
            r"UPDATE provisioning_records
              SET status = $3,
                  per_world_account_id = $4,
                  per_world_settlement_id = $5,
                  global_player_id = $6,
                  coord_x = $7,
                  coord_y = $8,
                  error_message = $9,
                  retry_count = $10,
                  updated_at = $11,
                  completed_at = $12
              WHERE id = $1 AND status = $2",
        )
        .bind(record.id.into_inner())
        .bind(expected.as_str())
        .bind(record.status.as_str())
        .bind(record.per_world_account_id.map(AccountId::into_inner))
        .bind(record.per_world_settlement_id.map(SettlementId::into_inner))
        .bind(record.global_player_id.map(PlayerId::into_inner))
        .bind(coord_x)
        .bind(coord_y)
        .bind(record.error_message.as_deref())
        .bind(db_i32("retry_count", record.retry_count)?)
        .bind(record.updated_at)
        .bind(record.completed_at)
        .execute(self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::StaleRecord {
                id: record.id,
                expected,
            });
        }
        Ok(())
    }

    /// Fetch one record by id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails, or
    /// [`DbError::InvalidColumn`] if a stored enum value is unknown.
    pub async fn get(&self, id: ProvisioningId) -> Result<Option<ProvisioningRecord>, DbError> {
        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM provisioning_records WHERE id = $1"
        ))
        .bind(id.into_inner())
        .fetch_optional(self.pool)
        .await?;

        row.map(ProvisioningRecord::try_from).transpose()
    }

    /// Non-terminal records last updated before `updated_before`, oldest
    /// first, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn list_in_flight(
        &self,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ProvisioningRecord>, DbError> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM provisioning_records
             WHERE status NOT IN ('completed', 'failed', 'blocked') AND updated_at < $1
             ORDER BY updated_at, id
             LIMIT $2"
        ))
        .bind(updated_before)
        .bind(i64::from(limit))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(ProvisioningRecord::try_from).collect()
    }

    /// Most recent records, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn list(
        &self,
        status: Option<ProvisioningStatus>,
        limit: u32,
    ) -> Result<Vec<ProvisioningRecord>, DbError> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM provisioning_records
             WHERE ($1::TEXT IS NULL OR status = $1)
             ORDER BY created_at DESC, id DESC
             LIMIT $2"
        ))
        .bind(status.map(ProvisioningStatus::as_str))
        .bind(i64::from(limit))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(ProvisioningRecord::try_from).collect()
    }
}

/// A row from the `provisioning_records` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LedgerRow {
    /// Record UUID.
    pub id: Uuid,
    /// World UUID.
    pub world_id: Uuid,
    /// Status text.
    pub status: String,
    /// NPC display name.
    pub npc_name: String,
    /// Faction text.
    pub faction: String,
    /// Difficulty text.
    pub difficulty: String,
    /// Personality text.
    pub personality: String,
    /// Per-world account UUID.
    pub per_world_account_id: Option<Uuid>,
    /// Per-world settlement UUID.
    pub per_world_settlement_id: Option<Uuid>,
    /// Global player UUID.
    pub global_player_id: Option<Uuid>,
    /// Reserved x coordinate.
    pub coord_x: Option<i32>,
    /// Reserved y coordinate.
    pub coord_y: Option<i32>,
    /// Last failure or resolution reason.
    pub error_message: Option<String>,
    /// Failed recovery attempts.
    pub retry_count: i32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
    /// Completion timestamp.
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<LedgerRow> for ProvisioningRecord {
    type Error = DbError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let coordinates = match (row.coord_x, row.coord_y) {
            (Some(x), Some(y)) => Some(Coordinates::new(x, y)),
            _ => None,
        };
        Ok(Self {
            id: ProvisioningId(row.id),
            world_id: WorldId(row.world_id),
            status: row.status.parse()?,
            attributes: NpcAttributes {
                name: row.npc_name,
                faction: row.faction.parse()?,
                difficulty: row.difficulty.parse()?,
                personality: row.personality.parse()?,
            },
            per_world_account_id: row.per_world_account_id.map(AccountId),
            per_world_settlement_id: row.per_world_settlement_id.map(SettlementId),
            global_player_id: row.global_player_id.map(PlayerId),
            coordinates,
            error_message: row.error_message,
            retry_count: column_u32("retry_count", row.retry_count)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

/// Split optional coordinates into the two nullable columns.
fn split_coordinates(coordinates: Option<Coordinates>) -> (Option<i32>, Option<i32>) {
    coordinates.map_or((None, None), |c| (Some(c.x), Some(c.y)))
}
