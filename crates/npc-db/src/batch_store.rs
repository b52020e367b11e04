//! Deferred spawn batches in the global store.
//!
//! The batch scheduler writes one row per deferred sub-batch. An external
//! time-driven trigger later claims due rows (`pending` -> `running`) and
//! marks them `done` with the outcome counts.
//!
//! A claim stamps `claimed_at`. A row still `running` after its lease (the
//! invocation that claimed it died, or could not record the outcome) is
//! listed as due again and can be re-claimed. Re-claiming bumps `attempts`.

use chrono::{DateTime, Utc};
use npc_types::{PlacementStrategy, SpawnBatchId, WorldId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{DbError, column_u32, db_i32};

/// Execution state of a deferred batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Waiting for its due time.
    Pending,
    /// Claimed by a trigger run.
    Running,
    /// Executed.
    Done,
}

impl BatchStatus {
    /// The value stored in the database.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
        }
    }

    fn parse(value: &str) -> Result<Self, DbError> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            other => Err(DbError::InvalidColumn(npc_types::ParseEnumError {
                kind: "batch status",
                value: other.to_owned(),
            })),
        }
    }
}

/// One deferred spawn batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnBatchRecord {
    /// Batch id.
    pub id: SpawnBatchId,
    /// Target world.
    pub world_id: WorldId,
    /// Preset the batch came from.
    pub preset: String,
    /// Placement strategy for the batch's NPCs.
    pub strategy: PlacementStrategy,
    /// NPCs to provision.
    pub count: u32,
    /// Earliest execution time.
    pub due_at: DateTime<Utc>,
    /// Execution state.
    pub status: BatchStatus,
    /// NPCs provisioned when executed.
    pub provisioned: u32,
    /// NPCs that failed when executed.
    pub failed: u32,
    /// When the batch was planned.
    pub created_at: DateTime<Utc>,
    /// When the batch finished.
    pub executed_at: Option<DateTime<Utc>>,
    /// When the batch was last claimed.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Times the batch has been claimed.
    pub attempts: u32,
}

impl SpawnBatchRecord {
    /// Whether a claim may take this batch at `now`: it is pending and due,
    /// or it is running under a claim made at or before `stale_before`.
    pub fn is_claimable(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        match self.status {
            BatchStatus::Pending => self.due_at <= now,
            BatchStatus::Running => self.claimed_at.is_none_or(|at| at <= stale_before),
            BatchStatus::Done => false,
        }
    }
}

/// Operations on the `spawn_batches` table.
pub struct BatchStore<'a> {
    pool: &'a PgPool,
}

impl<'a> BatchStore<'a> {
    /// Create a new batch store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Insert all batches of one plan in a single transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if any insert fails; none are kept.
    pub async fn insert_all(&self, batches: &[SpawnBatchRecord]) -> Result<(), DbError> {
        if batches.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for batch in batches {
            sqlx::query(
                r"INSERT INTO spawn_batches (id, world_id, preset, strategy, npc_count, due_at, status, provisioned, failed, created_at, executed_at, claimed_at, attempts)
                  VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            )
            .bind(batch.id.into_inner())
            .bind(batch.world_id.into_inner())
            .bind(&batch.preset)
            .bind(batch.strategy.as_str())
            .bind(db_i32("npc_count", batch.count)?)
            .bind(batch.due_at)
            .bind(batch.status.as_str())
            .bind(db_i32("provisioned", batch.provisioned)?)
            .bind(db_i32("failed", batch.failed)?)
            .bind(batch.created_at)
            .bind(batch.executed_at)
            .bind(batch.claimed_at)
            .bind(db_i32("attempts", batch.attempts)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!(count = batches.len(), "Inserted spawn batches");
        Ok(())
    }

    /// Claimable batches, earliest due first: pending ones due at or before
    /// `now`, and running ones claimed at or before `stale_before`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn list_due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<SpawnBatchRecord>, DbError> {
        let rows = sqlx::query_as::<_, BatchRow>(
            r"SELECT id, world_id, preset, strategy, npc_count, due_at, status, provisioned, failed, created_at, executed_at, claimed_at, attempts
              FROM spawn_batches
              WHERE (status = 'pending' AND due_at <= $1)
                 OR (status = 'running' AND (claimed_at IS NULL OR claimed_at <= $2))
              ORDER BY due_at, id
              LIMIT $3",
        )
        .bind(now)
        .bind(stale_before)
        .bind(i64::from(limit))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(SpawnBatchRecord::try_from).collect()
    }

    /// Claim a batch at `now`, from `pending` or from a `running` claim
    /// made at or before `stale_before`. Returns `false` if another trigger
    /// run holds a live claim or finished it.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the update fails.
    pub async fn claim(
        &self,
        id: SpawnBatchId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r"UPDATE spawn_batches
              SET status = 'running', claimed_at = $2, attempts = attempts + 1
              WHERE id = $1
                AND (status = 'pending'
                     OR (status = 'running' AND (claimed_at IS NULL OR claimed_at <= $3)))",
        )
        .bind(id.into_inner())
        .bind(now)
        .bind(stale_before)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark a running batch as done with its outcome counts.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the update fails.
    pub async fn finish(
        &self,
        id: SpawnBatchId,
        provisioned: u32,
        failed: u32,
    ) -> Result<(), DbError> {
        sqlx::query(
            r"UPDATE spawn_batches
              SET status = 'done', provisioned = $2, failed = $3, executed_at = now()
              WHERE id = $1 AND status = 'running'",
        )
        .bind(id.into_inner())
        .bind(db_i32("provisioned", provisioned)?)
        .bind(db_i32("failed", failed)?)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Every batch planned for a world, in due order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn list_for_world(&self, world_id: WorldId) -> Result<Vec<SpawnBatchRecord>, DbError> {
        let rows = sqlx::query_as::<_, BatchRow>(
            r"SELECT id, world_id, preset, strategy, npc_count, due_at, status, provisioned, failed, created_at, executed_at, claimed_at, attempts
              FROM spawn_batches
              WHERE world_id = $1
              ORDER BY due_at, id",
        )
        .bind(world_id.into_inner())
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(SpawnBatchRecord::try_from).collect()
    }
}

/// A row from the `spawn_batches` table.
#[derive(Debug, Clone, sqlx::FromRow)]
struct BatchRow {
    id: Uuid,
    world_id: Uuid,
    preset: String,
    strategy: String,
    npc_count: i32,
    due_at: DateTime<Utc>,
    status: String,
    provisioned: i32,
    failed: i32,
    created_at: DateTime<Utc>,
    executed_at: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
    attempts: i32,
}

impl TryFrom<BatchRow> for SpawnBatchRecord {
    type Error = DbError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: SpawnBatchId(row.id),
            world_id: WorldId(row.world_id),
            preset: row.preset,
            strategy: row.strategy.parse()?,
            count: column_u32("npc_count", row.npc_count)?,
            due_at: row.due_at,
            status: BatchStatus::parse(&row.status)?,
            provisioned: column_u32("provisioned", row.provisioned)?,
            failed: column_u32("failed", row.failed)?,
            created_at: row.created_at,
            executed_at: row.executed_at,
            claimed_at: row.claimed_at,
            attempts: column_u32("attempts", row.attempts)?,
        })
    }
}
