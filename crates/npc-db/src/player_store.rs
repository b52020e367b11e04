//! Global player identities and AI configuration.
//!
//! A provisioned NPC is one `players` row plus one `ai_configs` row, always
//! written and deleted together inside a single transaction.

use chrono::{DateTime, Utc};
use npc_types::{
    AccountId, Difficulty, Personality, PlayerId, PlayerKind, ProvisioningId, WorldId,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::DbError;

/// Everything needed to write one NPC's global footprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPlayer {
    /// Pre-generated player id.
    pub id: PlayerId,
    /// World the player lives in.
    pub world_id: WorldId,
    /// Classification.
    pub kind: PlayerKind,
    /// Display name.
    pub name: String,
    /// Linked per-world account.
    pub per_world_account_id: AccountId,
    /// Provisioning attempt that created the player.
    pub provisioning_id: Option<ProvisioningId>,
    /// AI difficulty.
    pub difficulty: Difficulty,
    /// AI behavior profile.
    pub personality: Personality,
}

/// A player identity as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    /// Player id.
    pub id: PlayerId,
    /// World the player lives in.
    pub world_id: WorldId,
    /// Classification.
    pub kind: PlayerKind,
    /// Display name.
    pub name: String,
    /// Linked per-world account.
    pub per_world_account_id: AccountId,
    /// Provisioning linkage, if created by provisioning.
    pub provisioning_id: Option<ProvisioningId>,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

/// Rows removed by a global cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayerRemoval {
    /// `ai_configs` rows deleted.
    pub ai_configs: u64,
    /// `players` rows deleted.
    pub players: u64,
}

/// Operations on the `players` and `ai_configs` tables.
pub struct PlayerStore<'a> {
    pool: &'a PgPool,
}

impl<'a> PlayerStore<'a> {
    /// Create a new player store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Insert the identity row and its AI configuration in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if either insert fails; nothing is
    /// committed in that case.
    pub async fn insert_with_ai(&self, player: &NewPlayer) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"INSERT INTO players (id, world_id, kind, name, per_world_account_id, provisioning_id)
              VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(player.id.into_inner())
        .bind(player.world_id.into_inner())
        .bind(player.kind.as_str())
        .bind(&player.name)
        .bind(player.per_world_account_id.into_inner())
        .bind(player.provisioning_id.map(ProvisioningId::into_inner))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"INSERT INTO ai_configs (player_id, difficulty, personality)
              VALUES ($1, $2, $3)",
        )
        .bind(player.id.into_inner())
        .bind(player.difficulty.as_str())
        .bind(player.personality.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(player_id = %player.id, account_id = %player.per_world_account_id, "Inserted player with AI config");
        Ok(())
    }

    /// Fetch a player by id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn get(&self, id: PlayerId) -> Result<Option<PlayerRecord>, DbError> {
        let row = sqlx::query_as::<_, PlayerRow>(
            r"SELECT id, world_id, kind, name, per_world_account_id, provisioning_id, created_at
              FROM players WHERE id = $1",
        )
        .bind(id.into_inner())
        .fetch_optional(self.pool)
        .await?;

        row.map(PlayerRecord::try_from).transpose()
    }

    /// Fetch the player created by a provisioning attempt.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn find_by_provisioning(
        &self,
        provisioning_id: ProvisioningId,
    ) -> Result<Option<PlayerRecord>, DbError> {
        let row = sqlx::query_as::<_, PlayerRow>(
            r"SELECT id, world_id, kind, name, per_world_account_id, provisioning_id, created_at
              FROM players WHERE provisioning_id = $1
              ORDER BY created_at LIMIT 1",
        )
        .bind(provisioning_id.into_inner())
        .fetch_optional(self.pool)
        .await?;

        row.map(PlayerRecord::try_from).transpose()
    }

    /// Fetch the player linked to a per-world account.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn find_by_account(
        &self,
        world_id: WorldId,
        account_id: AccountId,
    ) -> Result<Option<PlayerRecord>, DbError> {
        let row = sqlx::query_as::<_, PlayerRow>(
            r"SELECT id, world_id, kind, name, per_world_account_id, provisioning_id, created_at
              FROM players WHERE world_id = $1 AND per_world_account_id = $2",
        )
        .bind(world_id.into_inner())
        .bind(account_id.into_inner())
        .fetch_optional(self.pool)
        .await?;

        row.map(PlayerRecord::try_from).transpose()
    }

    /// Delete a player's AI configuration, then the player, in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if either delete fails; the transaction
    /// is rolled back and no row is removed.
    pub async fn delete_with_ai(&self, id: PlayerId) -> Result<PlayerRemoval, DbError> {
        let mut tx = self.pool.begin().await?;

        let ai_configs = sqlx::query("DELETE FROM ai_configs WHERE player_id = $1")
            .bind(id.into_inner())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let players = sqlx::query("DELETE FROM players WHERE id = $1")
            .bind(id.into_inner())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        tracing::debug!(player_id = %id, ai_configs, players, "Deleted player with AI config");
        Ok(PlayerRemoval {
            ai_configs,
            players,
        })
    }
}

/// A row from the `players` table.
#[derive(Debug, Clone, sqlx::FromRow)]
struct PlayerRow {
    id: Uuid,
    world_id: Uuid,
    kind: String,
    name: String,
    per_world_account_id: Uuid,
    provisioning_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PlayerRow> for PlayerRecord {
    type Error = DbError;

    fn try_from(row: PlayerRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: PlayerId(row.id),
            world_id: WorldId(row.world_id),
            kind: row.kind.parse()?,
            name: row.name,
            per_world_account_id: AccountId(row.per_world_account_id),
            provisioning_id: row.provisioning_id.map(ProvisioningId),
            created_at: row.created_at,
        })
    }
}
