//! Per-world footprint of a provisioned NPC.
//!
//! A footprint is one `accounts` row, one capital `settlements` row, its
//! `resource_fields` rows, and the claimed `map_tiles` row. It is written in
//! one transaction and removed in one transaction, in foreign-key-safe order.
//!
//! # Write order
//!
//! ```text
//! accounts -> map_tiles (claim) -> settlements -> resource_fields -> map_tiles (link)
//! ```
//!
//! # Delete order
//!
//! ```text
//! map_tiles (free) -> resource_fields -> settlements -> accounts
//! ```

use std::collections::BTreeSet;

use npc_types::{
    AccountId, Coordinates, Faction, FieldType, ProvisioningId, SettlementId,
};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{DbError, db_i32};

/// Password column value for accounts nobody logs into.
pub const NPC_PASSWORD_PLACEHOLDER: &str = "!npc-no-login";

/// Starting stockpile of a settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stockpile {
    /// Wood.
    pub wood: u32,
    /// Clay.
    pub clay: u32,
    /// Iron.
    pub iron: u32,
    /// Crop.
    pub crop: u32,
}

/// One resource field of a settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSeed {
    /// Position of the field around the settlement (1-based).
    pub index: u8,
    /// What the field produces.
    pub field_type: FieldType,
    /// Starting level.
    pub level: u8,
}

/// Everything written to a per-world store for one NPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementSeed {
    /// Provisioning attempt, stored on the account as linkage.
    pub provisioning_id: ProvisioningId,
    /// Pre-generated account id.
    pub account_id: AccountId,
    /// Pre-generated settlement id.
    pub settlement_id: SettlementId,
    /// Account name.
    pub account_name: String,
    /// Settlement name.
    pub settlement_name: String,
    /// Faction of the account.
    pub faction: Faction,
    /// Tile to claim.
    pub coordinates: Coordinates,
    /// Starting resources.
    pub stockpile: Stockpile,
    /// Warehouse capacity (wood, clay, iron).
    pub warehouse_capacity: u32,
    /// Granary capacity (crop).
    pub granary_capacity: u32,
    /// Starting population.
    pub population: u32,
    /// Resource field layout.
    pub fields: Vec<FieldSeed>,
}

/// What a probe found of one provisioning attempt in a per-world store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorldFootprint {
    /// Account row, if present.
    pub account_id: Option<AccountId>,
    /// Settlement row, if present.
    pub settlement_id: Option<SettlementId>,
    /// Position of the settlement, if present.
    pub coordinates: Option<Coordinates>,
}

impl WorldFootprint {
    /// Whether any per-world row of the attempt exists.
    pub const fn exists(&self) -> bool {
        self.account_id.is_some() || self.settlement_id.is_some()
    }
}

/// Rows touched by a per-world cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FootprintRemoval {
    /// Tiles returned to unoccupied.
    pub tiles_freed: u64,
    /// `resource_fields` rows deleted.
    pub fields: u64,
    /// `settlements` rows deleted.
    pub settlements: u64,
    /// `accounts` rows deleted.
    pub accounts: u64,
}

/// Operations on one per-world store.
pub struct SettlementStore<'a> {
    pool: &'a PgPool,
}

impl<'a> SettlementStore<'a> {
    /// Create a new settlement store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Write the whole footprint in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::TileOccupied`] if the tile was claimed by someone
    /// else (including a concurrent transaction that committed first), or
    /// [`DbError::Postgres`] for any other failure; nothing is committed on
    /// those. A failure of the final `COMMIT` itself is
    /// [`DbError::CommitOutcomeUnknown`], and the footprint may exist.
    pub async fn commit_footprint(&self, seed: &SettlementSeed) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"INSERT INTO accounts (id, name, faction, password_hash, is_npc, provisioning_id)
              VALUES ($1, $2, $3, $4, TRUE, $5)",
        )
        .bind(seed.account_id.into_inner())
        .bind(&seed.account_name)
        .bind(seed.faction.as_str())
        .bind(NPC_PASSWORD_PLACEHOLDER)
        .bind(seed.provisioning_id.into_inner())
        .execute(&mut *tx)
        .await?;

        claim_tile(&mut tx, seed.coordinates).await?;

        sqlx::query(
            r"INSERT INTO settlements (id, account_id, name, x, y, wood, clay, iron, crop, warehouse_capacity, granary_capacity, population, is_capital)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, TRUE)",
        )
        .bind(seed.settlement_id.into_inner())
        .bind(seed.account_id.into_inner())
        .bind(&seed.settlement_name)
        .bind(seed.coordinates.x)
        .bind(seed.coordinates.y)
        .bind(db_i32("wood", seed.stockpile.wood)?)
        .bind(db_i32("clay", seed.stockpile.clay)?)
        .bind(db_i32("iron", seed.stockpile.iron)?)
        .bind(db_i32("crop", seed.stockpile.crop)?)
        .bind(db_i32("warehouse_capacity", seed.warehouse_capacity)?)
        .bind(db_i32("granary_capacity", seed.granary_capacity)?)
        .bind(db_i32("population", seed.population)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| tile_conflict_or(e, seed.coordinates))?;

        for field in &seed.fields {
            sqlx::query(
                r"INSERT INTO resource_fields (settlement_id, field_index, level, field_type)
                  VALUES ($1, $2, $3, $4)",
            )
            .bind(seed.settlement_id.into_inner())
            .bind(i16::from(field.index))
            .bind(i16::from(field.level))
            .bind(field.field_type.as_str())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(r"UPDATE map_tiles SET settlement_id = $3 WHERE x = $1 AND y = $2")
            .bind(seed.coordinates.x)
            .bind(seed.coordinates.y)
            .bind(seed.settlement_id.into_inner())
            .execute(&mut *tx)
            .await?;

        tx.commit().await.map_err(DbError::CommitOutcomeUnknown)?;

        tracing::debug!(
            account_id = %seed.account_id,
            settlement_id = %seed.settlement_id,
            coordinates = %seed.coordinates,
            fields = seed.fields.len(),
            "Committed per-world footprint"
        );
        Ok(())
    }

    /// Look up what exists of an attempt. Known ids are used directly;
    /// otherwise the account is found through its provisioning linkage and
    /// the settlement through its account.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if a query fails.
    pub async fn probe_footprint(
        &self,
        provisioning_id: ProvisioningId,
        account_id: Option<AccountId>,
        settlement_id: Option<SettlementId>,
    ) -> Result<WorldFootprint, DbError> {
        let account: Option<Uuid> = match account_id {
            Some(id) => sqlx::query_scalar::<_, Uuid>("SELECT id FROM accounts WHERE id = $1")
                .bind(id.into_inner())
                .fetch_optional(self.pool)
                .await?,
            None => {
                sqlx::query_scalar::<_, Uuid>("SELECT id FROM accounts WHERE provisioning_id = $1")
                    .bind(provisioning_id.into_inner())
                    .fetch_optional(self.pool)
                    .await?
            }
        };

        let settlement: Option<(Uuid, i32, i32)> = match (settlement_id, account) {
            (Some(id), _) => sqlx::query_as::<_, (Uuid, i32, i32)>("SELECT id, x, y FROM settlements WHERE id = $1")
                .bind(id.into_inner())
                .fetch_optional(self.pool)
                .await?,
            (None, Some(owner)) => sqlx::query_as::<_, (Uuid, i32, i32)>(
                "SELECT id, x, y FROM settlements WHERE account_id = $1 ORDER BY is_capital DESC, created_at LIMIT 1",
            )
            .bind(owner)
            .fetch_optional(self.pool)
            .await?,
            (None, None) => None,
        };

        Ok(WorldFootprint {
            account_id: account.map(AccountId),
            settlement_id: settlement.map(|(id, _, _)| SettlementId(id)),
            coordinates: settlement.map(|(_, x, y)| Coordinates::new(x, y)),
        })
    }

    /// Remove a footprint in one transaction: free the tiles, then delete
    /// fields, settlements, and finally the account. Settlements owned by
    /// `account_id` are included even if `settlement_id` is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if any step fails; the transaction is
    /// rolled back and nothing is removed.
    pub async fn remove_footprint(
        &self,
        account_id: Option<AccountId>,
        settlement_id: Option<SettlementId>,
    ) -> Result<FootprintRemoval, DbError> {
        let mut tx = self.pool.begin().await?;

        let mut settlements: BTreeSet<Uuid> = BTreeSet::new();
        if let Some(id) = settlement_id {
            settlements.insert(id.into_inner());
        }
        if let Some(owner) = account_id {
            let owned: Vec<Uuid> =
                sqlx::query_scalar("SELECT id FROM settlements WHERE account_id = $1")
                    .bind(owner.into_inner())
                    .fetch_all(&mut *tx)
                    .await?;
            settlements.extend(owned);
        }
        let settlements: Vec<Uuid> = settlements.into_iter().collect();

        let tiles_freed = sqlx::query(
            "UPDATE map_tiles SET occupied = FALSE, settlement_id = NULL WHERE settlement_id = ANY($1)",
        )
        .bind(&settlements)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let fields = sqlx::query("DELETE FROM resource_fields WHERE settlement_id = ANY($1)")
            .bind(&settlements)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let deleted_settlements = sqlx::query("DELETE FROM settlements WHERE id = ANY($1)")
            .bind(&settlements)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let accounts = match account_id {
            Some(owner) => sqlx::query("DELETE FROM accounts WHERE id = $1")
                .bind(owner.into_inner())
                .execute(&mut *tx)
                .await?
                .rows_affected(),
            None => 0,
        };

        tx.commit().await?;

        let removal = FootprintRemoval {
            tiles_freed,
            fields,
            settlements: deleted_settlements,
            accounts,
        };

        tracing::debug!(
            tiles_freed = removal.tiles_freed,
            fields = removal.fields,
            settlements = removal.settlements,
            accounts = removal.accounts,
            "Removed per-world footprint"
        );
        Ok(removal)
    }

    /// Occupied tiles within the square of half-width `radius` around
    /// `center`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn occupied_tiles(
        &self,
        center: Coordinates,
        radius: u32,
    ) -> Result<BTreeSet<Coordinates>, DbError> {
        let radius = i64::from(radius);
        let rows: Vec<(i32, i32)> = sqlx::query_as(
            r"SELECT x, y FROM map_tiles
              WHERE occupied
                AND x::BIGINT BETWEEN $1 - $3 AND $1 + $3
                AND y::BIGINT BETWEEN $2 - $3 AND $2 + $3",
        )
        .bind(i64::from(center.x))
        .bind(i64::from(center.y))
        .bind(radius)
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().map(|(x, y)| Coordinates::new(x, y)).collect())
    }
}

/// Atomically flip a tile to occupied. A tile row that is already occupied
/// leaves the upsert with zero affected rows.
async fn claim_tile(
    tx: &mut Transaction<'_, Postgres>,
    tile: Coordinates,
) -> Result<(), DbError> {
    let claimed = sqlx::query(
        r"INSERT INTO map_tiles (x, y, occupied) VALUES ($1, $2, TRUE)
          ON CONFLICT (x, y) DO UPDATE SET occupied = TRUE
          WHERE map_tiles.occupied = FALSE",
    )
    .bind(tile.x)
    .bind(tile.y)
    .execute(&mut **tx)
    .await
    .map_err(|e| tile_conflict_or(e, tile))?
    .rows_affected();

    if claimed == 0 {
        return Err(DbError::TileOccupied(tile));
    }
    Ok(())
}

/// Map a unique violation on tile or settlement position to
/// [`DbError::TileOccupied`].
fn tile_conflict_or(err: sqlx::Error, tile: Coordinates) -> DbError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => DbError::TileOccupied(tile),
        _ => DbError::Postgres(err),
    }
}
