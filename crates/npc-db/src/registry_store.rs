//! World registry rows in the global store.

use chrono::{DateTime, Utc};
use npc_types::{WorldDescriptor, WorldId};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::DbError;

/// Operations on the `worlds` table.
pub struct RegistryStore<'a> {
    pool: &'a PgPool,
}

impl<'a> RegistryStore<'a> {
    /// Create a new registry store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Insert a world, or update its name, URL, and active flag if the id
    /// is already registered.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the upsert fails.
    pub async fn upsert(&self, world: &WorldDescriptor) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO worlds (id, name, connection_url, is_active, created_at)
              VALUES ($1, $2, $3, $4, $5)
              ON CONFLICT (id) DO UPDATE
              SET name = EXCLUDED.name,
                  connection_url = EXCLUDED.connection_url,
                  is_active = EXCLUDED.is_active",
        )
        .bind(world.id.into_inner())
        .bind(&world.name)
        .bind(&world.connection_url)
        .bind(world.is_active)
        .bind(world.created_at)
        .execute(self.pool)
        .await?;

        tracing::info!(world_id = %world.id, name = world.name, is_active = world.is_active, "Registered world");
        Ok(())
    }

    /// Fetch a world by id, active or not.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn get(&self, id: WorldId) -> Result<Option<WorldDescriptor>, DbError> {
        let row = sqlx::query_as::<_, WorldRow>(
            r"SELECT id, name, connection_url, is_active, created_at FROM worlds WHERE id = $1",
        )
        .bind(id.into_inner())
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(WorldDescriptor::from))
    }

    /// All registered worlds, ordered by creation.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn list(&self) -> Result<Vec<WorldDescriptor>, DbError> {
        let rows = sqlx::query_as::<_, WorldRow>(
            r"SELECT id, name, connection_url, is_active, created_at FROM worlds ORDER BY created_at",
        )
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().map(WorldDescriptor::from).collect())
    }
}

/// A row from the `worlds` table.
#[derive(Debug, Clone, sqlx::FromRow)]
struct WorldRow {
    id: Uuid,
    name: String,
    connection_url: String,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl From<WorldRow> for WorldDescriptor {
    fn from(row: WorldRow) -> Self {
        Self {
            id: WorldId(row.id),
            name: row.name,
            connection_url: row.connection_url,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}
