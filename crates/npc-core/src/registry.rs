//! World registry and per-world connection cache.
//!
//! The registry maps a world id to its per-world store descriptor, read from
//! the global store. Connections are opened on first use, cached for the
//! life of the registry, and closed explicitly by
//! [`WorldRegistry::close_all`].

use std::collections::BTreeMap;
use std::time::Duration;

use npc_db::{GlobalStore, MemoryWorldStore, PoolSettings, PostgresPool, SchemaKind, WorldStore};
use npc_types::{WorldDescriptor, WorldId};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{RegistryError, StoreCallError, bounded};

/// How the registry opens a world's store from its descriptor.
#[derive(Debug, Clone, Copy)]
pub enum WorldConnector {
    /// Open a `PostgreSQL` pool at the descriptor's connection URL.
    Postgres {
        /// Pool size per world.
        max_connections: u32,
        /// Connection timeout.
        connect_timeout: Duration,
    },
    /// Create an empty in-memory store.
    Memory,
}

/// Resolves worlds and owns their store connections.
pub struct WorldRegistry {
    global: GlobalStore,
    connector: WorldConnector,
    call_timeout: Duration,
    pools: RwLock<BTreeMap<WorldId, WorldStore>>,
}

impl WorldRegistry {
    /// Create a registry reading descriptors from `global`.
    pub fn new(global: GlobalStore, connector: WorldConnector, call_timeout: Duration) -> Self {
        Self {
            global,
            connector,
            call_timeout,
            pools: RwLock::new(BTreeMap::new()),
        }
    }

    /// Look up an active world's descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::WorldNotFound`] if the world is absent or
    /// inactive, or [`RegistryError::Store`] if the lookup fails.
    pub async fn describe(&self, world_id: WorldId) -> Result<WorldDescriptor, RegistryError> {
        let descriptor = bounded(
            self.call_timeout,
            "world lookup",
            self.global.get_world(world_id),
        )
        .await
        .map_err(|source| RegistryError::Store { world_id, source })?;

        match descriptor {
            Some(world) if world.is_active => Ok(world),
            _ => Err(RegistryError::WorldNotFound(world_id)),
        }
    }

    /// The store of an active world, opening it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::WorldNotFound`] if the world is absent or
    /// inactive, or [`RegistryError::Store`] if the connection fails.
    pub async fn connect(&self, world_id: WorldId) -> Result<WorldStore, RegistryError> {
        let descriptor = self.describe(world_id).await?;

        if let Some(store) = self.pools.read().await.get(&world_id) {
            return Ok(store.clone());
        }

        let opened = self.open(&descriptor).await?;

        let mut pools = self.pools.write().await;
        if let Some(existing) = pools.get(&world_id) {
            // Another task opened it while this one was connecting.
            let existing = existing.clone();
            drop(pools);
            opened.close().await;
            return Ok(existing);
        }
        pools.insert(world_id, opened.clone());
        info!(world_id = %world_id, world = %descriptor.name, "opened per-world store");
        Ok(opened)
    }

    async fn open(&self, descriptor: &WorldDescriptor) -> Result<WorldStore, RegistryError> {
        match self.connector {
            WorldConnector::Postgres {
                max_connections,
                connect_timeout,
            } => {
                let settings = PoolSettings::for_url(&descriptor.connection_url)
                    .with_max_connections(max_connections)
                    .with_acquire_timeout(connect_timeout);
                let pool = PostgresPool::open(&settings, SchemaKind::World)
                    .await
                    .map_err(|err| RegistryError::Store {
                        world_id: descriptor.id,
                        source: StoreCallError::Db(err),
                    })?;
                Ok(WorldStore::Postgres(pool))
            }
            WorldConnector::Memory => Ok(WorldStore::Memory(MemoryWorldStore::new())),
        }
    }

    /// Use `store` for `world_id` instead of opening one from the
    /// descriptor. Replaces any cached store.
    pub async fn attach(&self, world_id: WorldId, store: WorldStore) {
        let previous = self.pools.write().await.insert(world_id, store);
        if let Some(previous) = previous {
            previous.close().await;
        }
    }

    /// Register a world or update its descriptor.
    ///
    /// Deactivating a world closes its cached connection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] if the write fails.
    pub async fn register(&self, world: &WorldDescriptor) -> Result<(), RegistryError> {
        bounded(self.call_timeout, "world upsert", self.global.upsert_world(world))
            .await
            .map_err(|source| RegistryError::Store {
                world_id: world.id,
                source,
            })?;
        info!(
            world_id = %world.id,
            world = %world.name,
            active = world.is_active,
            "registered world"
        );
        if !world.is_active {
            self.evict(world.id).await;
        }
        Ok(())
    }

    /// Every registered world, active or not.
    ///
    /// # Errors
    ///
    /// Returns [`StoreCallError`] if the read fails.
    pub async fn list(&self) -> Result<Vec<WorldDescriptor>, StoreCallError> {
        bounded(self.call_timeout, "world listing", self.global.list_worlds()).await
    }

    /// Close and forget one world's cached connection.
    pub async fn evict(&self, world_id: WorldId) {
        let removed = self.pools.write().await.remove(&world_id);
        if let Some(store) = removed {
            store.close().await;
            debug!(world_id = %world_id, "closed per-world store");
        }
    }

    /// Number of cached connections.
    pub async fn open_count(&self) -> usize {
        self.pools.read().await.len()
    }

    /// Close every cached connection.
    pub async fn close_all(&self) {
        let pools = std::mem::take(&mut *self.pools.write().await);
        let count = pools.len();
        for (world_id, store) in pools {
            store.close().await;
            debug!(world_id = %world_id, "closed per-world store");
        }
        if count > 0 {
            info!(count, "closed per-world stores");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use npc_db::MemoryGlobalStore;

    use super::*;

    fn world(active: bool) -> WorldDescriptor {
        WorldDescriptor {
            id: WorldId::new(),
            name: String::from("s1"),
            connection_url: String::from("memory://s1"),
            is_active: active,
            created_at: Utc::now(),
        }
    }

    fn registry() -> WorldRegistry {
        WorldRegistry::new(
            GlobalStore::Memory(MemoryGlobalStore::new()),
            WorldConnector::Memory,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn unknown_world_is_not_found() {
        let registry = registry();
        let err = registry.connect(WorldId::new()).await.unwrap_err();
        assert!(matches!(err, RegistryError::WorldNotFound(_)));
    }

    #[tokio::test]
    async fn inactive_world_is_not_found() {
        let registry = registry();
        let w = world(false);
        registry.register(&w).await.unwrap();
        let err = registry.describe(w.id).await.unwrap_err();
        assert!(matches!(err, RegistryError::WorldNotFound(id) if id == w.id));
    }

    #[tokio::test]
    async fn connections_are_cached_until_closed() {
        let registry = registry();
        let w = world(true);
        registry.register(&w).await.unwrap();

        registry.connect(w.id).await.unwrap();
        registry.connect(w.id).await.unwrap();
        assert_eq!(registry.open_count().await, 1);

        registry.close_all().await;
        assert_eq!(registry.open_count().await, 0);
    }

    #[tokio::test]
    async fn deactivation_evicts_cached_connection() {
        let registry = registry();
        let mut w = world(true);
        registry.register(&w).await.unwrap();
        registry.connect(w.id).await.unwrap();

        w.is_active = false;
        registry.register(&w).await.unwrap();
        assert_eq!(registry.open_count().await, 0);
        assert!(registry.connect(w.id).await.is_err());
    }
}
