//! The provisioning service: every invocation-surface operation over one
//! set of stores.
//!
//! [`Provisioner`] owns the configuration, the global store handle, and the
//! world registry. Components are created per call from borrowed handles,
//! so the service itself holds no other state.

use std::future::Future;

use chrono::Utc;
use npc_db::{DbError, GlobalStore, PoolSettings, PostgresPool, SchemaKind};
use npc_types::{
    Coordinates, NpcAttributes, PlacementStrategy, ProvisionedNpc, ProvisioningId,
    ProvisioningRecord, ProvisioningStatus, SpawnPlan, WorldDescriptor, WorldId,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ProvisionerConfig;
use crate::error::{
    MigrateError, PlacementError, ProvisionError, ReconcileError, RegistryError, ScheduleError,
    StoreCallError, bounded,
};
use crate::orchestrator::Orchestrator;
use crate::placement::{PlacementAllocator, PlacementParams};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::registry::{WorldConnector, WorldRegistry};
use crate::scheduler::{BatchScheduler, BulkOutcome, DueBatchReport};

/// Worlds whose schemas `migrate` brought up to date.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Active worlds migrated, in registry order.
    pub worlds: Vec<WorldId>,
}

/// NPC provisioning over a global store and its registered worlds.
pub struct Provisioner {
    config: ProvisionerConfig,
    global: GlobalStore,
    registry: WorldRegistry,
}

impl Provisioner {
    /// Create a service over an existing global store.
    pub fn new(config: ProvisionerConfig, global: GlobalStore, connector: WorldConnector) -> Self {
        let registry = WorldRegistry::new(global.clone(), connector, config.timeouts.store_call());
        Self {
            config,
            global,
            registry,
        }
    }

    /// Connect to the configured `PostgreSQL` global store. World stores
    /// are opened on first use.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the global store cannot be reached.
    pub async fn connect(config: ProvisionerConfig) -> Result<Self, DbError> {
        let infra = &config.infrastructure;
        let settings = PoolSettings::for_url(&infra.global_database_url)
            .with_max_connections(infra.global_max_connections)
            .with_acquire_timeout(infra.connect_timeout());
        let pool = PostgresPool::open(&settings, SchemaKind::Global).await?;
        let connector = WorldConnector::Postgres {
            max_connections: infra.world_max_connections,
            connect_timeout: infra.connect_timeout(),
        };
        info!("connected to global store");
        Ok(Self::new(config, GlobalStore::Postgres(pool), connector))
    }

    /// Active configuration.
    pub const fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Global store handle.
    pub const fn global(&self) -> &GlobalStore {
        &self.global
    }

    /// World registry.
    pub const fn registry(&self) -> &WorldRegistry {
        &self.registry
    }

    fn orchestrator(&self) -> Orchestrator<'_> {
        Orchestrator::new(
            &self.global,
            &self.registry,
            &self.config.settlement,
            self.config.timeouts.store_call(),
        )
    }

    fn allocator(&self) -> PlacementAllocator<'_> {
        PlacementAllocator::new(&self.registry, self.config.timeouts.store_call())
    }

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(&self.global, &self.registry, self.config.timeouts.store_call())
    }

    fn scheduler(&self) -> BatchScheduler<'_> {
        BatchScheduler::new(&self.global, &self.registry, &self.config)
    }

    /// Configured placement parameters.
    pub fn placement_params(&self) -> PlacementParams {
        PlacementParams::from(&self.config.placement)
    }

    // ---------------------------------------------------------------------
    // Provisioning
    // ---------------------------------------------------------------------

    /// Provision one NPC.
    ///
    /// Without a `location` one tile is allocated with the configured
    /// strategy, and re-allocated once if another writer claims it first.
    ///
    /// # Errors
    ///
    /// See [`ProvisionError`].
    pub async fn create_npc(
        &self,
        world_id: WorldId,
        attributes: &NpcAttributes,
        location: Option<Coordinates>,
    ) -> Result<ProvisionedNpc, ProvisionError> {
        let orchestrator = self.orchestrator();
        if let Some(tile) = location {
            return orchestrator.provision(world_id, attributes, tile).await;
        }

        let strategy = self.config.placement.strategy;
        let params = self.placement_params();
        let tile = self.allocate_one(world_id, strategy, &params).await?;
        match orchestrator.provision(world_id, attributes, tile).await {
            Err(err) if err.is_tile_conflict() => {
                warn!(world_id = %world_id, coordinates = %tile, "tile taken, re-allocating");
                let retry_params = PlacementParams {
                    seed: None,
                    ..params
                };
                let tile = self.allocate_one(world_id, strategy, &retry_params).await?;
                orchestrator.provision(world_id, attributes, tile).await
            }
            other => other,
        }
    }

    async fn allocate_one(
        &self,
        world_id: WorldId,
        strategy: PlacementStrategy,
        params: &PlacementParams,
    ) -> Result<Coordinates, PlacementError> {
        let tiles = self.allocator().allocate(world_id, 1, strategy, params).await?;
        tiles.first().copied().ok_or(PlacementError::Exhausted {
            placed: 0,
            requested: 1,
            attempts: params.max_attempts_per_point,
        })
    }

    /// Sample unoccupied tiles without claiming them.
    ///
    /// # Errors
    ///
    /// See [`PlacementError`].
    pub async fn generate_spawn_locations(
        &self,
        world_id: WorldId,
        count: u32,
        strategy: PlacementStrategy,
        params: &PlacementParams,
    ) -> Result<Vec<Coordinates>, PlacementError> {
        self.allocator().allocate(world_id, count, strategy, params).await
    }

    // ---------------------------------------------------------------------
    // Bulk spawning
    // ---------------------------------------------------------------------

    /// Split a bulk request without executing it.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Registry`] if the world is unknown or
    /// inactive, or a preset error.
    pub async fn plan_batches(
        &self,
        world_id: WorldId,
        total: u32,
        preset: &str,
    ) -> Result<SpawnPlan, ScheduleError> {
        self.registry.describe(world_id).await?;
        self.scheduler().plan(world_id, total, preset)
    }

    /// Plan and execute a bulk request.
    ///
    /// # Errors
    ///
    /// See [`BatchScheduler::execute`].
    pub async fn spawn_bulk(
        &self,
        world_id: WorldId,
        total: u32,
        preset: &str,
        strategy: PlacementStrategy,
    ) -> Result<BulkOutcome, ScheduleError> {
        let scheduler = self.scheduler();
        let plan = scheduler.plan(world_id, total, preset)?;
        scheduler
            .execute(&plan, strategy, &self.placement_params())
            .await
    }

    /// Execute deferred batches that are due now.
    ///
    /// # Errors
    ///
    /// See [`BatchScheduler::run_due_batches`].
    pub async fn run_due_batches(&self) -> Result<DueBatchReport, ScheduleError> {
        self.scheduler().run_due_batches(Utc::now()).await
    }

    // ---------------------------------------------------------------------
    // Reconciliation
    // ---------------------------------------------------------------------

    /// One reconciliation pass with the configured age and limit.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::reconcile`].
    pub async fn run_reconciliation(&self) -> Result<ReconcileReport, ReconcileError> {
        let settings = &self.config.reconciler;
        self.reconciler()
            .reconcile(settings.max_age(), settings.limit)
            .await
    }

    /// Reconcile on the configured interval until `shutdown` resolves.
    pub async fn watch_reconciliation<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let settings = &self.config.reconciler;
        self.reconciler()
            .run_until(
                settings.interval(),
                settings.max_age(),
                settings.limit,
                shutdown,
            )
            .await;
    }

    /// Release a blocked record back to the reconciler.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::unblock`].
    pub async fn unblock(&self, id: ProvisioningId) -> Result<ProvisioningRecord, ReconcileError> {
        self.reconciler().unblock(id).await
    }

    // ---------------------------------------------------------------------
    // Inspection and administration
    // ---------------------------------------------------------------------

    /// One ledger record.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::RecordNotFound`] or
    /// [`ReconcileError::Ledger`].
    pub async fn show(&self, id: ProvisioningId) -> Result<ProvisioningRecord, ReconcileError> {
        bounded(
            self.config.timeouts.store_call(),
            "ledger read",
            self.global.get_record(id),
        )
        .await?
        .ok_or(ReconcileError::RecordNotFound(id))
    }

    /// Most recent ledger records, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreCallError`] if the read fails.
    pub async fn list(
        &self,
        status: Option<ProvisioningStatus>,
        limit: u32,
    ) -> Result<Vec<ProvisioningRecord>, StoreCallError> {
        bounded(
            self.config.timeouts.store_call(),
            "ledger listing",
            self.global.list_records(status, limit),
        )
        .await
    }

    /// A world's registry entry, active or not.
    ///
    /// # Errors
    ///
    /// Returns [`StoreCallError`] if the read fails.
    pub async fn world(&self, id: WorldId) -> Result<Option<WorldDescriptor>, StoreCallError> {
        bounded(
            self.config.timeouts.store_call(),
            "world lookup",
            self.global.get_world(id),
        )
        .await
    }

    /// Register, update, activate, or deactivate a world.
    ///
    /// # Errors
    ///
    /// See [`WorldRegistry::register`].
    pub async fn register_world(&self, world: &WorldDescriptor) -> Result<(), RegistryError> {
        self.registry.register(world).await
    }

    /// Migrate the global schema, then every active world's schema.
    ///
    /// # Errors
    ///
    /// Stops at the first failing store; see [`MigrateError`].
    pub async fn migrate(&self) -> Result<MigrationReport, MigrateError> {
        self.global
            .run_migrations()
            .await
            .map_err(MigrateError::Global)?;
        info!("global schema migrated");

        let worlds = self.registry.list().await.map_err(MigrateError::Listing)?;

        let mut report = MigrationReport::default();
        for world in worlds.iter().filter(|w| w.is_active) {
            let store = self.registry.connect(world.id).await?;
            store
                .run_migrations()
                .await
                .map_err(|source| MigrateError::World {
                    world_id: world.id,
                    source,
                })?;
            info!(world_id = %world.id, world = %world.name, "world schema migrated");
            report.worlds.push(world.id);
        }
        Ok(report)
    }

    /// Close every store connection.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
        self.global.close().await;
    }
}
