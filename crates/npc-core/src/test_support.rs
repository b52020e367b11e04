//! Shared fixture for unit tests: one registered world over in-memory
//! stores.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use chrono::Utc;
use npc_db::{GlobalStore, MemoryGlobalStore, MemoryWorldStore, WorldStore};
use npc_types::{
    Difficulty, Faction, NpcAttributes, Personality, ProvisioningId, ProvisioningRecord,
    WorldDescriptor, WorldId,
};

use crate::config::ProvisionerConfig;
use crate::orchestrator::Orchestrator;
use crate::registry::{WorldConnector, WorldRegistry};

pub(crate) const TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct Fixture {
    pub(crate) global_mem: MemoryGlobalStore,
    pub(crate) world_mem: MemoryWorldStore,
    pub(crate) global: GlobalStore,
    pub(crate) registry: WorldRegistry,
    pub(crate) config: ProvisionerConfig,
    pub(crate) world: WorldDescriptor,
}

impl Fixture {
    pub(crate) async fn new() -> Self {
        let global_mem = MemoryGlobalStore::new();
        let world_mem = MemoryWorldStore::new();
        let global = GlobalStore::Memory(global_mem.clone());
        let registry = WorldRegistry::new(global.clone(), WorldConnector::Memory, TIMEOUT);
        let world = WorldDescriptor {
            id: WorldId::new(),
            name: String::from("s1"),
            connection_url: String::from("memory://s1"),
            is_active: true,
            created_at: Utc::now(),
        };
        registry.register(&world).await.unwrap();
        registry
            .attach(world.id, WorldStore::Memory(world_mem.clone()))
            .await;
        Self {
            global_mem,
            world_mem,
            global,
            registry,
            config: ProvisionerConfig::default(),
            world,
        }
    }

    pub(crate) const fn world_id(&self) -> WorldId {
        self.world.id
    }

    pub(crate) fn orchestrator(&self) -> Orchestrator<'_> {
        Orchestrator::new(
            &self.global,
            &self.registry,
            &self.config.settlement,
            TIMEOUT,
        )
    }

    pub(crate) async fn record(&self, id: ProvisioningId) -> ProvisioningRecord {
        self.global.get_record(id).await.unwrap().unwrap()
    }
}

pub(crate) fn attrs() -> NpcAttributes {
    NpcAttributes {
        name: String::from("Vercingetorix"),
        faction: Faction::Gauls,
        difficulty: Difficulty::Hard,
        personality: Personality::Aggressive,
    }
}
