//! End-to-end provisioning scenarios through [`Provisioner`] over the
//! in-memory stores.

#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc
)]

use chrono::Utc;
use npc_core::{ProvisionError, Provisioner, ProvisionerConfig, WorldConnector};
use npc_db::{GlobalFault, GlobalStore, MemoryGlobalStore, MemoryWorldStore, WorldStore};
use npc_types::{
    Coordinates, Difficulty, Faction, NpcAttributes, Personality, PlacementStrategy,
    ProvisioningStatus, WorldDescriptor, WorldId,
};

struct Harness {
    service: Provisioner,
    global: MemoryGlobalStore,
    world: MemoryWorldStore,
    world_id: WorldId,
}

async fn harness() -> Harness {
    let mut config = ProvisionerConfig::default();
    config.reconciler.max_age_secs = 0;

    let global = MemoryGlobalStore::new();
    let world = MemoryWorldStore::new();
    let service = Provisioner::new(
        config,
        GlobalStore::Memory(global.clone()),
        WorldConnector::Memory,
    );

    let descriptor = WorldDescriptor {
        id: WorldId::new(),
        name: String::from("ts1"),
        connection_url: String::from("memory://ts1"),
        is_active: true,
        created_at: Utc::now(),
    };
    service.register_world(&descriptor).await.unwrap();
    service
        .registry()
        .attach(descriptor.id, WorldStore::Memory(world.clone()))
        .await;

    Harness {
        service,
        global,
        world,
        world_id: descriptor.id,
    }
}

fn attributes(name: &str) -> NpcAttributes {
    NpcAttributes {
        name: name.to_owned(),
        faction: Faction::Teutons,
        difficulty: Difficulty::Medium,
        personality: Personality::Economic,
    }
}

#[tokio::test]
async fn create_npc_allocates_and_links_both_stores() {
    let h = harness().await;
    let npc = h
        .service
        .create_npc(h.world_id, &attributes("Arminius"), None)
        .await
        .unwrap();

    let record = h.service.show(npc.record_id).await.unwrap();
    assert_eq!(record.status, ProvisioningStatus::Completed);
    assert!(record.is_fully_linked());
    assert_eq!(record.coordinates, Some(npc.coordinates));
    assert_eq!(h.world.counts().await.occupied_tiles, 1);
    assert_eq!(h.world.tile_settlement(npc.coordinates).await, Some(npc.per_world_settlement_id));
    assert_eq!(
        h.global.ai_config(npc.global_player_id).await,
        Some((Difficulty::Medium, Personality::Economic))
    );
}

#[tokio::test]
async fn explicit_location_is_used_and_duplicate_fails() {
    let h = harness().await;
    let tile = Coordinates::new(42, -17);
    let first = h
        .service
        .create_npc(h.world_id, &attributes("Boudica"), Some(tile))
        .await
        .unwrap();
    assert_eq!(first.coordinates, tile);

    let err = h
        .service
        .create_npc(h.world_id, &attributes("Cartimandua"), Some(tile))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::TileConflict { .. }));

    let failed = h.service.show(err.record_id().unwrap()).await.unwrap();
    assert_eq!(failed.status, ProvisioningStatus::Failed);
    assert_eq!(h.world.counts().await.accounts, 1);
}

#[tokio::test]
async fn crash_after_world_commit_is_compensated() {
    let h = harness().await;
    h.global.fail_next(GlobalFault::PlayerInsert, 1);

    let err = h
        .service
        .create_npc(h.world_id, &attributes("Ambiorix"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::GlobalWriteFailed { .. }));
    let id = err.record_id().unwrap();
    assert_eq!(
        h.service.show(id).await.unwrap().status,
        ProvisioningStatus::CommittingGlobal
    );
    assert_eq!(h.world.counts().await.occupied_tiles, 1);

    let report = h.service.run_reconciliation().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.cleaned, 1);

    let record = h.service.show(id).await.unwrap();
    assert_eq!(record.status, ProvisioningStatus::Failed);
    assert!(!record.has_per_world_ids());
    let counts = h.world.counts().await;
    assert_eq!(counts.accounts, 0);
    assert_eq!(counts.occupied_tiles, 0);

    let again = h.service.run_reconciliation().await.unwrap();
    assert_eq!(again.processed, 0);
}

#[tokio::test]
async fn bulk_spawn_defers_and_runs_nothing_early() {
    let h = harness().await;
    let outcome = h
        .service
        .spawn_bulk(h.world_id, 10, "gradual", PlacementStrategy::KingdomClustering)
        .await
        .unwrap();
    assert_eq!(outcome.instant.provisioned_count(), 2);
    assert_eq!(outcome.deferred.len(), 4);
    assert_eq!(h.world.counts().await.accounts, 2);

    // The earliest batch is a day out.
    let report = h.service.run_due_batches().await.unwrap();
    assert_eq!(report.batches, 0);

    let completed = h
        .service
        .list(Some(ProvisioningStatus::Completed), 100)
        .await
        .unwrap();
    assert_eq!(completed.len(), 2);
}

#[tokio::test]
async fn inactive_world_is_refused() {
    let h = harness().await;
    let mut descriptor = h.service.registry().describe(h.world_id).await.unwrap();
    descriptor.is_active = false;
    h.service.register_world(&descriptor).await.unwrap();

    let err = h
        .service
        .create_npc(h.world_id, &attributes("Caratacus"), Some(Coordinates::new(30, 30)))
        .await
        .unwrap_err();
    assert!(err.is_world_unavailable());
    assert!(h.service.plan_batches(h.world_id, 10, "instant").await.is_err());
}

#[tokio::test]
async fn migrate_touches_only_active_worlds() {
    let h = harness().await;
    let report = h.service.migrate().await.unwrap();
    assert_eq!(report.worlds, vec![h.world_id]);
    h.service.shutdown().await;
    assert_eq!(h.service.registry().open_count().await, 0);
}
