//! Provisioning orchestrator: the forward path of the saga.
//!
//! One call writes one NPC into its world's store and then into the global
//! store, checkpointing the ledger record around each local commit:
//!
//! ```text
//! pending
//!   -> committing-per-world   per-world tx: account, tile claim, settlement, fields
//!   -> committed-per-world    (account + settlement ids recorded)
//!   -> committing-global      global tx: player, ai config
//!   -> committed-global       (player id recorded)
//!   -> completed
//! ```
//!
//! A definite failure of the per-world transaction moves the record to
//! `failed`; nothing exists anywhere. A timeout or a failed `COMMIT` may
//! have landed, so the record stays in `committing-per-world`. Any failure after the per-world commit
//! leaves the record where it stopped, for the reconciler. The orchestrator
//! never retries and never compensates.

use std::time::Duration;

use npc_db::{FieldSeed, GlobalStore, NewPlayer, SettlementSeed, Stockpile};
use npc_types::{
    AccountId, Coordinates, NpcAttributes, PlayerId, PlayerKind, ProvisionedNpc,
    ProvisioningRecord, ProvisioningStatus, SettlementId, WorldId,
};
use tracing::{debug, info, warn};

use crate::config::SettlementConfig;
use crate::error::{ProvisionError, StoreCallError, bounded};
use crate::registry::WorldRegistry;

/// Longest NPC name accepted.
pub const MAX_NAME_LEN: usize = 64;

/// Runs the provisioning saga for single NPCs.
pub struct Orchestrator<'a> {
    global: &'a GlobalStore,
    registry: &'a WorldRegistry,
    settlement: &'a SettlementConfig,
    call_timeout: Duration,
}

impl<'a> Orchestrator<'a> {
    /// Create an orchestrator over the given stores.
    pub const fn new(
        global: &'a GlobalStore,
        registry: &'a WorldRegistry,
        settlement: &'a SettlementConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            global,
            registry,
            settlement,
            call_timeout,
        }
    }

    /// Provision one NPC at `coordinates` in `world_id`.
    ///
    /// # Errors
    ///
    /// See [`ProvisionError`]; each variant documents the state it leaves
    /// behind. Errors raised after the per-world commit carry the record id.
    pub async fn provision(
        &self,
        world_id: WorldId,
        attributes: &NpcAttributes,
        coordinates: Coordinates,
    ) -> Result<ProvisionedNpc, ProvisionError> {
        validate_attributes(attributes)?;
        let world = self.registry.connect(world_id).await?;

        // Step 1: durable intent.
        let mut record = ProvisioningRecord::new(world_id, attributes.clone(), Some(coordinates));
        let record_id = record.id;
        bounded(
            self.call_timeout,
            "ledger insert",
            self.global.insert_record(&record),
        )
        .await
        .map_err(|source| ProvisionError::LedgerUnavailable { record_id, source })?;
        debug!(record_id = %record_id, world_id = %world_id, "provisioning started");

        // Step 2: per-world footprint.
        self.checkpoint(&mut record, ProvisioningStatus::CommittingPerWorld)
            .await?;

        let seed = self.settlement_seed(&record, coordinates);
        let committed = bounded(
            self.call_timeout,
            "per-world commit",
            world.commit_footprint(&seed),
        )
        .await;
        if let Err(source) = committed {
            return Err(self.fail_per_world(&mut record, coordinates, source).await);
        }

        record.per_world_account_id = Some(seed.account_id);
        record.per_world_settlement_id = Some(seed.settlement_id);
        self.checkpoint(&mut record, ProvisioningStatus::CommittedPerWorld)
            .await?;

        // Step 3: global identity.
        self.checkpoint(&mut record, ProvisioningStatus::CommittingGlobal)
            .await?;

        let player = NewPlayer {
            id: PlayerId::new(),
            world_id,
            kind: PlayerKind::Npc,
            name: attributes.name.clone(),
            per_world_account_id: seed.account_id,
            provisioning_id: Some(record_id),
            difficulty: attributes.difficulty,
            personality: attributes.personality,
        };
        bounded(
            self.call_timeout,
            "global commit",
            self.global.insert_player(&player),
        )
        .await
        .map_err(|source| {
            warn!(
                record_id = %record_id,
                error = %source,
                "global write failed after per-world commit; left for reconciler"
            );
            ProvisionError::GlobalWriteFailed { record_id, source }
        })?;

        record.global_player_id = Some(player.id);
        self.checkpoint(&mut record, ProvisioningStatus::CommittedGlobal)
            .await?;

        // Step 4: done.
        self.checkpoint(&mut record, ProvisioningStatus::Completed)
            .await?;

        info!(
            record_id = %record_id,
            world_id = %world_id,
            player_id = %player.id,
            coordinates = %coordinates,
            "npc provisioned"
        );
        Ok(ProvisionedNpc {
            record_id,
            global_player_id: player.id,
            per_world_account_id: seed.account_id,
            per_world_settlement_id: seed.settlement_id,
            coordinates,
        })
    }

    /// Advance the record and persist it, expecting the previous status in
    /// the ledger.
    async fn checkpoint(
        &self,
        record: &mut ProvisioningRecord,
        next: ProvisioningStatus,
    ) -> Result<(), ProvisionError> {
        let expected = record.status;
        record.advance(next)?;
        let record_id = record.id;
        bounded(
            self.call_timeout,
            "ledger save",
            self.global.save_record(record, expected),
        )
        .await
        .map_err(|source| {
            warn!(
                record_id = %record_id,
                status = %next,
                error = %source,
                "ledger checkpoint failed"
            );
            ProvisionError::LedgerUnavailable { record_id, source }
        })
    }

    /// Classify a per-world failure and, when it definitely rolled back,
    /// mark the record failed.
    async fn fail_per_world(
        &self,
        record: &mut ProvisioningRecord,
        coordinates: Coordinates,
        source: StoreCallError,
    ) -> ProvisionError {
        let record_id = record.id;

        // The footprint may exist; the reconciler decides.
        if source.is_outcome_unknown() {
            warn!(record_id = %record_id, error = %source, "per-world commit outcome unknown");
            return ProvisionError::PerWorldWriteFailed { record_id, source };
        }

        let conflict = source.is_tile_conflict();
        record.error_message = Some(format!("per-world write failed: {source}"));
        let expected = record.status;
        if let Err(err) = record.advance(ProvisioningStatus::Failed) {
            return err.into();
        }
        let saved = bounded(
            self.call_timeout,
            "ledger save",
            self.global.save_record(record, expected),
        )
        .await;
        if let Err(err) = saved {
            warn!(record_id = %record_id, error = %err, "could not mark record failed");
        }

        if conflict {
            debug!(record_id = %record_id, coordinates = %coordinates, "tile conflict");
            ProvisionError::TileConflict {
                record_id,
                coordinates,
            }
        } else {
            warn!(record_id = %record_id, error = %source, "per-world write failed");
            ProvisionError::PerWorldWriteFailed { record_id, source }
        }
    }

    fn settlement_seed(
        &self,
        record: &ProvisioningRecord,
        coordinates: Coordinates,
    ) -> SettlementSeed {
        let attributes = &record.attributes;
        let level = attributes.difficulty.starting_field_level();
        let fields = (1..=u8::MAX)
            .zip(&self.settlement.field_layout)
            .map(|(index, field_type)| FieldSeed {
                index,
                field_type: *field_type,
                level,
            })
            .collect();

        SettlementSeed {
            provisioning_id: record.id,
            account_id: AccountId::new(),
            settlement_id: SettlementId::new(),
            account_name: attributes.name.clone(),
            settlement_name: format!("{}'s capital", attributes.name),
            faction: attributes.faction,
            coordinates,
            stockpile: Stockpile {
                wood: self.settlement.wood,
                clay: self.settlement.clay,
                iron: self.settlement.iron,
                crop: self.settlement.crop,
            },
            warehouse_capacity: self.settlement.warehouse_capacity,
            granary_capacity: self.settlement.granary_capacity,
            population: self.settlement.population,
            fields,
        }
    }
}

/// Reject attributes that cannot be written.
///
/// # Errors
///
/// Returns [`ProvisionError::InvalidAttributes`] for a blank or overlong
/// name.
pub fn validate_attributes(attributes: &NpcAttributes) -> Result<(), ProvisionError> {
    let name = attributes.name.trim();
    if name.is_empty() {
        return Err(ProvisionError::InvalidAttributes(String::from(
            "name must not be blank",
        )));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ProvisionError::InvalidAttributes(format!(
            "name longer than {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}
