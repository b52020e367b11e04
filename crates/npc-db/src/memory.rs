//! In-memory store backends.
//!
//! [`MemoryGlobalStore`] and [`MemoryWorldStore`] implement the same
//! operations as the `PostgreSQL` stores with the same transactional
//! semantics: every multi-row write is applied to a draft copy of the state
//! and swapped in only if every step succeeds. The saga and recovery-path
//! tests run against them.
//!
//! Both stores accept injected failures ([`GlobalFault`], [`WorldFault`]) so
//! callers can exercise what happens when a step fails mid-transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use npc_types::{
    AccountId, Coordinates, Difficulty, Personality, PlayerId, ProvisioningId, ProvisioningRecord,
    ProvisioningStatus, SettlementId, SpawnBatchId, WorldDescriptor, WorldId,
};
use tokio::sync::Mutex;

use crate::batch_store::{BatchStatus, SpawnBatchRecord};
use crate::error::DbError;
use crate::player_store::{NewPlayer, PlayerRecord, PlayerRemoval};
use crate::settlement_store::{FieldSeed, FootprintRemoval, SettlementSeed, WorldFootprint};

/// Decrement a fault counter. Returns `true` if a failure should fire.
fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// =========================================================================
// Global store
// =========================================================================

/// Operations of the in-memory global store that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalFault {
    /// Creating a provisioning record.
    RecordInsert,
    /// Updating a provisioning record.
    RecordSave,
    /// Inserting a player with its AI configuration (fails after the player
    /// row, before the AI row).
    PlayerInsert,
    /// Deleting a player with its AI configuration (fails after the AI row,
    /// before the player row).
    PlayerDelete,
    /// Player lookups.
    PlayerLookup,
    /// Marking a spawn batch done.
    BatchFinish,
}

#[derive(Debug, Default)]
struct GlobalFaults {
    record_insert: AtomicU32,
    record_save: AtomicU32,
    player_insert: AtomicU32,
    player_delete: AtomicU32,
    player_lookup: AtomicU32,
    batch_finish: AtomicU32,
}

impl GlobalFaults {
    const fn counter(&self, fault: GlobalFault) -> &AtomicU32 {
        match fault {
            GlobalFault::RecordInsert => &self.record_insert,
            GlobalFault::RecordSave => &self.record_save,
            GlobalFault::PlayerInsert => &self.player_insert,
            GlobalFault::PlayerDelete => &self.player_delete,
            GlobalFault::PlayerLookup => &self.player_lookup,
            GlobalFault::BatchFinish => &self.batch_finish,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AiConfigRow {
    difficulty: Difficulty,
    personality: Personality,
}

#[derive(Debug, Clone, Default)]
struct GlobalState {
    worlds: BTreeMap<WorldId, WorldDescriptor>,
    records: BTreeMap<ProvisioningId, ProvisioningRecord>,
    players: BTreeMap<PlayerId, PlayerRecord>,
    ai_configs: BTreeMap<PlayerId, AiConfigRow>,
    batches: BTreeMap<SpawnBatchId, SpawnBatchRecord>,
    mutations: u64,
}

impl GlobalState {
    const fn touch(&mut self) {
        self.mutations = self.mutations.saturating_add(1);
    }
}

/// Row counts of a [`MemoryGlobalStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalCounts {
    /// Provisioning records.
    pub records: usize,
    /// Player identities.
    pub players: usize,
    /// AI configurations.
    pub ai_configs: usize,
    /// Spawn batches.
    pub batches: usize,
    /// Committed write operations so far.
    pub mutations: u64,
}

/// In-memory global store. Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryGlobalStore {
    state: Arc<Mutex<GlobalState>>,
    faults: Arc<GlobalFaults>,
}

impl MemoryGlobalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `fault` fail.
    pub fn fail_next(&self, fault: GlobalFault, times: u32) {
        self.faults.counter(fault).store(times, Ordering::SeqCst);
    }

    /// Current row counts.
    pub async fn counts(&self) -> GlobalCounts {
        let state = self.state.lock().await;
        GlobalCounts {
            records: state.records.len(),
            players: state.players.len(),
            ai_configs: state.ai_configs.len(),
            batches: state.batches.len(),
            mutations: state.mutations,
        }
    }

    /// AI configuration of a player, if the row exists.
    pub async fn ai_config(&self, player_id: PlayerId) -> Option<(Difficulty, Personality)> {
        self.state
            .lock()
            .await
            .ai_configs
            .get(&player_id)
            .map(|row| (row.difficulty, row.personality))
    }

    pub(crate) async fn insert_record(&self, record: &ProvisioningRecord) -> Result<(), DbError> {
        if take_fault(self.faults.counter(GlobalFault::RecordInsert)) {
            return Err(DbError::Injected("provisioning record insert"));
        }
        let mut state = self.state.lock().await;
        if !state.worlds.contains_key(&record.world_id) {
            return Err(DbError::NotFound(format!("world {}", record.world_id)));
        }
        state.records.insert(record.id, record.clone());
        state.touch();
        Ok(())
    }

    pub(crate) async fn save_record(
        &self,
        record: &ProvisioningRecord,
        expected: ProvisioningStatus,
    ) -> Result<(), DbError> {
        if take_fault(self.faults.counter(GlobalFault::RecordSave)) {
            return Err(DbError::Injected("provisioning record save"));
        }
        let mut state = self.state.lock().await;
        match state.records.get_mut(&record.id) {
            Some(stored) if stored.status == expected => {
                // The attributes and creation time are immutable.
                let attributes = stored.attributes.clone();
                let created_at = stored.created_at;
                *stored = record.clone();
                stored.attributes = attributes;
                stored.created_at = created_at;
            }
            _ => {
                return Err(DbError::StaleRecord {
                    id: record.id,
                    expected,
                });
            }
        }
        state.touch();
        Ok(())
    }

    pub(crate) async fn get_record(&self, id: ProvisioningId) -> Option<ProvisioningRecord> {
        self.state.lock().await.records.get(&id).cloned()
    }

    pub(crate) async fn list_in_flight(
        &self,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Vec<ProvisioningRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<ProvisioningRecord> = state
            .records
            .values()
            .filter(|r| !r.status.is_terminal() && r.updated_at < updated_before)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.updated_at, r.id));
        records.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        records
    }

    pub(crate) async fn list_records(
        &self,
        status: Option<ProvisioningStatus>,
        limit: u32,
    ) -> Vec<ProvisioningRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<ProvisioningRecord> = state
            .records
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        records.sort_by_key(|r| core::cmp::Reverse((r.created_at, r.id)));
        records.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        records
    }

    pub(crate) async fn insert_player(&self, player: &NewPlayer) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        let mut draft = state.clone();

        if !draft.worlds.contains_key(&player.world_id) {
            return Err(DbError::NotFound(format!("world {}", player.world_id)));
        }
        let duplicate = draft.players.values().any(|p| {
            p.id == player.id
                || (p.world_id == player.world_id
                    && p.per_world_account_id == player.per_world_account_id)
        });
        if duplicate {
            return Err(DbError::Config(format!(
                "player for account {} already exists",
                player.per_world_account_id
            )));
        }
        draft.players.insert(
            player.id,
            PlayerRecord {
                id: player.id,
                world_id: player.world_id,
                kind: player.kind,
                name: player.name.clone(),
                per_world_account_id: player.per_world_account_id,
                provisioning_id: player.provisioning_id,
                created_at: Utc::now(),
            },
        );

        if take_fault(self.faults.counter(GlobalFault::PlayerInsert)) {
            return Err(DbError::Injected("ai config insert"));
        }
        draft.ai_configs.insert(
            player.id,
            AiConfigRow {
                difficulty: player.difficulty,
                personality: player.personality,
            },
        );

        draft.touch();
        *state = draft;
        Ok(())
    }

    pub(crate) async fn get_player(&self, id: PlayerId) -> Result<Option<PlayerRecord>, DbError> {
        if take_fault(self.faults.counter(GlobalFault::PlayerLookup)) {
            return Err(DbError::Injected("player lookup"));
        }
        Ok(self.state.lock().await.players.get(&id).cloned())
    }

    pub(crate) async fn find_player_by_provisioning(
        &self,
        provisioning_id: ProvisioningId,
    ) -> Result<Option<PlayerRecord>, DbError> {
        if take_fault(self.faults.counter(GlobalFault::PlayerLookup)) {
            return Err(DbError::Injected("player lookup"));
        }
        let state = self.state.lock().await;
        Ok(state
            .players
            .values()
            .filter(|p| p.provisioning_id == Some(provisioning_id))
            .min_by_key(|p| p.created_at)
            .cloned())
    }

    pub(crate) async fn find_player_by_account(
        &self,
        world_id: WorldId,
        account_id: AccountId,
    ) -> Result<Option<PlayerRecord>, DbError> {
        if take_fault(self.faults.counter(GlobalFault::PlayerLookup)) {
            return Err(DbError::Injected("player lookup"));
        }
        let state = self.state.lock().await;
        Ok(state
            .players
            .values()
            .find(|p| p.world_id == world_id && p.per_world_account_id == account_id)
            .cloned())
    }

    pub(crate) async fn delete_player(&self, id: PlayerId) -> Result<PlayerRemoval, DbError> {
        let mut state = self.state.lock().await;
        let mut draft = state.clone();

        let ai_configs = u64::from(draft.ai_configs.remove(&id).is_some());
        if take_fault(self.faults.counter(GlobalFault::PlayerDelete)) {
            return Err(DbError::Injected("player delete"));
        }
        let players = u64::from(draft.players.remove(&id).is_some());

        draft.touch();
        *state = draft;
        Ok(PlayerRemoval {
            ai_configs,
            players,
        })
    }

    pub(crate) async fn upsert_world(&self, world: &WorldDescriptor) {
        let mut state = self.state.lock().await;
        let created_at = state
            .worlds
            .get(&world.id)
            .map_or(world.created_at, |w| w.created_at);
        let mut stored = world.clone();
        stored.created_at = created_at;
        state.worlds.insert(world.id, stored);
        state.touch();
    }

    pub(crate) async fn get_world(&self, id: WorldId) -> Option<WorldDescriptor> {
        self.state.lock().await.worlds.get(&id).cloned()
    }

    pub(crate) async fn list_worlds(&self) -> Vec<WorldDescriptor> {
        let state = self.state.lock().await;
        let mut worlds: Vec<WorldDescriptor> = state.worlds.values().cloned().collect();
        worlds.sort_by_key(|w| (w.created_at, w.id));
        worlds
    }

    pub(crate) async fn insert_batches(&self, batches: &[SpawnBatchRecord]) {
        if batches.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        for batch in batches {
            state.batches.insert(batch.id, batch.clone());
        }
        state.touch();
    }

    pub(crate) async fn due_batches(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Vec<SpawnBatchRecord> {
        let state = self.state.lock().await;
        let mut due: Vec<SpawnBatchRecord> = state
            .batches
            .values()
            .filter(|b| b.is_claimable(now, stale_before))
            .cloned()
            .collect();
        due.sort_by_key(|b| (b.due_at, b.id));
        due.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        due
    }

    pub(crate) async fn claim_batch(
        &self,
        id: SpawnBatchId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> bool {
        let mut state = self.state.lock().await;
        let claimed = match state.batches.get_mut(&id) {
            Some(batch) if batch.is_claimable(now, stale_before) => {
                batch.status = BatchStatus::Running;
                batch.claimed_at = Some(now);
                batch.attempts = batch.attempts.saturating_add(1);
                true
            }
            _ => false,
        };
        if claimed {
            state.touch();
        }
        claimed
    }

    pub(crate) async fn finish_batch(
        &self,
        id: SpawnBatchId,
        provisioned: u32,
        failed: u32,
    ) -> Result<(), DbError> {
        if take_fault(self.faults.counter(GlobalFault::BatchFinish)) {
            return Err(DbError::Injected("spawn batch finish"));
        }
        let mut state = self.state.lock().await;
        let running = state
            .batches
            .get_mut(&id)
            .filter(|b| b.status == BatchStatus::Running);
        if let Some(batch) = running {
            batch.status = BatchStatus::Done;
            batch.provisioned = provisioned;
            batch.failed = failed;
            batch.executed_at = Some(Utc::now());
            state.touch();
        }
        Ok(())
    }

    pub(crate) async fn batches_for_world(&self, world_id: WorldId) -> Vec<SpawnBatchRecord> {
        let state = self.state.lock().await;
        let mut batches: Vec<SpawnBatchRecord> = state
            .batches
            .values()
            .filter(|b| b.world_id == world_id)
            .cloned()
            .collect();
        batches.sort_by_key(|b| (b.due_at, b.id));
        batches
    }
}

// =========================================================================
// Per-world store
// =========================================================================

/// Operations of the in-memory per-world store that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldFault {
    /// Footprint commit (fails after the account and tile, before the
    /// settlement).
    Commit,
    /// Footprint commit that applies the whole footprint and then reports
    /// [`DbError::CommitOutcomeUnknown`], as a connection lost during
    /// `COMMIT` would.
    CommitUnacknowledged,
    /// Footprint removal (fails after the fields, before the settlement).
    Cleanup,
    /// Footprint probes.
    Probe,
    /// Occupied-tile scans.
    TileScan,
}

#[derive(Debug, Default)]
struct WorldFaults {
    commit: AtomicU32,
    commit_unacknowledged: AtomicU32,
    cleanup: AtomicU32,
    probe: AtomicU32,
    tile_scan: AtomicU32,
}

impl WorldFaults {
    const fn counter(&self, fault: WorldFault) -> &AtomicU32 {
        match fault {
            WorldFault::Commit => &self.commit,
            WorldFault::CommitUnacknowledged => &self.commit_unacknowledged,
            WorldFault::Cleanup => &self.cleanup,
            WorldFault::Probe => &self.probe,
            WorldFault::TileScan => &self.tile_scan,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AccountRow {
    provisioning_id: Option<ProvisioningId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SettlementRow {
    account_id: AccountId,
    coordinates: Coordinates,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TileRow {
    occupied: bool,
    settlement_id: Option<SettlementId>,
}

#[derive(Debug, Clone, Default)]
struct WorldState {
    accounts: BTreeMap<AccountId, AccountRow>,
    settlements: BTreeMap<SettlementId, SettlementRow>,
    fields: BTreeMap<(SettlementId, u8), FieldSeed>,
    tiles: BTreeMap<Coordinates, TileRow>,
    mutations: u64,
}

impl WorldState {
    const fn touch(&mut self) {
        self.mutations = self.mutations.saturating_add(1);
    }
}

/// Row counts of a [`MemoryWorldStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorldCounts {
    /// Accounts.
    pub accounts: usize,
    /// Settlements.
    pub settlements: usize,
    /// Resource fields.
    pub fields: usize,
    /// Occupied tiles.
    pub occupied_tiles: usize,
    /// Committed write operations so far.
    pub mutations: u64,
}

/// In-memory per-world store. Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryWorldStore {
    state: Arc<Mutex<WorldState>>,
    faults: Arc<WorldFaults>,
}

impl MemoryWorldStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `fault` fail.
    pub fn fail_next(&self, fault: WorldFault, times: u32) {
        self.faults.counter(fault).store(times, Ordering::SeqCst);
    }

    /// Mark a tile occupied without a settlement (terrain, oases, players
    /// created outside provisioning).
    pub async fn occupy_tile(&self, tile: Coordinates) {
        let mut state = self.state.lock().await;
        state.tiles.entry(tile).or_default().occupied = true;
        state.touch();
    }

    /// Current row counts.
    pub async fn counts(&self) -> WorldCounts {
        let state = self.state.lock().await;
        WorldCounts {
            accounts: state.accounts.len(),
            settlements: state.settlements.len(),
            fields: state.fields.len(),
            occupied_tiles: state.tiles.values().filter(|t| t.occupied).count(),
            mutations: state.mutations,
        }
    }

    /// Owner account of a settlement, if both exist.
    pub async fn settlement_owner(&self, settlement_id: SettlementId) -> Option<AccountId> {
        let state = self.state.lock().await;
        state
            .settlements
            .get(&settlement_id)
            .map(|s| s.account_id)
            .filter(|owner| state.accounts.contains_key(owner))
    }

    /// Settlement bound to a tile, if any.
    pub async fn tile_settlement(&self, tile: Coordinates) -> Option<SettlementId> {
        self.state
            .lock()
            .await
            .tiles
            .get(&tile)
            .and_then(|t| t.settlement_id)
    }

    pub(crate) async fn commit_footprint(&self, seed: &SettlementSeed) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        let mut draft = state.clone();

        if draft.accounts.contains_key(&seed.account_id) {
            return Err(DbError::Config(format!(
                "account {} already exists",
                seed.account_id
            )));
        }
        let linked = draft
            .accounts
            .values()
            .any(|a| a.provisioning_id == Some(seed.provisioning_id));
        if linked {
            return Err(DbError::Config(format!(
                "provisioning {} already has an account",
                seed.provisioning_id
            )));
        }
        draft.accounts.insert(
            seed.account_id,
            AccountRow {
                provisioning_id: Some(seed.provisioning_id),
            },
        );

        let tile = draft.tiles.entry(seed.coordinates).or_default();
        if tile.occupied {
            return Err(DbError::TileOccupied(seed.coordinates));
        }
        tile.occupied = true;

        if take_fault(self.faults.counter(WorldFault::Commit)) {
            return Err(DbError::Injected("settlement insert"));
        }

        draft.settlements.insert(
            seed.settlement_id,
            SettlementRow {
                account_id: seed.account_id,
                coordinates: seed.coordinates,
            },
        );
        for field in &seed.fields {
            draft.fields.insert((seed.settlement_id, field.index), *field);
        }
        if let Some(tile) = draft.tiles.get_mut(&seed.coordinates) {
            tile.settlement_id = Some(seed.settlement_id);
        }

        draft.touch();
        *state = draft;
        if take_fault(self.faults.counter(WorldFault::CommitUnacknowledged)) {
            return Err(DbError::CommitOutcomeUnknown(sqlx::Error::Io(
                std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection lost during commit",
                ),
            )));
        }
        Ok(())
    }

    pub(crate) async fn probe_footprint(
        &self,
        provisioning_id: ProvisioningId,
        account_id: Option<AccountId>,
        settlement_id: Option<SettlementId>,
    ) -> Result<WorldFootprint, DbError> {
        if take_fault(self.faults.counter(WorldFault::Probe)) {
            return Err(DbError::Injected("footprint probe"));
        }
        let state = self.state.lock().await;

        let account = match account_id {
            Some(id) => state.accounts.contains_key(&id).then_some(id),
            None => state
                .accounts
                .iter()
                .find(|(_, a)| a.provisioning_id == Some(provisioning_id))
                .map(|(id, _)| *id),
        };

        let settlement = match (settlement_id, account) {
            (Some(id), _) => state.settlements.get(&id).map(|s| (id, s.coordinates)),
            (None, Some(owner)) => state
                .settlements
                .iter()
                .find(|(_, s)| s.account_id == owner)
                .map(|(id, s)| (*id, s.coordinates)),
            (None, None) => None,
        };

        Ok(WorldFootprint {
            account_id: account,
            settlement_id: settlement.map(|(id, _)| id),
            coordinates: settlement.map(|(_, c)| c),
        })
    }

    pub(crate) async fn remove_footprint(
        &self,
        account_id: Option<AccountId>,
        settlement_id: Option<SettlementId>,
    ) -> Result<FootprintRemoval, DbError> {
        let mut state = self.state.lock().await;
        let mut draft = state.clone();

        let mut settlements: BTreeSet<SettlementId> = settlement_id.into_iter().collect();
        if let Some(owner) = account_id {
            settlements.extend(
                draft
                    .settlements
                    .iter()
                    .filter(|(_, s)| s.account_id == owner)
                    .map(|(id, _)| *id),
            );
        }

        let mut tiles_freed: u64 = 0;
        for tile in draft.tiles.values_mut() {
            if tile.settlement_id.is_some_and(|id| settlements.contains(&id)) {
                tile.occupied = false;
                tile.settlement_id = None;
                tiles_freed = tiles_freed.saturating_add(1);
            }
        }

        let before = draft.fields.len();
        draft.fields.retain(|(owner, _), _| !settlements.contains(owner));
        let fields = u64::try_from(before.saturating_sub(draft.fields.len())).unwrap_or(u64::MAX);

        if take_fault(self.faults.counter(WorldFault::Cleanup)) {
            return Err(DbError::Injected("settlement delete"));
        }

        let mut deleted_settlements: u64 = 0;
        for id in &settlements {
            if draft.settlements.remove(id).is_some() {
                deleted_settlements = deleted_settlements.saturating_add(1);
            }
        }

        let accounts = account_id.map_or(0, |id| u64::from(draft.accounts.remove(&id).is_some()));

        draft.touch();
        *state = draft;
        Ok(FootprintRemoval {
            tiles_freed,
            fields,
            settlements: deleted_settlements,
            accounts,
        })
    }

    pub(crate) async fn occupied_tiles(
        &self,
        center: Coordinates,
        radius: u32,
    ) -> Result<BTreeSet<Coordinates>, DbError> {
        if take_fault(self.faults.counter(WorldFault::TileScan)) {
            return Err(DbError::Injected("tile scan"));
        }
        let radius = u64::from(radius);
        let state = self.state.lock().await;
        Ok(state
            .tiles
            .iter()
            .filter(|(c, t)| {
                t.occupied
                    && i64::from(c.x).abs_diff(i64::from(center.x)) <= radius
                    && i64::from(c.y).abs_diff(i64::from(center.y)) <= radius
            })
            .map(|(c, _)| *c)
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use npc_types::{Faction, FieldType};

    use super::*;
    use crate::settlement_store::Stockpile;

    fn seed(coordinates: Coordinates) -> SettlementSeed {
        SettlementSeed {
            provisioning_id: ProvisioningId::new(),
            account_id: AccountId::new(),
            settlement_id: SettlementId::new(),
            account_name: String::from("Natar"),
            settlement_name: String::from("Natar's capital"),
            faction: Faction::Romans,
            coordinates,
            stockpile: Stockpile {
                wood: 750,
                clay: 750,
                iron: 750,
                crop: 750,
            },
            warehouse_capacity: 800,
            granary_capacity: 800,
            population: 2,
            fields: vec![
                FieldSeed {
                    index: 1,
                    field_type: FieldType::Wood,
                    level: 0,
                },
                FieldSeed {
                    index: 2,
                    field_type: FieldType::Crop,
                    level: 0,
                },
            ],
        }
    }

    #[tokio::test]
    async fn commit_writes_whole_footprint() {
        let store = MemoryWorldStore::new();
        let s = seed(Coordinates::new(5, 5));
        store.commit_footprint(&s).await.unwrap();

        let counts = store.counts().await;
        assert_eq!(counts.accounts, 1);
        assert_eq!(counts.settlements, 1);
        assert_eq!(counts.fields, 2);
        assert_eq!(counts.occupied_tiles, 1);
        assert_eq!(store.tile_settlement(s.coordinates).await, Some(s.settlement_id));
    }

    #[tokio::test]
    async fn second_claim_of_tile_is_rejected() {
        let store = MemoryWorldStore::new();
        store.commit_footprint(&seed(Coordinates::new(1, 1))).await.unwrap();
        let err = store
            .commit_footprint(&seed(Coordinates::new(1, 1)))
            .await
            .unwrap_err();
        assert!(err.is_tile_conflict());
        assert_eq!(store.counts().await.accounts, 1);
    }

    #[tokio::test]
    async fn failed_commit_leaves_no_rows() {
        let store = MemoryWorldStore::new();
        store.fail_next(WorldFault::Commit, 1);
        assert!(store.commit_footprint(&seed(Coordinates::new(2, 2))).await.is_err());

        let counts = store.counts().await;
        assert_eq!(counts.accounts, 0);
        assert_eq!(counts.occupied_tiles, 0);
        assert_eq!(counts.mutations, 0);
    }

    #[test]
    fn store_handles_format_for_debugging() {
        let world = format!("{:?}", crate::WorldStore::Memory(MemoryWorldStore::new()));
        assert!(world.starts_with("Memory"));
        let global = format!("{:?}", crate::GlobalStore::Memory(MemoryGlobalStore::new()));
        assert!(global.starts_with("Memory"));
    }

    #[tokio::test]
    async fn unacknowledged_commit_keeps_rows() {
        let store = MemoryWorldStore::new();
        let s = seed(Coordinates::new(6, -6));
        store.fail_next(WorldFault::CommitUnacknowledged, 1);

        let err = store.commit_footprint(&s).await.unwrap_err();
        assert!(err.is_outcome_unknown());
        assert!(!err.is_tile_conflict());

        let counts = store.counts().await;
        assert_eq!(counts.accounts, 1);
        assert_eq!(counts.settlements, 1);
        assert_eq!(counts.occupied_tiles, 1);
    }

    #[tokio::test]
    async fn failed_cleanup_rolls_back_field_deletes() {
        let store = MemoryWorldStore::new();
        let s = seed(Coordinates::new(3, 3));
        store.commit_footprint(&s).await.unwrap();

        store.fail_next(WorldFault::Cleanup, 1);
        assert!(
            store
                .remove_footprint(Some(s.account_id), Some(s.settlement_id))
                .await
                .is_err()
        );
        let counts = store.counts().await;
        assert_eq!(counts.fields, 2);
        assert_eq!(counts.occupied_tiles, 1);

        let removal = store
            .remove_footprint(Some(s.account_id), Some(s.settlement_id))
            .await
            .unwrap();
        assert_eq!(removal.tiles_freed, 1);
        assert_eq!(removal.fields, 2);
        assert_eq!(removal.settlements, 1);
        assert_eq!(removal.accounts, 1);
        assert_eq!(store.counts().await.occupied_tiles, 0);
    }

    #[tokio::test]
    async fn probe_finds_footprint_through_linkage() {
        let store = MemoryWorldStore::new();
        let s = seed(Coordinates::new(-4, 7));
        store.commit_footprint(&s).await.unwrap();

        let found = store.probe_footprint(s.provisioning_id, None, None).await.unwrap();
        assert_eq!(found.account_id, Some(s.account_id));
        assert_eq!(found.settlement_id, Some(s.settlement_id));
        assert_eq!(found.coordinates, Some(s.coordinates));

        let missing = store
            .probe_footprint(ProvisioningId::new(), None, None)
            .await
            .unwrap();
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn stale_save_is_rejected() {
        let store = MemoryGlobalStore::new();
        let world = WorldDescriptor {
            id: WorldId::new(),
            name: String::from("s1"),
            connection_url: String::from("memory://s1"),
            is_active: true,
            created_at: Utc::now(),
        };
        store.upsert_world(&world).await;
        let record = ProvisioningRecord::new(
            world.id,
            npc_types::NpcAttributes {
                name: String::from("Natar"),
                faction: Faction::Teutons,
                difficulty: Difficulty::Easy,
                personality: Personality::Balanced,
            },
            None,
        );
        store.insert_record(&record).await.unwrap();

        let mut moved = record.clone();
        moved.advance(ProvisioningStatus::Failed).unwrap();
        store.save_record(&moved, ProvisioningStatus::Pending).await.unwrap();

        let err = store
            .save_record(&moved, ProvisioningStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::StaleRecord { .. }));
    }
}
