//! Batch scheduler: bulk spawns split into an instant part and deferred
//! batches.
//!
//! [`plan`] turns a requested total and a preset into a [`SpawnPlan`]. The
//! instant part is provisioned right away; deferred batches are persisted
//! in the global store, due at world creation plus their day offset, and
//! executed by [`BatchScheduler::run_due_batches`] when an external trigger
//! calls it. A batch still `running` once `spawning.batch_lease_secs` have
//! passed since its claim is claimed and executed again.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use npc_db::{BatchStatus, GlobalStore, SpawnBatchRecord};
use npc_types::{
    Coordinates, Difficulty, Faction, NpcAttributes, Personality, PlacementStrategy, PlannedBatch,
    ProvisionedNpc, ProvisioningId, SpawnBatchId, SpawnPlan, WorldId,
};
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{PresetBatch, PresetConfig, ProvisionerConfig, SpawningConfig};
use crate::error::{ScheduleError, bounded};
use crate::orchestrator::Orchestrator;
use crate::placement::{PlacementAllocator, PlacementParams};
use crate::registry::WorldRegistry;

/// Tries at drawing an unused suffixed name before accepting a repeat.
const SUFFIX_ATTEMPTS: u32 = 16;

/// Names of the presets every deployment has.
pub const BUILTIN_PRESETS: [&str; 3] = ["instant", "gradual", "staggered"];

/// A built-in preset by name.
pub fn builtin_preset(name: &str) -> Option<PresetConfig> {
    let batch = |offset_days, percent| PresetBatch {
        offset_days,
        percent,
    };
    match name {
        "instant" => Some(PresetConfig {
            instant_percent: 100,
            batches: Vec::new(),
        }),
        "gradual" => Some(PresetConfig {
            instant_percent: 20,
            batches: vec![batch(1, 20), batch(2, 20), batch(3, 20), batch(4, 20)],
        }),
        "staggered" => Some(PresetConfig {
            instant_percent: 40,
            batches: vec![batch(3, 30), batch(7, 30)],
        }),
        _ => None,
    }
}

/// Look up a preset, configured presets first.
///
/// # Errors
///
/// Returns [`ScheduleError::UnknownPreset`] or
/// [`ScheduleError::InvalidPreset`].
pub fn resolve_preset(
    name: &str,
    configured: &BTreeMap<String, PresetConfig>,
) -> Result<PresetConfig, ScheduleError> {
    let preset = configured
        .get(name)
        .cloned()
        .or_else(|| builtin_preset(name))
        .ok_or_else(|| ScheduleError::UnknownPreset(name.to_owned()))?;
    preset.check().map_err(|reason| ScheduleError::InvalidPreset {
        name: name.to_owned(),
        reason,
    })?;
    Ok(preset)
}

/// Split `total` according to `preset_name`.
///
/// Each deferred batch gets its share rounded down; the instant part takes
/// the remainder. Batches that round to zero are dropped.
///
/// # Errors
///
/// Returns the errors of [`resolve_preset`], or
/// [`ScheduleError::CountOverflow`].
pub fn plan(
    world_id: WorldId,
    total: u32,
    preset_name: &str,
    configured: &BTreeMap<String, PresetConfig>,
) -> Result<SpawnPlan, ScheduleError> {
    let preset = resolve_preset(preset_name, configured)?;

    let mut batches = Vec::with_capacity(preset.batches.len());
    let mut deferred: u32 = 0;
    for share in &preset.batches {
        let count = u64::from(total)
            .checked_mul(u64::from(share.percent))
            .and_then(|n| n.checked_div(100))
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(ScheduleError::CountOverflow(total))?;
        if count == 0 {
            continue;
        }
        deferred = deferred
            .checked_add(count)
            .ok_or(ScheduleError::CountOverflow(total))?;
        batches.push(PlannedBatch {
            offset_days: share.offset_days,
            count,
        });
    }
    let instant_count = total
        .checked_sub(deferred)
        .ok_or(ScheduleError::CountOverflow(total))?;

    Ok(SpawnPlan {
        world_id,
        preset: preset_name.to_owned(),
        total_count: total,
        instant_count,
        batches,
    })
}

// -----------------------------------------------------------------------
// Attribute generation
// -----------------------------------------------------------------------

/// Random NPC attributes for bulk requests.
///
/// Names are drawn from the pool without repetition; once the pool is used
/// up, names get a numeric suffix.
pub struct NpcGenerator<'a> {
    spawning: &'a SpawningConfig,
    used: BTreeSet<String>,
}

impl<'a> NpcGenerator<'a> {
    /// Create a generator over the configured pools.
    pub const fn new(spawning: &'a SpawningConfig) -> Self {
        Self {
            spawning,
            used: BTreeSet::new(),
        }
    }

    /// Draw one set of attributes.
    pub fn generate<R: Rng + ?Sized>(&mut self, rng: &mut R) -> NpcAttributes {
        let name = self.pick_name(rng);
        let faction = pick(rng, &self.spawning.factions).unwrap_or(Faction::Romans);
        let personality = pick(rng, Personality::ALL).unwrap_or(Personality::Balanced);
        let difficulty = self.pick_difficulty(rng);
        NpcAttributes {
            name,
            faction,
            difficulty,
            personality,
        }
    }

    fn pick_name<R: Rng + ?Sized>(&mut self, rng: &mut R) -> String {
        let available: Vec<&String> = self
            .spawning
            .name_pool
            .iter()
            .filter(|n| !self.used.contains(*n))
            .collect();

        let name = match pick(rng, &available) {
            Some(name) => name.clone(),
            None => self.suffixed_name(rng),
        };
        self.used.insert(name.clone());
        name
    }

    fn suffixed_name<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let base = pick(rng, &self.spawning.name_pool).unwrap_or_else(|| String::from("Natar"));
        let mut candidate = String::new();
        for _ in 0..SUFFIX_ATTEMPTS {
            let suffix: u32 = rng.random_range(100..10_000);
            candidate = format!("{base} {suffix}");
            if !self.used.contains(&candidate) {
                break;
            }
        }
        candidate
    }

    fn pick_difficulty<R: Rng + ?Sized>(&self, rng: &mut R) -> Difficulty {
        let weights = &self.spawning.difficulty_weights;
        let total = weights.values().fold(0u32, |acc, w| acc.saturating_add(*w));
        if total == 0 {
            return Difficulty::Medium;
        }
        let mut roll = rng.random_range(0..total);
        for (difficulty, weight) in weights {
            if roll < *weight {
                return *difficulty;
            }
            roll = roll.saturating_sub(*weight);
        }
        Difficulty::Medium
    }
}

fn pick<R: Rng + ?Sized, T: Clone>(rng: &mut R, items: &[T]) -> Option<T> {
    if items.is_empty() {
        return None;
    }
    let idx = rng.random_range(0..items.len());
    items.get(idx).cloned()
}

// -----------------------------------------------------------------------
// Execution
// -----------------------------------------------------------------------

/// NPCs of a bulk request that were not provisioned for the same reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnFailure {
    /// Ledger record of the attempt, if one was created.
    pub record_id: Option<ProvisioningId>,
    /// NPCs covered: 1 for a provisioning attempt, the whole request when
    /// allocation failed.
    pub count: u32,
    /// Why it failed.
    pub reason: String,
}

/// Results of provisioning a group of NPCs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpawnOutcome {
    /// NPCs that completed.
    pub provisioned: Vec<ProvisionedNpc>,
    /// NPCs that did not.
    pub failures: Vec<SpawnFailure>,
}

impl SpawnOutcome {
    /// Completed count.
    pub fn provisioned_count(&self) -> u32 {
        u32::try_from(self.provisioned.len()).unwrap_or(u32::MAX)
    }

    /// Failed count.
    pub fn failed_count(&self) -> u32 {
        self.failures
            .iter()
            .fold(0u32, |acc, f| acc.saturating_add(f.count))
    }

    fn fail(&mut self, record_id: Option<ProvisioningId>, reason: String) {
        self.failures.push(SpawnFailure {
            record_id,
            count: 1,
            reason,
        });
    }

    fn fail_all(&mut self, count: u32, reason: String) {
        self.failures.push(SpawnFailure {
            record_id: None,
            count,
            reason,
        });
    }
}

/// Results of executing a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    /// The executed plan.
    pub plan: SpawnPlan,
    /// The instant part.
    pub instant: SpawnOutcome,
    /// Deferred batches persisted for later.
    pub deferred: Vec<SpawnBatchRecord>,
}

/// Results of one `run_due_batches` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DueBatchReport {
    /// Batches executed.
    pub batches: u32,
    /// Executed batches taken over from an expired claim (also counted in
    /// `batches`).
    pub reclaimed: u32,
    /// Due batches another runner claimed first.
    pub skipped: u32,
    /// Batches whose claim or outcome could not be written. A batch left
    /// `running` this way is taken over after its lease.
    pub store_errors: u32,
    /// NPCs provisioned across all batches.
    pub provisioned: u32,
    /// NPCs that failed across all batches.
    pub failed: u32,
}

/// Executes spawn plans and due batches.
pub struct BatchScheduler<'a> {
    global: &'a GlobalStore,
    registry: &'a WorldRegistry,
    config: &'a ProvisionerConfig,
}

impl<'a> BatchScheduler<'a> {
    /// Create a scheduler over the given stores.
    pub const fn new(
        global: &'a GlobalStore,
        registry: &'a WorldRegistry,
        config: &'a ProvisionerConfig,
    ) -> Self {
        Self {
            global,
            registry,
            config,
        }
    }

    const fn call_timeout(&self) -> Duration {
        self.config.timeouts.store_call()
    }

    /// Plan a bulk spawn with the configured presets.
    ///
    /// # Errors
    ///
    /// See [`plan`].
    pub fn plan(
        &self,
        world_id: WorldId,
        total: u32,
        preset: &str,
    ) -> Result<SpawnPlan, ScheduleError> {
        plan(world_id, total, preset, &self.config.spawning.presets)
    }

    /// Persist the plan's deferred batches, then provision its instant part.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Registry`] if the world is unknown or
    /// inactive, or [`ScheduleError::Store`] if the batches cannot be
    /// persisted. Individual NPC failures are reported in the outcome.
    pub async fn execute(
        &self,
        plan: &SpawnPlan,
        strategy: PlacementStrategy,
        params: &PlacementParams,
    ) -> Result<BulkOutcome, ScheduleError> {
        let world = self.registry.describe(plan.world_id).await?;
        let now = Utc::now();

        let mut deferred = Vec::with_capacity(plan.batches.len());
        for batch in &plan.batches {
            let due = due_at(world.created_at, batch.offset_days).ok_or_else(|| {
                ScheduleError::InvalidPreset {
                    name: plan.preset.clone(),
                    reason: format!("offset of {} days out of range", batch.offset_days),
                }
            })?;
            deferred.push(SpawnBatchRecord {
                id: SpawnBatchId::new(),
                world_id: plan.world_id,
                preset: plan.preset.clone(),
                strategy,
                count: batch.count,
                due_at: due,
                status: BatchStatus::Pending,
                provisioned: 0,
                failed: 0,
                created_at: now,
                executed_at: None,
                claimed_at: None,
                attempts: 0,
            });
        }

        bounded(
            self.call_timeout(),
            "spawn batch insert",
            self.global.insert_batches(&deferred),
        )
        .await?;

        let instant = self
            .spawn(plan.world_id, plan.instant_count, strategy, params)
            .await;

        info!(
            world_id = %plan.world_id,
            preset = %plan.preset,
            provisioned = instant.provisioned_count(),
            failed = instant.failed_count(),
            deferred_batches = deferred.len(),
            deferred_npcs = plan.deferred_count(),
            "bulk spawn executed"
        );
        Ok(BulkOutcome {
            plan: plan.clone(),
            instant,
            deferred,
        })
    }

    /// Execute every pending batch due at or before `now`, and every
    /// running batch whose lease expired.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Store`] if the due batches cannot be listed.
    /// Claim and finish failures are counted per batch in the report.
    pub async fn run_due_batches(
        &self,
        now: DateTime<Utc>,
    ) -> Result<DueBatchReport, ScheduleError> {
        let limit = self.config.spawning.due_batch_limit;
        let stale_before = TimeDelta::from_std(self.config.spawning.batch_lease())
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let due = bounded(
            self.call_timeout(),
            "due batch scan",
            self.global.due_batches(now, stale_before, limit),
        )
        .await?;

        let params = PlacementParams::from(&self.config.placement);
        let mut report = DueBatchReport::default();
        for batch in due {
            let claimed = bounded(
                self.call_timeout(),
                "spawn batch claim",
                self.global.claim_batch(batch.id, now, stale_before),
            )
            .await;
            match claimed {
                Ok(true) => {}
                Ok(false) => {
                    report.skipped = report.skipped.saturating_add(1);
                    continue;
                }
                Err(err) => {
                    warn!(batch_id = %batch.id, error = %err, "spawn batch claim failed");
                    report.store_errors = report.store_errors.saturating_add(1);
                    continue;
                }
            }
            if batch.status == BatchStatus::Running {
                warn!(
                    batch_id = %batch.id,
                    attempts = batch.attempts,
                    claimed_at = ?batch.claimed_at,
                    "spawn batch lease expired; executing again"
                );
                report.reclaimed = report.reclaimed.saturating_add(1);
            }

            let outcome = self
                .spawn(batch.world_id, batch.count, batch.strategy, &params)
                .await;
            let provisioned = outcome.provisioned_count();
            let failed = outcome.failed_count();
            let finished = bounded(
                self.call_timeout(),
                "spawn batch finish",
                self.global.finish_batch(batch.id, provisioned, failed),
            )
            .await;
            if let Err(err) = finished {
                warn!(
                    batch_id = %batch.id,
                    provisioned,
                    failed,
                    error = %err,
                    "could not record spawn batch outcome"
                );
                report.store_errors = report.store_errors.saturating_add(1);
            }

            info!(
                batch_id = %batch.id,
                world_id = %batch.world_id,
                provisioned,
                failed,
                "spawn batch executed"
            );
            report.batches = report.batches.saturating_add(1);
            report.provisioned = report.provisioned.saturating_add(provisioned);
            report.failed = report.failed.saturating_add(failed);
        }
        Ok(report)
    }

    /// Allocate and provision `count` generated NPCs.
    pub async fn spawn(
        &self,
        world_id: WorldId,
        count: u32,
        strategy: PlacementStrategy,
        params: &PlacementParams,
    ) -> SpawnOutcome {
        let mut outcome = SpawnOutcome::default();
        if count == 0 {
            return outcome;
        }

        let allocator = PlacementAllocator::new(self.registry, self.call_timeout());
        let tiles = match allocator.allocate(world_id, count, strategy, params).await {
            Ok(tiles) => tiles,
            Err(err) => {
                warn!(world_id = %world_id, count, error = %err, "bulk allocation failed");
                outcome.fail_all(count, err.to_string());
                return outcome;
            }
        };

        let attributes: Vec<NpcAttributes> = {
            let mut rng = rand::rng();
            let mut generator = NpcGenerator::new(&self.config.spawning);
            tiles.iter().map(|_| generator.generate(&mut rng)).collect()
        };

        self.provision_at(world_id, &tiles, &attributes, strategy, params, &mut outcome)
            .await;
        outcome
    }

    /// Provision one NPC per tile, re-allocating once on a tile conflict.
    async fn provision_at(
        &self,
        world_id: WorldId,
        tiles: &[Coordinates],
        attributes: &[NpcAttributes],
        strategy: PlacementStrategy,
        params: &PlacementParams,
        outcome: &mut SpawnOutcome,
    ) {
        let orchestrator = Orchestrator::new(
            self.global,
            self.registry,
            &self.config.settlement,
            self.call_timeout(),
        );
        let allocator = PlacementAllocator::new(self.registry, self.call_timeout());
        let retry_params = PlacementParams {
            seed: None,
            ..*params
        };

        for (tile, npc) in tiles.iter().zip(attributes) {
            let first = orchestrator.provision(world_id, npc, *tile).await;
            let result = match first {
                Err(err) if err.is_tile_conflict() => {
                    match allocator.allocate(world_id, 1, strategy, &retry_params).await {
                        Ok(fresh) => match fresh.first() {
                            Some(tile) => orchestrator.provision(world_id, npc, *tile).await,
                            None => Err(err),
                        },
                        Err(placement) => Err(placement.into()),
                    }
                }
                other => other,
            };
            match result {
                Ok(provisioned) => outcome.provisioned.push(provisioned),
                Err(err) => {
                    warn!(world_id = %world_id, error = %err, "bulk provisioning attempt failed");
                    outcome.fail(err.record_id(), err.to_string());
                }
            }
        }
    }
}

fn due_at(world_created: DateTime<Utc>, offset_days: u32) -> Option<DateTime<Utc>> {
    TimeDelta::try_days(i64::from(offset_days)).and_then(|d| world_created.checked_add_signed(d))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use npc_db::GlobalFault;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::test_support::{Fixture, attrs};

    fn no_presets() -> BTreeMap<String, PresetConfig> {
        BTreeMap::new()
    }

    #[test]
    fn builtin_presets_are_consistent() {
        for name in BUILTIN_PRESETS {
            builtin_preset(name).unwrap().check().unwrap();
        }
    }

    #[test]
    fn instant_preset_has_no_batches() {
        let p = plan(WorldId::new(), 12, "instant", &no_presets()).unwrap();
        assert_eq!(p.instant_count, 12);
        assert!(p.batches.is_empty());
    }

    #[test]
    fn gradual_splits_evenly() {
        let p = plan(WorldId::new(), 100, "gradual", &no_presets()).unwrap();
        assert_eq!(p.instant_count, 20);
        assert_eq!(p.batches.len(), 4);
        assert!(p.batches.iter().all(|b| b.count == 20));
        assert_eq!(p.deferred_count(), 80);
    }

    #[test]
    fn instant_part_absorbs_rounding() {
        let p = plan(WorldId::new(), 7, "staggered", &no_presets()).unwrap();
        // 30% of 7 rounds down to 2, twice.
        assert_eq!(p.batches, vec![
            PlannedBatch { offset_days: 3, count: 2 },
            PlannedBatch { offset_days: 7, count: 2 },
        ]);
        assert_eq!(p.instant_count, 3);
    }

    #[test]
    fn zero_share_batches_are_dropped() {
        let p = plan(WorldId::new(), 2, "gradual", &no_presets()).unwrap();
        assert!(p.batches.is_empty());
        assert_eq!(p.instant_count, 2);
    }

    #[test]
    fn configured_preset_overrides_builtin() {
        let presets = BTreeMap::from([(
            String::from("instant"),
            PresetConfig {
                instant_percent: 50,
                batches: vec![PresetBatch {
                    offset_days: 2,
                    percent: 50,
                }],
            },
        )]);
        let p = plan(WorldId::new(), 10, "instant", &presets).unwrap();
        assert_eq!(p.instant_count, 5);
        assert_eq!(p.deferred_count(), 5);
    }

    #[test]
    fn unknown_preset_is_rejected() {
        let err = plan(WorldId::new(), 10, "blitz", &no_presets()).unwrap_err();
        assert!(matches!(err, ScheduleError::UnknownPreset(name) if name == "blitz"));
    }

    #[test]
    fn generator_uses_each_pool_name_once() {
        let spawning = SpawningConfig {
            name_pool: vec![String::from("Ada"), String::from("Bo")],
            ..SpawningConfig::default()
        };
        let mut generator = NpcGenerator::new(&spawning);
        let mut rng = StdRng::seed_from_u64(4);
        let names: Vec<String> = (0..4).map(|_| generator.generate(&mut rng).name).collect();

        assert!(names.iter().take(2).any(|n| n == "Ada"));
        assert!(names.iter().take(2).any(|n| n == "Bo"));
        let distinct: BTreeSet<&String> = names.iter().collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn generator_respects_difficulty_weights() {
        let spawning = SpawningConfig {
            difficulty_weights: BTreeMap::from([(Difficulty::Expert, 1), (Difficulty::Easy, 0)]),
            factions: vec![Faction::Teutons],
            ..SpawningConfig::default()
        };
        let mut generator = NpcGenerator::new(&spawning);
        let mut rng = StdRng::seed_from_u64(8);
        for _ in 0..20 {
            let a = generator.generate(&mut rng);
            assert_eq!(a.difficulty, Difficulty::Expert);
            assert_eq!(a.faction, Faction::Teutons);
        }
    }

    #[tokio::test]
    async fn execute_provisions_instant_part_and_persists_batches() {
        let fx = Fixture::new().await;
        let scheduler = BatchScheduler::new(&fx.global, &fx.registry, &fx.config);
        let p = scheduler.plan(fx.world_id(), 10, "staggered").unwrap();

        let outcome = scheduler
            .execute(&p, PlacementStrategy::QuadrantBalanced, &PlacementParams::default())
            .await
            .unwrap();
        assert_eq!(outcome.instant.provisioned_count(), 4);
        assert_eq!(outcome.instant.failed_count(), 0);
        assert_eq!(outcome.deferred.len(), 2);
        assert_eq!(fx.world_mem.counts().await.occupied_tiles, 4);

        let stored = fx.global.batches_for_world(fx.world_id()).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(
            stored.first().unwrap().due_at,
            due_at(fx.world.created_at, 3).unwrap()
        );
        assert!(stored.iter().all(|b| b.status == BatchStatus::Pending));
    }

    #[tokio::test]
    async fn due_batches_run_once() {
        let fx = Fixture::new().await;
        let scheduler = BatchScheduler::new(&fx.global, &fx.registry, &fx.config);
        let p = scheduler.plan(fx.world_id(), 10, "staggered").unwrap();
        scheduler
            .execute(&p, PlacementStrategy::RandomScatter, &PlacementParams::default())
            .await
            .unwrap();

        // Only the day-3 batch is due on day 4.
        let day_four = due_at(fx.world.created_at, 4).unwrap();
        let report = scheduler.run_due_batches(day_four).await.unwrap();
        assert_eq!(report.batches, 1);
        assert_eq!(report.provisioned, 3);
        assert_eq!(fx.world_mem.counts().await.occupied_tiles, 7);

        let again = scheduler.run_due_batches(day_four).await.unwrap();
        assert_eq!(again, DueBatchReport::default());

        let stored = fx.global.batches_for_world(fx.world_id()).await.unwrap();
        let done: Vec<_> = stored.iter().filter(|b| b.status == BatchStatus::Done).collect();
        assert_eq!(done.len(), 1);
        assert_eq!(done.first().unwrap().provisioned, 3);
        assert!(done.first().unwrap().executed_at.is_some());
    }

    #[tokio::test]
    async fn abandoned_batch_is_taken_over_after_its_lease() {
        let fx = Fixture::new().await;
        let scheduler = BatchScheduler::new(&fx.global, &fx.registry, &fx.config);
        let p = scheduler.plan(fx.world_id(), 10, "staggered").unwrap();
        scheduler
            .execute(&p, PlacementStrategy::RandomScatter, &PlacementParams::default())
            .await
            .unwrap();
        let day_four = due_at(fx.world.created_at, 4).unwrap();
        let lease = TimeDelta::from_std(fx.config.spawning.batch_lease()).unwrap();

        // A runner claimed the day-3 batch and died before provisioning.
        let stale_before = day_four.checked_sub_signed(lease).unwrap();
        let due = fx.global.due_batches(day_four, stale_before, 10).await.unwrap();
        let abandoned = due.first().unwrap().id;
        assert!(fx.global.claim_batch(abandoned, day_four, stale_before).await.unwrap());

        // Within the lease nobody touches it.
        let report = scheduler.run_due_batches(day_four).await.unwrap();
        assert_eq!(report, DueBatchReport::default());

        let later = day_four.checked_add_signed(lease).unwrap();
        let report = scheduler.run_due_batches(later).await.unwrap();
        assert_eq!(report.batches, 1);
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.provisioned, 3);

        let stored = fx.global.batches_for_world(fx.world_id()).await.unwrap();
        let batch = stored.iter().find(|b| b.id == abandoned).unwrap();
        assert_eq!(batch.status, BatchStatus::Done);
        assert_eq!(batch.attempts, 2);
        assert_eq!(batch.claimed_at, Some(later));
    }

    #[tokio::test]
    async fn finish_failure_is_reported_and_later_batches_still_run() {
        let fx = Fixture::new().await;
        let scheduler = BatchScheduler::new(&fx.global, &fx.registry, &fx.config);
        let p = scheduler.plan(fx.world_id(), 10, "staggered").unwrap();
        scheduler
            .execute(&p, PlacementStrategy::RandomScatter, &PlacementParams::default())
            .await
            .unwrap();

        fx.global_mem.fail_next(GlobalFault::BatchFinish, 1);
        let day_eight = due_at(fx.world.created_at, 8).unwrap();
        let report = scheduler.run_due_batches(day_eight).await.unwrap();
        assert_eq!(report.batches, 2);
        assert_eq!(report.store_errors, 1);
        assert_eq!(report.provisioned, 6);

        let stored = fx.global.batches_for_world(fx.world_id()).await.unwrap();
        let running = stored.iter().filter(|b| b.status == BatchStatus::Running).count();
        let done = stored.iter().filter(|b| b.status == BatchStatus::Done).count();
        assert_eq!((running, done), (1, 1));
    }

    #[tokio::test]
    async fn tile_conflict_is_retried_with_a_fresh_tile() {
        let fx = Fixture::new().await;
        let scheduler = BatchScheduler::new(&fx.global, &fx.registry, &fx.config);
        let taken = Coordinates::new(50, 50);
        fx.world_mem.occupy_tile(taken).await;

        let mut outcome = SpawnOutcome::default();
        scheduler
            .provision_at(
                fx.world_id(),
                &[taken],
                &[attrs()],
                PlacementStrategy::RandomScatter,
                &PlacementParams::default(),
                &mut outcome,
            )
            .await;

        assert_eq!(outcome.provisioned_count(), 1);
        let npc = outcome.provisioned.first().unwrap();
        assert_ne!(npc.coordinates, taken);
    }

    #[tokio::test]
    async fn unknown_world_fails_every_npc() {
        let fx = Fixture::new().await;
        let scheduler = BatchScheduler::new(&fx.global, &fx.registry, &fx.config);
        let outcome = scheduler
            .spawn(WorldId::new(), 3, PlacementStrategy::RandomScatter, &PlacementParams::default())
            .await;
        assert_eq!(outcome.failed_count(), 3);
        assert!(outcome.provisioned.is_empty());
    }

    #[tokio::test]
    async fn oversized_request_fails_as_one_entry() {
        let fx = Fixture::new().await;
        let scheduler = BatchScheduler::new(&fx.global, &fx.registry, &fx.config);
        let params = PlacementParams {
            max_radius: 2,
            center_exclusion_radius: 0,
            ..PlacementParams::default()
        };
        let outcome = scheduler
            .spawn(fx.world_id(), u32::MAX, PlacementStrategy::RandomScatter, &params)
            .await;
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failed_count(), u32::MAX);
        assert_eq!(fx.global_mem.counts().await.records, 0);
    }

    #[tokio::test]
    async fn execute_rejects_unknown_world() {
        let fx = Fixture::new().await;
        let scheduler = BatchScheduler::new(&fx.global, &fx.registry, &fx.config);
        let p = scheduler.plan(WorldId::new(), 5, "instant").unwrap();
        let err = scheduler
            .execute(&p, PlacementStrategy::RandomScatter, &PlacementParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Registry(_)));
    }
}
