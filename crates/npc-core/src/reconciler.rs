//! Reconciler: drives stuck provisioning records to a terminal outcome.
//!
//! A pass selects non-terminal records whose last ledger write is older than
//! `max_age`, oldest first, probes both stores for each, and applies the
//! resolution matrix:
//!
//! | per-world | global | action                                    |
//! |-----------|--------|-------------------------------------------|
//! | yes       | yes    | re-validate linkage, then `completed`     |
//! | yes       | no     | delete per-world footprint, then `failed` |
//! | no        | yes    | delete player + AI config, then `failed`  |
//! | no        | no     | `failed`                                  |
//!
//! A failed probe or cleanup leaves the record's ids alone and bumps
//! `retry_count`; at [`RETRY_CEILING`] the record is `blocked` and needs an
//! operator. Every ledger write is a compare-and-set on the status the pass
//! read, so a record another process moved meanwhile is skipped.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use npc_db::{DbError, GlobalStore, PlayerRecord, WorldFootprint, WorldStore};
use npc_types::{ProvisioningId, ProvisioningRecord, ProvisioningStatus, TransitionError};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{ReconcileError, StoreCallError, bounded};
use crate::registry::WorldRegistry;

/// Failed recovery attempts after which a record is blocked.
pub const RETRY_CEILING: u32 = 5;

/// Outcome counts of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Records examined.
    pub processed: u32,
    /// Records moved to `completed`.
    pub completed: u32,
    /// Records whose orphaned footprint was deleted (also counted in
    /// `failed`).
    pub cleaned: u32,
    /// Records moved to `failed`.
    pub failed: u32,
    /// Records that hit the retry ceiling or failed linkage re-validation.
    pub blocked: u32,
    /// Records left for a later pass after a failed probe or cleanup.
    pub retried: u32,
    /// Records skipped because the ledger write lost a race or failed.
    pub skipped: u32,
}

impl ReconcileReport {
    fn count(&mut self, outcome: Outcome) {
        self.processed = self.processed.saturating_add(1);
        let slot = match outcome {
            Outcome::Completed => &mut self.completed,
            Outcome::Failed { cleaned } => {
                if cleaned {
                    self.cleaned = self.cleaned.saturating_add(1);
                }
                &mut self.failed
            }
            Outcome::Blocked => &mut self.blocked,
            Outcome::Retried => &mut self.retried,
            Outcome::Skipped => &mut self.skipped,
        };
        *slot = slot.saturating_add(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed { cleaned: bool },
    Blocked,
    Retried,
    Skipped,
}

/// The crash-recovery half of the saga.
pub struct Reconciler<'a> {
    global: &'a GlobalStore,
    registry: &'a WorldRegistry,
    call_timeout: Duration,
}

impl<'a> Reconciler<'a> {
    /// Create a reconciler over the given stores.
    pub const fn new(
        global: &'a GlobalStore,
        registry: &'a WorldRegistry,
        call_timeout: Duration,
    ) -> Self {
        Self {
            global,
            registry,
            call_timeout,
        }
    }

    /// Resolve up to `limit` in-flight records untouched for `max_age`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Ledger`] if the candidate scan fails.
    /// Per-record failures are counted in the report instead.
    pub async fn reconcile(
        &self,
        max_age: Duration,
        limit: u32,
    ) -> Result<ReconcileReport, ReconcileError> {
        let now = Utc::now();
        let cutoff = TimeDelta::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.reconcile_before(cutoff, limit).await
    }

    /// Resolve up to `limit` in-flight records last updated before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Ledger`] if the candidate scan fails.
    pub async fn reconcile_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<ReconcileReport, ReconcileError> {
        let candidates = bounded(
            self.call_timeout,
            "in-flight scan",
            self.global.list_in_flight(cutoff, limit),
        )
        .await?;

        let mut report = ReconcileReport::default();
        for mut record in candidates {
            let outcome = self.resolve(&mut record).await;
            report.count(outcome);
        }

        if report.processed > 0 {
            info!(
                processed = report.processed,
                completed = report.completed,
                cleaned = report.cleaned,
                failed = report.failed,
                blocked = report.blocked,
                retried = report.retried,
                skipped = report.skipped,
                "reconciliation pass finished"
            );
        } else {
            debug!("reconciliation pass found nothing to do");
        }
        Ok(report)
    }

    /// Run passes every `interval` until `shutdown` resolves.
    ///
    /// The first pass starts immediately. A failed pass is logged and the
    /// loop continues.
    pub async fn run_until<F>(
        &self,
        interval: Duration,
        max_age: Duration,
        limit: u32,
        shutdown: F,
    ) where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_secs = interval.as_secs(), "reconciler loop started");
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("reconciler loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile(max_age, limit).await {
                        warn!(error = %err, "reconciliation pass failed");
                    }
                }
            }
        }
    }

    /// Return a blocked record to the most advanced in-flight state its ids
    /// justify, with a fresh retry budget. The next pass picks it up.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::RecordNotFound`], [`ReconcileError::NotBlocked`],
    /// or [`ReconcileError::Ledger`] if the read or write fails.
    pub async fn unblock(&self, id: ProvisioningId) -> Result<ProvisioningRecord, ReconcileError> {
        let mut record = bounded(self.call_timeout, "ledger read", self.global.get_record(id))
            .await?
            .ok_or(ReconcileError::RecordNotFound(id))?;

        let target = record.unblock_target();
        if !record.status.can_unblock_to(target) {
            return Err(ReconcileError::NotBlocked {
                id,
                status: record.status,
            });
        }

        record.status = target;
        record.retry_count = 0;
        record.error_message = Some(String::from("unblocked by operator"));
        // Backdate so the next pass selects it regardless of max_age.
        record.updated_at = DateTime::<Utc>::UNIX_EPOCH;
        bounded(
            self.call_timeout,
            "ledger save",
            self.global.save_record(&record, ProvisioningStatus::Blocked),
        )
        .await?;

        info!(record_id = %id, status = %target, "record unblocked");
        Ok(record)
    }

    async fn resolve(&self, record: &mut ProvisioningRecord) -> Outcome {
        let expected = record.status;

        let (world, footprint) = match self.probe_world(record).await {
            Ok(found) => found,
            Err(reason) => return self.retry_later(record, expected, &reason).await,
        };
        let player = match self.probe_global(record, &footprint).await {
            Ok(found) => found,
            Err(err) => {
                let reason = format!("global probe failed: {err}");
                return self.retry_later(record, expected, &reason).await;
            }
        };

        let (next, reason, outcome) = match (footprint.exists(), player) {
            (true, Some(player)) => {
                if let Some(mismatch) = linkage_mismatch(record, &footprint, &player) {
                    warn!(record_id = %record.id, reason = %mismatch, "linkage mismatch; blocking");
                    (
                        ProvisioningStatus::Blocked,
                        format!("linkage mismatch: {mismatch}"),
                        Outcome::Blocked,
                    )
                } else {
                    record.per_world_account_id = footprint.account_id;
                    record.per_world_settlement_id = footprint.settlement_id;
                    record.global_player_id = Some(player.id);
                    record.coordinates = footprint.coordinates.or(record.coordinates);
                    (
                        ProvisioningStatus::Completed,
                        String::from("reconciled: both stores committed"),
                        Outcome::Completed,
                    )
                }
            }
            (true, None) => {
                let removed = bounded(
                    self.call_timeout,
                    "per-world cleanup",
                    world.remove_footprint(footprint.account_id, footprint.settlement_id),
                )
                .await;
                match removed {
                    Ok(removal) => {
                        record.per_world_account_id = None;
                        record.per_world_settlement_id = None;
                        (
                            ProvisioningStatus::Failed,
                            format!(
                                "per-world orphan removed ({} account, {} settlement, {} tile freed)",
                                removal.accounts, removal.settlements, removal.tiles_freed
                            ),
                            Outcome::Failed { cleaned: true },
                        )
                    }
                    Err(err) => {
                        let reason = format!("per-world orphan cleanup failed: {err}");
                        return self.retry_later(record, expected, &reason).await;
                    }
                }
            }
            (false, Some(player)) => {
                let removed = bounded(
                    self.call_timeout,
                    "global cleanup",
                    self.global.delete_player(player.id),
                )
                .await;
                match removed {
                    Ok(_) => {
                        record.global_player_id = None;
                        (
                            ProvisioningStatus::Failed,
                            format!("global orphan removed (player {})", player.id),
                            Outcome::Failed { cleaned: true },
                        )
                    }
                    Err(err) => {
                        let reason = format!("global orphan cleanup failed: {err}");
                        return self.retry_later(record, expected, &reason).await;
                    }
                }
            }
            (false, None) => (
                ProvisioningStatus::Failed,
                String::from("no footprint in either store"),
                Outcome::Failed { cleaned: false },
            ),
        };

        record.error_message = Some(reason);
        if let Err(err) = record.advance(next) {
            return skip_illegal(record, err);
        }
        self.commit(record, expected, outcome).await
    }

    /// Locate the record's per-world footprint, by ids when known, else by
    /// linkage.
    async fn probe_world(
        &self,
        record: &ProvisioningRecord,
    ) -> Result<(WorldStore, WorldFootprint), String> {
        let world = self
            .registry
            .connect(record.world_id)
            .await
            .map_err(|err| format!("per-world store unreachable: {err}"))?;
        let footprint = bounded(
            self.call_timeout,
            "per-world probe",
            world.probe_footprint(
                record.id,
                record.per_world_account_id,
                record.per_world_settlement_id,
            ),
        )
        .await
        .map_err(|err| format!("per-world probe failed: {err}"))?;
        Ok((world, footprint))
    }

    /// Locate the record's global player, by id when known, else by
    /// provisioning linkage, else by the footprint's account.
    async fn probe_global(
        &self,
        record: &ProvisioningRecord,
        footprint: &WorldFootprint,
    ) -> Result<Option<PlayerRecord>, StoreCallError> {
        if let Some(player_id) = record.global_player_id {
            return bounded(
                self.call_timeout,
                "global probe",
                self.global.get_player(player_id),
            )
            .await;
        }

        let linked = bounded(
            self.call_timeout,
            "global probe",
            self.global.find_player_by_provisioning(record.id),
        )
        .await?;
        if linked.is_some() {
            return Ok(linked);
        }

        match footprint.account_id {
            Some(account_id) => {
                bounded(
                    self.call_timeout,
                    "global probe",
                    self.global.find_player_by_account(record.world_id, account_id),
                )
                .await
            }
            None => Ok(None),
        }
    }

    /// Count a failed probe or cleanup, blocking at the ceiling.
    async fn retry_later(
        &self,
        record: &mut ProvisioningRecord,
        expected: ProvisioningStatus,
        reason: &str,
    ) -> Outcome {
        record.retry_count = record.retry_count.saturating_add(1);
        let attempt = record.retry_count;
        record.error_message = Some(format!("{reason} (attempt {attempt}/{RETRY_CEILING})"));

        if attempt >= RETRY_CEILING {
            warn!(record_id = %record.id, reason = %reason, "retry ceiling reached; blocking");
            if let Err(err) = record.advance(ProvisioningStatus::Blocked) {
                return skip_illegal(record, err);
            }
            return self.commit(record, expected, Outcome::Blocked).await;
        }

        warn!(record_id = %record.id, attempt, reason = %reason, "recovery attempt failed");
        record.updated_at = Utc::now();
        self.commit(record, expected, Outcome::Retried).await
    }

    async fn commit(
        &self,
        record: &ProvisioningRecord,
        expected: ProvisioningStatus,
        outcome: Outcome,
    ) -> Outcome {
        let saved = bounded(
            self.call_timeout,
            "ledger save",
            self.global.save_record(record, expected),
        )
        .await;
        match saved {
            Ok(()) => {
                debug!(record_id = %record.id, status = %record.status, "record reconciled");
                outcome
            }
            Err(StoreCallError::Db(DbError::StaleRecord { .. })) => {
                debug!(record_id = %record.id, "record moved concurrently; skipped");
                Outcome::Skipped
            }
            Err(err) => {
                warn!(record_id = %record.id, error = %err, "could not save reconciled record");
                Outcome::Skipped
            }
        }
    }
}

fn skip_illegal(record: &ProvisioningRecord, err: TransitionError) -> Outcome {
    warn!(record_id = %record.id, error = %err, "illegal reconcile transition; skipped");
    Outcome::Skipped
}

/// Why a footprint and a player that both exist do not belong to the same
/// attempt, if they do not.
fn linkage_mismatch(
    record: &ProvisioningRecord,
    footprint: &WorldFootprint,
    player: &PlayerRecord,
) -> Option<String> {
    if player.world_id != record.world_id {
        return Some(format!(
            "player {} belongs to world {}, record targets {}",
            player.id, player.world_id, record.world_id
        ));
    }
    if let Some(linked) = player.provisioning_id
        && linked != record.id
    {
        return Some(format!("player {} was provisioned by {linked}", player.id));
    }
    let Some(account_id) = footprint.account_id else {
        return Some(String::from("settlement exists without its account"));
    };
    if player.per_world_account_id != account_id {
        return Some(format!(
            "player {} links account {}, footprint has {account_id}",
            player.id, player.per_world_account_id
        ));
    }
    if footprint.settlement_id.is_none() {
        return Some(format!("account {account_id} has no settlement"));
    }
    if let (Some(expected), Some(actual)) = (record.coordinates, footprint.coordinates)
        && expected != actual
    {
        return Some(format!("settlement at {actual}, record reserved {expected}"));
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use npc_db::{GlobalFault, NewPlayer, SettlementSeed, Stockpile, WorldFault};
    use npc_types::{
        AccountId, Coordinates, Difficulty, Faction, Personality, PlayerId, PlayerKind,
        SettlementId,
    };

    use super::*;
    use crate::error::ProvisionError;
    use crate::test_support::{Fixture, TIMEOUT, attrs};

    fn reconciler(fx: &Fixture) -> Reconciler<'_> {
        Reconciler::new(&fx.global, &fx.registry, TIMEOUT)
    }

    /// Everything currently in flight, regardless of age.
    async fn pass(fx: &Fixture) -> ReconcileReport {
        reconciler(fx)
            .reconcile_before(Utc::now().checked_add_signed(TimeDelta::seconds(1)).unwrap(), 100)
            .await
            .unwrap()
    }

    /// Provision with a failing global write: per-world footprint committed,
    /// record stuck in committing-global.
    async fn stuck_after_per_world(fx: &Fixture, tile: Coordinates) -> ProvisioningId {
        fx.global_mem.fail_next(GlobalFault::PlayerInsert, 1);
        let err = fx
            .orchestrator()
            .provision(fx.world_id(), &attrs(), tile)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::GlobalWriteFailed { .. }));
        err.record_id().unwrap()
    }

    /// A crash between the per-world commit and the ledger update: the
    /// footprint exists but the record never learned its ids.
    async fn crashed_before_checkpoint(
        fx: &Fixture,
        tile: Coordinates,
    ) -> (ProvisioningId, AccountId) {
        let mut record = ProvisioningRecord::new(fx.world_id(), attrs(), Some(tile));
        fx.global.insert_record(&record).await.unwrap();
        record.advance(ProvisioningStatus::CommittingPerWorld).unwrap();
        fx.global
            .save_record(&record, ProvisioningStatus::Pending)
            .await
            .unwrap();

        let account_id = AccountId::new();
        let world = fx.registry.connect(fx.world_id()).await.unwrap();
        world
            .commit_footprint(&SettlementSeed {
                provisioning_id: record.id,
                account_id,
                settlement_id: SettlementId::new(),
                account_name: String::from("Vercingetorix"),
                settlement_name: String::from("Alesia"),
                faction: Faction::Gauls,
                coordinates: tile,
                stockpile: Stockpile {
                    wood: 1,
                    clay: 1,
                    iron: 1,
                    crop: 1,
                },
                warehouse_capacity: 800,
                granary_capacity: 800,
                population: 2,
                fields: Vec::new(),
            })
            .await
            .unwrap();
        (record.id, account_id)
    }

    fn manual_player(
        fx: &Fixture,
        account_id: AccountId,
        provisioning_id: Option<ProvisioningId>,
    ) -> NewPlayer {
        NewPlayer {
            id: PlayerId::new(),
            world_id: fx.world_id(),
            kind: PlayerKind::Npc,
            name: String::from("Vercingetorix"),
            per_world_account_id: account_id,
            provisioning_id,
            difficulty: Difficulty::Easy,
            personality: Personality::Balanced,
        }
    }

    #[tokio::test]
    async fn per_world_orphan_is_removed_and_tile_freed() {
        let fx = Fixture::new().await;
        let tile = Coordinates::new(25, 25);
        let id = stuck_after_per_world(&fx, tile).await;

        let report = pass(&fx).await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.cleaned, 1);
        assert_eq!(report.failed, 1);

        let record = fx.record(id).await;
        assert_eq!(record.status, ProvisioningStatus::Failed);
        assert!(record.per_world_account_id.is_none());
        assert!(record.error_message.unwrap().contains("orphan removed"));

        let world = fx.world_mem.counts().await;
        assert_eq!(world.accounts, 0);
        assert_eq!(world.settlements, 0);
        assert_eq!(world.fields, 0);
        assert!(fx.world_mem.tile_settlement(tile).await.is_none());
    }

    #[tokio::test]
    async fn second_pass_mutates_nothing() {
        let fx = Fixture::new().await;
        stuck_after_per_world(&fx, Coordinates::new(30, 30)).await;
        pass(&fx).await;

        let global_before = fx.global_mem.counts().await;
        let world_before = fx.world_mem.counts().await;
        let report = pass(&fx).await;

        assert_eq!(report, ReconcileReport::default());
        assert_eq!(fx.global_mem.counts().await, global_before);
        assert_eq!(fx.world_mem.counts().await, world_before);
    }

    #[tokio::test]
    async fn footprint_found_by_linkage_is_cleaned() {
        let fx = Fixture::new().await;
        let (id, _) = crashed_before_checkpoint(&fx, Coordinates::new(-40, 12)).await;

        let report = pass(&fx).await;
        assert_eq!(report.cleaned, 1);
        assert_eq!(fx.record(id).await.status, ProvisioningStatus::Failed);
        assert_eq!(fx.world_mem.counts().await.accounts, 0);
    }

    #[tokio::test]
    async fn manual_global_row_completes_the_record() {
        let fx = Fixture::new().await;
        let tile = Coordinates::new(-40, 13);
        let (id, account_id) = crashed_before_checkpoint(&fx, tile).await;
        let player = manual_player(&fx, account_id, None);
        fx.global.insert_player(&player).await.unwrap();

        let report = pass(&fx).await;
        assert_eq!(report.completed, 1);
        assert_eq!(report.cleaned, 0);

        let record = fx.record(id).await;
        assert_eq!(record.status, ProvisioningStatus::Completed);
        assert!(record.is_fully_linked());
        assert_eq!(record.global_player_id, Some(player.id));
        assert_eq!(record.per_world_account_id, Some(account_id));
        assert!(record.completed_at.is_some());

        assert_eq!(fx.world_mem.counts().await.accounts, 1);
        assert_eq!(fx.global_mem.counts().await.players, 1);
    }

    #[tokio::test]
    async fn global_orphan_is_removed() {
        let fx = Fixture::new().await;
        let record = ProvisioningRecord::new(fx.world_id(), attrs(), None);
        fx.global.insert_record(&record).await.unwrap();
        let player = manual_player(&fx, AccountId::new(), Some(record.id));
        fx.global.insert_player(&player).await.unwrap();

        let report = pass(&fx).await;
        assert_eq!(report.cleaned, 1);

        let stored = fx.record(record.id).await;
        assert_eq!(stored.status, ProvisioningStatus::Failed);
        assert!(stored.global_player_id.is_none());
        let global = fx.global_mem.counts().await;
        assert_eq!(global.players, 0);
        assert_eq!(global.ai_configs, 0);
    }

    #[tokio::test]
    async fn nothing_anywhere_fails_the_record() {
        let fx = Fixture::new().await;
        let record = ProvisioningRecord::new(fx.world_id(), attrs(), Some(Coordinates::new(5, 50)));
        fx.global.insert_record(&record).await.unwrap();

        let report = pass(&fx).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.cleaned, 0);
        let stored = fx.record(record.id).await;
        assert_eq!(stored.status, ProvisioningStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("no footprint in either store"));
    }

    #[tokio::test]
    async fn repeated_cleanup_failures_block_the_record() {
        let fx = Fixture::new().await;
        let id = stuck_after_per_world(&fx, Coordinates::new(60, -60)).await;
        fx.world_mem.fail_next(WorldFault::Cleanup, RETRY_CEILING);

        for attempt in 1..RETRY_CEILING {
            let report = pass(&fx).await;
            assert_eq!(report.retried, 1);
            let record = fx.record(id).await;
            assert_eq!(record.retry_count, attempt);
            assert!(record.has_per_world_ids());
        }

        let report = pass(&fx).await;
        assert_eq!(report.blocked, 1);
        let record = fx.record(id).await;
        assert_eq!(record.status, ProvisioningStatus::Blocked);
        assert_eq!(record.retry_count, RETRY_CEILING);

        // Blocked records are never selected again.
        assert_eq!(pass(&fx).await.processed, 0);
        // The footprint survived every rolled-back attempt.
        assert_eq!(fx.world_mem.counts().await.fields, 18);
    }

    #[tokio::test]
    async fn unreachable_world_counts_as_failed_attempt() {
        let fx = Fixture::new().await;
        let id = stuck_after_per_world(&fx, Coordinates::new(61, -61)).await;
        fx.world_mem.fail_next(WorldFault::Probe, 1);

        let report = pass(&fx).await;
        assert_eq!(report.retried, 1);
        let record = fx.record(id).await;
        assert_eq!(record.status, ProvisioningStatus::CommittingGlobal);
        assert_eq!(record.retry_count, 1);
        assert!(record.error_message.unwrap().contains("probe failed"));
    }

    #[tokio::test]
    async fn mismatched_linkage_blocks_without_deleting() {
        let fx = Fixture::new().await;
        let (id, _) = crashed_before_checkpoint(&fx, Coordinates::new(70, 70)).await;
        // Claims the attempt but points at a different account.
        let player = manual_player(&fx, AccountId::new(), Some(id));
        fx.global.insert_player(&player).await.unwrap();

        let report = pass(&fx).await;
        assert_eq!(report.blocked, 1);
        let record = fx.record(id).await;
        assert_eq!(record.status, ProvisioningStatus::Blocked);
        assert!(record.error_message.unwrap().starts_with("linkage mismatch"));
        assert_eq!(fx.world_mem.counts().await.accounts, 1);
        assert_eq!(fx.global_mem.counts().await.players, 1);
    }

    #[tokio::test]
    async fn recent_records_are_left_alone() {
        let fx = Fixture::new().await;
        stuck_after_per_world(&fx, Coordinates::new(80, 80)).await;

        let report = reconciler(&fx)
            .reconcile(Duration::from_secs(3600), 100)
            .await
            .unwrap();
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn unblocked_record_is_retried_from_its_furthest_state() {
        let fx = Fixture::new().await;
        let id = stuck_after_per_world(&fx, Coordinates::new(90, 0)).await;
        fx.world_mem.fail_next(WorldFault::Cleanup, RETRY_CEILING);
        for _ in 0..RETRY_CEILING {
            pass(&fx).await;
        }
        assert_eq!(fx.record(id).await.status, ProvisioningStatus::Blocked);

        let unblocked = reconciler(&fx).unblock(id).await.unwrap();
        assert_eq!(unblocked.status, ProvisioningStatus::CommittedPerWorld);
        assert_eq!(unblocked.retry_count, 0);

        let err = reconciler(&fx).unblock(id).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotBlocked { .. }));

        // Even a max_age pass picks it up right away.
        let report = reconciler(&fx)
            .reconcile(Duration::from_secs(60), 100)
            .await
            .unwrap();
        assert_eq!(report.cleaned, 1);
        assert_eq!(fx.record(id).await.status, ProvisioningStatus::Failed);
    }

    #[tokio::test]
    async fn unblock_of_missing_record_is_not_found() {
        let fx = Fixture::new().await;
        let err = reconciler(&fx).unblock(ProvisioningId::new()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn periodic_loop_runs_a_pass_and_stops() {
        let fx = Fixture::new().await;
        let id = stuck_after_per_world(&fx, Coordinates::new(95, 5)).await;
        // Backdate past max_age.
        let mut record = fx.record(id).await;
        let status = record.status;
        record.updated_at = record.created_at.checked_sub_signed(TimeDelta::hours(2)).unwrap();
        fx.global.save_record(&record, status).await.unwrap();

        reconciler(&fx)
            .run_until(
                Duration::from_secs(3600),
                Duration::from_secs(60),
                100,
                tokio::time::sleep(Duration::from_millis(100)),
            )
            .await;
        assert_eq!(fx.record(id).await.status, ProvisioningStatus::Failed);
    }
}
