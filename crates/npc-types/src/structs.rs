//! Core records shared by the stores and the provisioning core.
//!
//! [`ProvisioningRecord`] is the ledger row that drives the saga. The other
//! types are request/response payloads and registry entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{Difficulty, Faction, Personality, ProvisioningStatus, TransitionError};
use crate::ids::{AccountId, PlayerId, ProvisioningId, SettlementId, WorldId};

/// A map tile position. The map center is `(0, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Coordinates {
    /// Horizontal position.
    pub x: i32,
    /// Vertical position.
    pub y: i32,
}

impl Coordinates {
    /// The map center.
    pub const ORIGIN: Self = Self { x: 0, y: 0 };

    /// Create a coordinate pair.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to `other`, computed in `i64` so it
    /// cannot overflow for any pair of `i32` coordinates.
    pub const fn distance_squared(self, other: Self) -> i64 {
        let dx = (self.x as i64).abs_diff(other.x as i64);
        let dy = (self.y as i64).abs_diff(other.y as i64);
        let sum = dx.saturating_mul(dx).saturating_add(dy.saturating_mul(dy));
        if sum > i64::MAX as u64 {
            i64::MAX
        } else {
            sum as i64
        }
    }
}

impl core::fmt::Display for Coordinates {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}|{})", self.x, self.y)
    }
}

/// Attributes of the NPC being provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpcAttributes {
    /// Display name, used for the account and the capital settlement.
    pub name: String,
    /// Playable faction.
    pub faction: Faction,
    /// AI difficulty tier.
    pub difficulty: Difficulty,
    /// AI behavior profile.
    pub personality: Personality,
}

/// One provisioning attempt as stored in the ledger.
///
/// Mutated only by the orchestrator (forward progress) and the reconciler
/// (recovery). Never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRecord {
    /// Record id, also written to the linkage columns of both footprints.
    pub id: ProvisioningId,
    /// Target world.
    pub world_id: WorldId,
    /// Current state.
    pub status: ProvisioningStatus,
    /// Requested NPC attributes.
    pub attributes: NpcAttributes,
    /// Per-world account, once the per-world commit is recorded.
    pub per_world_account_id: Option<AccountId>,
    /// Per-world settlement, once the per-world commit is recorded.
    pub per_world_settlement_id: Option<SettlementId>,
    /// Global player, once the global commit is recorded.
    pub global_player_id: Option<PlayerId>,
    /// Reserved placement.
    pub coordinates: Option<Coordinates>,
    /// Last failure or resolution reason.
    pub error_message: Option<String>,
    /// Failed recovery attempts so far.
    pub retry_count: u32,
    /// When the attempt started.
    pub created_at: DateTime<Utc>,
    /// Last ledger write.
    pub updated_at: DateTime<Utc>,
    /// When the record reached `completed`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProvisioningRecord {
    /// Start a new attempt in [`ProvisioningStatus::Pending`].
    pub fn new(
        world_id: WorldId,
        attributes: NpcAttributes,
        coordinates: Option<Coordinates>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ProvisioningId::new(),
            world_id,
            status: ProvisioningStatus::Pending,
            attributes,
            per_world_account_id: None,
            per_world_settlement_id: None,
            global_player_id: None,
            coordinates,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move the record to `next`, stamping `updated_at` (and `completed_at`
    /// when completing).
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the state machine forbids the move; the
    /// record is left unchanged.
    pub fn advance(&mut self, next: ProvisioningStatus) -> Result<(), TransitionError> {
        self.status = self.status.transition(next)?;
        let now = Utc::now();
        self.updated_at = now;
        if next == ProvisioningStatus::Completed {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Whether both per-world ids are known.
    pub const fn has_per_world_ids(&self) -> bool {
        self.per_world_account_id.is_some() && self.per_world_settlement_id.is_some()
    }

    /// Whether all three cross-store ids are known.
    pub const fn is_fully_linked(&self) -> bool {
        self.has_per_world_ids() && self.global_player_id.is_some()
    }

    /// The state an operator unblock returns this record to: the most
    /// advanced in-flight state its recorded ids justify.
    pub const fn unblock_target(&self) -> ProvisioningStatus {
        if self.global_player_id.is_some() {
            ProvisioningStatus::CommittedGlobal
        } else if self.has_per_world_ids() {
            ProvisioningStatus::CommittedPerWorld
        } else {
            ProvisioningStatus::Pending
        }
    }
}

/// The ids returned to a caller once provisioning completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedNpc {
    /// Ledger record of the attempt.
    pub record_id: ProvisioningId,
    /// Global player identity.
    pub global_player_id: PlayerId,
    /// Per-world account.
    pub per_world_account_id: AccountId,
    /// Per-world capital settlement.
    pub per_world_settlement_id: SettlementId,
    /// Claimed tile.
    pub coordinates: Coordinates,
}

/// A world registry entry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldDescriptor {
    /// World id.
    pub id: WorldId,
    /// Human-readable world name.
    pub name: String,
    /// Connection URL of the per-world store.
    pub connection_url: String,
    /// Inactive worlds are treated as absent.
    pub is_active: bool,
    /// World start; deferred spawn batches are offset from it.
    pub created_at: DateTime<Utc>,
}

impl core::fmt::Debug for WorldDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorldDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("connection_url", &"<redacted>")
            .field("is_active", &self.is_active)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// One deferred sub-batch of a spawn plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedBatch {
    /// Days after world creation when the batch becomes due.
    pub offset_days: u32,
    /// NPCs to provision in this batch.
    pub count: u32,
}

/// How a bulk request is split into instant and deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnPlan {
    /// Target world.
    pub world_id: WorldId,
    /// Preset the plan was derived from.
    pub preset: String,
    /// Total NPCs requested.
    pub total_count: u32,
    /// NPCs provisioned immediately.
    pub instant_count: u32,
    /// Deferred batches, ordered by offset.
    pub batches: Vec<PlannedBatch>,
}

impl SpawnPlan {
    /// Total NPCs deferred to later batches.
    pub fn deferred_count(&self) -> u32 {
        self.batches
            .iter()
            .fold(0_u32, |acc, b| acc.saturating_add(b.count))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::enums::{Difficulty, Faction, Personality};

    fn attributes() -> NpcAttributes {
        NpcAttributes {
            name: String::from("Brennus"),
            faction: Faction::Gauls,
            difficulty: Difficulty::Medium,
            personality: Personality::Aggressive,
        }
    }

    #[test]
    fn new_record_is_pending_and_unlinked() {
        let record =
            ProvisioningRecord::new(WorldId::new(), attributes(), Some(Coordinates::new(3, -4)));
        assert_eq!(record.status, ProvisioningStatus::Pending);
        assert!(!record.has_per_world_ids());
        assert_eq!(record.retry_count, 0);
        assert!(record.completed_at.is_none());
    }

    #[test]
    fn advancing_to_completed_stamps_completion() {
        let mut record = ProvisioningRecord::new(WorldId::new(), attributes(), None);
        record.advance(ProvisioningStatus::CommittingPerWorld).unwrap();
        record.advance(ProvisioningStatus::Completed).unwrap();
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn illegal_advance_leaves_record_untouched() {
        let mut record = ProvisioningRecord::new(WorldId::new(), attributes(), None);
        let before = record.clone();
        assert!(record.advance(ProvisioningStatus::CommittingGlobal).is_err());
        assert_eq!(record, before);
    }

    #[test]
    fn unblock_target_follows_recorded_ids() {
        let mut record = ProvisioningRecord::new(WorldId::new(), attributes(), None);
        assert_eq!(record.unblock_target(), ProvisioningStatus::Pending);
        record.per_world_account_id = Some(AccountId::new());
        record.per_world_settlement_id = Some(SettlementId::new());
        assert_eq!(record.unblock_target(), ProvisioningStatus::CommittedPerWorld);
        record.global_player_id = Some(PlayerId::new());
        assert_eq!(record.unblock_target(), ProvisioningStatus::CommittedGlobal);
    }

    #[test]
    fn distance_is_squared_euclidean() {
        let a = Coordinates::new(3, 4);
        assert_eq!(a.distance_squared(Coordinates::ORIGIN), 25);
        let far = Coordinates::new(i32::MIN, i32::MIN);
        assert!(far.distance_squared(Coordinates::new(i32::MAX, i32::MAX)) > 0);
    }

    #[test]
    fn deferred_count_sums_batches() {
        let plan = SpawnPlan {
            world_id: WorldId::new(),
            preset: String::from("gradual"),
            total_count: 10,
            instant_count: 4,
            batches: vec![
                PlannedBatch {
                    offset_days: 1,
                    count: 3,
                },
                PlannedBatch {
                    offset_days: 3,
                    count: 3,
                },
            ],
        };
        assert_eq!(plan.deferred_count(), 6);
    }

    #[test]
    fn descriptor_debug_hides_connection_url() {
        let world = WorldDescriptor {
            id: WorldId::new(),
            name: String::from("s1"),
            connection_url: String::from("postgresql://user:secret@db/s1"),
            is_active: true,
            created_at: Utc::now(),
        };
        assert!(!format!("{world:?}").contains("secret"));
    }
}
