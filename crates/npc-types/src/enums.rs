//! Enumeration types for NPC provisioning.
//!
//! Every enum here is persisted as text in one of the stores. The
//! `as_str`/`FromStr` pairs are the single mapping between the Rust variant
//! and its column value.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// A stored enum column held a value no variant maps to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} value: {value:?}")]
pub struct ParseEnumError {
    /// Name of the enum being parsed.
    pub kind: &'static str,
    /// The offending value.
    pub value: String,
}

/// Generates `as_str`, `Display`, and `FromStr` for a fieldless enum.
macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// The value stored in the database for this variant.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Provisioning state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a provisioning record.
///
/// ```text
/// pending -> committing-per-world -> committed-per-world
///         -> committing-global -> committed-global -> completed
///
/// any non-terminal -> failed | blocked | completed (reconciler)
/// ```
///
/// `committed-per-world` and `committed-global` are the states that can
/// survive a crash: a local commit happened but the ledger may not know
/// about the next step yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisioningStatus {
    /// Record created, no store touched yet.
    Pending,
    /// Per-world transaction in flight.
    CommittingPerWorld,
    /// Per-world transaction committed; per-world ids recorded.
    CommittedPerWorld,
    /// Global transaction in flight.
    CommittingGlobal,
    /// Global transaction committed; global player id recorded.
    CommittedGlobal,
    /// Both stores hold cross-linked rows.
    Completed,
    /// Attempt abandoned with no residual data.
    Failed,
    /// Automatic recovery gave up; requires an operator.
    Blocked,
}

string_enum!(ProvisioningStatus, "provisioning status", {
    Pending => "pending",
    CommittingPerWorld => "committing-per-world",
    CommittedPerWorld => "committed-per-world",
    CommittingGlobal => "committing-global",
    CommittedGlobal => "committed-global",
    Completed => "completed",
    Failed => "failed",
    Blocked => "blocked",
});

/// A state change the provisioning state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal provisioning transition {from} -> {to}")]
pub struct TransitionError {
    /// State the record was in.
    pub from: ProvisioningStatus,
    /// State that was requested.
    pub to: ProvisioningStatus,
}

impl ProvisioningStatus {
    /// Non-terminal states, in forward order.
    pub const IN_FLIGHT: &'static [Self] = &[
        Self::Pending,
        Self::CommittingPerWorld,
        Self::CommittedPerWorld,
        Self::CommittingGlobal,
        Self::CommittedGlobal,
    ];

    /// Whether the record has reached a final state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Covers forward progress by the orchestrator and the direct jumps
    /// (`completed`, `failed`, `blocked`) the reconciler makes from any
    /// non-terminal state. Leaving `blocked` goes through
    /// [`can_unblock_to`](Self::can_unblock_to) instead.
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::CommittingPerWorld)
            | (Self::CommittingPerWorld, Self::CommittedPerWorld)
            | (Self::CommittedPerWorld, Self::CommittingGlobal)
            | (Self::CommittingGlobal, Self::CommittedGlobal) => true,
            (from, Self::Completed | Self::Failed | Self::Blocked) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Whether an operator may move a `blocked` record back to `next`.
    pub const fn can_unblock_to(self, next: Self) -> bool {
        matches!(self, Self::Blocked) && !next.is_terminal()
    }

    /// Validate a transition, returning the target state on success.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] when the state machine forbids the move.
    pub const fn transition(self, next: Self) -> Result<Self, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Game attributes
// ---------------------------------------------------------------------------

/// Playable faction of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Faction {
    /// Strong defense and balanced economy.
    Romans,
    /// Cheap, raid-oriented troops.
    Teutons,
    /// Fast units and trap defense.
    Gauls,
}

string_enum!(Faction, "faction", {
    Romans => "romans",
    Teutons => "teutons",
    Gauls => "gauls",
});

/// AI difficulty tier attached to an NPC's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    /// Slow growth, passive.
    Easy,
    /// Default tier.
    Medium,
    /// Fast growth, frequent raids.
    Hard,
    /// Maximum tier.
    Expert,
}

string_enum!(Difficulty, "difficulty", {
    Easy => "easy",
    Medium => "medium",
    Hard => "hard",
    Expert => "expert",
});

impl Difficulty {
    /// Level every resource field starts at for this tier.
    pub const fn starting_field_level(self) -> u8 {
        match self {
            Self::Easy => 0,
            Self::Medium => 1,
            Self::Hard => 2,
            Self::Expert => 3,
        }
    }
}

/// Behavior profile of an NPC's AI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Personality {
    /// Prioritizes troops and raiding.
    Aggressive,
    /// Prioritizes resource fields and trade.
    Economic,
    /// No strong preference.
    Balanced,
    /// Prioritizes walls and defensive troops.
    Defensive,
    /// Seeks alliances.
    Diplomatic,
}

string_enum!(Personality, "personality", {
    Aggressive => "aggressive",
    Economic => "economic",
    Balanced => "balanced",
    Defensive => "defensive",
    Diplomatic => "diplomatic",
});

/// Classification of a global player identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerKind {
    /// A real person.
    Human,
    /// A synthetic player driven by an AI configuration.
    Npc,
}

string_enum!(PlayerKind, "player kind", {
    Human => "human",
    Npc => "npc",
});

/// Resource produced by a settlement field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Woodcutter.
    Wood,
    /// Clay pit.
    Clay,
    /// Iron mine.
    Iron,
    /// Cropland.
    Crop,
}

string_enum!(FieldType, "field type", {
    Wood => "wood",
    Clay => "clay",
    Iron => "iron",
    Crop => "crop",
});

/// How the placement allocator distributes spawn coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    /// Uniform sampling outside the center exclusion disk.
    RandomScatter,
    /// Even split across the four quadrants.
    QuadrantBalanced,
    /// Groups of NPCs around spread-out cluster centers.
    KingdomClustering,
}

string_enum!(PlacementStrategy, "placement strategy", {
    RandomScatter => "random_scatter",
    QuadrantBalanced => "quadrant_balanced",
    KingdomClustering => "kingdom_clustering",
});
