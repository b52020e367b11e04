//! Shared type definitions for NPC provisioning.
//!
//! This crate is the single source of truth for the identifiers, enums, and
//! records that flow between the global store, the per-world stores, and the
//! provisioning core.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for all entity identifiers
//! - [`enums`] -- Closed enumerations (provisioning status, faction, AI profile)
//! - [`structs`] -- Provisioning records, attributes, coordinates, spawn plans

pub mod enums;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use enums::{
    Difficulty, Faction, FieldType, ParseEnumError, Personality, PlacementStrategy, PlayerKind,
    ProvisioningStatus, TransitionError,
};
pub use ids::{AccountId, PlayerId, ProvisioningId, SettlementId, SpawnBatchId, WorldId};
pub use structs::{
    Coordinates, NpcAttributes, PlannedBatch, ProvisionedNpc, ProvisioningRecord, SpawnPlan,
    WorldDescriptor,
};
