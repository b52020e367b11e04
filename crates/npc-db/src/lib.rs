//! Data layer for NPC provisioning (global store + per-world stores).
//!
//! The global store holds cross-world identity: players, their AI
//! configuration, the world registry, the provisioning ledger, and deferred
//! spawn batches. Each world has its own store holding the game state an
//! NPC needs to exist: an account, a capital settlement, its resource
//! fields, and the claimed map tile. No transaction spans the two.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator / Reconciler
//!     |
//!     +-- GlobalStore (Postgres | Memory)
//!     |       |-- LedgerStore     (provisioning records, CAS saves)
//!     |       |-- PlayerStore     (players + ai_configs)
//!     |       |-- RegistryStore   (worlds)
//!     |       +-- BatchStore      (spawn_batches)
//!     |
//!     +-- WorldStore (Postgres | Memory), one per world
//!             +-- SettlementStore (accounts, settlements, fields, tiles)
//! ```
//!
//! # Modules
//!
//! - [`postgres`] -- `PostgreSQL` pools and their schema migrations
//! - [`global`] -- [`GlobalStore`] dispatch over backends
//! - [`world`] -- [`WorldStore`] dispatch over backends
//! - [`ledger_store`] -- Provisioning record persistence
//! - [`player_store`] -- Global player identities
//! - [`registry_store`] -- World descriptors
//! - [`batch_store`] -- Deferred spawn batches
//! - [`settlement_store`] -- Per-world NPC footprints
//! - [`memory`] -- In-memory backends with fault injection
//! - [`error`] -- Shared error types

pub mod batch_store;
pub mod error;
pub mod global;
pub mod ledger_store;
pub mod memory;
pub mod player_store;
pub mod postgres;
pub mod registry_store;
pub mod settlement_store;
pub mod world;

// Re-export primary types for convenience.
pub use batch_store::{BatchStatus, BatchStore, SpawnBatchRecord};
pub use error::DbError;
pub use global::GlobalStore;
pub use ledger_store::{LedgerRow, LedgerStore};
pub use memory::{
    GlobalCounts, GlobalFault, MemoryGlobalStore, MemoryWorldStore, WorldCounts, WorldFault,
};
pub use player_store::{NewPlayer, PlayerRecord, PlayerRemoval, PlayerStore};
pub use postgres::{PoolSettings, PostgresPool, SchemaKind};
pub use registry_store::RegistryStore;
pub use settlement_store::{
    FieldSeed, FootprintRemoval, NPC_PASSWORD_PLACEHOLDER, SettlementSeed, SettlementStore,
    Stockpile, WorldFootprint,
};
pub use world::WorldStore;
