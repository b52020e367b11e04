//! Type-safe identifier wrappers around [`Uuid`].
//!
//! Every row written by the provisioning saga has a strongly-typed ID so a
//! per-world account id can never be passed where a global player id is
//! expected. All IDs use UUID v7 (time-ordered) for efficient indexing.
//!
//! IDs are generated app-side: the orchestrator needs the provisioning id
//! before either store has been touched, and the per-world rows carry it as
//! their linkage field.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl core::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Unique identifier for a game world (one per-world store each).
    WorldId
}

define_id! {
    /// Unique identifier for a provisioning record in the ledger.
    ProvisioningId
}

define_id! {
    /// Unique identifier for a player identity row in the global store.
    PlayerId
}

define_id! {
    /// Unique identifier for an account row in a per-world store.
    AccountId
}

define_id! {
    /// Unique identifier for a settlement row in a per-world store.
    SettlementId
}

define_id! {
    /// Unique identifier for a deferred spawn batch.
    SpawnBatchId
}
