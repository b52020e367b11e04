//! Command-line arguments.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use npc_core::LogFormat;
use npc_types::{
    Coordinates, Difficulty, Faction, Personality, PlacementStrategy, ProvisioningId,
    ProvisioningStatus, WorldId,
};

/// Provision NPC players across the global store and per-world stores.
#[derive(Debug, Parser)]
#[command(name = "npc-provisioner", version)]
pub struct Cli {
    /// Configuration file. Defaults apply when it does not exist.
    #[arg(short, long, env = "NPC_CONFIG", default_value = "provisioner-config.yaml")]
    pub config: PathBuf,

    /// Log output format, overriding the configuration.
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => Self::Text,
            LogFormatArg::Json => Self::Json,
        }
    }
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Provision one NPC.
    CreateNpc(CreateNpcArgs),

    /// Sample unoccupied spawn locations without claiming them.
    SpawnLocations(SpawnLocationsArgs),

    /// Show how a bulk request would be split.
    PlanBatches(PlanArgs),

    /// Provision the instant part of a bulk request and schedule the rest.
    SpawnBulk(SpawnBulkArgs),

    /// Execute deferred batches that are due.
    RunDueBatches,

    /// Resolve stuck provisioning records.
    Reconcile(ReconcileArgs),

    /// Release a blocked record back to the reconciler.
    Unblock {
        /// Provisioning record id.
        id: ProvisioningId,
    },

    /// Show one provisioning record.
    Show {
        /// Provisioning record id.
        id: ProvisioningId,
    },

    /// List recent provisioning records.
    List(ListArgs),

    /// Register, update, or deactivate a world.
    RegisterWorld(RegisterWorldArgs),

    /// Migrate the global schema and every active world's schema.
    Migrate,
}

/// Arguments of `create-npc`.
#[derive(Debug, Args)]
pub struct CreateNpcArgs {
    /// Target world.
    #[arg(long)]
    pub world: WorldId,

    /// NPC display name.
    #[arg(long)]
    pub name: String,

    /// NPC faction.
    #[arg(long, default_value = "romans")]
    pub faction: Faction,

    /// AI difficulty tier.
    #[arg(long, default_value = "medium")]
    pub difficulty: Difficulty,

    /// AI behavior profile.
    #[arg(long, default_value = "balanced")]
    pub personality: Personality,

    /// Tile x coordinate; allocated when omitted.
    #[arg(long, requires = "y", allow_hyphen_values = true)]
    pub x: Option<i32>,

    /// Tile y coordinate; allocated when omitted.
    #[arg(long, requires = "x", allow_hyphen_values = true)]
    pub y: Option<i32>,
}

impl CreateNpcArgs {
    /// Explicit location, if both coordinates were given.
    pub fn location(&self) -> Option<Coordinates> {
        self.x.zip(self.y).map(|(x, y)| Coordinates::new(x, y))
    }
}

/// Arguments of `spawn-locations`.
#[derive(Debug, Args)]
pub struct SpawnLocationsArgs {
    /// Target world.
    #[arg(long)]
    pub world: WorldId,

    /// Locations to sample.
    #[arg(long)]
    pub count: u32,

    /// Placement strategy; configured default when omitted.
    #[arg(long)]
    pub strategy: Option<PlacementStrategy>,

    /// RNG seed for a reproducible plan.
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Arguments of `plan-batches`.
#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Target world.
    #[arg(long)]
    pub world: WorldId,

    /// Total NPCs requested.
    #[arg(long)]
    pub count: u32,

    /// Built-in or configured preset.
    #[arg(long, default_value = "instant")]
    pub preset: String,
}

/// Arguments of `spawn-bulk`.
#[derive(Debug, Args)]
pub struct SpawnBulkArgs {
    /// Target world.
    #[arg(long)]
    pub world: WorldId,

    /// Total NPCs requested.
    #[arg(long)]
    pub count: u32,

    /// Built-in or configured preset.
    #[arg(long, default_value = "instant")]
    pub preset: String,

    /// Placement strategy; configured default when omitted.
    #[arg(long)]
    pub strategy: Option<PlacementStrategy>,
}

/// Arguments of `reconcile`.
#[derive(Debug, Args)]
pub struct ReconcileArgs {
    /// Keep running on the configured interval until Ctrl-C.
    #[arg(long)]
    pub watch: bool,

    /// Only records untouched for this many seconds.
    #[arg(long)]
    pub max_age_secs: Option<u64>,

    /// Records per pass.
    #[arg(long)]
    pub limit: Option<u32>,
}

/// Arguments of `list`.
#[derive(Debug, Args)]
pub struct ListArgs {
    /// Only records in this status.
    #[arg(long)]
    pub status: Option<ProvisioningStatus>,

    /// Maximum records to return.
    #[arg(long, default_value_t = 50)]
    pub limit: u32,
}

/// Arguments of `register-world`.
#[derive(Debug, Args)]
pub struct RegisterWorldArgs {
    /// World id; a new one is generated when omitted.
    #[arg(long)]
    pub id: Option<WorldId>,

    /// Human-readable world name.
    #[arg(long)]
    pub name: String,

    /// Connection URL of the world's store.
    #[arg(long, env = "NPC_WORLD_URL")]
    pub url: String,

    /// Register the world as inactive.
    #[arg(long)]
    pub inactive: bool,

    /// World start (RFC 3339); kept from the existing entry, or now.
    #[arg(long)]
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn create_npc_accepts_negative_coordinates() {
        let world = WorldId::new();
        let cli = Cli::try_parse_from([
            "npc-provisioner",
            "create-npc",
            "--world",
            &world.to_string(),
            "--name",
            "Ada",
            "--faction",
            "gauls",
            "--x",
            "-12",
            "--y",
            "7",
        ])
        .unwrap();
        let Command::CreateNpc(args) = cli.command else {
            panic!("expected create-npc");
        };
        assert_eq!(args.world, world);
        assert_eq!(args.faction, Faction::Gauls);
        assert_eq!(args.location(), Some(Coordinates::new(-12, 7)));
    }

    #[test]
    fn single_coordinate_is_rejected() {
        let result = Cli::try_parse_from([
            "npc-provisioner",
            "create-npc",
            "--world",
            &WorldId::new().to_string(),
            "--name",
            "Ada",
            "--x",
            "3",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn list_parses_kebab_case_status() {
        let cli = Cli::try_parse_from([
            "npc-provisioner",
            "list",
            "--status",
            "committed-per-world",
        ])
        .unwrap();
        let Command::List(args) = cli.command else {
            panic!("expected list");
        };
        assert_eq!(args.status, Some(ProvisioningStatus::CommittedPerWorld));
        assert_eq!(args.limit, 50);
    }
}
