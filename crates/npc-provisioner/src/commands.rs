//! Command execution against a connected [`Provisioner`].

use chrono::Utc;
use npc_core::{PlacementParams, Provisioner};
use npc_types::{NpcAttributes, WorldDescriptor};
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::{Command, CreateNpcArgs, RegisterWorldArgs, SpawnLocationsArgs};
use crate::error::CliError;

/// What a command printed, and whether part of it failed.
#[derive(Debug)]
pub struct Report {
    /// JSON written to stdout.
    pub body: serde_json::Value,
    /// Some of the work failed; the process exits with status 2.
    pub partial: bool,
}

impl Report {
    fn complete<T: Serialize>(value: &T) -> Result<Self, CliError> {
        Self::partial_if(value, false)
    }

    fn partial_if<T: Serialize>(value: &T, partial: bool) -> Result<Self, CliError> {
        Ok(Self {
            body: serde_json::to_value(value)?,
            partial,
        })
    }
}

/// Run one command.
pub async fn execute(service: &Provisioner, command: Command) -> Result<Report, CliError> {
    match command {
        Command::CreateNpc(args) => create_npc(service, &args).await,
        Command::SpawnLocations(args) => spawn_locations(service, &args).await,
        Command::PlanBatches(args) => {
            let plan = service
                .plan_batches(args.world, args.count, &args.preset)
                .await?;
            Report::complete(&plan)
        }
        Command::SpawnBulk(args) => {
            let strategy = args
                .strategy
                .unwrap_or(service.config().placement.strategy);
            let outcome = service
                .spawn_bulk(args.world, args.count, &args.preset, strategy)
                .await?;
            Report::partial_if(&outcome, !outcome.instant.failures.is_empty())
        }
        Command::RunDueBatches => {
            let report = service.run_due_batches().await?;
            Report::partial_if(&report, report.failed > 0 || report.store_errors > 0)
        }
        Command::Reconcile(args) => {
            if args.watch {
                service.watch_reconciliation(shutdown_signal()).await;
                return Report::complete(&serde_json::json!({ "stopped": true }));
            }
            let report = service.run_reconciliation().await?;
            let unresolved = report.blocked > 0 || report.retried > 0 || report.skipped > 0;
            Report::partial_if(&report, unresolved)
        }
        Command::Unblock { id } => Report::complete(&service.unblock(id).await?),
        Command::Show { id } => Report::complete(&service.show(id).await?),
        Command::List(args) => Report::complete(&service.list(args.status, args.limit).await?),
        Command::RegisterWorld(args) => register_world(service, args).await,
        Command::Migrate => Report::complete(&service.migrate().await?),
    }
}

async fn create_npc(service: &Provisioner, args: &CreateNpcArgs) -> Result<Report, CliError> {
    let attributes = NpcAttributes {
        name: args.name.clone(),
        faction: args.faction,
        difficulty: args.difficulty,
        personality: args.personality,
    };
    let npc = service
        .create_npc(args.world, &attributes, args.location())
        .await?;
    Report::complete(&npc)
}

async fn spawn_locations(
    service: &Provisioner,
    args: &SpawnLocationsArgs,
) -> Result<Report, CliError> {
    let strategy = args
        .strategy
        .unwrap_or(service.config().placement.strategy);
    let params = PlacementParams {
        seed: args.seed,
        ..service.placement_params()
    };
    let tiles = service
        .generate_spawn_locations(args.world, args.count, strategy, &params)
        .await?;
    Report::complete(&tiles)
}

async fn register_world(
    service: &Provisioner,
    args: RegisterWorldArgs,
) -> Result<Report, CliError> {
    let id = args.id.unwrap_or_default();
    let existing = service.world(id).await?;
    let created_at = args
        .created_at
        .or_else(|| existing.map(|world| world.created_at))
        .unwrap_or_else(Utc::now);

    let world = WorldDescriptor {
        id,
        name: args.name,
        connection_url: args.url,
        is_active: !args.inactive,
        created_at,
    };
    service.register_world(&world).await?;
    Report::complete(&serde_json::json!({
        "id": world.id,
        "name": world.name,
        "is_active": world.is_active,
        "created_at": world.created_at,
    }))
}

/// Resolves on Ctrl-C.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
