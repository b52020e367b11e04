//! Command-line entry point for NPC provisioning.
//!
//! Loads `provisioner-config.yaml`, initializes logging, connects to the
//! global store, and runs one command. Results are printed to stdout as
//! JSON; logs go to stderr.
//!
//! Exit status is `0` on success, `2` when part of the work failed (for
//! example some NPCs of a bulk request), and `1` on a hard failure.

mod cli;
mod commands;
mod error;

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use npc_core::config::LoggingConfig;
use npc_core::{ConfigError, LogFormat, Provisioner, ProvisionerConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::commands::Report;
use crate::error::CliError;

const PARTIAL_SUCCESS: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = load_config(&cli.config);
    let logging = loaded
        .as_ref()
        .map_or_else(|_| LoggingConfig::default(), |(config, _)| config.logging.clone());
    let format = cli.log_format.map_or(logging.format, LogFormat::from);
    init_tracing(&logging, format);

    let mut config = match loaded {
        Ok((config, from_file)) => {
            if !from_file {
                warn!(path = %cli.config.display(), "config file not found, using defaults");
            }
            config
        }
        Err(err) => {
            error!(path = %cli.config.display(), error = %err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Command::Reconcile(args) = &cli.command {
        if let Some(max_age) = args.max_age_secs {
            config.reconciler.max_age_secs = max_age;
        }
        if let Some(limit) = args.limit {
            config.reconciler.limit = limit;
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "npc-provisioner starting");
    match run(cli.command, config).await {
        Ok(report) => match serde_json::to_string_pretty(&report.body) {
            Ok(rendered) => {
                println!("{rendered}");
                if report.partial {
                    warn!("command finished with partial failures");
                    ExitCode::from(PARTIAL_SUCCESS)
                } else {
                    ExitCode::SUCCESS
                }
            }
            Err(err) => {
                error!(error = %err, "failed to render output");
                ExitCode::FAILURE
            }
        },
        Err(err) => {
            error!(error = %err, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: ProvisionerConfig) -> Result<Report, CliError> {
    let service = Provisioner::connect(config).await?;
    let result = Box::pin(commands::execute(&service, command)).await;
    service.shutdown().await;
    result
}

/// Read the config file, or fall back to defaults when it does not exist.
/// The flag reports whether the file was read.
fn load_config(path: &Path) -> Result<(ProvisionerConfig, bool), ConfigError> {
    if path.exists() {
        return ProvisionerConfig::from_file(path).map(|config| (config, true));
    }
    let mut config = ProvisionerConfig::default();
    config.infrastructure.apply_env_overrides();
    Ok((config, false))
}

fn init_tracing(logging: &LoggingConfig, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
