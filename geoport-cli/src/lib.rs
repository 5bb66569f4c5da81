//! Command-line interface for running geoport imports.
#![forbid(unsafe_code)]

use std::io::Write;

use clap::{Parser, Subcommand};
use geoport_core::ExecutionRequest;

mod error;
mod import;
mod status;

pub use error::CliError;
use import::{ImportArgs, run_import};
use status::{StatusArgs, run_status};

pub(crate) const ARG_DATABASE: &str = "database";
pub(crate) const ARG_BASE_FILE: &str = "base-file";
pub(crate) const ARG_USER: &str = "user";
pub(crate) const ARG_OVERRIDE_EXISTING_LAYER: &str = "override-existing-layer";
pub(crate) const ARG_SKIP_EXISTING_LAYER: &str = "skip-existing-layer";
pub(crate) const ARG_OGR2OGR: &str = "ogr2ogr";
pub(crate) const ARG_PG_HOST: &str = "pg-host";
pub(crate) const ARG_PG_PORT: &str = "pg-port";
pub(crate) const ARG_PG_DATABASE: &str = "pg-database";
pub(crate) const ARG_PG_USER: &str = "pg-user";
pub(crate) const ARG_PG_PASSWORD: &str = "pg-password";
pub(crate) const ARG_LOADER_TIMEOUT_SECS: &str = "loader-timeout-secs";
pub(crate) const ARG_QUEUE_CONCURRENCY: &str = "queue-concurrency";
pub(crate) const ARG_MAX_RETRIES: &str = "max-retries";
pub(crate) const ARG_EXEC_ID: &str = "exec-id";
pub(crate) const ENV_IMPORT_DATABASE: &str = "GEOPORT_CMDS_IMPORT_DATABASE";
pub(crate) const ENV_IMPORT_BASE_FILE: &str = "GEOPORT_CMDS_IMPORT_BASE_FILE";
pub(crate) const ENV_IMPORT_USER: &str = "GEOPORT_CMDS_IMPORT_USER";
pub(crate) const ENV_STATUS_DATABASE: &str = "GEOPORT_CMDS_STATUS_DATABASE";
pub(crate) const ENV_STATUS_EXEC_ID: &str = "GEOPORT_CMDS_STATUS_EXEC_ID";

/// Run the geoport CLI with the current process arguments and environment.
///
/// # Errors
///
/// Returns a [`CliError`] when arguments or configuration are invalid, the
/// stores cannot be opened, or the import is rejected.
pub fn run() -> Result<(), CliError> {
    let cli = Cli::try_parse().map_err(CliError::ArgumentParsing)?;
    let mut stdout = std::io::stdout().lock();
    execute(cli.command, &mut stdout)
}

fn execute(command: Command, out: &mut impl Write) -> Result<(), CliError> {
    let execution = match command {
        Command::Import(args) => {
            let config = args.into_config()?;
            config.validate_sources()?;
            run_import(&config)?
        }
        Command::Status(args) => {
            let config = args.into_config()?;
            config.validate_sources()?;
            run_status(&config)?
        }
    };
    write_execution(out, &execution)
}

fn write_execution(out: &mut impl Write, execution: &ExecutionRequest) -> Result<(), CliError> {
    let rendered =
        serde_json::to_string_pretty(execution).map_err(CliError::SerializeExecution)?;
    writeln!(out, "{rendered}").map_err(CliError::WriteOutput)
}

#[derive(Debug, Parser)]
#[command(
    name = "geoport",
    about = "Import GeoPackage datasets into PostGIS and track their progress",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Import every layer of a GeoPackage and wait for the result.
    Import(ImportArgs),
    /// Show the recorded state of an execution.
    Status(StatusArgs),
}

#[cfg(test)]
mod tests;
