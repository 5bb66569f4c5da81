//! Status command implementation for the geoport CLI.

use camino::Utf8PathBuf;
use clap::Parser;
use geoport_core::{ExecutionId, ExecutionLedger, ExecutionRequest, SqliteExecutionLedger};
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::import::require_existing;
use crate::{ARG_DATABASE, ARG_EXEC_ID, CliError, ENV_STATUS_DATABASE, ENV_STATUS_EXEC_ID};

/// CLI arguments for the `status` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(about = "Print the recorded state of an execution as JSON")]
#[ortho_config(prefix = "GEOPORT")]
pub(crate) struct StatusArgs {
    /// Identifier printed by `geoport import`.
    #[arg(value_name = "exec-id")]
    #[serde(default)]
    pub(crate) exec_id: Option<String>,
    /// SQLite database holding the execution ledger.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
}

impl StatusArgs {
    pub(crate) fn into_config(self) -> Result<StatusConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        StatusConfig::try_from(merged)
    }
}

/// Resolved `status` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatusConfig {
    pub(crate) exec_id: ExecutionId,
    pub(crate) database: Utf8PathBuf,
}

impl StatusConfig {
    pub(crate) fn validate_sources(&self) -> Result<(), CliError> {
        require_existing(&self.database, ARG_DATABASE)
    }
}

impl TryFrom<StatusArgs> for StatusConfig {
    type Error = CliError;

    fn try_from(args: StatusArgs) -> Result<Self, Self::Error> {
        let raw = args.exec_id.ok_or(CliError::MissingArgument {
            field: ARG_EXEC_ID,
            env: ENV_STATUS_EXEC_ID,
        })?;
        let exec_id = raw
            .parse()
            .map_err(|source| CliError::InvalidExecutionId { value: raw, source })?;
        let database = args.database.ok_or(CliError::MissingArgument {
            field: ARG_DATABASE,
            env: ENV_STATUS_DATABASE,
        })?;
        Ok(Self { exec_id, database })
    }
}

pub(crate) fn run_status(config: &StatusConfig) -> Result<ExecutionRequest, CliError> {
    let ledger_error = |source| CliError::Ledger {
        path: config.database.clone(),
        source,
    };
    let ledger = SqliteExecutionLedger::open(&config.database).map_err(ledger_error)?;
    ledger.get(config.exec_id).map_err(ledger_error)
}
