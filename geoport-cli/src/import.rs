//! Import command implementation for the geoport CLI.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use geoport_core::{ExecutionRequest, SqliteExecutionLedger, SqliteSchemaStore};
use geoport_data::{
    ConnectionParams, DEFAULT_LOADER_TIMEOUT, DEFAULT_OGR2OGR, GeoPackageSource, Ogr2OgrLoader,
};
use geoport_importer::{
    DEFAULT_QUEUE_CONCURRENCY, ImportPayload, ImportRequest, Orchestrator, RetryPolicy,
    SchedulerConfig, Staging,
};
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    ARG_BASE_FILE, ARG_DATABASE, ARG_LOADER_TIMEOUT_SECS, ARG_MAX_RETRIES, ARG_OGR2OGR,
    ARG_OVERRIDE_EXISTING_LAYER, ARG_PG_DATABASE, ARG_PG_HOST, ARG_PG_PASSWORD, ARG_PG_PORT,
    ARG_PG_USER, ARG_QUEUE_CONCURRENCY, ARG_SKIP_EXISTING_LAYER, ARG_USER, CliError,
    ENV_IMPORT_BASE_FILE, ENV_IMPORT_DATABASE, ENV_IMPORT_USER,
};

pub(crate) const DEFAULT_PG_HOST: &str = "localhost";
pub(crate) const DEFAULT_PG_PORT: u16 = 5432;
pub(crate) const DEFAULT_PG_DATABASE: &str = "geoport";
pub(crate) const DEFAULT_PG_USER: &str = "geoport";

/// CLI arguments for the `import` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Import every feature layer of a GeoPackage into PostGIS. \
                 The execution is recorded in a SQLite ledger and the command \
                 waits until it completes or fails. Options can come from CLI \
                 flags, configuration files, or environment variables.",
    about = "Import a GeoPackage"
)]
#[ortho_config(prefix = "GEOPORT")]
pub(crate) struct ImportArgs {
    /// SQLite database holding the execution ledger and schema catalog.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
    /// GeoPackage to import.
    #[arg(long = ARG_BASE_FILE, value_name = "path")]
    #[serde(default)]
    pub(crate) base_file: Option<Utf8PathBuf>,
    /// User the import runs on behalf of.
    #[arg(long = ARG_USER, value_name = "name")]
    #[serde(default)]
    pub(crate) user: Option<String>,
    /// Replace existing layers instead of creating suffixed copies.
    #[arg(
        long = ARG_OVERRIDE_EXISTING_LAYER,
        value_name = "bool",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    #[serde(default)]
    pub(crate) override_existing_layer: Option<bool>,
    /// Skip layers the user already imported.
    #[arg(
        long = ARG_SKIP_EXISTING_LAYER,
        value_name = "bool",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    #[serde(default)]
    pub(crate) skip_existing_layer: Option<bool>,
    /// Path to the `ogr2ogr` binary.
    #[arg(long = ARG_OGR2OGR, value_name = "path")]
    #[serde(default)]
    pub(crate) ogr2ogr: Option<Utf8PathBuf>,
    /// PostgreSQL host.
    #[arg(long = ARG_PG_HOST, value_name = "host")]
    #[serde(default)]
    pub(crate) pg_host: Option<String>,
    /// PostgreSQL port.
    #[arg(long = ARG_PG_PORT, value_name = "port")]
    #[serde(default)]
    pub(crate) pg_port: Option<u16>,
    /// PostgreSQL database receiving the layers.
    #[arg(long = ARG_PG_DATABASE, value_name = "name")]
    #[serde(default)]
    pub(crate) pg_database: Option<String>,
    /// PostgreSQL login role.
    #[arg(long = ARG_PG_USER, value_name = "name")]
    #[serde(default)]
    pub(crate) pg_user: Option<String>,
    /// PostgreSQL password.
    #[arg(long = ARG_PG_PASSWORD, value_name = "password")]
    #[serde(default)]
    pub(crate) pg_password: Option<String>,
    /// Seconds a single `ogr2ogr` run may take before it is killed.
    #[arg(long = ARG_LOADER_TIMEOUT_SECS, value_name = "seconds")]
    #[serde(default)]
    pub(crate) loader_timeout_secs: Option<u64>,
    /// Jobs each queue runs at once.
    #[arg(long = ARG_QUEUE_CONCURRENCY, value_name = "count")]
    #[serde(default)]
    pub(crate) queue_concurrency: Option<usize>,
    /// Extra attempts for jobs failing with a transient error.
    #[arg(long = ARG_MAX_RETRIES, value_name = "count")]
    #[serde(default)]
    pub(crate) max_retries: Option<u32>,
}

impl ImportArgs {
    pub(crate) fn into_config(self) -> Result<ImportConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        ImportConfig::try_from(merged)
    }
}

/// Resolved `import` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImportConfig {
    /// Ledger and catalog database.
    pub(crate) database: Utf8PathBuf,
    /// GeoPackage to import.
    pub(crate) base_file: Utf8PathBuf,
    /// Requesting user.
    pub(crate) user: String,
    pub(crate) override_existing_layer: bool,
    pub(crate) skip_existing_layer: bool,
    /// Loader binary.
    pub(crate) ogr2ogr: Utf8PathBuf,
    /// Target PostGIS database.
    pub(crate) connection: ConnectionParams,
    pub(crate) loader_timeout: Duration,
    pub(crate) scheduler: SchedulerConfig,
}

impl ImportConfig {
    pub(crate) fn validate_sources(&self) -> Result<(), CliError> {
        require_existing(&self.base_file, ARG_BASE_FILE)
    }
}

/// Fail unless `path` names an existing regular file.
pub(crate) fn require_existing(path: &Utf8Path, field: &'static str) -> Result<(), CliError> {
    match geoport_fs::file_is_file(path) {
        Ok(true) => Ok(()),
        Ok(false) if path.exists() => Err(CliError::SourcePathNotFile {
            field,
            path: path.to_path_buf(),
        }),
        Ok(false) => Err(CliError::MissingSourceFile {
            field,
            path: path.to_path_buf(),
        }),
        Err(source) => Err(CliError::InspectSourcePath {
            field,
            path: path.to_path_buf(),
            source,
        }),
    }
}

impl TryFrom<ImportArgs> for ImportConfig {
    type Error = CliError;

    fn try_from(args: ImportArgs) -> Result<Self, Self::Error> {
        let database = args.database.ok_or(CliError::MissingArgument {
            field: ARG_DATABASE,
            env: ENV_IMPORT_DATABASE,
        })?;
        let base_file = args.base_file.ok_or(CliError::MissingArgument {
            field: ARG_BASE_FILE,
            env: ENV_IMPORT_BASE_FILE,
        })?;
        let user = args.user.ok_or(CliError::MissingArgument {
            field: ARG_USER,
            env: ENV_IMPORT_USER,
        })?;

        let connection = ConnectionParams {
            dbname: args
                .pg_database
                .unwrap_or_else(|| DEFAULT_PG_DATABASE.to_owned()),
            host: args.pg_host.unwrap_or_else(|| DEFAULT_PG_HOST.to_owned()),
            port: args.pg_port.unwrap_or(DEFAULT_PG_PORT),
            user: args.pg_user.unwrap_or_else(|| DEFAULT_PG_USER.to_owned()),
            password: args.pg_password.unwrap_or_default(),
        };
        let loader_timeout = args
            .loader_timeout_secs
            .map_or(DEFAULT_LOADER_TIMEOUT, Duration::from_secs);
        let scheduler = SchedulerConfig {
            default_concurrency: args.queue_concurrency.unwrap_or(DEFAULT_QUEUE_CONCURRENCY),
            retry: args
                .max_retries
                .map_or_else(RetryPolicy::default, |max_retries| RetryPolicy { max_retries }),
            ..SchedulerConfig::default()
        };

        Ok(Self {
            database,
            base_file,
            user,
            override_existing_layer: args.override_existing_layer.unwrap_or(false),
            skip_existing_layer: args.skip_existing_layer.unwrap_or(false),
            ogr2ogr: args
                .ogr2ogr
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_OGR2OGR)),
            connection,
            loader_timeout,
            scheduler,
        })
    }
}

/// Run the import described by `config` to completion.
///
/// Rejections are returned as errors; failures after the execution was
/// recorded are reported through the returned execution's status.
pub(crate) fn run_import(config: &ImportConfig) -> Result<ExecutionRequest, CliError> {
    let orchestrator = build_orchestrator(config)?;
    let payload = ImportPayload::with_base_file(config.base_file.clone())
        .with_param("override_existing_layer", config.override_existing_layer)
        .with_param("skip_existing_layer", config.skip_existing_layer);
    let request = ImportRequest {
        staging: Staging::Borrowed,
        ..ImportRequest::upload(config.user.clone(), payload)
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    runtime.block_on(async {
        let id = orchestrator.submit_import(request).await?;
        info!(exec_id = %id, base_file = %config.base_file, "import submitted");
        orchestrator.wait_idle().await;
        let execution = orchestrator.execution(id).await?;
        info!(exec_id = %id, status = %execution.status, "import finished");
        Ok::<_, CliError>(execution)
    })
}

fn build_orchestrator(config: &ImportConfig) -> Result<Orchestrator, CliError> {
    let database = &config.database;
    geoport_fs::ensure_parent_dir(database).map_err(|source| CliError::PrepareDatabase {
        path: database.clone(),
        source,
    })?;
    let ledger = SqliteExecutionLedger::open(database).map_err(|source| CliError::Ledger {
        path: database.clone(),
        source,
    })?;
    let schemas = SqliteSchemaStore::open(database).map_err(|source| CliError::OpenCatalog {
        path: database.clone(),
        source,
    })?;
    let loader = Ogr2OgrLoader::new(config.ogr2ogr.clone(), config.connection.clone())
        .with_timeout(config.loader_timeout);
    Ok(Orchestrator::builder(
        Arc::new(ledger),
        Arc::new(schemas),
        Arc::new(GeoPackageSource),
        Arc::new(loader),
    )
    .scheduler(config.scheduler.clone())
    .build())
}
