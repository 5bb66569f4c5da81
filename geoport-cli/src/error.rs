//! Error types emitted by the geoport CLI.
//!
//! Keep this error type reasonably small, as every CLI helper returns
//! `Result<_, CliError>`.

use std::sync::Arc;

use camino::Utf8PathBuf;
use geoport_core::{LedgerError, SchemaStoreError};
use geoport_importer::ImportError;
use thiserror::Error;

/// Errors emitted by the geoport CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Provided arguments failed Clap validation.
    #[error(transparent)]
    ArgumentParsing(#[from] clap::Error),
    /// Configuration layering failed (files, env, CLI).
    #[error("failed to load configuration: {0}")]
    Configuration(#[from] Arc<ortho_config::OrthoError>),
    /// A required option is missing after configuration merging.
    #[error("missing {field} (set --{field} or {env})")]
    MissingArgument {
        field: &'static str,
        env: &'static str,
    },
    /// A referenced input path does not exist on disk.
    #[error("{field} path {path:?} does not exist")]
    MissingSourceFile {
        field: &'static str,
        path: Utf8PathBuf,
    },
    /// A referenced input path exists but is not a file.
    #[error("{field} path {path:?} exists but is not a file")]
    SourcePathNotFile {
        field: &'static str,
        path: Utf8PathBuf,
    },
    /// A referenced input path could not be inspected due to an IO error.
    #[error("failed to inspect {field} path {path:?}: {source}")]
    InspectSourcePath {
        field: &'static str,
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The execution identifier is not a UUID.
    #[error("invalid execution id {value:?}: {source}")]
    InvalidExecutionId {
        value: String,
        #[source]
        source: uuid::Error,
    },
    /// The directory holding the database could not be created.
    #[error("failed to prepare database directory for {path:?}: {source}")]
    PrepareDatabase {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The execution ledger could not be opened or read.
    #[error("execution ledger at {path:?} failed: {source}")]
    Ledger {
        path: Utf8PathBuf,
        #[source]
        source: LedgerError,
    },
    /// The schema catalog could not be opened.
    #[error("failed to open schema catalog at {path:?}: {source}")]
    OpenCatalog {
        path: Utf8PathBuf,
        #[source]
        source: SchemaStoreError,
    },
    /// The async runtime could not be started.
    #[error("failed to build Tokio runtime: {0}")]
    Runtime(#[source] std::io::Error),
    /// The import was rejected before it started.
    #[error("import rejected: {0}")]
    Import(#[from] ImportError),
    /// Serializing the execution failed.
    #[error("failed to serialize execution: {0}")]
    SerializeExecution(#[source] serde_json::Error),
    /// Writing the command output failed.
    #[error("failed to write output: {0}")]
    WriteOutput(#[source] std::io::Error),
}
