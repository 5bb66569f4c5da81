//! Core domain types for the geoport import pipeline.
//!
//! The crate defines the execution request model, the dynamic layer schema
//! model and the persistence traits shared by the importer and the CLI:
//! [`ExecutionLedger`], [`SchemaStore`] and [`LayerSource`]. SQLite
//! implementations live behind the `store-sqlite` feature; in-memory doubles
//! for tests live behind `test-support`.
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod execution;
pub mod ledger;
pub mod schema;
mod source;

#[cfg(any(test, feature = "test-support"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-support")))]
pub mod test_support;

pub use execution::{
    Action, ExecutionId, ExecutionRequest, ExecutionSource, ExecutionStatus, ExecutionUpdate,
    InputParams, LayerProgress, LayerRef, LayerState, LegacyStatus, LogEntry, NewExecution,
    UnknownLabel, unix_now,
};
pub use ledger::{ExecutionLedger, LedgerError};
#[cfg(feature = "store-sqlite")]
pub use ledger::SqliteExecutionLedger;
pub use schema::{
    BatchReport, CHAR_MAX_LENGTH, DEFAULT_DB_NAME, FieldDescriptor, FieldKind, FieldOptions,
    GEOM_TYPE_MAPPING, GeometryKind, LayerSchema, ModelHandle, STANDARD_TYPE_MAPPING, SchemaId,
    SchemaLookup, SchemaStore, SchemaStoreError, geometry_kind, standard_field_kind,
};
#[cfg(feature = "store-sqlite")]
pub use schema::SqliteSchemaStore;
pub use source::{GeometryColumn, LayerSource, LayerSourceError, SourceField, SourceLayer};
