//! Facade crate for the geoport import pipeline.
//!
//! This crate re-exports the core domain types and the GeoPackage tooling,
//! and exposes the orchestrator and the SQLite stores behind feature flags.

#![forbid(unsafe_code)]

pub use geoport_core::{
    Action, ExecutionId, ExecutionLedger, ExecutionRequest, ExecutionStatus, LayerProgress,
    LayerSource, LedgerError, SchemaStore, SchemaStoreError, SourceLayer,
};

#[cfg(feature = "store-sqlite")]
pub use geoport_core::{SqliteExecutionLedger, SqliteSchemaStore};

pub use geoport_data::{ConnectionParams, DataLoader, GeoPackageSource, Ogr2OgrLoader};

#[cfg(feature = "importer")]
pub use geoport_importer::{
    CopyRequest, HandlerRegistry, ImportError, ImportPayload, ImportRequest, Orchestrator,
    SchedulerConfig,
};
