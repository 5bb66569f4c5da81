//! Import orchestration for geoport.
//!
//! An import walks through the stages its [`Handler`] declares. The
//! [`Orchestrator`] records every step in the
//! [`ExecutionLedger`](geoport_core::ExecutionLedger), queues each stage on
//! the [`Scheduler`] and re-enters itself when a stage finishes. The
//! GeoPackage handler fans out per layer: schema batches and the bulk load
//! run as a chord whose body continues the layer's chain, and the execution
//! completes once every layer chain has finished.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use geoport_core::{SqliteExecutionLedger, SqliteSchemaStore};
//! use geoport_data::{ConnectionParams, GeoPackageSource, Ogr2OgrLoader};
//! use geoport_importer::{ImportPayload, ImportRequest, Orchestrator};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::builder(
//!     Arc::new(SqliteExecutionLedger::open_in_memory()?),
//!     Arc::new(SqliteSchemaStore::open_in_memory()?),
//!     Arc::new(GeoPackageSource),
//!     Arc::new(Ogr2OgrLoader::new("/usr/bin/ogr2ogr", ConnectionParams::default())),
//! )
//! .build();
//! let payload = ImportPayload::with_base_file("/srv/uploads/roads.gpkg");
//! let id = orchestrator
//!     .submit_import(ImportRequest::upload("alice", payload))
//!     .await?;
//! orchestrator.wait_idle().await;
//! println!("{:?}", orchestrator.execution(id).await?.status);
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]

mod error;
pub mod handler;
mod orchestrator;
pub mod payload;
pub mod policy;
mod publisher;
mod registry;
pub mod scheduler;
pub mod schema;

pub use error::{ImportError, TaskError};
pub use handler::{
    CREATE_GN_RESOURCE, GPKG_HANDLER_QUEUE, GPKG_IDENTITY, GPKG_NEXT_STEP_QUEUE,
    GPKG_OGR2OGR_QUEUE, GeoPackageHandler, GeoPackagePayloadValidator, Handler, HandlerParams,
    IMPORT_RESOURCE, PUBLISH_RESOURCE, START_IMPORT, StageContext, StageCursor, StageOutcome,
};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, stage_queue};
pub use payload::{
    CopyRequest, GenericPayloadValidator, ImportPayload, ImportRequest, PayloadValidator, Staging,
};
pub use policy::should_be_imported;
pub use publisher::{LedgerPublisher, ResourcePublisher};
pub use registry::HandlerRegistry;
pub use scheduler::{
    DEFAULT_QUEUE_CONCURRENCY, FailureHook, Job, LedgerFailureHook, QueueStats, RetryPolicy,
    Scheduler, SchedulerConfig,
};
pub use schema::{FIELD_BATCH_SIZE, FieldOutcome};
