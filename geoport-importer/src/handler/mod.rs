//! Format handlers and the contract the orchestrator drives them through.
//!
//! A handler declares, per action, the ordered list of stages an execution
//! walks through and runs each stage when the orchestrator asks it to.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use geoport_core::{Action, ExecutionId, ExecutionRequest, LayerRef};
use serde_json::{Map, Value};

use crate::error::{ImportError, TaskError};
use crate::orchestrator::Orchestrator;
use crate::payload::{ImportPayload, PayloadValidator};

mod vector;

pub use vector::{
    CREATE_GN_RESOURCE, GPKG_HANDLER_QUEUE, GPKG_IDENTITY, GPKG_NEXT_STEP_QUEUE,
    GPKG_OGR2OGR_QUEUE, GeoPackageHandler, GeoPackagePayloadValidator, IMPORT_RESOURCE,
    PUBLISH_RESOURCE, START_IMPORT,
};

/// Flags extracted from a request payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerParams {
    /// Replace existing layer schemas and tables.
    pub override_existing_layer: bool,
    /// Skip layers the user already imported.
    pub skip_existing_layer: bool,
}

/// Position of one chain in the pipeline.
///
/// Executions start with a cursor that has completed nothing; layer chains
/// carry the layer they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCursor {
    /// Execution the chain belongs to.
    pub exec_id: ExecutionId,
    /// Last stage that finished, if any.
    pub completed: Option<String>,
    /// Layer the chain is processing.
    pub layer: Option<LayerRef>,
}

impl StageCursor {
    /// Cursor at the start of an execution.
    #[must_use]
    pub const fn start(exec_id: ExecutionId) -> Self {
        Self {
            exec_id,
            completed: None,
            layer: None,
        }
    }

    /// Cursor at the start of a layer chain.
    #[must_use]
    pub const fn for_layer(exec_id: ExecutionId, layer: LayerRef) -> Self {
        Self {
            exec_id,
            completed: None,
            layer: Some(layer),
        }
    }

    /// The same chain with `stage` recorded as completed.
    #[must_use]
    pub fn after(&self, stage: &str) -> Self {
        Self {
            exec_id: self.exec_id,
            completed: Some(stage.to_owned()),
            layer: self.layer.clone(),
        }
    }
}

/// What the orchestrator does once a stage returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Continue the chain with the next stage.
    Advance,
    /// The stage scheduled its own continuations.
    Deferred,
}

/// Everything a stage needs to run.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Services and scheduler of the running pipeline.
    pub orchestrator: Orchestrator,
    /// Execution snapshot taken when the stage started.
    pub execution: ExecutionRequest,
    /// Chain position, with `completed` still set to the previous stage.
    pub cursor: StageCursor,
}

/// A format-specific importer.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Stable identity stored on executions.
    fn identity(&self) -> &str;

    /// Whether this handler should process `payload`.
    fn accepts(&self, payload: &ImportPayload) -> bool;

    /// Whether every declared file is usable.
    fn is_valid(&self, files: &BTreeMap<String, Utf8PathBuf>) -> bool;

    /// Ordered stages for `action`; empty when unsupported.
    fn task_list(&self, action: Action) -> &'static [&'static str];

    /// Whether the handler supports `action`.
    fn can_do(&self, action: Action) -> bool {
        !self.task_list(action).is_empty()
    }

    /// Split handler flags from the remaining request parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Validation`] when a flag has an unusable value.
    fn extract_params_from_data(
        &self,
        params: Map<String, Value>,
        action: Action,
    ) -> Result<(HandlerParams, Map<String, Value>), ImportError>;

    /// Handler-specific payload validator.
    fn validator(&self) -> Option<&dyn PayloadValidator> {
        None
    }

    /// Run one stage.
    ///
    /// # Errors
    ///
    /// Returns the [`TaskError`] that stopped the stage.
    async fn run_stage(&self, stage: &str, ctx: StageContext) -> Result<StageOutcome, TaskError>;
}
