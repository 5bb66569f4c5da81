//! GeoPackage handler.
#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use geoport_core::{
    Action, ExecutionId, ExecutionRequest, ExecutionUpdate, LayerRef, LayerState, SchemaId,
    SourceLayer,
};
use geoport_data::LoadRequest;
use log::{debug, info};
use serde_json::{Map, Value};

use super::{Handler, HandlerParams, StageContext, StageCursor, StageOutcome};
use crate::error::{ImportError, TaskError};
use crate::orchestrator::Orchestrator;
use crate::payload::{BASE_FILE, ImportPayload, PayloadValidator, parse_flag};
use crate::policy::should_be_imported;
use crate::scheduler::{Job, LedgerFailureHook, run_blocking};
use crate::schema::{FieldOutcome, apply_batch, derive_fields, field_batches, resolve_schema};

/// Identity of the GeoPackage handler.
pub const GPKG_IDENTITY: &str = "geoport.handlers.gpkg";

/// First stage of an import; does nothing.
pub const START_IMPORT: &str = "start_import";
/// Stage fanning out schema and data jobs per layer.
pub const IMPORT_RESOURCE: &str = "import_resource";
/// Stage publishing a layer on the map server.
pub const PUBLISH_RESOURCE: &str = "publish_resource";
/// Stage registering a layer in the catalog.
pub const CREATE_GN_RESOURCE: &str = "create_gn_resource";

/// Queue of schema batch jobs.
pub const GPKG_HANDLER_QUEUE: &str = "importer.gpkg_handler";
/// Queue of bulk load jobs.
pub const GPKG_OGR2OGR_QUEUE: &str = "importer.gpkg_ogr2ogr";
/// Queue of per-layer continuations.
pub const GPKG_NEXT_STEP_QUEUE: &str = "importer.gpkg_next_step";

const IMPORT_TASKS: &[&str] = &[
    START_IMPORT,
    IMPORT_RESOURCE,
    PUBLISH_RESOURCE,
    CREATE_GN_RESOURCE,
];

const OVERRIDE_EXISTING_LAYER: &str = "override_existing_layer";
const SKIP_EXISTING_LAYER: &str = "skip_existing_layer";

fn is_geopackage(path: &Utf8Path) -> bool {
    path.extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("gpkg"))
}

fn flag(params: &Map<String, Value>, key: &str) -> Result<bool, ImportError> {
    params.get(key).map_or(Ok(false), |value| {
        parse_flag(value).ok_or_else(|| {
            ImportError::validation(format!("{key} must be a boolean, got {value}"))
        })
    })
}

/// Payload validator for GeoPackage uploads.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeoPackagePayloadValidator;

impl PayloadValidator for GeoPackagePayloadValidator {
    fn validate(&self, payload: &ImportPayload) -> Result<(), ImportError> {
        let Some(base_file) = payload.base_file() else {
            return Err(ImportError::validation("a base_file is required"));
        };
        if !is_geopackage(base_file) {
            return Err(ImportError::validation(format!(
                "{base_file} is not a GeoPackage"
            )));
        }
        flag(&payload.params, OVERRIDE_EXISTING_LAYER)?;
        flag(&payload.params, SKIP_EXISTING_LAYER)?;
        Ok(())
    }
}

/// Imports every feature layer of a GeoPackage into its own table.
///
/// Copying is not supported.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeoPackageHandler;

#[async_trait]
impl Handler for GeoPackageHandler {
    fn identity(&self) -> &str {
        GPKG_IDENTITY
    }

    fn accepts(&self, payload: &ImportPayload) -> bool {
        payload.base_file().is_some_and(is_geopackage)
    }

    fn is_valid(&self, files: &BTreeMap<String, Utf8PathBuf>) -> bool {
        !files.is_empty()
            && geoport_fs::all_files_exist(files.values().map(Utf8PathBuf::as_path))
    }

    fn task_list(&self, action: Action) -> &'static [&'static str] {
        match action {
            Action::Import => IMPORT_TASKS,
            Action::Copy => &[],
        }
    }

    fn extract_params_from_data(
        &self,
        mut params: Map<String, Value>,
        _action: Action,
    ) -> Result<(HandlerParams, Map<String, Value>), ImportError> {
        let extracted = HandlerParams {
            override_existing_layer: flag(&params, OVERRIDE_EXISTING_LAYER)?,
            skip_existing_layer: flag(&params, SKIP_EXISTING_LAYER)?,
        };
        params.remove(OVERRIDE_EXISTING_LAYER);
        params.remove(SKIP_EXISTING_LAYER);
        Ok((extracted, params))
    }

    fn validator(&self) -> Option<&dyn PayloadValidator> {
        Some(&GeoPackagePayloadValidator)
    }

    async fn run_stage(&self, stage: &str, ctx: StageContext) -> Result<StageOutcome, TaskError> {
        match stage {
            START_IMPORT => Ok(StageOutcome::Advance),
            IMPORT_RESOURCE => {
                import_resource(&ctx).await?;
                Ok(StageOutcome::Deferred)
            }
            PUBLISH_RESOURCE => {
                let publisher = ctx.orchestrator.publisher();
                publisher
                    .publish(&ctx.execution, ctx.cursor.layer.as_ref())
                    .await?;
                Ok(StageOutcome::Advance)
            }
            CREATE_GN_RESOURCE => {
                let publisher = ctx.orchestrator.publisher();
                publisher
                    .create_resource(&ctx.execution, ctx.cursor.layer.as_ref())
                    .await?;
                Ok(StageOutcome::Advance)
            }
            other => Err(TaskError::UnknownStage {
                handler: GPKG_IDENTITY.to_owned(),
                stage: other.to_owned(),
            }),
        }
    }
}

/// Read the layers, record the barrier and start one chord per eligible
/// layer.
///
/// Layers that already have a progress row were planned by an earlier
/// attempt of this stage and are not planned again.
async fn import_resource(ctx: &StageContext) -> Result<(), TaskError> {
    let execution = &ctx.execution;
    let base_file = execution
        .input_params
        .base_file()
        .cloned()
        .ok_or(TaskError::MissingFile { role: BASE_FILE })?;
    let source = ctx.orchestrator.layer_source();
    let path = base_file.clone();
    let layers = run_blocking(move || source.layers(&path)).await?;
    let total = layers.len();
    info!("total number of layers available: {total}");

    let exec_id = execution.exec_id;
    let planned: HashSet<String> = ctx
        .orchestrator
        .with_ledger(move |ledger| ledger.layer_progress(exec_id))
        .await?
        .into_iter()
        .map(|row| row.layer)
        .collect();
    let eligible = eligible_layers(&ctx.orchestrator, execution, layers, &planned).await?;
    let expected = u32::try_from(eligible.len()).unwrap_or(u32::MAX);
    ctx.orchestrator
        .with_ledger(move |ledger| ledger.expect_layers(exec_id, expected))
        .await?;

    for (position, layer) in eligible {
        if planned.contains(&layer.name) {
            debug!("layer {} of execution {exec_id} is already planned", layer.name);
            continue;
        }
        let percent = position
            .saturating_mul(100)
            .checked_div(total)
            .unwrap_or(100);
        let message = format!(
            "setting up dynamic model for layer: {} completed: {percent}%",
            layer.name
        );
        ctx.orchestrator
            .with_ledger(move |ledger| ledger.update(exec_id, ExecutionUpdate::log(message)))
            .await?;
        plan_layer(&ctx.orchestrator, execution, &base_file, &layer).await?;
    }
    Ok(())
}

/// Layers to import, paired with their 1-based position among all layers.
///
/// Layers in `planned` stay eligible without consulting the skip policy,
/// since their schema may have been created by this execution.
async fn eligible_layers(
    orchestrator: &Orchestrator,
    execution: &ExecutionRequest,
    layers: Vec<SourceLayer>,
    planned: &HashSet<String>,
) -> Result<Vec<(usize, SourceLayer)>, TaskError> {
    let skip = execution.input_params.skip_existing_layer;
    let mut eligible = Vec::with_capacity(layers.len());
    for (index, layer) in layers.into_iter().enumerate() {
        let import = if planned.contains(&layer.name) {
            true
        } else {
            let store = orchestrator.schemas();
            let name = layer.name.clone();
            let user = execution.user.clone();
            run_blocking(move || should_be_imported(store.as_ref(), &name, &user, skip)).await?
        };
        if import {
            eligible.push((index.saturating_add(1), layer));
        } else {
            info!(
                "skipping layer {} already imported by {}",
                layer.name, execution.user
            );
        }
    }
    Ok(eligible)
}

/// Resolve the schema of one layer, record it as planned and start its
/// chord.
async fn plan_layer(
    orchestrator: &Orchestrator,
    execution: &ExecutionRequest,
    base_file: &Utf8Path,
    layer: &SourceLayer,
) -> Result<(), TaskError> {
    let exec_id = execution.exec_id;
    let overwrite = execution.input_params.override_existing_layer;
    let store = orchestrator.schemas();
    let name = layer.name.clone();
    let owner = execution.user.clone();
    let schema =
        run_blocking(move || resolve_schema(store.as_ref(), &name, &owner, exec_id, overwrite))
            .await?;
    let layer_ref = LayerRef::new(layer.name.clone(), schema.name.clone());

    let planned = layer_ref.clone();
    let recorded = orchestrator
        .with_ledger(move |ledger| {
            ledger.record_layer_stage(exec_id, &planned, IMPORT_RESOURCE, LayerState::Running)
        })
        .await?;
    if !recorded {
        debug!("execution {exec_id} ended before layer {} was planned", layer.name);
        return Ok(());
    }

    let mut header: Vec<Job> = field_batches(derive_fields(layer))
        .into_iter()
        .enumerate()
        .map(|(index, batch)| {
            schema_job(orchestrator, exec_id, schema.id, index, batch, overwrite)
        })
        .collect();
    header.push(load_job(orchestrator, exec_id, base_file, &layer_ref, overwrite));
    let body = next_step_job(orchestrator, exec_id, schema.id, layer_ref.clone());
    let on_error = Arc::new(
        LedgerFailureHook::new(orchestrator.ledger()).for_layer(layer_ref, IMPORT_RESOURCE),
    );
    orchestrator.scheduler().chord(header, body, on_error);
    Ok(())
}

fn schema_job(
    orchestrator: &Orchestrator,
    exec_id: ExecutionId,
    schema: SchemaId,
    index: usize,
    batch: Vec<FieldOutcome>,
    overwrite: bool,
) -> Job {
    let store = orchestrator.schemas();
    let batch = Arc::new(batch);
    Job::new(
        GPKG_HANDLER_QUEUE,
        exec_id,
        format!("field batch {index} of schema {}", schema.0),
        move || {
            let store = Arc::clone(&store);
            let batch = Arc::clone(&batch);
            async move {
                run_blocking(move || apply_batch(store.as_ref(), schema, &batch, overwrite))
                    .await
                    .map(|_| ())
            }
        },
    )
}

fn load_job(
    orchestrator: &Orchestrator,
    exec_id: ExecutionId,
    base_file: &Utf8Path,
    layer: &LayerRef,
    overwrite: bool,
) -> Job {
    let loader = orchestrator.loader();
    let request = Arc::new(LoadRequest {
        source: base_file.to_path_buf(),
        layer: layer.name.clone(),
        alternate: layer.alternate.clone(),
        overwrite,
    });
    Job::new(
        GPKG_OGR2OGR_QUEUE,
        exec_id,
        format!("load {} into {}", layer.name, layer.alternate),
        move || {
            let loader = Arc::clone(&loader);
            let request = Arc::clone(&request);
            async move {
                loader
                    .load(&request)
                    .await
                    .map(|_| ())
                    .map_err(TaskError::from)
            }
        },
    )
}

fn next_step_job(
    orchestrator: &Orchestrator,
    exec_id: ExecutionId,
    schema: SchemaId,
    layer: LayerRef,
) -> Job {
    let orchestrator = orchestrator.clone();
    Job::new(
        GPKG_NEXT_STEP_QUEUE,
        exec_id,
        format!("next step for {}", layer.alternate),
        move || {
            let orchestrator = orchestrator.clone();
            let layer = layer.clone();
            async move {
                let store = orchestrator.schemas();
                let model = run_blocking(move || store.realize(schema)).await?;
                info!("dynamic model {} is ready", model.table_name());
                let cursor = StageCursor::for_layer(exec_id, layer).after(IMPORT_RESOURCE);
                orchestrator.dispatch(cursor).await
            }
        },
    )
}
