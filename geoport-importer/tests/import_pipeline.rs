//! End-to-end tests of the import pipeline against in-memory stores.
#![expect(clippy::expect_used, reason = "tests should fail fast when setup breaks")]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use camino::Utf8PathBuf;
use geoport_core::{
    Action, ExecutionLedger, ExecutionStatus, LayerState, SchemaStore, SourceField, SourceLayer,
};
use geoport_importer::schema::alternate_name;
use geoport_importer::{
    CopyRequest, CREATE_GN_RESOURCE, GPKG_HANDLER_QUEUE, GPKG_IDENTITY, GPKG_NEXT_STEP_QUEUE,
    GPKG_OGR2OGR_QUEUE, Handler, HandlerParams, HandlerRegistry, IMPORT_RESOURCE, ImportError,
    ImportPayload, ImportRequest, PUBLISH_RESOURCE, START_IMPORT, StageContext, StageOutcome,
    TaskError, stage_queue,
};
use rstest::rstest;
use serde_json::{Map, Value};
use tempfile::TempDir;

mod support;

use support::{Harness, SchemaFault, layer};

#[rstest]
#[tokio::test]
async fn two_layers_walk_every_stage_and_complete() {
    let harness = Harness::new(vec![layer("roads", 3), layer("rivers", 2)]);

    let execution = harness
        .import("alice", harness.payload())
        .await
        .expect("import accepted");

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.expected_layers, Some(2));
    assert_eq!(execution.completed_layers, 2);
    assert_eq!(execution.step.as_deref(), Some(CREATE_GN_RESOURCE));
    assert_eq!(execution.input_params.handler_module_path, GPKG_IDENTITY);
    assert_eq!(harness.submitted(&stage_queue(START_IMPORT)), 1);
    for queue in [
        GPKG_HANDLER_QUEUE.to_owned(),
        GPKG_OGR2OGR_QUEUE.to_owned(),
        GPKG_NEXT_STEP_QUEUE.to_owned(),
        stage_queue(PUBLISH_RESOURCE),
        stage_queue(CREATE_GN_RESOURCE),
    ] {
        assert_eq!(harness.submitted(&queue), 2, "jobs on {queue}");
    }
    assert!(Harness::logged(&execution, "setting up dynamic model for layer: roads completed: 50%"));
    assert!(Harness::logged(&execution, "setting up dynamic model for layer: rivers completed: 100%"));
    assert!(Harness::logged(&execution, "published layer roads"));
    assert!(Harness::logged(&execution, "created resource for layer rivers"));

    let progress = harness
        .ledger
        .layer_progress(execution.exec_id)
        .expect("layer progress");
    assert_eq!(progress.len(), 2);
    assert!(progress.iter().all(|row| row.state == LayerState::Done));

    let mut loaded: Vec<_> = harness
        .loader
        .requests()
        .into_iter()
        .map(|request| (request.layer, request.alternate, request.overwrite))
        .collect();
    loaded.sort();
    assert_eq!(
        loaded,
        vec![
            ("rivers".to_owned(), "rivers".to_owned(), false),
            ("roads".to_owned(), "roads".to_owned(), false),
        ]
    );

    let roads = harness
        .schemas
        .get_or_create("roads", "alice")
        .expect("roads schema");
    assert!(!roads.created);
    let names: Vec<_> = harness
        .schemas
        .fields(roads.schema.id)
        .expect("roads fields")
        .into_iter()
        .map(|field| field.name)
        .collect();
    assert_eq!(names, ["field_0", "field_1", "field_2", "geom"]);
}

#[rstest]
#[tokio::test]
async fn existing_schema_gets_execution_suffixed_name() {
    let harness = Harness::new(vec![layer("roads", 1)]);
    harness
        .schemas
        .get_or_create("roads", "bob")
        .expect("existing schema");

    let execution = harness
        .import("alice", harness.payload())
        .await
        .expect("import accepted");

    let alternate = alternate_name("roads", execution.exec_id);
    assert_eq!(execution.status, ExecutionStatus::Completed);
    let requests = harness.loader.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests.first().map(|r| r.alternate.as_str()), Some(alternate.as_str()));
    let progress = harness
        .ledger
        .layer_progress(execution.exec_id)
        .expect("layer progress");
    assert_eq!(progress.first().map(|row| row.alternate.as_str()), Some(alternate.as_str()));
    assert!(Harness::logged(&execution, &format!("published layer {alternate}")));
}

#[rstest]
#[tokio::test]
async fn override_reuses_existing_schema_and_overwrites_table() {
    let harness = Harness::new(vec![layer("roads", 1)]);
    harness
        .schemas
        .get_or_create("roads", "alice")
        .expect("existing schema");

    let payload = harness.payload().with_param("override_existing_layer", true);
    let execution = harness
        .import("alice", payload)
        .await
        .expect("import accepted");

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.input_params.override_existing_layer);
    let requests = harness.loader.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests.iter().all(|r| r.alternate == "roads" && r.overwrite));
}

#[rstest]
#[tokio::test]
async fn loader_stderr_fails_execution_without_continuation() {
    let stderr = "ERROR 1: relation \"rivers\" already exists";
    let harness = Harness::failing_load(vec![layer("roads", 1), layer("rivers", 1)], "rivers", stderr);

    let execution = harness
        .import("alice", harness.payload())
        .await
        .expect("import accepted");

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(Harness::logged(&execution, stderr));
    assert_eq!(harness.submitted(GPKG_OGR2OGR_QUEUE), 2);
    assert_eq!(harness.submitted(GPKG_NEXT_STEP_QUEUE), 1);
    let progress = harness
        .ledger
        .layer_progress(execution.exec_id)
        .expect("layer progress");
    let rivers = progress
        .iter()
        .find(|row| row.layer == "rivers")
        .expect("rivers progress");
    assert_eq!(rivers.state, LayerState::Failed);
    assert!(execution.completed_layers < 2);
}

#[rstest]
#[tokio::test]
async fn retried_layer_planning_loads_each_layer_once() {
    let harness = Harness::with_schema_fault(
        vec![layer("roads", 1), layer("rivers", 1)],
        SchemaFault::LockedOnce("rivers"),
    );

    let execution = harness
        .import("alice", harness.payload())
        .await
        .expect("import accepted");

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.expected_layers, Some(2));
    assert_eq!(execution.completed_layers, 2);
    let stats = harness
        .orchestrator
        .scheduler()
        .stats(&stage_queue(IMPORT_RESOURCE));
    assert_eq!((stats.submitted, stats.retried), (1, 1));
    assert_eq!(harness.submitted(GPKG_NEXT_STEP_QUEUE), 2);

    let mut loaded: Vec<_> = harness
        .loader
        .requests()
        .into_iter()
        .map(|request| (request.layer, request.alternate))
        .collect();
    loaded.sort();
    assert_eq!(
        loaded,
        vec![
            ("rivers".to_owned(), "rivers".to_owned()),
            ("roads".to_owned(), "roads".to_owned()),
        ]
    );
    let planned = execution
        .log
        .iter()
        .filter(|entry| entry.message.contains("setting up dynamic model for layer: roads"))
        .count();
    assert_eq!(planned, 1);
}

#[rstest]
#[tokio::test]
async fn failed_field_batch_fails_layer_without_continuation() {
    let harness = Harness::with_schema_fault(vec![layer("roads", 2)], SchemaFault::BrokenBatches);

    let execution = harness
        .import("alice", harness.payload())
        .await
        .expect("import accepted");

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(harness.submitted(GPKG_HANDLER_QUEUE), 1);
    assert_eq!(harness.submitted(GPKG_NEXT_STEP_QUEUE), 0);
    assert_eq!(execution.completed_layers, 0);
    let progress = harness
        .ledger
        .layer_progress(execution.exec_id)
        .expect("layer progress");
    let states: Vec<_> = progress
        .into_iter()
        .map(|row| (row.layer, row.state))
        .collect();
    assert_eq!(states, vec![("roads".to_owned(), LayerState::Failed)]);
}

#[rstest]
#[tokio::test]
async fn dataset_without_layers_completes() {
    let harness = Harness::new(Vec::new());

    let execution = harness
        .import("alice", harness.payload())
        .await
        .expect("import accepted");

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.expected_layers, Some(0));
    assert!(harness.loader.requests().is_empty());
    assert_eq!(harness.submitted(&stage_queue(PUBLISH_RESOURCE)), 0);
}

#[rstest]
#[tokio::test]
async fn skip_existing_layer_excludes_owned_layers() {
    let harness = Harness::new(vec![layer("roads", 1), layer("rivers", 1)]);
    harness
        .schemas
        .get_or_create("roads", "alice")
        .expect("existing schema");

    let payload = harness.payload().with_param("skip_existing_layer", "true");
    let execution = harness
        .import("alice", payload)
        .await
        .expect("import accepted");

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.expected_layers, Some(1));
    let layers: Vec<_> = harness
        .loader
        .requests()
        .into_iter()
        .map(|request| request.layer)
        .collect();
    assert_eq!(layers, ["rivers"]);
}

#[rstest]
#[tokio::test]
async fn wide_layer_is_split_into_field_batches() {
    let harness = Harness::new(vec![layer("parcels", 130)]);

    let execution = harness
        .import("alice", harness.payload())
        .await
        .expect("import accepted");

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(harness.submitted(GPKG_HANDLER_QUEUE), 3);
    let schema = harness
        .schemas
        .get_or_create("parcels", "alice")
        .expect("parcels schema");
    let fields = harness.schemas.fields(schema.schema.id).expect("fields");
    assert_eq!(fields.len(), 131);
}

#[rstest]
#[tokio::test]
async fn unmapped_field_is_dropped_and_siblings_persist() {
    let layer = SourceLayer::new(
        "poi",
        vec![
            SourceField::new("Name", "String"),
            SourceField::new("Tags", "StringList"),
            SourceField::new("Height", "Real"),
        ],
    )
    .with_geometry("geom", "POINT");
    let harness = Harness::new(vec![layer]);

    let execution = harness
        .import("alice", harness.payload())
        .await
        .expect("import accepted");

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let schema = harness
        .schemas
        .get_or_create("poi", "alice")
        .expect("poi schema");
    let names: Vec<_> = harness
        .schemas
        .fields(schema.schema.id)
        .expect("fields")
        .into_iter()
        .map(|field| field.name)
        .collect();
    assert_eq!(names, ["name", "height", "geom"]);
}

#[rstest]
#[tokio::test]
async fn unsupported_format_is_rejected_and_staged_file_removed() {
    let harness = Harness::new(Vec::new());
    let dir = TempDir::new().expect("temp dir");
    let shapefile = Utf8PathBuf::from_path_buf(dir.path().join("roads.shp")).expect("utf-8");
    std::fs::write(&shapefile, b"shp").expect("stage shapefile");

    let err = harness
        .orchestrator
        .submit_import(ImportRequest::upload(
            "alice",
            ImportPayload::with_base_file(shapefile.clone()),
        ))
        .await
        .expect_err("no handler for shapefiles");

    assert!(matches!(err, ImportError::Validation { .. }));
    assert!(!shapefile.exists());
    assert!(harness.ledger.ids().expect("ids").is_empty());
}

#[rstest]
#[tokio::test]
async fn invalid_flag_is_rejected_before_any_record() {
    let harness = Harness::new(vec![layer("roads", 1)]);
    let payload = harness.payload().with_param("skip_existing_layer", "maybe");

    let err = harness
        .orchestrator
        .submit_import(ImportRequest::upload("alice", payload))
        .await
        .expect_err("invalid flag");

    assert!(matches!(err, ImportError::Validation { .. }));
    assert!(harness.ledger.ids().expect("ids").is_empty());
}

#[rstest]
#[tokio::test]
async fn copy_is_rejected_for_geopackage_handler() {
    let harness = Harness::new(vec![layer("roads", 1)]);

    let err = harness
        .orchestrator
        .submit_copy(CopyRequest {
            user: "alice".to_owned(),
            handler: GPKG_IDENTITY.to_owned(),
            layer_name: "roads".to_owned(),
            alternate: "roads".to_owned(),
            params: Map::new(),
        })
        .await
        .expect_err("copy unsupported");

    assert!(matches!(
        err,
        ImportError::HandlerCapability { action: Action::Copy, .. }
    ));
    assert!(harness.ledger.ids().expect("ids").is_empty());
}

const COPY_IDENTITY: &str = "tests.handlers.copying";
const COPY_TASKS: &[&str] = &["copy_resource", "publish_copy"];

#[derive(Default)]
struct CopyingHandler {
    seen: Mutex<Vec<(String, Option<String>)>>,
}

#[async_trait]
impl Handler for CopyingHandler {
    fn identity(&self) -> &str {
        COPY_IDENTITY
    }

    fn accepts(&self, _payload: &ImportPayload) -> bool {
        false
    }

    fn is_valid(&self, _files: &BTreeMap<String, Utf8PathBuf>) -> bool {
        true
    }

    fn task_list(&self, action: Action) -> &'static [&'static str] {
        match action {
            Action::Import => &[],
            Action::Copy => COPY_TASKS,
        }
    }

    fn extract_params_from_data(
        &self,
        params: Map<String, Value>,
        _action: Action,
    ) -> Result<(HandlerParams, Map<String, Value>), ImportError> {
        Ok((HandlerParams::default(), params))
    }

    async fn run_stage(&self, stage: &str, ctx: StageContext) -> Result<StageOutcome, TaskError> {
        let alternate = ctx.cursor.layer.map(|layer| layer.alternate);
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((stage.to_owned(), alternate));
        Ok(StageOutcome::Advance)
    }
}

#[rstest]
#[tokio::test]
async fn copy_walks_the_copy_task_list() {
    let handler = Arc::new(CopyingHandler::default());
    let registry = HandlerRegistry::default().with(Arc::clone(&handler) as Arc<dyn Handler>);
    let harness = Harness::with_registry(Vec::new(), registry);

    let id = harness
        .orchestrator
        .submit_copy(CopyRequest {
            user: "alice".to_owned(),
            handler: COPY_IDENTITY.to_owned(),
            layer_name: "roads".to_owned(),
            alternate: "roads_copy".to_owned(),
            params: Map::new(),
        })
        .await
        .expect("copy accepted");
    let execution = harness.settle(id).await.expect("execution");

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.action, Action::Copy);
    assert_eq!(execution.step.as_deref(), Some("publish_copy"));
    let seen = handler
        .seen
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    assert_eq!(
        seen,
        vec![
            ("copy_resource".to_owned(), Some("roads_copy".to_owned())),
            ("publish_copy".to_owned(), Some("roads_copy".to_owned())),
        ]
    );
}
