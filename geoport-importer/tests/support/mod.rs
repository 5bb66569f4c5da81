//! Shared harness for the import pipeline tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8PathBuf;
use geoport_core::test_support::{MemoryExecutionLedger, StubLayerSource};
use geoport_core::{
    BatchReport, ExecutionId, ExecutionLedger, ExecutionRequest, FieldDescriptor, LayerSource,
    ModelHandle, SchemaId, SchemaLookup, SchemaStore, SchemaStoreError, SourceField, SourceLayer,
    SqliteSchemaStore,
};
use geoport_data::DataLoader;
use geoport_data::test_support::RecordingLoader;
use geoport_importer::{HandlerRegistry, ImportError, ImportPayload, ImportRequest, Orchestrator};
use tempfile::TempDir;

/// Layer with `fields` string attributes and a polygon geometry.
pub fn layer(name: &str, fields: usize) -> SourceLayer {
    let fields = (0..fields)
        .map(|index| SourceField::new(format!("Field_{index}"), "String"))
        .collect();
    SourceLayer::new(name, fields).with_geometry("geom", "MULTIPOLYGON")
}

/// Failure injected by [`FaultySchemaStore`].
#[derive(Debug, Clone, Copy)]
pub enum SchemaFault {
    /// The first lookup of the named layer reports a locked catalog.
    LockedOnce(&'static str),
    /// Every field batch targets a schema that no longer exists.
    BrokenBatches,
}

/// Schema store delegating to SQLite apart from one injected fault.
pub struct FaultySchemaStore {
    inner: Arc<SqliteSchemaStore>,
    fault: SchemaFault,
    tripped: AtomicBool,
}

impl FaultySchemaStore {
    pub fn new(inner: Arc<SqliteSchemaStore>, fault: SchemaFault) -> Self {
        Self {
            inner,
            fault,
            tripped: AtomicBool::new(false),
        }
    }
}

impl SchemaStore for FaultySchemaStore {
    fn get_or_create(&self, name: &str, owner: &str) -> Result<SchemaLookup, SchemaStoreError> {
        if matches!(self.fault, SchemaFault::LockedOnce(layer) if layer == name)
            && !self.tripped.swap(true, Ordering::SeqCst)
        {
            return Err(SchemaStoreError::Storage {
                operation: "get or create schema",
                source: "database is locked".into(),
            });
        }
        self.inner.get_or_create(name, owner)
    }

    fn exists_for_owner(&self, name: &str, owner: &str) -> Result<bool, SchemaStoreError> {
        self.inner.exists_for_owner(name, owner)
    }

    fn apply_field_batch(
        &self,
        schema: SchemaId,
        batch: &[FieldDescriptor],
        overwrite: bool,
    ) -> Result<BatchReport, SchemaStoreError> {
        if matches!(self.fault, SchemaFault::BrokenBatches) {
            return Err(SchemaStoreError::NotFound { id: schema });
        }
        self.inner.apply_field_batch(schema, batch, overwrite)
    }

    fn fields(&self, schema: SchemaId) -> Result<Vec<FieldDescriptor>, SchemaStoreError> {
        self.inner.fields(schema)
    }

    fn realize(&self, schema: SchemaId) -> Result<ModelHandle, SchemaStoreError> {
        self.inner.realize(schema)
    }
}

/// Orchestrator wired to in-memory stores and a recording loader.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub ledger: Arc<MemoryExecutionLedger>,
    pub schemas: Arc<SqliteSchemaStore>,
    pub loader: Arc<RecordingLoader>,
    pub base_file: Utf8PathBuf,
    _dir: TempDir,
}

impl Harness {
    /// Harness whose dataset holds `layers`.
    pub fn new(layers: Vec<SourceLayer>) -> Self {
        Self::build(layers, RecordingLoader::new(), HandlerRegistry::default(), None)
    }

    /// Harness whose loader fails for `layer` with `stderr`.
    pub fn failing_load(layers: Vec<SourceLayer>, layer: &str, stderr: &str) -> Self {
        Self::build(
            layers,
            RecordingLoader::failing_on(layer, stderr),
            HandlerRegistry::default(),
            None,
        )
    }

    /// Harness with a custom handler registry.
    pub fn with_registry(layers: Vec<SourceLayer>, registry: HandlerRegistry) -> Self {
        Self::build(layers, RecordingLoader::new(), registry, None)
    }

    /// Harness whose schema store misbehaves as `fault` describes.
    pub fn with_schema_fault(layers: Vec<SourceLayer>, fault: SchemaFault) -> Self {
        Self::build(
            layers,
            RecordingLoader::new(),
            HandlerRegistry::default(),
            Some(fault),
        )
    }

    fn build(
        layers: Vec<SourceLayer>,
        loader: RecordingLoader,
        registry: HandlerRegistry,
        fault: Option<SchemaFault>,
    ) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let base_file =
            Utf8PathBuf::from_path_buf(dir.path().join("data.gpkg")).expect("utf-8 temp path");
        std::fs::write(&base_file, b"gpkg").expect("stage dataset");

        let ledger = Arc::new(MemoryExecutionLedger::default());
        let schemas = Arc::new(SqliteSchemaStore::open_in_memory().expect("schema store"));
        let store: Arc<dyn SchemaStore> = match fault {
            Some(fault) => Arc::new(FaultySchemaStore::new(Arc::clone(&schemas), fault)),
            None => Arc::clone(&schemas) as Arc<dyn SchemaStore>,
        };
        let loader = Arc::new(loader);
        let source: Arc<dyn LayerSource> = Arc::new(StubLayerSource::with_layers(layers));
        let orchestrator = Orchestrator::builder(
            Arc::clone(&ledger) as Arc<dyn ExecutionLedger>,
            store,
            source,
            Arc::clone(&loader) as Arc<dyn DataLoader>,
        )
        .registry(registry)
        .build();

        Self {
            orchestrator,
            ledger,
            schemas,
            loader,
            base_file,
            _dir: dir,
        }
    }

    /// Payload pointing at the staged dataset.
    pub fn payload(&self) -> ImportPayload {
        ImportPayload::with_base_file(self.base_file.clone())
    }

    /// Submit `payload` for `user` and wait until the pipeline is idle.
    pub async fn import(
        &self,
        user: &str,
        payload: ImportPayload,
    ) -> Result<ExecutionRequest, ImportError> {
        let id = self
            .orchestrator
            .submit_import(ImportRequest::upload(user, payload))
            .await?;
        self.settle(id).await
    }

    /// Wait for the pipeline and read back the execution.
    pub async fn settle(&self, id: ExecutionId) -> Result<ExecutionRequest, ImportError> {
        self.orchestrator.wait_idle().await;
        self.orchestrator.execution(id).await
    }

    /// Number of jobs submitted on `queue`.
    pub fn submitted(&self, queue: &str) -> u64 {
        self.orchestrator.scheduler().stats(queue).submitted
    }

    /// Whether any log entry of `execution` contains `needle`.
    pub fn logged(execution: &ExecutionRequest, needle: &str) -> bool {
        execution
            .log
            .iter()
            .any(|entry| entry.message.contains(needle))
    }
}
