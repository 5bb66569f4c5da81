//! The reentrant stage driver.
//!
//! [`Orchestrator::dispatch`] is the only place that decides what runs next.
//! It reads the execution, finds the successor of the cursor's completed
//! stage in the handler's task list and queues it. Past the last stage a
//! layer chain counts towards the execution barrier; a chain without a layer
//! completes the execution directly.
#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use geoport_core::{
    Action, ExecutionId, ExecutionLedger, ExecutionRequest, ExecutionSource, ExecutionUpdate,
    InputParams, LayerRef, LayerSource, LayerState, LedgerError, NewExecution, SchemaStore,
};
use geoport_data::DataLoader;
use log::{debug, error, info};

use crate::error::{ImportError, TaskError};
use crate::handler::{Handler, StageContext, StageCursor, StageOutcome};
use crate::payload::{CopyRequest, ImportRequest};
use crate::publisher::{LedgerPublisher, ResourcePublisher};
use crate::registry::HandlerRegistry;
use crate::scheduler::{
    FailureHook, Job, LedgerFailureHook, Scheduler, SchedulerConfig, run_blocking,
};

/// Queue a stage runs on.
///
/// # Examples
///
/// ```
/// use geoport_importer::stage_queue;
///
/// assert_eq!(stage_queue("import_resource"), "importer.import_resource");
/// ```
#[must_use]
pub fn stage_queue(stage: &str) -> String {
    format!("importer.{stage}")
}

struct Services {
    ledger: Arc<dyn ExecutionLedger>,
    schemas: Arc<dyn SchemaStore>,
    source: Arc<dyn LayerSource>,
    loader: Arc<dyn DataLoader>,
    publisher: Arc<dyn ResourcePublisher>,
    registry: HandlerRegistry,
    scheduler: Scheduler,
}

/// Entry point of the import pipeline.
///
/// Cloning is cheap; every clone drives the same services and scheduler.
#[derive(Clone)]
pub struct Orchestrator {
    services: Arc<Services>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.services.registry)
            .field("scheduler", &self.services.scheduler)
            .finish_non_exhaustive()
    }
}

/// Assembles an [`Orchestrator`].
pub struct OrchestratorBuilder {
    ledger: Arc<dyn ExecutionLedger>,
    schemas: Arc<dyn SchemaStore>,
    source: Arc<dyn LayerSource>,
    loader: Arc<dyn DataLoader>,
    publisher: Option<Arc<dyn ResourcePublisher>>,
    registry: HandlerRegistry,
    config: SchedulerConfig,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    /// Replace the default [`LedgerPublisher`].
    #[must_use]
    pub fn publisher(mut self, publisher: Arc<dyn ResourcePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Replace the default registry holding the GeoPackage handler.
    #[must_use]
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the default scheduler settings.
    #[must_use]
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the orchestrator. Failed jobs are recorded in the ledger.
    #[must_use]
    pub fn build(self) -> Orchestrator {
        let hook: Arc<dyn FailureHook> =
            Arc::new(LedgerFailureHook::new(Arc::clone(&self.ledger)));
        let publisher: Arc<dyn ResourcePublisher> = match self.publisher {
            Some(publisher) => publisher,
            None => Arc::new(LedgerPublisher::new(Arc::clone(&self.ledger))),
        };
        Orchestrator {
            services: Arc::new(Services {
                scheduler: Scheduler::new(self.config, hook),
                ledger: self.ledger,
                schemas: self.schemas,
                source: self.source,
                loader: self.loader,
                publisher,
                registry: self.registry,
            }),
        }
    }
}

impl Orchestrator {
    /// Start assembling an orchestrator over the given services.
    #[must_use]
    pub fn builder(
        ledger: Arc<dyn ExecutionLedger>,
        schemas: Arc<dyn SchemaStore>,
        source: Arc<dyn LayerSource>,
        loader: Arc<dyn DataLoader>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            ledger,
            schemas,
            source,
            loader,
            publisher: None,
            registry: HandlerRegistry::default(),
            config: SchedulerConfig::default(),
        }
    }

    /// Execution ledger.
    #[must_use]
    pub fn ledger(&self) -> Arc<dyn ExecutionLedger> {
        Arc::clone(&self.services.ledger)
    }

    /// Schema catalog.
    #[must_use]
    pub fn schemas(&self) -> Arc<dyn SchemaStore> {
        Arc::clone(&self.services.schemas)
    }

    /// Reader for source datasets.
    #[must_use]
    pub fn layer_source(&self) -> Arc<dyn LayerSource> {
        Arc::clone(&self.services.source)
    }

    /// Bulk loader.
    #[must_use]
    pub fn loader(&self) -> Arc<dyn DataLoader> {
        Arc::clone(&self.services.loader)
    }

    /// Publisher used by the publication stages.
    #[must_use]
    pub fn publisher(&self) -> Arc<dyn ResourcePublisher> {
        Arc::clone(&self.services.publisher)
    }

    /// Registered handlers.
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.services.registry
    }

    /// Job scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.services.scheduler
    }

    /// Run a ledger call on the blocking pool.
    pub(crate) async fn with_ledger<T, F>(&self, call: F) -> Result<T, TaskError>
    where
        F: FnOnce(&dyn ExecutionLedger) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = self.ledger();
        run_blocking(move || call(ledger.as_ref())).await
    }

    /// Validate, record and start an import.
    ///
    /// Every failure before the execution exists is returned here and the
    /// staged files are discarded when the request owns them. After the
    /// execution exists, failures are recorded against it and the caller
    /// must poll [`Orchestrator::execution`].
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Validation`] when no validator or handler
    /// accepts the payload, [`ImportError::HandlerCapability`] when the
    /// handler cannot import, and [`ImportError::Dispatch`] when the first
    /// stage could not be queued.
    pub async fn submit_import(&self, request: ImportRequest) -> Result<ExecutionId, ImportError> {
        let execution = match self.prepare_import(&request) {
            Ok(execution) => execution,
            Err(err) => {
                request.discard_staged_files();
                return Err(err);
            }
        };
        let id = match self.create(execution).await {
            Ok(id) => id,
            Err(err) => {
                request.discard_staged_files();
                return Err(err);
            }
        };
        info!("created import execution {id} for {}", request.user);
        if let Err(source) = self.dispatch(StageCursor::start(id)).await {
            self.record_failure(id, &source).await;
            request.discard_staged_files();
            return Err(ImportError::Dispatch { id, source });
        }
        Ok(id)
    }

    fn prepare_import(&self, request: &ImportRequest) -> Result<NewExecution, ImportError> {
        let payload = &request.payload;
        let registry = self.registry();
        registry.get_serializer(payload).validate(payload)?;
        let handler = registry
            .resolve(payload)
            .ok_or_else(|| ImportError::validation("no handlers found for this dataset type"))?;
        let (params, extra) =
            handler.extract_params_from_data(payload.params.clone(), Action::Import)?;
        if !handler.is_valid(&payload.files) {
            return Err(ImportError::validation(format!(
                "the file set is not valid for handler {}",
                handler.identity()
            )));
        }
        ensure_capable(handler.as_ref(), Action::Import)?;

        let name = payload
            .base_file()
            .and_then(|path| path.file_name())
            .unwrap_or_default()
            .to_owned();
        Ok(NewExecution {
            user: request.user.clone(),
            input_params: InputParams {
                files: payload.files.clone(),
                handler_module_path: handler.identity().to_owned(),
                override_existing_layer: params.override_existing_layer,
                skip_existing_layer: params.skip_existing_layer,
                extra,
            },
            action: Action::Import,
            legacy_upload_name: name.clone(),
            name,
            source: request.source,
            step: first_stage(handler.as_ref(), Action::Import),
        })
    }

    /// Start a copy of an already imported resource.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::UnknownHandler`] for unregistered handlers,
    /// [`ImportError::HandlerCapability`] when the handler cannot copy, and
    /// [`ImportError::Dispatch`] when the first stage could not be queued.
    pub async fn submit_copy(&self, request: CopyRequest) -> Result<ExecutionId, ImportError> {
        let handler = self.registry().load(&request.handler)?;
        ensure_capable(handler.as_ref(), Action::Copy)?;
        let (params, extra) = handler.extract_params_from_data(request.params, Action::Copy)?;
        let execution = NewExecution {
            user: request.user.clone(),
            input_params: InputParams {
                handler_module_path: handler.identity().to_owned(),
                override_existing_layer: params.override_existing_layer,
                skip_existing_layer: params.skip_existing_layer,
                extra,
                ..InputParams::default()
            },
            action: Action::Copy,
            name: request.layer_name.clone(),
            legacy_upload_name: request.layer_name.clone(),
            source: ExecutionSource::ImporterCopy,
            step: first_stage(handler.as_ref(), Action::Copy),
        };
        let id = self.create(execution).await?;
        info!("created copy execution {id} for {}", request.user);

        let layer = LayerRef::new(request.layer_name, request.alternate);
        let cursor = StageCursor::for_layer(id, layer);
        let started = async {
            self.with_ledger(move |ledger| ledger.expect_layers(id, 1))
                .await?;
            self.dispatch(cursor).await
        };
        if let Err(source) = started.await {
            self.record_failure(id, &source).await;
            return Err(ImportError::Dispatch { id, source });
        }
        Ok(id)
    }

    /// Current state of an execution.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Ledger`] when the execution cannot be read.
    pub async fn execution(&self, id: ExecutionId) -> Result<ExecutionRequest, ImportError> {
        let ledger = self.ledger();
        tokio::task::spawn_blocking(move || ledger.get(id))
            .await
            .map_err(|source| ImportError::Join { source })?
            .map_err(|source| ImportError::Ledger { source })
    }

    /// Wait until no job is queued or running.
    pub async fn wait_idle(&self) {
        self.scheduler().wait_idle().await;
    }

    async fn create(&self, execution: NewExecution) -> Result<ExecutionId, ImportError> {
        let ledger = self.ledger();
        tokio::task::spawn_blocking(move || ledger.create(execution))
            .await
            .map_err(|source| ImportError::Join { source })?
            .map_err(|source| ImportError::Ledger { source })
    }

    async fn record_failure(&self, id: ExecutionId, error: &TaskError) {
        let hook = LedgerFailureHook::new(self.ledger());
        hook.on_failure(id, "importer.dispatch", error).await;
    }

    /// Queue the stage following `cursor.completed`.
    ///
    /// Does nothing once the execution is terminal.
    ///
    /// # Errors
    ///
    /// Returns the [`TaskError`] raised while reading the execution or
    /// recording progress.
    pub fn dispatch(&self, cursor: StageCursor) -> BoxFuture<'static, Result<(), TaskError>> {
        let orchestrator = self.clone();
        async move { orchestrator.advance(cursor).await }.boxed()
    }

    async fn advance(&self, cursor: StageCursor) -> Result<(), TaskError> {
        let id = cursor.exec_id;
        let execution = self.with_ledger(move |ledger| ledger.get(id)).await?;
        if execution.status.is_terminal() {
            debug!("execution {id} is {}, not dispatching", execution.status);
            return Ok(());
        }
        let identity = execution.input_params.handler_module_path.clone();
        let handler = self
            .registry()
            .load(&identity)
            .map_err(|_| TaskError::UnknownHandler { identity })?;
        let stages = handler.task_list(execution.action);
        let next = match cursor.completed.as_deref() {
            None => stages.first(),
            Some(done) => {
                let position = stages.iter().position(|stage| *stage == done).ok_or_else(|| {
                    TaskError::UnknownStage {
                        handler: handler.identity().to_owned(),
                        stage: done.to_owned(),
                    }
                })?;
                stages.get(position.saturating_add(1))
            }
        };

        let Some(&stage) = next else {
            return self.finish_chain(cursor).await;
        };
        let layer = cursor.layer.clone();
        self.with_ledger(move |ledger| {
            ledger.update(id, ExecutionUpdate::step(stage))?;
            if let Some(layer) = &layer {
                ledger.record_layer_stage(id, layer, stage, LayerState::Running)?;
            }
            Ok(())
        })
        .await?;

        let orchestrator = self.clone();
        let label = match &cursor.layer {
            Some(layer) => format!("{stage} for {}", layer.alternate),
            None => stage.to_owned(),
        };
        self.scheduler().submit(Job::new(stage_queue(stage), id, label, move || {
            let orchestrator = orchestrator.clone();
            let handler = Arc::clone(&handler);
            let cursor = cursor.clone();
            async move { orchestrator.run_stage(handler, stage, cursor).await }
        }));
        Ok(())
    }

    async fn finish_chain(&self, cursor: StageCursor) -> Result<(), TaskError> {
        let id = cursor.exec_id;
        let completed = match cursor.layer {
            Some(layer) => {
                let done = self
                    .with_ledger(move |ledger| ledger.finish_layer(id, &layer))
                    .await?;
                debug!("layer chain of execution {id} finished");
                done
            }
            None => self.with_ledger(move |ledger| ledger.complete(id)).await?,
        };
        if completed {
            info!("execution {id} completed");
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        handler: Arc<dyn Handler>,
        stage: &'static str,
        cursor: StageCursor,
    ) -> Result<(), TaskError> {
        let id = cursor.exec_id;
        let execution = self.with_ledger(move |ledger| ledger.get(id)).await?;
        if execution.status.is_terminal() {
            debug!("execution {id} is {}, skipping {stage}", execution.status);
            return Ok(());
        }
        let ctx = StageContext {
            orchestrator: self.clone(),
            execution,
            cursor: cursor.clone(),
        };
        match handler.run_stage(stage, ctx).await? {
            StageOutcome::Advance => self.dispatch(cursor.after(stage)).await,
            StageOutcome::Deferred => Ok(()),
        }
    }
}

fn ensure_capable(handler: &dyn Handler, action: Action) -> Result<(), ImportError> {
    if handler.can_do(action) {
        return Ok(());
    }
    error!(
        "handler {} cannot manage the action required: {action}",
        handler.identity()
    );
    Err(ImportError::HandlerCapability {
        handler: handler.identity().to_owned(),
        action,
    })
}

fn first_stage(handler: &dyn Handler, action: Action) -> Option<String> {
    handler
        .task_list(action)
        .first()
        .map(|stage| (*stage).to_owned())
}
