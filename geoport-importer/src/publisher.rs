//! Publication of imported layers.
#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use geoport_core::{ExecutionLedger, ExecutionRequest, ExecutionUpdate, LayerRef};
use log::info;

use crate::error::TaskError;
use crate::scheduler::run_blocking;

/// Makes imported layers visible to map servers and the catalog.
#[async_trait]
pub trait ResourcePublisher: Send + Sync {
    /// Publish the layer on the map server.
    ///
    /// # Errors
    ///
    /// Returns a [`TaskError`] when publication fails.
    async fn publish(
        &self,
        execution: &ExecutionRequest,
        layer: Option<&LayerRef>,
    ) -> Result<(), TaskError>;

    /// Register the layer as a catalog resource.
    ///
    /// # Errors
    ///
    /// Returns a [`TaskError`] when registration fails.
    async fn create_resource(
        &self,
        execution: &ExecutionRequest,
        layer: Option<&LayerRef>,
    ) -> Result<(), TaskError>;
}

/// Publisher that only records each step in the execution log.
#[derive(Clone)]
pub struct LedgerPublisher {
    ledger: Arc<dyn ExecutionLedger>,
}

impl LedgerPublisher {
    /// Publisher writing to `ledger`.
    #[must_use]
    pub fn new(ledger: Arc<dyn ExecutionLedger>) -> Self {
        Self { ledger }
    }

    async fn note(&self, execution: &ExecutionRequest, message: String) -> Result<(), TaskError> {
        info!("{message}");
        let ledger = Arc::clone(&self.ledger);
        let id = execution.exec_id;
        run_blocking(move || ledger.update(id, ExecutionUpdate::log(message))).await
    }
}

impl fmt::Debug for LedgerPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerPublisher").finish_non_exhaustive()
    }
}

fn target(execution: &ExecutionRequest, layer: Option<&LayerRef>) -> String {
    layer.map_or_else(|| execution.name.clone(), |layer| layer.alternate.clone())
}

#[async_trait]
impl ResourcePublisher for LedgerPublisher {
    async fn publish(
        &self,
        execution: &ExecutionRequest,
        layer: Option<&LayerRef>,
    ) -> Result<(), TaskError> {
        let message = format!("published layer {}", target(execution, layer));
        self.note(execution, message).await
    }

    async fn create_resource(
        &self,
        execution: &ExecutionRequest,
        layer: Option<&LayerRef>,
    ) -> Result<(), TaskError> {
        let message = format!("created resource for layer {}", target(execution, layer));
        self.note(execution, message).await
    }
}
