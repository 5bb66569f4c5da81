//! Test-only, in-memory implementations of the ledger and layer source used
//! by unit and behaviour tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};

use crate::ledger::{COMPLETED_LOG, CREATED_LOG, barrier_reached};
use crate::{
    Action, ExecutionId, ExecutionLedger, ExecutionRequest, ExecutionSource, ExecutionStatus,
    ExecutionUpdate, InputParams, LayerProgress, LayerRef, LayerSource, LayerSourceError,
    LayerState, LedgerError, LegacyStatus, LogEntry, NewExecution, SourceLayer, unix_now,
};

/// Minimal import execution owned by `user`.
#[must_use]
pub fn new_execution(user: &str) -> NewExecution {
    NewExecution {
        user: user.to_owned(),
        input_params: InputParams::default(),
        action: Action::Import,
        name: "dataset".to_owned(),
        legacy_upload_name: "dataset".to_owned(),
        source: ExecutionSource::Upload,
        step: None,
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    executions: HashMap<ExecutionId, ExecutionRequest>,
    layers: HashMap<ExecutionId, Vec<LayerProgress>>,
}

/// In-memory `ExecutionLedger` with the same semantics as the SQLite one.
#[derive(Debug, Default)]
pub struct MemoryExecutionLedger {
    state: Mutex<LedgerState>,
}

impl MemoryExecutionLedger {
    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>, LedgerError> {
        self.state.lock().map_err(|_| LedgerError::Poisoned)
    }

    /// Identifiers of every execution created so far.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Poisoned`] when a writer panicked.
    pub fn ids(&self) -> Result<Vec<ExecutionId>, LedgerError> {
        Ok(self.lock()?.executions.keys().copied().collect())
    }
}

fn execution_mut(
    state: &mut LedgerState,
    id: ExecutionId,
) -> Result<&mut ExecutionRequest, LedgerError> {
    state
        .executions
        .get_mut(&id)
        .ok_or(LedgerError::NotFound { id })
}

fn push_log(record: &mut ExecutionRequest, message: &str) {
    let now = unix_now();
    record.log.push(LogEntry {
        at: now,
        message: message.to_owned(),
    });
    record.last_updated = now;
}

fn finish(record: &mut ExecutionRequest, status: ExecutionStatus, message: &str) {
    record.status = status;
    record.legacy_status = LegacyStatus::for_status(status);
    push_log(record, message);
}

impl ExecutionLedger for MemoryExecutionLedger {
    fn create(&self, execution: NewExecution) -> Result<ExecutionId, LedgerError> {
        let id = ExecutionId::new_v4();
        let now = unix_now();
        let mut record = ExecutionRequest {
            exec_id: id,
            user: execution.user,
            status: ExecutionStatus::Running,
            legacy_status: LegacyStatus::Running,
            log: Vec::new(),
            step: execution.step,
            input_params: execution.input_params,
            action: execution.action,
            name: execution.name,
            legacy_upload_name: execution.legacy_upload_name,
            source: execution.source,
            created: now,
            last_updated: now,
            expected_layers: None,
            completed_layers: 0,
        };
        push_log(&mut record, CREATED_LOG);
        self.lock()?.executions.insert(id, record);
        Ok(id)
    }

    fn get(&self, id: ExecutionId) -> Result<ExecutionRequest, LedgerError> {
        self.lock()?
            .executions
            .get(&id)
            .cloned()
            .ok_or(LedgerError::NotFound { id })
    }

    fn update(&self, id: ExecutionId, update: ExecutionUpdate) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        let record = execution_mut(&mut state, id)?;
        if !record.status.is_terminal() {
            if let Some(next) = update.status {
                if !record.status.can_transition_to(next) {
                    return Err(LedgerError::InvalidTransition {
                        id,
                        from: record.status,
                        to: next,
                    });
                }
                record.status = next;
                record.legacy_status = LegacyStatus::for_status(next);
            }
            if let Some(legacy) = update.legacy_status {
                record.legacy_status = legacy;
            }
            if let Some(step) = update.step {
                record.step = Some(step);
            }
            record.last_updated = unix_now();
        }
        if let Some(message) = update.log.as_deref() {
            push_log(record, message);
        }
        Ok(())
    }

    fn set_failed(&self, id: ExecutionId, reason: &str) -> Result<bool, LedgerError> {
        let mut state = self.lock()?;
        let record = execution_mut(&mut state, id)?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        finish(record, ExecutionStatus::Failed, reason);
        Ok(true)
    }

    fn complete(&self, id: ExecutionId) -> Result<bool, LedgerError> {
        let mut state = self.lock()?;
        let record = execution_mut(&mut state, id)?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        finish(record, ExecutionStatus::Completed, COMPLETED_LOG);
        Ok(true)
    }

    fn record_layer_stage(
        &self,
        id: ExecutionId,
        layer: &LayerRef,
        stage: &str,
        state: LayerState,
    ) -> Result<bool, LedgerError> {
        let mut guard = self.lock()?;
        if execution_mut(&mut guard, id)?.status.is_terminal() {
            return Ok(false);
        }
        let rows = guard.layers.entry(id).or_default();
        match rows.iter_mut().find(|row| row.layer == layer.name) {
            Some(row) => {
                row.alternate.clone_from(&layer.alternate);
                stage.clone_into(&mut row.stage);
                row.state = state;
            }
            None => rows.push(LayerProgress {
                exec_id: id,
                layer: layer.name.clone(),
                alternate: layer.alternate.clone(),
                stage: stage.to_owned(),
                state,
            }),
        }
        Ok(true)
    }

    fn layer_progress(&self, id: ExecutionId) -> Result<Vec<LayerProgress>, LedgerError> {
        let mut rows = self.lock()?.layers.get(&id).cloned().unwrap_or_default();
        rows.sort_by(|a, b| a.layer.cmp(&b.layer));
        Ok(rows)
    }

    fn expect_layers(&self, id: ExecutionId, count: u32) -> Result<bool, LedgerError> {
        let mut state = self.lock()?;
        let record = execution_mut(&mut state, id)?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        record.expected_layers = Some(count);
        if !barrier_reached(Some(count), record.completed_layers) {
            return Ok(false);
        }
        finish(record, ExecutionStatus::Completed, COMPLETED_LOG);
        Ok(true)
    }

    fn finish_layer(&self, id: ExecutionId, layer: &LayerRef) -> Result<bool, LedgerError> {
        let mut state = self.lock()?;
        if execution_mut(&mut state, id)?.status.is_terminal() {
            return Ok(false);
        }
        let rows = state.layers.entry(id).or_default();
        match rows.iter_mut().find(|row| row.layer == layer.name) {
            Some(row) => row.state = LayerState::Done,
            None => rows.push(LayerProgress {
                exec_id: id,
                layer: layer.name.clone(),
                alternate: layer.alternate.clone(),
                stage: String::new(),
                state: LayerState::Done,
            }),
        }
        let done = rows.iter().filter(|row| row.state == LayerState::Done).count();
        let completed = u32::try_from(done).unwrap_or(u32::MAX);

        let record = execution_mut(&mut state, id)?;
        record.completed_layers = completed;
        if !barrier_reached(record.expected_layers, completed) {
            return Ok(false);
        }
        finish(record, ExecutionStatus::Completed, COMPLETED_LOG);
        Ok(true)
    }
}

/// `LayerSource` returning canned layers, or an error, for any path.
#[derive(Debug, Default, Clone)]
pub struct StubLayerSource {
    layers: Vec<SourceLayer>,
    failure: Option<String>,
}

impl StubLayerSource {
    /// Source yielding `layers` for every path.
    #[must_use]
    pub const fn with_layers(layers: Vec<SourceLayer>) -> Self {
        Self {
            layers,
            failure: None,
        }
    }

    /// Source that rejects every path with `reason`.
    #[must_use]
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            layers: Vec::new(),
            failure: Some(reason.into()),
        }
    }
}

impl LayerSource for StubLayerSource {
    fn layers(&self, path: &Utf8Path) -> Result<Vec<SourceLayer>, LayerSourceError> {
        match &self.failure {
            Some(reason) => Err(LayerSourceError::InvalidFormat {
                path: Utf8PathBuf::from(path),
                reason: reason.clone(),
            }),
            None => Ok(self.layers.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn memory_ledger_mirrors_barrier_semantics() {
        let ledger = MemoryExecutionLedger::default();
        let id = ledger.create(new_execution("alice")).expect("create");
        let layer = LayerRef::new("roads", "roads");

        assert!(!ledger.finish_layer(id, &layer).expect("finish early"));
        assert!(ledger.expect_layers(id, 1).expect("expect"));
        assert!(!ledger.set_failed(id, "late").expect("fail after completion"));
        assert_eq!(
            ledger.get(id).expect("fetch").status,
            ExecutionStatus::Completed
        );
    }

    #[rstest]
    fn memory_ledger_ignores_layer_writes_after_failure() {
        let ledger = MemoryExecutionLedger::default();
        let id = ledger.create(new_execution("alice")).expect("create");
        let roads = LayerRef::new("roads", "roads");
        ledger.expect_layers(id, 2).expect("expect");
        ledger.set_failed(id, "boom").expect("fail");

        assert!(
            !ledger
                .record_layer_stage(id, &roads, "publish_resource", LayerState::Running)
                .expect("late stage")
        );
        assert!(!ledger.finish_layer(id, &roads).expect("late finish"));
        assert!(!ledger.expect_layers(id, 7).expect("late expectation"));

        let record = ledger.get(id).expect("fetch");
        assert_eq!((record.expected_layers, record.completed_layers), (Some(2), 0));
        assert!(ledger.layer_progress(id).expect("progress").is_empty());
    }

    #[rstest]
    fn stub_source_reports_failures() {
        let source = StubLayerSource::failing("not a geopackage");
        let err = source
            .layers(Utf8Path::new("/tmp/x.gpkg"))
            .expect_err("failure");
        assert!(matches!(err, LayerSourceError::InvalidFormat { .. }));
    }
}
