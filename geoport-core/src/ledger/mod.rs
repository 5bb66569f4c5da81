//! Durable bookkeeping for execution requests.
//!
//! The [`ExecutionLedger`] trait is the only shared state between pipeline
//! jobs. Implementations serialise writes so concurrent jobs observe a
//! consistent view of status, log and the layer barrier.

use thiserror::Error;

use crate::{
    ExecutionId, ExecutionRequest, ExecutionStatus, ExecutionUpdate, LayerProgress, LayerRef,
    LayerState, NewExecution,
};

#[cfg(feature = "store-sqlite")]
mod sqlite;

#[cfg(feature = "store-sqlite")]
pub use sqlite::SqliteExecutionLedger;

/// Boxed driver error carried by storage failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by [`ExecutionLedger`] implementations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// No execution exists with the identifier.
    #[error("execution {id} not found")]
    NotFound {
        /// Identifier that was looked up.
        id: ExecutionId,
    },
    /// An update tried to move the status backwards.
    #[error("execution {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Execution being updated.
        id: ExecutionId,
        /// Current status.
        from: ExecutionStatus,
        /// Requested status.
        to: ExecutionStatus,
    },
    /// A persisted row could not be decoded.
    #[error("corrupt ledger row for execution {id}: {detail}")]
    Corrupt {
        /// Execution whose row is corrupt.
        id: String,
        /// What failed to decode.
        detail: String,
    },
    /// The underlying storage failed.
    #[error("ledger storage failed during {operation}")]
    Storage {
        /// Operation that was running.
        operation: &'static str,
        /// Driver error.
        #[source]
        source: BoxError,
    },
    /// The database was created by an incompatible version.
    #[error("expected ledger schema version {expected} but found {found}")]
    VersionMismatch {
        /// Version this build understands.
        expected: i64,
        /// Version recorded in the database.
        found: i64,
    },
    /// The ledger lock was poisoned by a panicking writer.
    #[error("ledger lock poisoned")]
    Poisoned,
}

/// Persistence contract for execution requests and per-layer progress.
///
/// All methods are synchronous; async callers run them inside
/// `spawn_blocking`.
///
/// # Examples
///
/// ```
/// # #[cfg(feature = "test-support")]
/// # {
/// use geoport_core::test_support::{MemoryExecutionLedger, new_execution};
/// use geoport_core::{ExecutionLedger, ExecutionStatus};
///
/// let ledger = MemoryExecutionLedger::default();
/// let id = ledger.create(new_execution("alice")).unwrap();
/// assert_eq!(ledger.get(id).unwrap().status, ExecutionStatus::Running);
/// assert!(ledger.set_failed(id, "boom").unwrap());
/// assert!(!ledger.set_failed(id, "again").unwrap());
/// # }
/// ```
pub trait ExecutionLedger: Send + Sync {
    /// Insert a new execution and promote it to `running`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] when the row cannot be written.
    fn create(&self, execution: NewExecution) -> Result<ExecutionId, LedgerError>;

    /// Fetch an execution with its full log.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for unknown identifiers.
    fn get(&self, id: ExecutionId) -> Result<ExecutionRequest, LedgerError>;

    /// Apply a partial update.
    ///
    /// Against a terminal execution only the log line is appended.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidTransition`] when the status would move
    /// backwards and [`LedgerError::NotFound`] for unknown identifiers.
    fn update(&self, id: ExecutionId, update: ExecutionUpdate) -> Result<(), LedgerError>;

    /// Mark the execution failed with `reason`.
    ///
    /// Returns `false` when the execution was already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for unknown identifiers.
    fn set_failed(&self, id: ExecutionId, reason: &str) -> Result<bool, LedgerError>;

    /// Mark the execution completed.
    ///
    /// Returns `false` when the execution was already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for unknown identifiers.
    fn complete(&self, id: ExecutionId) -> Result<bool, LedgerError>;

    /// Upsert the progress row for one layer.
    ///
    /// Returns `false` without writing when the execution is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] when the row cannot be written.
    fn record_layer_stage(
        &self,
        id: ExecutionId,
        layer: &LayerRef,
        stage: &str,
        state: LayerState,
    ) -> Result<bool, LedgerError>;

    /// List per-layer progress ordered by layer name.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] when the rows cannot be read.
    fn layer_progress(&self, id: ExecutionId) -> Result<Vec<LayerProgress>, LedgerError>;

    /// Set how many layers must finish before the execution completes.
    ///
    /// Returns `true` when this call completed the execution. A terminal
    /// execution is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for unknown identifiers.
    fn expect_layers(&self, id: ExecutionId, count: u32) -> Result<bool, LedgerError>;

    /// Mark one layer as finished and count it towards the barrier.
    ///
    /// Finishing the same layer twice counts once. Returns `true` when this
    /// call completed the execution. A terminal execution is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for unknown identifiers.
    fn finish_layer(&self, id: ExecutionId, layer: &LayerRef) -> Result<bool, LedgerError>;
}

/// Log line recorded when an execution is created.
pub const CREATED_LOG: &str = "execution request created";

/// Log line recorded when the layer barrier completes an execution.
pub const COMPLETED_LOG: &str = "import completed";

/// Whether a barrier with the given counters is satisfied.
pub(crate) const fn barrier_reached(expected: Option<u32>, completed: u32) -> bool {
    match expected {
        Some(expected) => completed >= expected,
        None => false,
    }
}
