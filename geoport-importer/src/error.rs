//! Error types raised by the import pipeline.
#![forbid(unsafe_code)]

use geoport_core::{Action, ExecutionId, LayerSourceError, LedgerError, SchemaStoreError};
use geoport_data::LoaderError;
use thiserror::Error;

/// Errors returned synchronously to the caller of an import or copy.
///
/// Once an execution exists, failures are recorded against it instead and
/// only [`ImportError::Dispatch`] reaches the caller.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The payload was rejected before any execution was created.
    #[error("invalid import request: {reason}")]
    Validation {
        /// Human readable explanation.
        reason: String,
    },
    /// The handler cannot perform the requested action.
    #[error("the handler {handler} cannot manage the action required: {action}")]
    HandlerCapability {
        /// Handler identity.
        handler: String,
        /// Requested action.
        action: Action,
    },
    /// No registered handler has the given identity.
    #[error("no handler registered as {identity}")]
    UnknownHandler {
        /// Identity that was looked up.
        identity: String,
    },
    /// Creating the execution record failed.
    #[error("failed to create execution request")]
    Ledger {
        /// Ledger failure.
        #[source]
        source: LedgerError,
    },
    /// The execution was created but its first stage could not be queued.
    #[error("failed to dispatch execution {id}")]
    Dispatch {
        /// Execution marked failed as a consequence.
        id: ExecutionId,
        /// Underlying task failure.
        #[source]
        source: TaskError,
    },
    /// A blocking ledger call could not be joined.
    #[error("blocking ledger task failed")]
    Join {
        /// Join failure from Tokio.
        #[source]
        source: tokio::task::JoinError,
    },
}

impl ImportError {
    /// Shorthand for [`ImportError::Validation`].
    #[must_use]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }
}

/// Failure of a single pipeline job.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Ledger access failed.
    #[error(transparent)]
    Ledger {
        /// Ledger failure.
        #[from]
        source: LedgerError,
    },
    /// Schema catalog access failed.
    #[error(transparent)]
    Schema {
        /// Schema store failure.
        #[from]
        source: SchemaStoreError,
    },
    /// The source dataset could not be read.
    #[error(transparent)]
    Source {
        /// Layer source failure.
        #[from]
        source: LayerSourceError,
    },
    /// The bulk loader failed.
    #[error(transparent)]
    Loader {
        /// Loader failure.
        #[from]
        source: LoaderError,
    },
    /// The execution names a handler that is not registered.
    #[error("no handler registered as {identity}")]
    UnknownHandler {
        /// Identity stored on the execution.
        identity: String,
    },
    /// A cursor names a stage the handler does not know.
    #[error("handler {handler} has no stage {stage}")]
    UnknownStage {
        /// Handler identity.
        handler: String,
        /// Stage that was requested.
        stage: String,
    },
    /// A file role required by a stage is missing from the execution.
    #[error("execution has no {role} file")]
    MissingFile {
        /// Missing role.
        role: &'static str,
    },
    /// A spawned job panicked or was cancelled.
    #[error("job did not run to completion: {source}")]
    Join {
        /// Join failure from Tokio.
        #[source]
        source: tokio::task::JoinError,
    },
}

impl TaskError {
    /// Whether running the job again may succeed.
    ///
    /// Storage failures and transient loader failures are retryable; data
    /// errors and programming errors are not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Ledger { source } => matches!(source, LedgerError::Storage { .. }),
            Self::Schema { source } => matches!(source, SchemaStoreError::Storage { .. }),
            Self::Loader { source } => source.is_retryable(),
            Self::Source { .. }
            | Self::UnknownHandler { .. }
            | Self::UnknownStage { .. }
            | Self::MissingFile { .. }
            | Self::Join { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn loader_stderr_is_not_retried() {
        let err = TaskError::from(LoaderError::Stderr {
            stderr: "ERROR 1: bad geometry".into(),
            code: Some(1),
        });
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "ERROR 1: bad geometry");
    }

    #[rstest]
    fn storage_failures_are_retried() {
        let err = TaskError::from(LedgerError::Storage {
            operation: "append log",
            source: "database is locked".into(),
        });
        assert!(err.is_retryable());
    }

    #[rstest]
    fn capability_message_names_handler_and_action() {
        let err = ImportError::HandlerCapability {
            handler: "geoport.gpkg".into(),
            action: Action::Copy,
        };
        assert_eq!(
            err.to_string(),
            "the handler geoport.gpkg cannot manage the action required: copy"
        );
    }
}
