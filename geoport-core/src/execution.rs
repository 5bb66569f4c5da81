//! Execution request model shared by the ledger, the orchestrator and the CLI.
//!
//! An execution request is the durable record of a single import or copy
//! operation. Its status only ever moves forward: `pending → running →
//! {completed, failed}`. Once terminal, the record accepts further log lines
//! but no further status or step changes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::Utf8PathBuf;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier of an execution request.
///
/// # Examples
///
/// ```
/// use geoport_core::ExecutionId;
///
/// let id: ExecutionId = "1c9a1f4e-5a43-4c3f-9b0f-2d3c1b4a5e6f".parse().unwrap();
/// assert_eq!(id.underscored(), "1c9a1f4e_5a43_4c3f_9b0f_2d3c1b4a5e6f");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Allocate a fresh random identifier.
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Borrow the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Hyphenated form with `-` replaced by `_`, safe for table names.
    #[must_use]
    pub fn underscored(&self) -> String {
        self.0.hyphenated().to_string().replace('-', "_")
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Error raised when a stored enum label cannot be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} label '{label}'")]
pub struct UnknownLabel {
    /// Name of the enum being parsed.
    pub kind: &'static str,
    /// The label that failed to parse.
    pub label: String,
}

macro_rules! labelled_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Stable lower-case label used for persistence and display.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $label ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownLabel;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $label => Ok(Self::$variant), )+
                    other => Err(UnknownLabel {
                        kind: $kind,
                        label: other.to_owned(),
                    }),
                }
            }
        }
    };
}

labelled_enum! {
    /// Lifecycle status of an execution request.
    ExecutionStatus, "execution status" {
        /// Created but not yet started.
        Pending => "pending",
        /// Work is in progress.
        Running => "running",
        /// All stages finished successfully.
        Completed => "completed",
        /// A stage or job failed.
        Failed => "failed",
    }
}

impl ExecutionStatus {
    /// Whether no further status changes are accepted.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` respects the forward-only order.
    ///
    /// Same-status moves are allowed for non-terminal states so progress
    /// updates can carry `running` repeatedly.
    ///
    /// # Examples
    ///
    /// ```
    /// use geoport_core::ExecutionStatus;
    ///
    /// assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Running));
    /// assert!(!ExecutionStatus::Running.can_transition_to(ExecutionStatus::Pending));
    /// assert!(!ExecutionStatus::Failed.can_transition_to(ExecutionStatus::Completed));
    /// ```
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

labelled_enum! {
    /// Status mirrored onto the legacy upload record.
    LegacyStatus, "legacy status" {
        /// Accepted and waiting.
        Ready => "ready",
        /// Processing.
        Running => "running",
        /// Finished successfully.
        Processed => "processed",
        /// Finished with an error.
        Invalid => "invalid",
    }
}

impl LegacyStatus {
    /// Legacy status mirroring an execution status.
    #[must_use]
    pub const fn for_status(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Pending => Self::Ready,
            ExecutionStatus::Running => Self::Running,
            ExecutionStatus::Completed => Self::Processed,
            ExecutionStatus::Failed => Self::Invalid,
        }
    }
}

labelled_enum! {
    /// Operation requested by the caller.
    Action, "action" {
        /// Import a new dataset.
        Import => "import",
        /// Copy an already imported resource.
        Copy => "copy",
    }
}

labelled_enum! {
    /// Origin of an execution request.
    ExecutionSource, "execution source" {
        /// A file upload through the importer API.
        Upload => "upload",
        /// A copy of an existing resource.
        ImporterCopy => "importer_copy",
        /// The command line interface.
        Cli => "cli",
    }
}

labelled_enum! {
    /// Per-layer pipeline state.
    LayerState, "layer state" {
        /// The layer is between stages or inside one.
        Running => "running",
        /// Every stage for the layer finished.
        Done => "done",
        /// A job for the layer failed.
        Failed => "failed",
    }
}

/// A single timestamped log line.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LogEntry {
    /// Seconds since the Unix epoch.
    pub at: u64,
    /// Free-form message.
    pub message: String,
}

/// Parameters captured when an execution is created.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InputParams {
    /// Staged files keyed by role, for example `base_file`.
    pub files: BTreeMap<String, Utf8PathBuf>,
    /// Identity of the handler responsible for the execution.
    pub handler_module_path: String,
    /// Replace existing layer schemas instead of disambiguating.
    #[cfg_attr(feature = "serde", serde(default))]
    pub override_existing_layer: bool,
    /// Skip layers whose schema already exists for the owner.
    #[cfg_attr(feature = "serde", serde(default))]
    pub skip_existing_layer: bool,
    /// Handler-specific parameters not covered above.
    #[cfg_attr(feature = "serde", serde(default))]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl InputParams {
    /// Path registered for the `base_file` role, if any.
    #[must_use]
    pub fn base_file(&self) -> Option<&Utf8PathBuf> {
        self.files.get("base_file")
    }
}

/// Durable record of one import or copy operation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExecutionRequest {
    /// Immutable identifier.
    pub exec_id: ExecutionId,
    /// Requesting user.
    pub user: String,
    /// Current lifecycle status.
    pub status: ExecutionStatus,
    /// Mirror of the status for the legacy upload record.
    pub legacy_status: LegacyStatus,
    /// Append-only log, oldest first.
    pub log: Vec<LogEntry>,
    /// Name of the most recently entered stage.
    pub step: Option<String>,
    /// Parameters captured at creation.
    pub input_params: InputParams,
    /// Requested operation.
    pub action: Action,
    /// Display name of the dataset.
    pub name: String,
    /// Name of the legacy upload record.
    pub legacy_upload_name: String,
    /// Origin of the request.
    pub source: ExecutionSource,
    /// Creation time in seconds since the Unix epoch.
    pub created: u64,
    /// Last modification time in seconds since the Unix epoch.
    pub last_updated: u64,
    /// Number of layers the execution waits for, once known.
    pub expected_layers: Option<u32>,
    /// Number of layers that finished every stage.
    pub completed_layers: u32,
}

impl ExecutionRequest {
    /// Message of the most recent log entry.
    #[must_use]
    pub fn last_log(&self) -> Option<&str> {
        self.log.last().map(|entry| entry.message.as_str())
    }
}

/// Values required to create an execution request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExecution {
    /// Requesting user.
    pub user: String,
    /// Parameters captured at creation.
    pub input_params: InputParams,
    /// Requested operation.
    pub action: Action,
    /// Display name of the dataset.
    pub name: String,
    /// Name of the legacy upload record.
    pub legacy_upload_name: String,
    /// Origin of the request.
    pub source: ExecutionSource,
    /// Initial step recorded on the row.
    pub step: Option<String>,
}

/// Partial update applied by [`crate::ExecutionLedger::update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionUpdate {
    /// New lifecycle status.
    pub status: Option<ExecutionStatus>,
    /// New legacy status.
    pub legacy_status: Option<LegacyStatus>,
    /// New current step.
    pub step: Option<String>,
    /// Log line to append.
    pub log: Option<String>,
}

impl ExecutionUpdate {
    /// Update carrying only a log line.
    #[must_use]
    pub fn log(message: impl Into<String>) -> Self {
        Self {
            log: Some(message.into()),
            ..Self::default()
        }
    }

    /// Update moving the execution to `running` at the named step.
    #[must_use]
    pub fn step(step: impl Into<String>) -> Self {
        Self {
            status: Some(ExecutionStatus::Running),
            legacy_status: Some(LegacyStatus::Running),
            step: Some(step.into()),
            log: None,
        }
    }
}

/// A layer and the table name its data is loaded into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerRef {
    /// Layer name inside the source file.
    pub name: String,
    /// Table name used in the target store.
    pub alternate: String,
}

impl LayerRef {
    /// Build a layer reference.
    pub fn new(name: impl Into<String>, alternate: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alternate: alternate.into(),
        }
    }
}

/// Persisted per-layer progress for resumption and inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerProgress {
    /// Owning execution.
    pub exec_id: ExecutionId,
    /// Layer name inside the source file.
    pub layer: String,
    /// Table name used in the target store.
    pub alternate: String,
    /// Last stage recorded for the layer.
    pub stage: String,
    /// Current state.
    pub state: LayerState,
}

/// Current time in seconds since the Unix epoch.
///
/// Clocks set before the epoch report zero.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
