//! Inbound requests and their shape validation.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use geoport_core::ExecutionSource;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ImportError;

/// File role every import must provide.
pub const BASE_FILE: &str = "base_file";

/// Raw description of the data being imported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportPayload {
    /// Staged files keyed by role.
    pub files: BTreeMap<String, Utf8PathBuf>,
    /// Request parameters not describing files.
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ImportPayload {
    /// Payload with a single `base_file`.
    ///
    /// # Examples
    ///
    /// ```
    /// use geoport_importer::ImportPayload;
    ///
    /// let payload = ImportPayload::with_base_file("/tmp/roads.gpkg")
    ///     .with_param("skip_existing_layer", true);
    /// assert_eq!(payload.base_file().map(|p| p.as_str()), Some("/tmp/roads.gpkg"));
    /// ```
    #[must_use]
    pub fn with_base_file(path: impl Into<Utf8PathBuf>) -> Self {
        let mut files = BTreeMap::new();
        files.insert(BASE_FILE.to_owned(), path.into());
        Self {
            files,
            params: Map::new(),
        }
    }

    /// Add a request parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Path registered for the `base_file` role.
    #[must_use]
    pub fn base_file(&self) -> Option<&Utf8Path> {
        self.files.get(BASE_FILE).map(Utf8PathBuf::as_path)
    }
}

/// Who is responsible for the staged files of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Staging {
    /// The files were staged for this request and are removed if it is
    /// rejected.
    #[default]
    Owned,
    /// The files belong to the caller and are never removed.
    Borrowed,
}

/// An import submitted by a user.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRequest {
    /// Requesting user.
    pub user: String,
    /// Files and parameters.
    pub payload: ImportPayload,
    /// Ownership of the staged files.
    pub staging: Staging,
    /// Origin recorded on the execution.
    pub source: ExecutionSource,
}

impl ImportRequest {
    /// Upload of staged files owned by the request.
    #[must_use]
    pub fn upload(user: impl Into<String>, payload: ImportPayload) -> Self {
        Self {
            user: user.into(),
            payload,
            staging: Staging::Owned,
            source: ExecutionSource::Upload,
        }
    }

    /// Remove the staged files when the request owns them.
    ///
    /// Removal failures are logged; missing files are ignored.
    pub fn discard_staged_files(&self) {
        if self.staging == Staging::Borrowed {
            return;
        }
        let paths = self.payload.files.values().map(Utf8PathBuf::as_path);
        for (path, err) in geoport_fs::remove_files(paths) {
            warn!("failed to remove staged file {path}: {err}");
        }
    }
}

/// A copy of an already imported resource.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyRequest {
    /// Requesting user.
    pub user: String,
    /// Identity of the handler that imported the resource.
    pub handler: String,
    /// Title of the resource, used as the layer name.
    pub layer_name: String,
    /// Table backing the resource.
    pub alternate: String,
    /// Request parameters.
    pub params: Map<String, Value>,
}

/// Validates the shape of an inbound payload.
pub trait PayloadValidator: Send + Sync {
    /// Check `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Validation`] describing the first problem.
    fn validate(&self, payload: &ImportPayload) -> Result<(), ImportError>;
}

/// Validator used when the handler does not provide one.
///
/// Only requires a `base_file`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericPayloadValidator;

impl PayloadValidator for GenericPayloadValidator {
    fn validate(&self, payload: &ImportPayload) -> Result<(), ImportError> {
        if payload.base_file().is_none() {
            return Err(ImportError::validation("a base_file is required"));
        }
        Ok(())
    }
}

/// Interpret a flag parameter given as a JSON boolean or a
/// `"true"`/`"false"` string.
///
/// # Examples
///
/// ```
/// use geoport_importer::payload::parse_flag;
/// use serde_json::json;
///
/// assert_eq!(parse_flag(&json!("True")), Some(true));
/// assert_eq!(parse_flag(&json!(false)), Some(false));
/// assert_eq!(parse_flag(&json!(1)), None);
/// ```
#[must_use]
pub fn parse_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) if text.eq_ignore_ascii_case("true") => Some(true),
        Value::String(text) if text.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    fn generic_validator_requires_base_file() {
        let err = GenericPayloadValidator
            .validate(&ImportPayload::default())
            .expect_err("missing base file");
        assert!(matches!(err, ImportError::Validation { .. }));
        GenericPayloadValidator
            .validate(&ImportPayload::with_base_file("a.gpkg"))
            .expect("base file present");
    }

    #[rstest]
    #[case(Staging::Owned, false)]
    #[case(Staging::Borrowed, true)]
    fn discard_respects_ownership(#[case] staging: Staging, #[case] survives: bool) {
        let dir = TempDir::new().expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("roads.gpkg")).expect("utf-8");
        std::fs::write(&path, b"gpkg").expect("write staged file");
        let request = ImportRequest {
            staging,
            ..ImportRequest::upload("alice", ImportPayload::with_base_file(path.clone()))
        };

        request.discard_staged_files();

        assert_eq!(path.exists(), survives);
    }
}
