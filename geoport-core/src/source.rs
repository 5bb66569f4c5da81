//! Read-only access to the layers inside a vector dataset.

use camino::{Utf8Path, Utf8PathBuf};
use geo::Rect;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::BoxError;

/// An attribute column of a source layer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SourceField {
    /// Column name as stored in the source.
    pub name: String,
    /// OGR type name, for example `Integer64` or `String`.
    pub type_name: String,
}

impl SourceField {
    /// Build a source field.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// The geometry column of a source layer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GeometryColumn {
    /// Column name.
    pub name: String,
    /// Geometry type name, for example `MULTIPOLYGON`.
    pub geometry_type: String,
}

/// A layer discovered inside a dataset.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SourceLayer {
    /// Layer name.
    pub name: String,
    /// Attribute columns in declaration order.
    pub fields: Vec<SourceField>,
    /// Geometry column, when the layer has one.
    pub geometry: Option<GeometryColumn>,
    /// Declared extent, when recorded.
    pub bounds: Option<Rect<f64>>,
}

impl SourceLayer {
    /// Layer with attribute fields only.
    pub fn new(name: impl Into<String>, fields: Vec<SourceField>) -> Self {
        Self {
            name: name.into(),
            fields,
            geometry: None,
            bounds: None,
        }
    }

    /// Attach a geometry column.
    #[must_use]
    pub fn with_geometry(mut self, name: impl Into<String>, geometry_type: impl Into<String>) -> Self {
        self.geometry = Some(GeometryColumn {
            name: name.into(),
            geometry_type: geometry_type.into(),
        });
        self
    }
}

/// Errors raised while reading layers.
#[derive(Debug, Error)]
pub enum LayerSourceError {
    /// The dataset could not be opened.
    #[error("failed to open dataset {path}")]
    Open {
        /// Location of the dataset.
        path: Utf8PathBuf,
        /// Driver error.
        #[source]
        source: BoxError,
    },
    /// The dataset is not in the expected format.
    #[error("{path} is not a valid dataset: {reason}")]
    InvalidFormat {
        /// Location of the dataset.
        path: Utf8PathBuf,
        /// What is missing or malformed.
        reason: String,
    },
    /// Reading layer metadata failed.
    #[error("failed to read layers from {path} during {operation}")]
    Read {
        /// Location of the dataset.
        path: Utf8PathBuf,
        /// Query that was running.
        operation: &'static str,
        /// Driver error.
        #[source]
        source: BoxError,
    },
}

/// Enumerates the layers of a dataset on disk.
pub trait LayerSource: Send + Sync {
    /// Read every feature layer in `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LayerSourceError`] when the dataset cannot be opened or read.
    fn layers(&self, path: &Utf8Path) -> Result<Vec<SourceLayer>, LayerSourceError>;
}
