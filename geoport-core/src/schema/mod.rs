//! Dynamic layer schemas and their persistence contract.
//!
//! A [`LayerSchema`] describes the table a layer is loaded into. Schemas are
//! keyed by name, grown in batches of fields and turned into a
//! [`ModelHandle`] once every batch has landed.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::BoxError;

#[cfg(feature = "store-sqlite")]
mod sqlite;
mod types;

#[cfg(feature = "store-sqlite")]
pub use sqlite::SqliteSchemaStore;
pub use types::{
    FieldKind, GEOM_TYPE_MAPPING, GeometryKind, STANDARD_TYPE_MAPPING, geometry_kind,
    standard_field_kind,
};

/// Database alias every generated schema targets.
pub const DEFAULT_DB_NAME: &str = "datastore";

/// Length applied to character fields.
pub const CHAR_MAX_LENGTH: u32 = 255;

/// Identifier of a persisted layer schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SchemaId(pub i64);

/// Extra options attached to a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FieldOptions {
    /// Maximum length for character fields.
    pub max_length: Option<u32>,
}

/// A single column of a layer schema.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FieldDescriptor {
    /// Column name.
    pub name: String,
    /// Storage class.
    pub kind: FieldKind,
    /// Whether the column accepts nulls.
    pub nullable: bool,
    /// Extra options.
    pub options: FieldOptions,
}

impl FieldDescriptor {
    /// Build a nullable field, applying the character length where needed.
    ///
    /// # Examples
    ///
    /// ```
    /// use geoport_core::{FieldDescriptor, FieldKind};
    ///
    /// let field = FieldDescriptor::new("name", FieldKind::Char);
    /// assert_eq!(field.options.max_length, Some(255));
    /// assert!(field.nullable);
    /// ```
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let max_length = kind.is_char().then_some(CHAR_MAX_LENGTH);
        Self {
            name: name.into(),
            kind,
            nullable: true,
            options: FieldOptions { max_length },
        }
    }
}

/// A dynamic table definition for one imported layer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerSchema {
    /// Persistent identifier.
    pub id: SchemaId,
    /// Unique schema name, used as the table name.
    pub name: String,
    /// Target database alias.
    pub db_name: String,
    /// Whether the table lifecycle is managed by the schema store.
    pub managed: bool,
    /// User that created the schema.
    pub owner: String,
    /// Fields known so far.
    pub fields: Vec<FieldDescriptor>,
}

/// Result of [`SchemaStore::get_or_create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaLookup {
    /// The schema that was found or created.
    pub schema: LayerSchema,
    /// Whether this call created it.
    pub created: bool,
}

/// Counters reported by [`SchemaStore::apply_field_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Fields inserted.
    pub created: usize,
    /// Existing fields updated in place.
    pub updated: usize,
    /// Fields left untouched because they already existed.
    pub skipped: usize,
}

/// A schema whose fields are final and ready to back a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHandle {
    /// The realised schema, fields included.
    pub schema: LayerSchema,
}

impl ModelHandle {
    /// Table name of the realised model.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.schema.name
    }
}

/// Errors raised by [`SchemaStore`] implementations.
#[derive(Debug, Error)]
pub enum SchemaStoreError {
    /// No schema exists with the identifier.
    #[error("layer schema {id:?} not found")]
    NotFound {
        /// Identifier that was looked up.
        id: SchemaId,
    },
    /// A persisted field could not be decoded.
    #[error("corrupt field '{field}' in schema {id:?}: {detail}")]
    Corrupt {
        /// Schema containing the field.
        id: SchemaId,
        /// Field name.
        field: String,
        /// What failed to decode.
        detail: String,
    },
    /// The underlying storage failed.
    #[error("schema storage failed during {operation}")]
    Storage {
        /// Operation that was running.
        operation: &'static str,
        /// Driver error.
        #[source]
        source: BoxError,
    },
    /// The database was created by an incompatible version.
    #[error("expected catalog schema version {expected} but found {found}")]
    VersionMismatch {
        /// Version this build understands.
        expected: i64,
        /// Version recorded in the database.
        found: i64,
    },
    /// The store lock was poisoned by a panicking writer.
    #[error("schema store lock poisoned")]
    Poisoned,
}

/// Persistence contract for dynamic layer schemas.
pub trait SchemaStore: Send + Sync {
    /// Fetch the schema called `name`, creating it for `owner` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaStoreError::Storage`] when the catalog cannot be
    /// read or written.
    fn get_or_create(&self, name: &str, owner: &str) -> Result<SchemaLookup, SchemaStoreError>;

    /// Whether `owner` already has a schema called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaStoreError::Storage`] when the catalog cannot be read.
    fn exists_for_owner(&self, name: &str, owner: &str) -> Result<bool, SchemaStoreError>;

    /// Persist one batch of fields.
    ///
    /// With `overwrite`, fields whose name already exists are updated in
    /// place; otherwise they are skipped. All other fields are inserted in a
    /// single statement.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaStoreError::NotFound`] for unknown schemas.
    fn apply_field_batch(
        &self,
        schema: SchemaId,
        batch: &[FieldDescriptor],
        overwrite: bool,
    ) -> Result<BatchReport, SchemaStoreError>;

    /// List fields in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaStoreError::NotFound`] for unknown schemas.
    fn fields(&self, schema: SchemaId) -> Result<Vec<FieldDescriptor>, SchemaStoreError>;

    /// Produce the model handle for a schema whose batches have landed.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaStoreError::NotFound`] for unknown schemas.
    fn realize(&self, schema: SchemaId) -> Result<ModelHandle, SchemaStoreError>;
}

#[cfg(all(test, feature = "store-sqlite"))]
mod tests;
