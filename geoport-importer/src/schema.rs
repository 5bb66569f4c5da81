//! Derivation of layer schemas from source layers.
//!
//! Source attributes map to [`FieldKind`]s through the standard type table
//! and the geometry column through the geometry table. Fields that cannot be
//! mapped are reported as [`FieldOutcome::Skipped`] and dropped by
//! [`apply_batch`] while their siblings persist.
#![forbid(unsafe_code)]

use std::collections::HashSet;

use geoport_core::{
    BatchReport, ExecutionId, FieldDescriptor, FieldKind, LayerSchema, SchemaId, SchemaStore,
    SchemaStoreError, SourceLayer, geometry_kind, standard_field_kind,
};
use log::{debug, error};

/// Number of fields persisted by one schema job.
pub const FIELD_BATCH_SIZE: usize = 50;

/// Result of mapping one source column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldOutcome {
    /// The column maps to a schema field.
    Mapped(FieldDescriptor),
    /// The column type is not recognised.
    Skipped {
        /// Column name.
        name: String,
        /// Why the column was skipped.
        reason: String,
    },
}

/// Map every column of `layer`, attributes first and geometry last.
///
/// Attribute names are lower-cased. A column whose name was already mapped
/// is skipped.
///
/// # Examples
///
/// ```
/// use geoport_core::{FieldKind, GeometryKind, SourceField, SourceLayer};
/// use geoport_importer::schema::{FieldOutcome, derive_fields};
///
/// let layer = SourceLayer::new("roads", vec![SourceField::new("Name", "String")])
///     .with_geometry("geom", "LINESTRING");
/// let outcomes = derive_fields(&layer);
///
/// assert!(matches!(&outcomes[0], FieldOutcome::Mapped(f) if f.name == "name"));
/// assert!(matches!(
///     &outcomes[1],
///     FieldOutcome::Mapped(f) if f.kind == FieldKind::Geometry(GeometryKind::LineString)
/// ));
/// ```
#[must_use]
pub fn derive_fields(layer: &SourceLayer) -> Vec<FieldOutcome> {
    let mut seen = HashSet::new();
    let mut outcomes: Vec<FieldOutcome> = layer
        .fields
        .iter()
        .map(|field| {
            let name = field.name.to_lowercase();
            match standard_field_kind(&field.type_name) {
                Some(kind) => FieldOutcome::Mapped(FieldDescriptor::new(name, kind)),
                None => FieldOutcome::Skipped {
                    name,
                    reason: format!("unsupported field type {}", field.type_name),
                },
            }
        })
        .map(|outcome| unique(outcome, &mut seen))
        .collect();
    if let Some(geometry) = &layer.geometry {
        let outcome = match geometry_kind(&geometry.geometry_type) {
            Some(kind) => FieldOutcome::Mapped(FieldDescriptor::new(
                geometry.name.clone(),
                FieldKind::Geometry(kind),
            )),
            None => FieldOutcome::Skipped {
                name: geometry.name.clone(),
                reason: format!("unsupported geometry type {}", geometry.geometry_type),
            },
        };
        outcomes.push(unique(outcome, &mut seen));
    }
    outcomes
}

fn unique(outcome: FieldOutcome, seen: &mut HashSet<String>) -> FieldOutcome {
    match outcome {
        FieldOutcome::Mapped(field) if !seen.insert(field.name.clone()) => FieldOutcome::Skipped {
            name: field.name,
            reason: "duplicate field name".to_owned(),
        },
        other => other,
    }
}

/// Split outcomes into batches of [`FIELD_BATCH_SIZE`].
#[must_use]
pub fn field_batches(outcomes: Vec<FieldOutcome>) -> Vec<Vec<FieldOutcome>> {
    let mut batches = Vec::new();
    let mut outcomes = outcomes.into_iter().peekable();
    while outcomes.peek().is_some() {
        batches.push(outcomes.by_ref().take(FIELD_BATCH_SIZE).collect());
    }
    batches
}

/// Persist the mapped fields of one batch, logging and dropping the rest.
///
/// # Errors
///
/// Returns any [`SchemaStoreError`] raised by the store.
pub fn apply_batch(
    store: &dyn SchemaStore,
    schema: SchemaId,
    batch: &[FieldOutcome],
    overwrite: bool,
) -> Result<BatchReport, SchemaStoreError> {
    let mut fields = Vec::with_capacity(batch.len());
    for outcome in batch {
        match outcome {
            FieldOutcome::Mapped(field) => fields.push(field.clone()),
            FieldOutcome::Skipped { name, reason } => {
                error!("field named {name} cannot be imported: {reason}");
            }
        }
    }
    let report = store.apply_field_batch(schema, &fields, overwrite)?;
    debug!(
        "schema {schema:?}: {} created, {} updated, {} skipped",
        report.created, report.updated, report.skipped
    );
    Ok(report)
}

/// Schema name used when `layer` already exists and may not be replaced.
///
/// # Examples
///
/// ```
/// use geoport_core::ExecutionId;
/// use geoport_importer::schema::alternate_name;
///
/// let id: ExecutionId = "0b0c5f9e-1a2b-4c3d-8e9f-001122334455".parse().unwrap();
/// assert_eq!(
///     alternate_name("roads", id),
///     "roads_0b0c5f9e_1a2b_4c3d_8e9f_001122334455"
/// );
/// ```
#[must_use]
pub fn alternate_name(layer: &str, exec_id: ExecutionId) -> String {
    format!("{layer}_{}", exec_id.underscored())
}

/// Find or create the schema for `layer`.
///
/// An existing schema is reused only when `overwrite` is set; otherwise a
/// schema named by [`alternate_name`] is used. The returned schema name is
/// also the table the data is loaded into.
///
/// # Errors
///
/// Returns any [`SchemaStoreError`] raised by the store.
pub fn resolve_schema(
    store: &dyn SchemaStore,
    layer: &str,
    owner: &str,
    exec_id: ExecutionId,
    overwrite: bool,
) -> Result<LayerSchema, SchemaStoreError> {
    let lookup = store.get_or_create(layer, owner)?;
    if lookup.created || overwrite {
        return Ok(lookup.schema);
    }
    let alternate = alternate_name(layer, exec_id);
    debug!("schema {layer} already exists, using {alternate}");
    Ok(store.get_or_create(&alternate, owner)?.schema)
}
