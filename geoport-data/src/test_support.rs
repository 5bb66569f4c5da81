//! Test doubles and fixture builders for loader and GeoPackage tests.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8Path;
use geoport_core::SourceLayer;
use rusqlite::{Connection, params};

use crate::loader::{DataLoader, LoadReport, LoadRequest, LoaderError};

/// Write a minimal GeoPackage containing `layers`.
///
/// Only the metadata tables the importer reads are created. Layers without
/// bounds receive a unit extent.
///
/// # Errors
///
/// Returns any SQLite error raised while writing the file.
pub fn write_geopackage(path: &Utf8Path, layers: &[SourceLayer]) -> rusqlite::Result<()> {
    let connection = Connection::open(path.as_std_path())?;
    connection.execute_batch(
        "CREATE TABLE gpkg_contents (
            table_name TEXT NOT NULL PRIMARY KEY,
            data_type TEXT NOT NULL,
            identifier TEXT,
            min_x DOUBLE, min_y DOUBLE, max_x DOUBLE, max_y DOUBLE,
            srs_id INTEGER
        );
        CREATE TABLE gpkg_geometry_columns (
            table_name TEXT NOT NULL,
            column_name TEXT NOT NULL,
            geometry_type_name TEXT NOT NULL,
            srs_id INTEGER NOT NULL,
            z TINYINT NOT NULL,
            m TINYINT NOT NULL
        );",
    )?;
    for layer in layers {
        let mut columns = vec!["\"fid\" INTEGER PRIMARY KEY AUTOINCREMENT".to_owned()];
        columns.extend(
            layer
                .fields
                .iter()
                .map(|field| format!("\"{}\" {}", field.name, declared_type(&field.type_name))),
        );
        if let Some(geometry) = &layer.geometry {
            columns.push(format!("\"{}\" {}", geometry.name, geometry.geometry_type));
        }
        connection.execute_batch(&format!(
            "CREATE TABLE \"{}\" ({});",
            layer.name,
            columns.join(", ")
        ))?;

        let (min, max) = layer.bounds.map_or(((0.0, 0.0), (1.0, 1.0)), |rect| {
            (rect.min().x_y(), rect.max().x_y())
        });
        connection.execute(
            "INSERT INTO gpkg_contents (table_name, data_type, identifier, min_x, min_y, max_x, max_y, srs_id)
             VALUES (?1, 'features', ?1, ?2, ?3, ?4, ?5, 4326)",
            params![layer.name, min.0, min.1, max.0, max.1],
        )?;
        if let Some(geometry) = &layer.geometry {
            connection.execute(
                "INSERT INTO gpkg_geometry_columns VALUES (?1, ?2, ?3, 4326, 0, 0)",
                params![layer.name, geometry.name, geometry.geometry_type],
            )?;
        }
    }
    Ok(())
}

fn declared_type(ogr_type: &str) -> &str {
    match ogr_type {
        "Integer" => "SMALLINT",
        "Integer64" => "INTEGER",
        "Real" => "REAL",
        "String" => "TEXT",
        "Date" => "DATE",
        "DateTime" => "DATETIME",
        "Binary" => "BLOB",
        "Boolean" => "BOOLEAN",
        other => other,
    }
}

/// [`DataLoader`] that records requests instead of running a process.
#[derive(Debug, Default)]
pub struct RecordingLoader {
    requests: Mutex<Vec<LoadRequest>>,
    failing_layer: Option<(String, String)>,
}

impl RecordingLoader {
    /// Loader that succeeds for every request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader that reports `stderr` whenever `layer` is loaded.
    #[must_use]
    pub fn failing_on(layer: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            failing_layer: Some((layer.into(), stderr.into())),
        }
    }

    /// Requests seen so far, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<LoadRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DataLoader for RecordingLoader {
    async fn load(&self, request: &LoadRequest) -> Result<LoadReport, LoaderError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        if let Some((layer, stderr)) = &self.failing_layer {
            if *layer == request.layer {
                return Err(LoaderError::Stderr {
                    stderr: stderr.clone(),
                    code: Some(1),
                });
            }
        }
        Ok(LoadReport {
            stdout: String::new(),
            elapsed: Duration::ZERO,
        })
    }
}
