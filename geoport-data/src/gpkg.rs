//! GeoPackage layer discovery.
//!
//! Layers are read from the GeoPackage metadata tables rather than through
//! GDAL: `gpkg_contents` lists feature tables and their extent,
//! `gpkg_geometry_columns` names the geometry column, and `pragma_table_info`
//! describes the attribute columns.
#![forbid(unsafe_code)]

use camino::{Utf8Path, Utf8PathBuf};
use geo::{Coord, Rect};
use geoport_core::{
    GeometryColumn, LayerSource, LayerSourceError, SourceField, SourceLayer,
};
use log::debug;
use rusqlite::{Connection, OpenFlags, OptionalExtension};

/// Reads feature layers from a GeoPackage file.
///
/// # Examples
///
/// ```no_run
/// use camino::Utf8Path;
/// use geoport_core::LayerSource;
/// use geoport_data::GeoPackageSource;
///
/// let layers = GeoPackageSource.layers(Utf8Path::new("roads.gpkg"))?;
/// for layer in layers {
///     println!("{} has {} fields", layer.name, layer.fields.len());
/// }
/// # Ok::<(), geoport_core::LayerSourceError>(())
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct GeoPackageSource;

impl LayerSource for GeoPackageSource {
    fn layers(&self, path: &Utf8Path) -> Result<Vec<SourceLayer>, LayerSourceError> {
        let connection = Connection::open_with_flags(
            path.as_std_path(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| LayerSourceError::Open {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        let reader = Reader { connection: &connection, path };
        reader.ensure_geopackage()?;
        let layers = reader.feature_tables()?;
        debug!("found {} feature layers in {path}", layers.len());
        Ok(layers)
    }
}

struct Reader<'a> {
    connection: &'a Connection,
    path: &'a Utf8Path,
}

impl Reader<'_> {
    fn read_error(&self, operation: &'static str) -> impl FnOnce(rusqlite::Error) -> LayerSourceError {
        let path: Utf8PathBuf = self.path.to_path_buf();
        move |source| LayerSourceError::Read {
            path,
            operation,
            source: Box::new(source),
        }
    }

    fn ensure_geopackage(&self) -> Result<(), LayerSourceError> {
        for table in ["gpkg_contents", "gpkg_geometry_columns"] {
            let present: bool = self
                .connection
                .query_row(
                    "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                    [table],
                    |row| row.get(0),
                )
                .map_err(|source| match source {
                    rusqlite::Error::SqliteFailure(..) => LayerSourceError::InvalidFormat {
                        path: self.path.to_path_buf(),
                        reason: format!("not a SQLite database: {source}"),
                    },
                    other => LayerSourceError::Read {
                        path: self.path.to_path_buf(),
                        operation: "inspect metadata tables",
                        source: Box::new(other),
                    },
                })?;
            if !present {
                return Err(LayerSourceError::InvalidFormat {
                    path: self.path.to_path_buf(),
                    reason: format!("missing {table} table"),
                });
            }
        }
        Ok(())
    }

    fn feature_tables(&self) -> Result<Vec<SourceLayer>, LayerSourceError> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT table_name, min_x, min_y, max_x, max_y FROM gpkg_contents
                 WHERE data_type = 'features' ORDER BY rowid",
            )
            .map_err(self.read_error("prepare contents query"))?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    [
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                    ],
                ))
            })
            .map_err(self.read_error("query contents"))?;

        let mut layers = Vec::new();
        for row in rows {
            let (name, extent) = row.map_err(self.read_error("read contents row"))?;
            let geometry = self.geometry_column(&name)?;
            let fields = self.attribute_fields(&name, geometry.as_ref())?;
            layers.push(SourceLayer {
                name,
                fields,
                geometry,
                bounds: bounds_from_extent(extent),
            });
        }
        Ok(layers)
    }

    fn geometry_column(&self, table: &str) -> Result<Option<GeometryColumn>, LayerSourceError> {
        self.connection
            .query_row(
                "SELECT column_name, geometry_type_name FROM gpkg_geometry_columns
                 WHERE table_name = ?1",
                [table],
                |row| {
                    Ok(GeometryColumn {
                        name: row.get(0)?,
                        geometry_type: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(self.read_error("query geometry columns"))
    }

    fn attribute_fields(
        &self,
        table: &str,
        geometry: Option<&GeometryColumn>,
    ) -> Result<Vec<SourceField>, LayerSourceError> {
        let mut statement = self
            .connection
            .prepare("SELECT name, type, pk FROM pragma_table_info(?1) ORDER BY cid")
            .map_err(self.read_error("prepare table info"))?;
        let rows = statement
            .query_map([table], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(self.read_error("query table info"))?;

        let mut fields = Vec::new();
        for row in rows {
            let (name, declared, pk) = row.map_err(self.read_error("read table info"))?;
            let is_geometry = geometry.is_some_and(|column| column.name == name);
            if pk > 0 || is_geometry {
                continue;
            }
            fields.push(SourceField {
                type_name: ogr_type_name(&declared),
                name,
            });
        }
        Ok(fields)
    }
}

fn bounds_from_extent(extent: [Option<f64>; 4]) -> Option<Rect<f64>> {
    match extent {
        [Some(min_x), Some(min_y), Some(max_x), Some(max_y)] => Some(Rect::new(
            Coord { x: min_x, y: min_y },
            Coord { x: max_x, y: max_y },
        )),
        _ => None,
    }
}

/// Translate a declared SQLite column type into an OGR field type name.
///
/// Unknown declarations are returned verbatim.
///
/// # Examples
///
/// ```
/// use geoport_data::ogr_type_name;
///
/// assert_eq!(ogr_type_name("INTEGER"), "Integer64");
/// assert_eq!(ogr_type_name("TEXT(80)"), "String");
/// assert_eq!(ogr_type_name("JSONB"), "JSONB");
/// ```
#[must_use]
pub fn ogr_type_name(declared: &str) -> String {
    let base = declared
        .split('(')
        .next()
        .unwrap_or(declared)
        .trim()
        .to_ascii_uppercase();
    let mapped = match base.as_str() {
        "INTEGER" | "INT" | "MEDIUMINT" => "Integer64",
        "SMALLINT" | "TINYINT" => "Integer",
        "FLOAT" | "DOUBLE" | "REAL" => "Real",
        "DATE" => "Date",
        "DATETIME" => "DateTime",
        "BLOB" => "Binary",
        "BOOLEAN" => "Boolean",
        text if text.starts_with("TEXT") => "String",
        _ => return declared.to_owned(),
    };
    mapped.to_owned()
}
