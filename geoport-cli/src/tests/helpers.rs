//! Fixtures shared by the CLI unit and behaviour tests.

use camino::{Utf8Path, Utf8PathBuf};
use geoport_core::{SourceField, SourceLayer};
use geoport_data::test_support::write_geopackage;
use tempfile::TempDir;

/// A scratch directory holding a GeoPackage and room for the ledger database.
pub(super) struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    pub(super) fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 tempdir");
        Self { _dir: dir, root }
    }

    pub(super) fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Ledger database path; the file is created by the first import.
    pub(super) fn database(&self) -> Utf8PathBuf {
        self.root.join("state/geoport.db")
    }

    /// Write `upload.gpkg` with one line layer per name.
    pub(super) fn geopackage(&self, layers: &[&str]) -> Utf8PathBuf {
        let path = self.root.join("upload.gpkg");
        let layers: Vec<_> = layers
            .iter()
            .map(|name| {
                SourceLayer::new(*name, vec![SourceField::new("name", "String")])
                    .with_geometry("geom", "LINESTRING")
            })
            .collect();
        write_geopackage(&path, &layers).expect("write GeoPackage");
        path
    }
}
