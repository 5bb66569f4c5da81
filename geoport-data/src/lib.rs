//! Data access for the geoport importer.
//!
//! [`GeoPackageSource`] enumerates the feature layers of a GeoPackage and
//! [`Ogr2OgrLoader`] copies a layer into PostGIS using GDAL's `ogr2ogr`.
#![forbid(unsafe_code)]

pub mod gpkg;
pub mod loader;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use gpkg::{GeoPackageSource, ogr_type_name};
pub use loader::{
    ConnectionParams, DEFAULT_LOADER_TIMEOUT, DEFAULT_OGR2OGR, DataLoader, LoadReport,
    LoadRequest, LoaderError, Ogr2OgrLoader,
};
