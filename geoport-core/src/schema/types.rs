//! Field kinds and the lookup tables translating source type names.

use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::UnknownLabel;

/// Geometry flavour carried by a geometry field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GeometryKind {
    /// Single point.
    Point,
    /// Single line string.
    LineString,
    /// Single polygon.
    Polygon,
    /// Collection of points.
    MultiPoint,
    /// Collection of line strings.
    MultiLineString,
    /// Collection of polygons.
    MultiPolygon,
    /// Heterogeneous collection.
    GeometryCollection,
    /// Any geometry.
    Geometry,
}

impl GeometryKind {
    const ALL: [Self; 8] = [
        Self::Point,
        Self::LineString,
        Self::Polygon,
        Self::MultiPoint,
        Self::MultiLineString,
        Self::MultiPolygon,
        Self::GeometryCollection,
        Self::Geometry,
    ];

    /// Snake-case label used for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Point => "point",
            Self::LineString => "line_string",
            Self::Polygon => "polygon",
            Self::MultiPoint => "multi_point",
            Self::MultiLineString => "multi_line_string",
            Self::MultiPolygon => "multi_polygon",
            Self::GeometryCollection => "geometry_collection",
            Self::Geometry => "geometry",
        }
    }
}

/// Storage class of a layer schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FieldKind {
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInteger,
    /// Double precision float.
    Float,
    /// Bounded character string.
    Char,
    /// Calendar date.
    Date,
    /// Date and time.
    DateTime,
    /// Time of day.
    Time,
    /// Opaque bytes.
    Binary,
    /// True or false.
    Boolean,
    /// Geometry column of the given flavour.
    Geometry(GeometryKind),
}

impl FieldKind {
    /// Whether values of this kind carry a `max_length`.
    #[must_use]
    pub const fn is_char(self) -> bool {
        matches!(self, Self::Char)
    }

    /// Whether this is a geometry column.
    #[must_use]
    pub const fn is_geometry(self) -> bool {
        matches!(self, Self::Geometry(_))
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => f.write_str("integer"),
            Self::BigInteger => f.write_str("big_integer"),
            Self::Float => f.write_str("float"),
            Self::Char => f.write_str("char"),
            Self::Date => f.write_str("date"),
            Self::DateTime => f.write_str("datetime"),
            Self::Time => f.write_str("time"),
            Self::Binary => f.write_str("binary"),
            Self::Boolean => f.write_str("boolean"),
            Self::Geometry(kind) => write!(f, "geometry:{}", kind.as_str()),
        }
    }
}

impl FromStr for FieldKind {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "integer" => Self::Integer,
            "big_integer" => Self::BigInteger,
            "float" => Self::Float,
            "char" => Self::Char,
            "date" => Self::Date,
            "datetime" => Self::DateTime,
            "time" => Self::Time,
            "binary" => Self::Binary,
            "boolean" => Self::Boolean,
            other => {
                let geometry = other.strip_prefix("geometry:").and_then(|label| {
                    GeometryKind::ALL
                        .into_iter()
                        .find(|kind| kind.as_str() == label)
                });
                return geometry.map(Self::Geometry).ok_or_else(|| UnknownLabel {
                    kind: "field kind",
                    label: other.to_owned(),
                });
            }
        };
        Ok(kind)
    }
}

/// OGR attribute type names and the field kind each maps to.
pub const STANDARD_TYPE_MAPPING: &[(&str, FieldKind)] = &[
    ("Integer", FieldKind::Integer),
    ("Integer64", FieldKind::BigInteger),
    ("Real", FieldKind::Float),
    ("String", FieldKind::Char),
    ("Date", FieldKind::Date),
    ("DateTime", FieldKind::DateTime),
    ("Time", FieldKind::Time),
    ("Binary", FieldKind::Binary),
    ("Boolean", FieldKind::Boolean),
];

/// Geometry type names and the geometry kind each maps to.
///
/// Both the GeoPackage spelling (`MULTIPOLYGON`) and the OGR display name
/// (`Multi Polygon`) are accepted; lookups ignore case.
pub const GEOM_TYPE_MAPPING: &[(&str, GeometryKind)] = &[
    ("POINT", GeometryKind::Point),
    ("LINESTRING", GeometryKind::LineString),
    ("POLYGON", GeometryKind::Polygon),
    ("MULTIPOINT", GeometryKind::MultiPoint),
    ("MULTILINESTRING", GeometryKind::MultiLineString),
    ("MULTIPOLYGON", GeometryKind::MultiPolygon),
    ("GEOMETRYCOLLECTION", GeometryKind::GeometryCollection),
    ("GEOMETRY", GeometryKind::Geometry),
    ("Point", GeometryKind::Point),
    ("Line String", GeometryKind::LineString),
    ("Polygon", GeometryKind::Polygon),
    ("Multi Point", GeometryKind::MultiPoint),
    ("Multi Line String", GeometryKind::MultiLineString),
    ("Multi Polygon", GeometryKind::MultiPolygon),
    ("Geometry Collection", GeometryKind::GeometryCollection),
    ("Unknown (any)", GeometryKind::Geometry),
];

/// Look up the field kind for an OGR attribute type name.
///
/// # Examples
///
/// ```
/// use geoport_core::{FieldKind, standard_field_kind};
///
/// assert_eq!(standard_field_kind("Integer64"), Some(FieldKind::BigInteger));
/// assert_eq!(standard_field_kind("IntegerList"), None);
/// ```
#[must_use]
pub fn standard_field_kind(type_name: &str) -> Option<FieldKind> {
    STANDARD_TYPE_MAPPING
        .iter()
        .find(|(name, _)| *name == type_name)
        .map(|(_, kind)| *kind)
}

/// Look up the geometry kind for a geometry type name.
#[must_use]
pub fn geometry_kind(type_name: &str) -> Option<GeometryKind> {
    let trimmed = type_name.trim();
    GEOM_TYPE_MAPPING
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(trimmed))
        .map(|(_, kind)| *kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Integer", Some(FieldKind::Integer))]
    #[case("Real", Some(FieldKind::Float))]
    #[case("String", Some(FieldKind::Char))]
    #[case("Boolean", Some(FieldKind::Boolean))]
    #[case("StringList", None)]
    #[case("string", None)]
    fn standard_lookup(#[case] name: &str, #[case] expected: Option<FieldKind>) {
        assert_eq!(standard_field_kind(name), expected);
    }

    #[rstest]
    #[case("MULTIPOLYGON", Some(GeometryKind::MultiPolygon))]
    #[case("multi polygon", Some(GeometryKind::MultiPolygon))]
    #[case("Point", Some(GeometryKind::Point))]
    #[case("CURVEPOLYGON", None)]
    fn geometry_lookup(#[case] name: &str, #[case] expected: Option<GeometryKind>) {
        assert_eq!(geometry_kind(name), expected);
    }

    #[rstest]
    #[case(FieldKind::BigInteger)]
    #[case(FieldKind::Char)]
    #[case(FieldKind::Geometry(GeometryKind::MultiLineString))]
    fn field_kind_labels_parse_back(#[case] kind: FieldKind) {
        assert_eq!(kind.to_string().parse::<FieldKind>(), Ok(kind));
    }
}
