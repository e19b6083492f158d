//! Coordinate reference systems and reprojection expressions.
//!
//! Three CRSs are involved in population and querying:
//!
//! - the source CRS of raw parcel geometry (British National Grid by default),
//! - the native CRS of the indexed `geometry` columns (metric, so
//!   `ST_DWithin` distances are in meters),
//! - the interchange CRS of pre-serialized `GeoJSON` and request centers
//!   (WGS84).

use std::fmt;

/// A `PostGIS` spatial reference identifier (EPSG code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Srid(pub i32);

impl Srid {
    /// WGS84 longitude/latitude.
    pub const WGS84: Self = Self(4326);
    /// OSGB36 / British National Grid (meters).
    pub const BRITISH_NATIONAL_GRID: Self = Self(27700);

    /// Returns the numeric SRID.
    #[must_use]
    pub const fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Srid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

/// SQL expression reprojecting `expr` from `from` to `to`.
///
/// The input is stamped with `from` via `ST_SetSRID` first so that source
/// columns with a missing or wrong SRID are still interpreted correctly.
/// `ST_Transform` is elided when both SRIDs are equal.
#[must_use]
pub fn reproject_expr(expr: &str, from: Srid, to: Srid) -> String {
    let stamped = format!("ST_SetSRID({expr}, {})", from.value());
    if from == to {
        stamped
    } else {
        format!("ST_Transform({stamped}, {})", to.value())
    }
}

/// SQL expression for a point from longitude/latitude placeholders in
/// `from`, reprojected into `to`.
#[must_use]
pub fn point_expr(lon_param: &str, lat_param: &str, from: Srid, to: Srid) -> String {
    reproject_expr(&format!("ST_MakePoint({lon_param}, {lat_param})"), from, to)
}

/// SQL expression serializing `expr` (already in `from`) as `GeoJSON` in
/// `to`.
#[must_use]
pub fn geojson_expr(expr: &str, from: Srid, to: Srid) -> String {
    let projected = if from == to {
        expr.to_string()
    } else {
        format!("ST_Transform({expr}, {})", to.value())
    };
    format!("ST_AsGeoJSON({projected})::jsonb")
}
