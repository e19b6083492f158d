//! `GeoJSON` polygon parsing and serialization.
//!
//! Constraint collections arrive as `GeoJSON`. Each geometry is checked
//! for shape (polygonal, closed rings, finite coordinates) before it is
//! sent to the store; topology such as self-intersection is left to the
//! geometry engine.

use geo::{MultiPolygon, Polygon};

use crate::TransformError;

/// Parses a `GeoJSON` geometry object into its member polygons.
///
/// `Polygon` yields one polygon and `MultiPolygon` yields each member.
///
/// # Errors
///
/// Returns [`TransformError::InvalidGeometry`] if the value is null, is not
/// a `GeoJSON` geometry, is not polygonal, or contains a malformed ring.
pub fn polygons_from_geojson(value: &serde_json::Value) -> Result<Vec<Polygon<f64>>, TransformError> {
    if value.is_null() {
        return Err(invalid("geometry is null"));
    }

    let geometry: geojson::Geometry = serde_json::from_value(value.clone())
        .map_err(|e| invalid(format!("not a GeoJSON geometry: {e}")))?;

    let geo_geom: geo::Geometry<f64> = geometry
        .try_into()
        .map_err(|e| invalid(format!("unsupported GeoJSON geometry: {e}")))?;

    let polygons = match geo_geom {
        geo::Geometry::Polygon(p) => vec![p],
        geo::Geometry::MultiPolygon(MultiPolygon(ps)) => ps,
        other => {
            return Err(invalid(format!(
                "expected Polygon or MultiPolygon, got {}",
                geometry_kind(&other)
            )));
        }
    };

    if polygons.is_empty() {
        return Err(invalid("MultiPolygon has no members"));
    }

    for polygon in &polygons {
        check_polygon(polygon)?;
    }

    Ok(polygons)
}

/// Serializes a polygon as a `GeoJSON` geometry object.
#[must_use]
pub fn polygon_to_geojson(polygon: &Polygon<f64>) -> serde_json::Value {
    let geometry = geojson::Geometry::new(geojson::Value::from(polygon));
    serde_json::to_value(geometry).unwrap_or(serde_json::Value::Null)
}

fn check_polygon(polygon: &Polygon<f64>) -> Result<(), TransformError> {
    let exterior = polygon.exterior();
    if exterior.0.len() < 4 {
        return Err(invalid(format!(
            "exterior ring has {} positions, need at least 4",
            exterior.0.len()
        )));
    }
    if !exterior.is_closed() {
        return Err(invalid("exterior ring is not closed"));
    }

    let all_finite = std::iter::once(exterior)
        .chain(polygon.interiors())
        .flat_map(|ring| ring.0.iter())
        .all(|c| c.x.is_finite() && c.y.is_finite());
    if !all_finite {
        return Err(invalid("ring contains non-finite coordinates"));
    }

    Ok(())
}

const fn geometry_kind(geometry: &geo::Geometry<f64>) -> &'static str {
    match geometry {
        geo::Geometry::Point(_) => "Point",
        geo::Geometry::Line(_) => "Line",
        geo::Geometry::LineString(_) => "LineString",
        geo::Geometry::Polygon(_) => "Polygon",
        geo::Geometry::MultiPoint(_) => "MultiPoint",
        geo::Geometry::MultiLineString(_) => "MultiLineString",
        geo::Geometry::MultiPolygon(_) => "MultiPolygon",
        geo::Geometry::GeometryCollection(_) => "GeometryCollection",
        geo::Geometry::Rect(_) => "Rect",
        geo::Geometry::Triangle(_) => "Triangle",
        #[allow(unreachable_patterns)]
        _ => "unknown geometry",
    }
}

fn invalid(message: impl Into<String>) -> TransformError {
    TransformError::InvalidGeometry {
        message: message.into(),
    }
}
