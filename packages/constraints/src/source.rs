//! Reading and flattening `GeoJSON` constraint collections.

use plot_finder_parcel_models::{ConstraintLayer, ConstraintPolygon};
use plot_finder_transform::geometry::{polygon_to_geojson, polygons_from_geojson};

use crate::ConstraintLoadError;

/// Reads a whole collection from a file path or `http(s)://` URL.
///
/// # Errors
///
/// Returns an error if the location cannot be read or is not JSON.
pub async fn read_collection(location: &str) -> Result<serde_json::Value, ConstraintLoadError> {
    let text = if location.starts_with("http://") || location.starts_with("https://") {
        reqwest::get(location)
            .await?
            .error_for_status()?
            .text()
            .await?
    } else {
        tokio::fs::read_to_string(location)
            .await
            .map_err(|source| ConstraintLoadError::Read {
                location: location.to_string(),
                source,
            })?
    };

    Ok(serde_json::from_str(&text)?)
}

/// Flattens a `FeatureCollection` into one [`ConstraintPolygon`] per
/// polygon. `MultiPolygon` features contribute each member polygon under
/// the feature's name.
///
/// # Errors
///
/// Returns [`ConstraintLoadError::Malformed`] if the value is not a
/// `FeatureCollection` or any feature lacks valid polygon geometry.
pub fn collection_polygons(
    layer: ConstraintLayer,
    collection: &serde_json::Value,
) -> Result<Vec<ConstraintPolygon>, ConstraintLoadError> {
    let malformed = |message: String| ConstraintLoadError::Malformed { layer, message };

    if collection["type"].as_str() != Some("FeatureCollection") {
        return Err(malformed("expected a FeatureCollection".to_string()));
    }
    let features = collection["features"]
        .as_array()
        .ok_or_else(|| malformed("missing features array".to_string()))?;

    let mut polygons = Vec::with_capacity(features.len());

    for (i, feature) in features.iter().enumerate() {
        let geometry = &feature["geometry"];
        if geometry.is_null() {
            return Err(malformed(format!("feature {i} has no geometry")));
        }

        let props = &feature["properties"];
        let name = props["name"]
            .as_str()
            .or_else(|| props["NAME"].as_str())
            .map(ToString::to_string);

        let parsed =
            polygons_from_geojson(geometry).map_err(|e| malformed(format!("feature {i}: {e}")))?;

        polygons.extend(parsed.iter().map(|polygon| ConstraintPolygon {
            layer,
            name: name.clone(),
            geometry: polygon_to_geojson(polygon),
        }));
    }

    Ok(polygons)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(x: f64, y: f64) -> serde_json::Value {
        serde_json::json!([[x, y], [x + 1.0, y], [x + 1.0, y + 1.0], [x, y + 1.0], [x, y]])
    }

    #[test]
    fn multipolygons_are_split_and_keep_the_feature_name() {
        let collection = serde_json::json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": { "NAME": "Old Town" },
                "geometry": {
                    "type": "MultiPolygon",
                    "coordinates": [[ring(0.0, 0.0)], [ring(5.0, 5.0)]]
                }
            }]
        });

        let polygons =
            collection_polygons(ConstraintLayer::ConservationArea, &collection).unwrap();
        assert_eq!(polygons.len(), 2);
        assert!(polygons.iter().all(|p| p.name.as_deref() == Some("Old Town")));
        assert!(polygons.iter().all(|p| p.geometry["type"] == "Polygon"));
    }

    #[test]
    fn non_polygon_geometry_is_malformed() {
        let collection = serde_json::json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {},
                "geometry": { "type": "Point", "coordinates": [0.0, 0.0] }
            }]
        });
        let err = collection_polygons(ConstraintLayer::GreenBelt, &collection).unwrap_err();
        assert!(matches!(err, ConstraintLoadError::Malformed { .. }));
    }

    #[test]
    fn bare_geometry_is_not_a_collection() {
        let value = serde_json::json!({ "type": "Polygon", "coordinates": [ring(0.0, 0.0)] });
        assert!(collection_polygons(ConstraintLayer::GreenBelt, &value).is_err());
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let err = read_collection("/nonexistent/conservation.geojson")
            .await
            .unwrap_err();
        assert!(matches!(err, ConstraintLoadError::Read { .. }));
    }
}
