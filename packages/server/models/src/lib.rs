#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! API request and response types for the plot finder server.
//!
//! Request bodies use the field names the map frontend sends (`lng`,
//! `plotIds`); responses reuse [`plot_finder_parcel_models::QueryResult`].
//! Every request type validates itself before the handler touches the
//! store.

use plot_finder_parcel_models::{Center, MAX_LOOKUP_RADIUS_M, ValidationError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A map position as sent by the frontend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ApiLatLng {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
}

impl From<ApiLatLng> for Center {
    fn from(value: ApiLatLng) -> Self {
        Self::new(value.lat, value.lng)
    }
}

/// Body of `POST /api/good-parcels`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoodParcelsRequest {
    /// Search center.
    pub center: ApiLatLng,
    /// Search radius in meters.
    pub radius: f64,
    /// Optional cap on returned parcels.
    #[serde(default)]
    pub limit: Option<u32>,
}

impl GoodParcelsRequest {
    /// Checks the center, the radius (at most [`MAX_LOOKUP_RADIUS_M`]),
    /// and the limit.
    ///
    /// # Errors
    ///
    /// Returns the [`ValidationError`] for the first bad field.
    pub fn validate(&self) -> Result<Center, ValidationError> {
        let center = Center::from(self.center);
        center.validate()?;

        if !self.radius.is_finite() || self.radius <= 0.0 {
            return Err(ValidationError::Radius(self.radius));
        }
        if self.radius > MAX_LOOKUP_RADIUS_M {
            return Err(ValidationError::RadiusTooLarge {
                radius: self.radius,
                max: MAX_LOOKUP_RADIUS_M,
            });
        }
        if self.limit == Some(0) {
            return Err(ValidationError::Limit);
        }

        Ok(center)
    }
}

/// Body of `POST /api/sample-parcels`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleParcelsRequest {
    /// Search center.
    pub center: ApiLatLng,
}

impl SampleParcelsRequest {
    /// Checks the center.
    ///
    /// # Errors
    ///
    /// Returns the [`ValidationError`] for a bad coordinate.
    pub fn validate(&self) -> Result<Center, ValidationError> {
        let center = Center::from(self.center);
        center.validate()?;
        Ok(center)
    }
}

/// Body of `POST /api/parcels/by-ids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParcelsByIdsRequest {
    /// Parcel ids to fetch.
    pub plot_ids: Vec<String>,
}

impl ParcelsByIdsRequest {
    /// Parses every id as a UUID.
    ///
    /// # Errors
    ///
    /// * [`ValidationError::EmptyIds`] if no ids were sent
    /// * [`ValidationError::Id`] for the first id that is not a UUID
    pub fn parse_ids(&self) -> Result<Vec<Uuid>, ValidationError> {
        if self.plot_ids.is_empty() {
            return Err(ValidationError::EmptyIds);
        }
        self.plot_ids
            .iter()
            .map(|id| Uuid::parse_str(id.trim()).map_err(|_| ValidationError::Id(id.clone())))
            .collect()
    }
}

/// Response of `POST /api/admin/populate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulateResponse {
    /// Rows inserted by the rebuild.
    pub inserted: u64,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHealth {
    /// Whether the service is healthy.
    pub healthy: bool,
    /// Service version.
    pub version: String,
    /// Phase of the most recent population run.
    pub population: String,
}

/// Error body returned with every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Human-readable description.
    pub error: String,
}

impl ApiError {
    /// Wraps a message.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good(lat: f64, lng: f64, radius: f64) -> GoodParcelsRequest {
        GoodParcelsRequest {
            center: ApiLatLng { lat, lng },
            radius,
            limit: None,
        }
    }

    #[test]
    fn good_parcels_radius_is_capped() {
        assert!(good(51.5074, -0.1278, 5_000.0).validate().is_ok());
        assert!(matches!(
            good(51.5074, -0.1278, 5_000.1).validate(),
            Err(ValidationError::RadiusTooLarge { .. })
        ));
        assert!(matches!(
            good(51.5074, -0.1278, 0.0).validate(),
            Err(ValidationError::Radius(_))
        ));
        assert!(matches!(
            good(-91.0, 0.0, 10.0).validate(),
            Err(ValidationError::Latitude(_))
        ));
    }

    #[test]
    fn parses_frontend_body() {
        let body: GoodParcelsRequest = serde_json::from_str(
            r#"{"center": {"lat": 51.5074, "lng": -0.1278}, "radius": 1000}"#,
        )
        .unwrap();
        let center = body.validate().unwrap();
        assert!((center.lon + 0.1278).abs() < f64::EPSILON);
        assert_eq!(body.limit, None);
    }

    #[test]
    fn ids_must_be_present_and_uuids() {
        let empty = ParcelsByIdsRequest { plot_ids: vec![] };
        assert_eq!(empty.parse_ids(), Err(ValidationError::EmptyIds));

        let bad: ParcelsByIdsRequest =
            serde_json::from_str(r#"{"plotIds": ["not-a-uuid"]}"#).unwrap();
        assert_eq!(
            bad.parse_ids(),
            Err(ValidationError::Id("not-a-uuid".to_string()))
        );

        let ok = ParcelsByIdsRequest {
            plot_ids: vec![Uuid::nil().to_string()],
        };
        assert_eq!(ok.parse_ids().unwrap(), vec![Uuid::nil()]);
    }
}
