#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Parcel, constraint layer, and query result types.
//!
//! These types are shared by the population pipeline, the query engine, and
//! the store implementations. Row types mirror the `get_good_parcels` table;
//! [`QueryResult`] and [`ParcelItem`] are the response contract returned to
//! callers.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

/// Largest radius accepted for a parcel lookup, in meters.
pub const MAX_LOOKUP_RADIUS_M: f64 = 5_000.0;

/// A query parameter outside its accepted domain.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Latitude non-finite or outside `[-90, 90]`.
    #[error("Invalid latitude: {0}")]
    Latitude(f64),

    /// Longitude non-finite or outside `[-180, 180]`.
    #[error("Invalid longitude: {0}")]
    Longitude(f64),

    /// Radius not a positive finite number of meters.
    #[error("Invalid radius: {0} (must be a positive number of meters)")]
    Radius(f64),

    /// Radius above the allowed maximum.
    #[error("Radius {radius} exceeds the maximum of {max} meters")]
    RadiusTooLarge {
        /// Requested radius.
        radius: f64,
        /// Allowed maximum.
        max: f64,
    },

    /// Result limit of zero.
    #[error("Limit must be at least 1")]
    Limit,

    /// An ID-set request with no IDs.
    #[error("At least one parcel id is required")]
    EmptyIds,

    /// A parcel id that is not a UUID.
    #[error("Invalid parcel id: {0:?}")]
    Id(String),
}

/// A planning constraint layer that parcels are tagged against.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintLayer {
    /// Metropolitan green belt land.
    GreenBelt,
    /// Built-up area boundaries.
    BuiltUpArea,
    /// Conservation area boundaries.
    ConservationArea,
}

impl ConstraintLayer {
    /// Returns all constraint layers in flag column order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::GreenBelt, Self::BuiltUpArea, Self::ConservationArea]
    }

    /// Name of the boolean column in `get_good_parcels` holding this
    /// layer's flag.
    #[must_use]
    pub const fn flag_column(self) -> &'static str {
        match self {
            Self::GreenBelt => "isInGreenBelt",
            Self::BuiltUpArea => "isInBuiltUpArea",
            Self::ConservationArea => "isInConservationArea",
        }
    }
}

/// The three constraint flags computed for a parcel at population time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintFlags {
    /// Parcel intersects the green belt.
    pub green_belt: bool,
    /// Parcel intersects a built-up area.
    pub built_up_area: bool,
    /// Parcel intersects a conservation area.
    pub conservation_area: bool,
}

impl ConstraintFlags {
    /// Sets the flag for a single layer.
    pub const fn set(&mut self, layer: ConstraintLayer, value: bool) {
        match layer {
            ConstraintLayer::GreenBelt => self.green_belt = value,
            ConstraintLayer::BuiltUpArea => self.built_up_area = value,
            ConstraintLayer::ConservationArea => self.conservation_area = value,
        }
    }
}

/// A half-open range of source keys, `[start, end)`.
///
/// Used both for the whole source key span and for individual batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// First key included in the range.
    pub start: i64,
    /// First key past the end of the range.
    pub end: i64,
}

impl KeyRange {
    /// Creates a new key range.
    #[must_use]
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Number of keys covered by the range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        if self.end > self.start {
            self.end.abs_diff(self.start)
        } else {
            0
        }
    }

    /// Whether the range covers no keys.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Whether `key` falls inside the range.
    #[must_use]
    pub const fn contains(&self, key: i64) -> bool {
        key >= self.start && key < self.end
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A point in WGS84 coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Center {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
}

impl Center {
    /// Creates a new center point.
    #[must_use]
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Checks that both coordinates are finite and in range.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Latitude`] or
    /// [`ValidationError::Longitude`] for the first bad coordinate.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(ValidationError::Latitude(self.lat));
        }
        if !self.lon.is_finite() || !(-180.0..=180.0).contains(&self.lon) {
            return Err(ValidationError::Longitude(self.lon));
        }
        Ok(())
    }
}

/// A reference polygon belonging to a constraint layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintPolygon {
    /// Layer the polygon belongs to.
    pub layer: ConstraintLayer,
    /// Feature name from the source collection, if any.
    pub name: Option<String>,
    /// `GeoJSON` `Polygon` geometry object in the source CRS.
    pub geometry: serde_json::Value,
}

/// An enriched parcel row as stored in `get_good_parcels`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelRow {
    /// Surrogate key generated at population time.
    pub id: Uuid,
    /// Parcel area rounded to 2 decimals.
    pub parcel_area: f64,
    /// Free area rounded to 2 decimals.
    pub free_area: f64,
    /// Free area as a percentage of parcel area, rounded to 2 decimals.
    pub free_pct: f64,
    /// Pre-serialized `GeoJSON` geometry in WGS84.
    pub geometry: serde_json::Value,
    /// Constraint flags computed at population time.
    pub flags: ConstraintFlags,
}

/// A parcel as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelItem {
    /// Parcel identifier.
    pub id: Uuid,
    /// Parcel area in square meters.
    pub parcelarea: f64,
    /// Free area in square meters.
    pub freearea: f64,
    /// Free area percentage.
    pub free_pct: f64,
    /// `GeoJSON` geometry (WGS84).
    pub geometry: serde_json::Value,
    /// Whether the parcel intersects the green belt.
    #[serde(rename = "isInGreenBelt")]
    pub is_in_green_belt: bool,
    /// Whether the parcel intersects a built-up area.
    #[serde(rename = "isInBuiltUpArea")]
    pub is_in_built_up_area: bool,
    /// Whether the parcel intersects a conservation area.
    #[serde(rename = "isInConservationArea")]
    pub is_in_conservation_area: bool,
}

impl From<ParcelRow> for ParcelItem {
    fn from(row: ParcelRow) -> Self {
        Self {
            id: row.id,
            parcelarea: row.parcel_area,
            freearea: row.free_area,
            free_pct: row.free_pct,
            geometry: row.geometry,
            is_in_green_belt: row.flags.green_belt,
            is_in_built_up_area: row.flags.built_up_area,
            is_in_conservation_area: row.flags.conservation_area,
        }
    }
}

/// Result of a radius or ID-set parcel query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Echoed search center (absent for ID-set queries).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub center: Option<Center>,
    /// Echoed search radius in meters (absent for ID-set queries).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius_m: Option<f64>,
    /// Number of parcels returned. Always equals `parcels.len()`.
    pub count: usize,
    /// Matching parcels.
    pub parcels: Vec<ParcelItem>,
}

impl QueryResult {
    /// Builds a radius query result from matched rows.
    #[must_use]
    pub fn radius(center: Center, radius_m: f64, rows: Vec<ParcelRow>) -> Self {
        let parcels: Vec<ParcelItem> = rows.into_iter().map(ParcelItem::from).collect();
        Self {
            center: Some(center),
            radius_m: Some(radius_m),
            count: parcels.len(),
            parcels,
        }
    }

    /// Builds an ID-set query result from matched rows.
    #[must_use]
    pub fn ids(rows: Vec<ParcelRow>) -> Self {
        let parcels: Vec<ParcelItem> = rows.into_iter().map(ParcelItem::from).collect();
        Self {
            center: None,
            radius_m: None,
            count: parcels.len(),
            parcels,
        }
    }

    /// An ID-set result with no parcels.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            center: None,
            radius_m: None,
            count: 0,
            parcels: Vec::new(),
        }
    }
}
