#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Read-only parcel queries over the enriched parcel table.
//!
//! Radius queries are answered against the indexed native-CRS geometry and
//! return the `GeoJSON` written at population time, so no row is
//! reprojected at query time. Queries may run concurrently with each other
//! and with a rebuild; during a rebuild they see whatever rows have been
//! inserted so far.

use std::collections::BTreeSet;

use plot_finder_database::{DbError, ParcelStore};
use plot_finder_parcel_models::{Center, QueryResult, ValidationError};
use thiserror::Error;
use uuid::Uuid;

/// Radius used for sample lookups: two statute miles in meters.
pub const TWO_MILES_METERS: f64 = 2.0 * 1_609.344;

/// Errors that can occur while answering a query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// A query parameter was rejected before reaching the store.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The store failed.
    #[error("Store error: {0}")]
    Store(#[from] DbError),
}

impl QueryError {
    /// Whether the failure came from an unreachable store.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }
}

/// A radius search around a WGS84 point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadiusQuery {
    /// Search center.
    pub center: Center,
    /// Search radius in meters.
    pub radius_m: f64,
    /// Maximum number of parcels to return, nearest first.
    pub limit: Option<u32>,
}

impl RadiusQuery {
    /// An unlimited radius query.
    #[must_use]
    pub const fn new(lat: f64, lon: f64, radius_m: f64) -> Self {
        Self {
            center: Center::new(lat, lon),
            radius_m,
            limit: None,
        }
    }

    /// Caps the number of returned parcels.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Checks the center, radius, and limit.
    ///
    /// # Errors
    ///
    /// Returns the [`ValidationError`] for the first bad parameter.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.center.validate()?;
        if !self.radius_m.is_finite() || self.radius_m <= 0.0 {
            return Err(ValidationError::Radius(self.radius_m));
        }
        if self.limit == Some(0) {
            return Err(ValidationError::Limit);
        }
        Ok(())
    }
}

/// Parcels whose geometry lies within the query radius, nearest first.
///
/// # Errors
///
/// * [`QueryError::Validation`] if the query is out of domain
/// * [`QueryError::Store`] if the store fails
pub async fn query_by_radius(
    store: &dyn ParcelStore,
    query: RadiusQuery,
) -> Result<QueryResult, QueryError> {
    query.validate()?;

    let rows = store
        .parcels_within(query.center, query.radius_m, query.limit)
        .await?;

    log::debug!(
        "Radius query ({}, {}) r={}m returned {} parcels",
        query.center.lat,
        query.center.lon,
        query.radius_m,
        rows.len()
    );

    Ok(QueryResult::radius(query.center, query.radius_m, rows))
}

/// Parcels with the given ids, ordered by id.
///
/// Duplicate ids collapse. An empty id set returns an empty result without
/// touching the store.
///
/// # Errors
///
/// Returns [`QueryError::Store`] if the store fails.
pub async fn query_by_ids(
    store: &dyn ParcelStore,
    ids: &[Uuid],
) -> Result<QueryResult, QueryError> {
    let unique: Vec<Uuid> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    if unique.is_empty() {
        return Ok(QueryResult::empty());
    }

    let rows = store.parcels_by_ids(&unique).await?;

    log::debug!(
        "ID query for {} ids ({} unique) returned {} parcels",
        ids.len(),
        unique.len(),
        rows.len()
    );

    Ok(QueryResult::ids(rows))
}

/// Parcels within `radius_m` meters of (`lat`, `lon`).
///
/// # Errors
///
/// See [`query_by_radius`].
pub async fn get_good_parcels(
    store: &dyn ParcelStore,
    lat: f64,
    lon: f64,
    radius_m: f64,
) -> Result<QueryResult, QueryError> {
    query_by_radius(store, RadiusQuery::new(lat, lon, radius_m)).await
}

/// Parcels within two miles of (`lat`, `lon`).
///
/// # Errors
///
/// See [`query_by_radius`].
pub async fn get_sample_parcels(
    store: &dyn ParcelStore,
    lat: f64,
    lon: f64,
) -> Result<QueryResult, QueryError> {
    query_by_radius(store, RadiusQuery::new(lat, lon, TWO_MILES_METERS)).await
}

/// Parcels with the given ids.
///
/// # Errors
///
/// See [`query_by_ids`].
pub async fn get_parcels_by_ids(
    store: &dyn ParcelStore,
    ids: &[Uuid],
) -> Result<QueryResult, QueryError> {
    query_by_ids(store, ids).await
}

#[cfg(test)]
mod tests {
    use plot_finder_database::memory::{MemoryStore, SourceParcel};
    use plot_finder_parcel_models::KeyRange;

    use super::*;

    const LONDON: (f64, f64) = (51.5074, -0.1278);

    /// Parcels due north of central London every 0.01 degrees of latitude
    /// (roughly 1.1 km apart), key 0 at the center.
    async fn london_store() -> MemoryStore {
        let source = (0..10)
            .map(|k| {
                SourceParcel::square(k, LONDON.1, LONDON.0 + 0.01 * k as f64, 0.0001)
            })
            .collect();
        let store = MemoryStore::with_source(source);
        store.recreate_parcel_table().await.unwrap();
        store
            .populate_batch(KeyRange::new(0, 10), &[])
            .await
            .unwrap();
        store
    }

    fn first_lat(geometry: &serde_json::Value) -> f64 {
        geometry["coordinates"][0][0][1].as_f64().unwrap()
    }

    #[tokio::test]
    async fn five_km_around_london() {
        let store = london_store().await;
        let result = get_good_parcels(&store, LONDON.0, LONDON.1, 5_000.0)
            .await
            .unwrap();

        assert_eq!(result.radius_m, Some(5_000.0));
        assert_eq!(result.center, Some(Center::new(LONDON.0, LONDON.1)));
        // Offsets 0..=4 lie within ~4.45 km; offset 5 starts at ~5.55 km.
        assert_eq!(result.count, 5);
        assert_eq!(result.count, result.parcels.len());

        let lats: Vec<f64> = result.parcels.iter().map(|p| first_lat(&p.geometry)).collect();
        assert!(lats.windows(2).all(|w| w[0] < w[1]), "not nearest first: {lats:?}");
        assert!(lats.iter().all(|lat| (lat - LONDON.0) * 111_195.0 <= 5_000.0));
    }

    #[tokio::test]
    async fn sample_uses_two_miles() {
        let store = london_store().await;
        let result = get_sample_parcels(&store, LONDON.0, LONDON.1).await.unwrap();

        assert_eq!(result.radius_m, Some(TWO_MILES_METERS));
        assert!((TWO_MILES_METERS - 3_218.688).abs() < 1e-9);
        assert_eq!(result.count, 3);
    }

    #[tokio::test]
    async fn limit_keeps_the_nearest() {
        let store = london_store().await;
        let query = RadiusQuery::new(LONDON.0, LONDON.1, 5_000.0).with_limit(2);
        let result = query_by_radius(&store, query).await.unwrap();

        assert_eq!(result.count, 2);
        assert!(first_lat(&result.parcels[0].geometry) < first_lat(&result.parcels[1].geometry));
    }

    #[tokio::test]
    async fn bad_parameters_never_reach_the_store() {
        let store = MemoryStore::default();
        store.set_offline(true);

        for radius in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = get_good_parcels(&store, LONDON.0, LONDON.1, radius)
                .await
                .unwrap_err();
            assert!(matches!(err, QueryError::Validation(ValidationError::Radius(_))));
        }

        let err = get_good_parcels(&store, 91.0, 0.0, 100.0).await.unwrap_err();
        assert!(matches!(err, QueryError::Validation(ValidationError::Latitude(_))));

        let query = RadiusQuery::new(LONDON.0, LONDON.1, 100.0).with_limit(0);
        let err = query_by_radius(&store, query).await.unwrap_err();
        assert!(matches!(err, QueryError::Validation(ValidationError::Limit)));
    }

    #[tokio::test]
    async fn empty_ids_return_empty_without_store() {
        let store = MemoryStore::default();
        store.set_offline(true);

        let result = get_parcels_by_ids(&store, &[]).await.unwrap();
        assert_eq!(result, QueryResult::empty());
    }

    #[tokio::test]
    async fn ids_collapse_duplicates_and_are_stable() {
        let store = london_store().await;
        let all = get_good_parcels(&store, LONDON.0, LONDON.1, 50_000.0)
            .await
            .unwrap();
        let a = all.parcels[3].id;
        let b = all.parcels[7].id;

        let first = get_parcels_by_ids(&store, &[b, a, b, Uuid::new_v4()])
            .await
            .unwrap();
        let second = get_parcels_by_ids(&store, &[a, b]).await.unwrap();

        assert_eq!(first.count, 2);
        assert_eq!(first, second);
        assert!(first.parcels[0].id < first.parcels[1].id);
        assert_eq!(first.radius_m, None);
    }

    #[tokio::test]
    async fn unreachable_store_is_transient() {
        let store = MemoryStore::default();
        store.set_offline(true);
        let err = get_good_parcels(&store, LONDON.0, LONDON.1, 100.0)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
