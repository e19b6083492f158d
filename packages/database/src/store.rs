//! The parcel store seam.
//!
//! [`ParcelStore`] names every round trip the constraint loader, population
//! pipeline, and query engine make to the geometry engine. Each method is
//! one statement (or one short sequence of DDL statements); implementations
//! must not hold a connection between calls.

use async_trait::async_trait;
use plot_finder_parcel_models::{Center, ConstraintLayer, ConstraintPolygon, KeyRange, ParcelRow};
use plot_finder_transform::Srid;
use uuid::Uuid;

use crate::DbError;

/// Storage operations backing constraint loading, population, and queries.
#[async_trait]
pub trait ParcelStore: Send + Sync {
    /// Creates the constraint polygon table if it does not exist.
    async fn ensure_constraint_table(&self) -> Result<(), DbError>;

    /// Number of stored polygons for `layer`.
    async fn count_constraints(&self, layer: ConstraintLayer) -> Result<u64, DbError>;

    /// Inserts every polygon of a layer in a single statement, reprojecting
    /// from `srid` into the native CRS. Either all polygons are stored or
    /// none are.
    async fn insert_constraints(
        &self,
        layer: ConstraintLayer,
        srid: Srid,
        polygons: &[ConstraintPolygon],
    ) -> Result<u64, DbError>;

    /// Builds the spatial index over the constraint table (idempotent).
    async fn index_constraints(&self) -> Result<(), DbError>;

    /// Drops the enriched parcel table if present and recreates it empty.
    async fn recreate_parcel_table(&self) -> Result<(), DbError>;

    /// Number of raw source parcels.
    async fn count_source_rows(&self) -> Result<u64, DbError>;

    /// Half-open span `[min(key), max(key) + 1)` of source keys, or `None`
    /// if the source table is empty.
    async fn source_key_span(&self) -> Result<Option<KeyRange>, DbError>;

    /// Transforms and inserts the source rows whose key falls in `range`,
    /// tagging each against the constraint layers in `layers` (flags for
    /// other layers are `false`). Returns the number of inserted rows.
    async fn populate_batch(
        &self,
        range: KeyRange,
        layers: &[ConstraintLayer],
    ) -> Result<u64, DbError>;

    /// Builds the spatial index over the enriched parcel table.
    async fn index_parcel_table(&self) -> Result<(), DbError>;

    /// Number of enriched parcels.
    async fn count_parcels(&self) -> Result<u64, DbError>;

    /// Enriched parcels within `radius_m` meters of `center`, nearest first.
    async fn parcels_within(
        &self,
        center: Center,
        radius_m: f64,
        limit: Option<u32>,
    ) -> Result<Vec<ParcelRow>, DbError>;

    /// Enriched parcels whose id is in `ids`, ordered by id. `ids` must be
    /// free of duplicates.
    async fn parcels_by_ids(&self, ids: &[Uuid]) -> Result<Vec<ParcelRow>, DbError>;
}
