//! In-memory [`ParcelStore`].
//!
//! Holds source parcels and constraint polygons in WGS84 and answers the
//! same operations as the `PostGIS` store with `geo` predicates over an
//! R-tree. Records batch calls and peak concurrency so callers can assert
//! on pipeline scheduling.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use geo::{BoundingRect as _, Contains as _, Intersects as _, LineString, Point, Polygon};
use plot_finder_parcel_models::{
    Center, ConstraintFlags, ConstraintLayer, ConstraintPolygon, KeyRange, ParcelRow,
};
use plot_finder_transform::geometry::{polygon_to_geojson, polygons_from_geojson};
use plot_finder_transform::{Srid, free_pct, round2};
use rstar::{AABB, RTree, RTreeObject};
use uuid::Uuid;

use crate::DbError;
use crate::store::ParcelStore;

/// Mean earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// A raw parcel as held in the source table.
#[derive(Debug, Clone)]
pub struct SourceParcel {
    /// Integer batching key.
    pub key: i64,
    /// Raw parcel area (may be missing).
    pub parcel_area: Option<f64>,
    /// Raw free area (may be missing).
    pub free_area: Option<f64>,
    /// Parcel footprint in lon/lat.
    pub geometry: Polygon<f64>,
}

impl SourceParcel {
    /// A square parcel of `half_side` degrees around (`lon`, `lat`).
    #[must_use]
    pub fn square(key: i64, lon: f64, lat: f64, half_side: f64) -> Self {
        Self {
            key,
            parcel_area: Some(100.0),
            free_area: Some(50.0),
            geometry: square(lon, lat, half_side),
        }
    }

    /// Replaces the raw area attributes.
    #[must_use]
    pub const fn with_areas(mut self, parcel_area: Option<f64>, free_area: Option<f64>) -> Self {
        self.parcel_area = parcel_area;
        self.free_area = free_area;
        self
    }
}

/// Axis-aligned square polygon centered on (`lon`, `lat`).
#[must_use]
pub fn square(lon: f64, lat: f64, half_side: f64) -> Polygon<f64> {
    Polygon::new(
        LineString::from(vec![
            (lon - half_side, lat - half_side),
            (lon + half_side, lat - half_side),
            (lon + half_side, lat + half_side),
            (lon - half_side, lat + half_side),
            (lon - half_side, lat - half_side),
        ]),
        vec![],
    )
}

struct ConstraintEntry {
    layer: ConstraintLayer,
    envelope: AABB<[f64; 2]>,
    polygon: Polygon<f64>,
}

impl RTreeObject for ConstraintEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

struct StoredParcel {
    row: ParcelRow,
    polygon: Polygon<f64>,
}

#[derive(Default)]
struct Inner {
    source: Vec<SourceParcel>,
    constraint_table_exists: bool,
    constraints: RTree<ConstraintEntry>,
    constraint_counts: BTreeMap<ConstraintLayer, u64>,
    constraints_indexed: bool,
    constraint_insert_calls: usize,
    parcels: Option<Vec<StoredParcel>>,
    parcels_indexed: bool,
    batch_log: Vec<KeyRange>,
    failing_batches: BTreeSet<i64>,
}

/// Decrements the in-flight counter when a batch finishes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A [`ParcelStore`] held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryStore {
    /// Creates a store whose source table holds `source`.
    #[must_use]
    pub fn with_source(source: Vec<SourceParcel>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                source,
                ..Inner::default()
            }),
            ..Self::default()
        }
    }

    /// Makes the batch starting at `start` fail with [`DbError::Unavailable`].
    pub fn fail_batch_at(&self, start: i64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing_batches.insert(start);
        }
    }

    /// While offline every operation fails with [`DbError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Ranges passed to `populate_batch`, in call order.
    #[must_use]
    pub fn batch_log(&self) -> Vec<KeyRange> {
        self.inner
            .lock()
            .map(|inner| inner.batch_log.clone())
            .unwrap_or_default()
    }

    /// Highest number of concurrently running batches observed.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of `insert_constraints` calls that stored polygons.
    #[must_use]
    pub fn constraint_insert_calls(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.constraint_insert_calls)
            .unwrap_or_default()
    }

    /// Whether the constraint table has been indexed.
    #[must_use]
    pub fn constraints_indexed(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.constraints_indexed)
            .unwrap_or_default()
    }

    /// Whether the parcel table has been indexed since it was recreated.
    #[must_use]
    pub fn parcels_indexed(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.parcels_indexed)
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, DbError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable {
                message: "memory store is offline".to_string(),
            });
        }
        self.inner.lock().map_err(|e| DbError::Unavailable {
            message: format!("memory store lock poisoned: {e}"),
        })
    }
}

fn missing_table(name: &str) -> DbError {
    DbError::Conversion {
        message: format!("relation \"{name}\" does not exist"),
    }
}

fn envelope_of(polygon: &Polygon<f64>) -> AABB<[f64; 2]> {
    polygon.bounding_rect().map_or_else(
        || AABB::from_point([0.0, 0.0]),
        |rect| AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
    )
}

/// Distance in meters from `center` to `polygon`, zero when inside.
///
/// Uses a local equirectangular projection around the center, which is
/// accurate to well under a meter at parcel-query radii.
fn distance_m(center: Center, polygon: &Polygon<f64>) -> f64 {
    if polygon.contains(&Point::new(center.lon, center.lat)) {
        return 0.0;
    }

    let scale_y = EARTH_RADIUS_M.to_radians();
    let scale_x = scale_y * center.lat.to_radians().cos();
    let project = |c: geo::Coord<f64>| ((c.x - center.lon) * scale_x, (c.y - center.lat) * scale_y);

    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .flat_map(|ring| ring.lines())
        .map(|line| segment_distance(project(line.start), project(line.end)))
        .fold(f64::INFINITY, f64::min)
}

/// Distance from the origin to the segment `a`-`b`.
fn segment_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len_sq = dx.mul_add(dx, dy * dy);
    let t = if len_sq > 0.0 {
        (-(a.0.mul_add(dx, a.1 * dy)) / len_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let (px, py) = (t.mul_add(dx, a.0), t.mul_add(dy, a.1));
    px.hypot(py)
}

#[async_trait]
impl ParcelStore for MemoryStore {
    async fn ensure_constraint_table(&self) -> Result<(), DbError> {
        self.lock()?.constraint_table_exists = true;
        Ok(())
    }

    async fn count_constraints(&self, layer: ConstraintLayer) -> Result<u64, DbError> {
        let inner = self.lock()?;
        if !inner.constraint_table_exists {
            return Err(missing_table("constraint_polygons"));
        }
        Ok(inner.constraint_counts.get(&layer).copied().unwrap_or(0))
    }

    async fn insert_constraints(
        &self,
        layer: ConstraintLayer,
        srid: Srid,
        polygons: &[ConstraintPolygon],
    ) -> Result<u64, DbError> {
        if srid != Srid::WGS84 {
            return Err(DbError::Conversion {
                message: format!("memory store only holds {} geometry, got {srid}", Srid::WGS84),
            });
        }

        // Parse everything before touching state so a bad polygon stores nothing.
        let mut parsed = Vec::with_capacity(polygons.len());
        for polygon in polygons {
            let geometries =
                polygons_from_geojson(&polygon.geometry).map_err(|e| DbError::Conversion {
                    message: format!("Invalid {layer} polygon: {e}"),
                })?;
            parsed.extend(geometries);
        }

        let mut inner = self.lock()?;
        if !inner.constraint_table_exists {
            return Err(missing_table("constraint_polygons"));
        }
        if parsed.is_empty() {
            return Ok(0);
        }

        let inserted = parsed.len() as u64;
        for polygon in parsed {
            inner.constraints.insert(ConstraintEntry {
                layer,
                envelope: envelope_of(&polygon),
                polygon,
            });
        }
        *inner.constraint_counts.entry(layer).or_insert(0) += inserted;
        inner.constraint_insert_calls += 1;

        Ok(inserted)
    }

    async fn index_constraints(&self) -> Result<(), DbError> {
        self.lock()?.constraints_indexed = true;
        Ok(())
    }

    async fn recreate_parcel_table(&self) -> Result<(), DbError> {
        let mut inner = self.lock()?;
        inner.parcels = Some(Vec::new());
        inner.parcels_indexed = false;
        Ok(())
    }

    async fn count_source_rows(&self) -> Result<u64, DbError> {
        Ok(self.lock()?.source.len() as u64)
    }

    async fn source_key_span(&self) -> Result<Option<KeyRange>, DbError> {
        let inner = self.lock()?;
        let min = inner.source.iter().map(|p| p.key).min();
        let max = inner.source.iter().map(|p| p.key).max();

        match (min, max) {
            (Some(min), Some(max)) => Ok(Some(KeyRange::new(min, max + 1))),
            _ => Ok(None),
        }
    }

    async fn populate_batch(
        &self,
        range: KeyRange,
        layers: &[ConstraintLayer],
    ) -> Result<u64, DbError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        // Let sibling batches start before this one completes.
        tokio::task::yield_now().await;

        let mut inner = self.lock()?;
        inner.batch_log.push(range);

        if inner.failing_batches.contains(&range.start) {
            return Err(DbError::Unavailable {
                message: format!("batch {range} failed"),
            });
        }

        let mut rows = Vec::new();
        for source in inner.source.iter().filter(|p| range.contains(p.key)) {
            let envelope = envelope_of(&source.geometry);
            let mut flags = ConstraintFlags::default();
            for entry in inner.constraints.locate_in_envelope_intersecting(&envelope) {
                if layers.contains(&entry.layer) && entry.polygon.intersects(&source.geometry) {
                    flags.set(entry.layer, true);
                }
            }

            rows.push(StoredParcel {
                row: ParcelRow {
                    id: Uuid::new_v4(),
                    parcel_area: round2(source.parcel_area),
                    free_area: round2(source.free_area),
                    free_pct: free_pct(source.parcel_area, source.free_area),
                    geometry: polygon_to_geojson(&source.geometry),
                    flags,
                },
                polygon: source.geometry.clone(),
            });
        }

        let inserted = rows.len() as u64;
        inner
            .parcels
            .as_mut()
            .ok_or_else(|| missing_table("get_good_parcels"))?
            .extend(rows);

        Ok(inserted)
    }

    async fn index_parcel_table(&self) -> Result<(), DbError> {
        let mut inner = self.lock()?;
        if inner.parcels.is_none() {
            return Err(missing_table("get_good_parcels"));
        }
        inner.parcels_indexed = true;
        Ok(())
    }

    async fn count_parcels(&self) -> Result<u64, DbError> {
        let inner = self.lock()?;
        inner
            .parcels
            .as_ref()
            .map(|p| p.len() as u64)
            .ok_or_else(|| missing_table("get_good_parcels"))
    }

    async fn parcels_within(
        &self,
        center: Center,
        radius_m: f64,
        limit: Option<u32>,
    ) -> Result<Vec<ParcelRow>, DbError> {
        let inner = self.lock()?;
        let parcels = inner
            .parcels
            .as_ref()
            .ok_or_else(|| missing_table("get_good_parcels"))?;

        let mut matched: Vec<(f64, &ParcelRow)> = parcels
            .iter()
            .map(|p| (distance_m(center, &p.polygon), &p.row))
            .filter(|(distance, _)| *distance <= radius_m)
            .collect();
        matched.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

        if let Some(limit) = limit {
            matched.truncate(limit as usize);
        }

        Ok(matched.into_iter().map(|(_, row)| row.clone()).collect())
    }

    async fn parcels_by_ids(&self, ids: &[Uuid]) -> Result<Vec<ParcelRow>, DbError> {
        let inner = self.lock()?;
        let parcels = inner
            .parcels
            .as_ref()
            .ok_or_else(|| missing_table("get_good_parcels"))?;

        let wanted: BTreeSet<&Uuid> = ids.iter().collect();
        let mut rows: Vec<ParcelRow> = parcels
            .iter()
            .filter(|p| wanted.contains(&p.row.id))
            .map(|p| p.row.clone())
            .collect();
        rows.sort_by_key(|r| r.id);

        Ok(rows)
    }
}
