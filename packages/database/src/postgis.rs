//! `PostGIS` implementation of [`ParcelStore`].
//!
//! Statements are assembled from the configured table and column names
//! (validated identifiers, always quoted) and the transform crate's SQL
//! builders; values travel as `$n` parameters.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use moosicbox_json_utils::database::ToValue as _;
use plot_finder_config::StoreConfig;
use plot_finder_parcel_models::{
    Center, ConstraintFlags, ConstraintLayer, ConstraintPolygon, KeyRange, ParcelRow,
};
use plot_finder_transform::crs::{geojson_expr, point_expr, reproject_expr};
use plot_finder_transform::numeric::{free_pct_expr, round2_expr};
use plot_finder_transform::sql::quote_ident;
use plot_finder_transform::Srid;
use switchy_database::{Database, DatabaseValue};
use uuid::Uuid;

use crate::store::ParcelStore;
use crate::{DbError, PG_MAX_PARAMS};

/// Columns selected for every enriched parcel read.
const PARCEL_COLUMNS: &str = "p.id::text AS id,
        p.\"parcelArea\"::float8 AS parcel_area,
        p.\"freeArea\"::float8 AS free_area,
        p.free_pct::float8 AS free_pct,
        p.geometry_geojson::text AS geometry,
        p.\"isInGreenBelt\" AS green_belt,
        p.\"isInBuiltUpArea\" AS built_up_area,
        p.\"isInConservationArea\" AS conservation_area";

/// [`ParcelStore`] backed by a `PostGIS` database.
pub struct PostgisStore {
    db: Arc<dyn Database>,
    config: StoreConfig,
}

impl PostgisStore {
    /// Wraps a database connection. `config` must already be validated
    /// (see `plot_finder_config::AppConfig::load`).
    #[must_use]
    pub fn new(db: Arc<dyn Database>, config: StoreConfig) -> Self {
        Self { db, config }
    }

    /// Connects to `DATABASE_URL` (see [`crate::db::connect_from_env`]).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Unavailable`] if the connection fails.
    pub async fn connect_from_env(config: StoreConfig) -> Result<Self, DbError> {
        let db = crate::db::connect_from_env().await?;
        Ok(Self::new(Arc::from(db), config))
    }

    async fn count(&self, sql: &str, params: &[DatabaseValue]) -> Result<u64, DbError> {
        let rows = self.db.query_raw_params(sql, params).await?;
        let count: i64 = rows.first().map_or(Ok(0), |r| {
            r.to_value("count").map_err(|e| DbError::Conversion {
                message: format!("Failed to parse count: {e}"),
            })
        })?;

        u64::try_from(count).map_err(|_| DbError::Conversion {
            message: format!("Negative count {count}"),
        })
    }
}

#[async_trait]
impl ParcelStore for PostgisStore {
    async fn ensure_constraint_table(&self) -> Result<(), DbError> {
        self.db
            .exec_raw(&create_constraint_table_sql(&self.config))
            .await?;
        Ok(())
    }

    async fn count_constraints(&self, layer: ConstraintLayer) -> Result<u64, DbError> {
        let sql = format!(
            "SELECT COUNT(*)::bigint AS count FROM {} WHERE layer = $1",
            quote_ident(&self.config.constraint_table)
        );
        self.count(&sql, &[DatabaseValue::String(layer.as_ref().to_string())])
            .await
    }

    async fn insert_constraints(
        &self,
        layer: ConstraintLayer,
        srid: Srid,
        polygons: &[ConstraintPolygon],
    ) -> Result<u64, DbError> {
        if polygons.is_empty() {
            return Ok(0);
        }

        // The whole collection travels as one JSON array parameter so the
        // insert is a single atomic statement regardless of polygon count.
        let features: Vec<serde_json::Value> = polygons
            .iter()
            .map(|p| serde_json::json!({ "name": p.name, "geometry": p.geometry }))
            .collect();
        let payload = serde_json::to_string(&features).map_err(|e| DbError::Conversion {
            message: format!("Failed to serialize {layer} polygons: {e}"),
        })?;

        let inserted = self
            .db
            .exec_raw_params(
                &insert_constraints_sql(&self.config, srid),
                &[
                    DatabaseValue::String(layer.as_ref().to_string()),
                    DatabaseValue::String(payload),
                ],
            )
            .await?;

        Ok(inserted)
    }

    async fn index_constraints(&self) -> Result<(), DbError> {
        let table = &self.config.constraint_table;
        self.db
            .exec_raw(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} USING GIST (geometry)",
                quote_ident(&format!("{table}_geometry_idx")),
                quote_ident(table),
            ))
            .await?;
        self.db
            .exec_raw(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (layer)",
                quote_ident(&format!("{table}_layer_idx")),
                quote_ident(table),
            ))
            .await?;
        self.db
            .exec_raw(&format!("ANALYZE {}", quote_ident(table)))
            .await?;
        Ok(())
    }

    async fn recreate_parcel_table(&self) -> Result<(), DbError> {
        self.db
            .exec_raw(&format!(
                "DROP TABLE IF EXISTS {}",
                quote_ident(&self.config.target_table)
            ))
            .await?;
        self.db
            .exec_raw(&create_parcel_table_sql(&self.config))
            .await?;
        Ok(())
    }

    async fn count_source_rows(&self) -> Result<u64, DbError> {
        let sql = format!(
            "SELECT COUNT(*)::bigint AS count FROM {}",
            quote_ident(&self.config.source_table)
        );
        self.count(&sql, &[]).await
    }

    async fn source_key_span(&self) -> Result<Option<KeyRange>, DbError> {
        let key = quote_ident(&self.config.source_key);
        let sql = format!(
            "SELECT MIN({key})::bigint AS min_key, MAX({key})::bigint AS max_key FROM {}",
            quote_ident(&self.config.source_table)
        );
        let rows = self.db.query_raw_params(&sql, &[]).await?;

        rows.first().map_or(Ok(None), key_span_from_row)
    }

    async fn populate_batch(
        &self,
        range: KeyRange,
        layers: &[ConstraintLayer],
    ) -> Result<u64, DbError> {
        let inserted = self
            .db
            .exec_raw_params(
                &populate_batch_sql(&self.config, layers),
                &[
                    DatabaseValue::Int64(range.start),
                    DatabaseValue::Int64(range.end),
                ],
            )
            .await?;
        Ok(inserted)
    }

    async fn index_parcel_table(&self) -> Result<(), DbError> {
        let table = &self.config.target_table;
        self.db
            .exec_raw(&format!(
                "CREATE INDEX {} ON {} USING GIST (geometry)",
                quote_ident(&format!("{table}_geometry_idx")),
                quote_ident(table),
            ))
            .await?;
        self.db
            .exec_raw(&format!("ANALYZE {}", quote_ident(table)))
            .await?;
        Ok(())
    }

    async fn count_parcels(&self) -> Result<u64, DbError> {
        let sql = format!(
            "SELECT COUNT(*)::bigint AS count FROM {}",
            quote_ident(&self.config.target_table)
        );
        self.count(&sql, &[]).await
    }

    async fn parcels_within(
        &self,
        center: Center,
        radius_m: f64,
        limit: Option<u32>,
    ) -> Result<Vec<ParcelRow>, DbError> {
        let mut params = vec![
            DatabaseValue::Real64(center.lon),
            DatabaseValue::Real64(center.lat),
            DatabaseValue::Real64(radius_m),
        ];
        if let Some(limit) = limit {
            params.push(DatabaseValue::Int64(i64::from(limit)));
        }

        let rows = self
            .db
            .query_raw_params(&radius_sql(&self.config, limit.is_some()), &params)
            .await?;

        rows.iter().map(parcel_from_row).collect()
    }

    async fn parcels_by_ids(&self, ids: &[Uuid]) -> Result<Vec<ParcelRow>, DbError> {
        let mut parcels = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(PG_MAX_PARAMS) {
            let params: Vec<DatabaseValue> = chunk
                .iter()
                .map(|id| DatabaseValue::String(id.to_string()))
                .collect();
            let rows = self
                .db
                .query_raw_params(&ids_sql(&self.config, chunk.len()), &params)
                .await?;
            for row in &rows {
                parcels.push(parcel_from_row(row)?);
            }
        }

        // Chunks are individually ordered; keep the whole result ordered.
        parcels.sort_by_key(|p| p.id);
        Ok(parcels)
    }
}

fn create_constraint_table_sql(config: &StoreConfig) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id BIGSERIAL PRIMARY KEY,
            layer TEXT NOT NULL,
            name TEXT,
            geometry geometry(Geometry, {}) NOT NULL
        )",
        quote_ident(&config.constraint_table),
        config.native_srid,
    )
}

fn insert_constraints_sql(config: &StoreConfig, srid: Srid) -> String {
    format!(
        "INSERT INTO {} (layer, name, geometry)
         SELECT $1, f->>'name', {}
         FROM json_array_elements($2::text::json) AS f",
        quote_ident(&config.constraint_table),
        reproject_expr(
            "ST_GeomFromGeoJSON(f->>'geometry')",
            srid,
            config.native_srid()
        ),
    )
}

fn create_parcel_table_sql(config: &StoreConfig) -> String {
    format!(
        "CREATE TABLE {} (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            \"parcelArea\" NUMERIC NOT NULL DEFAULT 0,
            \"freeArea\" NUMERIC NOT NULL DEFAULT 0,
            free_pct NUMERIC NOT NULL DEFAULT 0,
            geometry geometry(Geometry, {}),
            geometry_geojson JSONB,
            \"isInGreenBelt\" BOOLEAN NOT NULL DEFAULT false,
            \"isInBuiltUpArea\" BOOLEAN NOT NULL DEFAULT false,
            \"isInConservationArea\" BOOLEAN NOT NULL DEFAULT false
        )",
        quote_ident(&config.target_table),
        config.native_srid,
    )
}

/// `INSERT ... SELECT` transforming one key range of the source table.
///
/// Geometry is reprojected once into the native CRS (lateral `g.native`)
/// and both stored columns plus every flag derive from it.
fn populate_batch_sql(config: &StoreConfig, layers: &[ConstraintLayer]) -> String {
    let parcel_area = format!("src.{}", quote_ident(&config.source_parcel_area));
    let free_area = format!("src.{}", quote_ident(&config.source_free_area));
    let source_geometry = format!("src.{}", quote_ident(&config.source_geometry));
    let key = format!("src.{}", quote_ident(&config.source_key));

    let flags: Vec<String> = ConstraintLayer::all()
        .iter()
        .map(|layer| {
            if layers.contains(layer) {
                format!(
                    "EXISTS (SELECT 1 FROM {} c WHERE c.layer = '{}' \
                     AND ST_Intersects(c.geometry, g.native))",
                    quote_ident(&config.constraint_table),
                    layer.as_ref(),
                )
            } else {
                "false".to_string()
            }
        })
        .collect();

    let flag_columns: Vec<String> = ConstraintLayer::all()
        .iter()
        .map(|layer| quote_ident(layer.flag_column()))
        .collect();

    format!(
        "INSERT INTO {target} (
            \"parcelArea\", \"freeArea\", free_pct, geometry, geometry_geojson, {flag_columns}
        )
        SELECT
            {parcel_round},
            {free_round},
            {free_pct},
            g.native,
            {geojson},
            {flags}
        FROM {source} src
        CROSS JOIN LATERAL (SELECT {native} AS native) g
        WHERE {key} >= $1::bigint AND {key} < $2::bigint",
        target = quote_ident(&config.target_table),
        flag_columns = flag_columns.join(", "),
        parcel_round = round2_expr(&parcel_area),
        free_round = round2_expr(&free_area),
        free_pct = free_pct_expr(&parcel_area, &free_area),
        geojson = geojson_expr("g.native", config.native_srid(), config.interchange_srid()),
        flags = flags.join(",\n            "),
        source = quote_ident(&config.source_table),
        native = reproject_expr(&source_geometry, config.source_srid(), config.native_srid()),
    )
}

fn radius_sql(config: &StoreConfig, with_limit: bool) -> String {
    let mut sql = format!(
        "SELECT {PARCEL_COLUMNS}
         FROM {} p, (SELECT {} AS pt) q
         WHERE ST_DWithin(p.geometry, q.pt, $3)
         ORDER BY ST_Distance(p.geometry, q.pt), p.id",
        quote_ident(&config.target_table),
        point_expr("$1", "$2", config.interchange_srid(), config.native_srid()),
    );
    if with_limit {
        sql.push_str("\n         LIMIT $4");
    }
    sql
}

fn ids_sql(config: &StoreConfig, count: usize) -> String {
    let mut sql = format!(
        "SELECT {PARCEL_COLUMNS}
         FROM {} p
         WHERE p.id IN (",
        quote_ident(&config.target_table),
    );
    for i in 1..=count {
        if i > 1 {
            sql.push_str(", ");
        }
        write!(sql, "${i}::text::uuid").unwrap_or_default();
    }
    sql.push_str(")\n         ORDER BY p.id");
    sql
}

/// Reads the `min_key`/`max_key` row of a span query. Both NULL means the
/// source table is empty.
fn key_span_from_row(row: &switchy_database::Row) -> Result<Option<KeyRange>, DbError> {
    let min_key: Option<i64> = row
        .to_value("min_key")
        .map_err(|e| decode_error("min_key", e))?;
    let max_key: Option<i64> = row
        .to_value("max_key")
        .map_err(|e| decode_error("max_key", e))?;

    match (min_key, max_key) {
        (Some(min), Some(max)) => {
            let end = max.checked_add(1).ok_or_else(|| DbError::Conversion {
                message: format!("Source key {max} overflows the batch span"),
            })?;
            Ok(Some(KeyRange::new(min, end)))
        }
        (None, None) => Ok(None),
        (min, max) => Err(DbError::Conversion {
            message: format!("Inconsistent source key span: min {min:?}, max {max:?}"),
        }),
    }
}

fn parcel_from_row(row: &switchy_database::Row) -> Result<ParcelRow, DbError> {
    let id: String = row.to_value("id").map_err(|e| decode_error("id", e))?;
    let id = Uuid::parse_str(&id).map_err(|e| DbError::Conversion {
        message: format!("Invalid parcel id {id:?}: {e}"),
    })?;

    let geometry: Option<String> = row
        .to_value("geometry")
        .map_err(|e| decode_error("geometry", e))?;
    let geometry = geometry.map_or(Ok(serde_json::Value::Null), |g| {
        serde_json::from_str(&g).map_err(|e| DbError::Conversion {
            message: format!("Invalid GeoJSON for parcel {id}: {e}"),
        })
    })?;

    Ok(ParcelRow {
        id,
        parcel_area: row
            .to_value("parcel_area")
            .map_err(|e| decode_error("parcel_area", e))?,
        free_area: row
            .to_value("free_area")
            .map_err(|e| decode_error("free_area", e))?,
        free_pct: row
            .to_value("free_pct")
            .map_err(|e| decode_error("free_pct", e))?,
        geometry,
        flags: ConstraintFlags {
            green_belt: row
                .to_value("green_belt")
                .map_err(|e| decode_error("green_belt", e))?,
            built_up_area: row
                .to_value("built_up_area")
                .map_err(|e| decode_error("built_up_area", e))?,
            conservation_area: row
                .to_value("conservation_area")
                .map_err(|e| decode_error("conservation_area", e))?,
        },
    })
}

fn decode_error(column: &str, e: impl std::fmt::Display) -> DbError {
    DbError::Conversion {
        message: format!("Failed to read column {column}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StoreConfig {
        StoreConfig::default()
    }

    #[test]
    fn batch_sql_reprojects_once_and_filters_by_range() {
        let sql = populate_batch_sql(&config(), &[ConstraintLayer::ConservationArea]);

        assert!(sql.contains("INSERT INTO \"get_good_parcels\""));
        assert!(sql.contains("FROM \"good_parcels\" src"));
        assert!(sql.contains("(SELECT ST_SetSRID(src.\"geometry\", 27700) AS native) g"));
        assert!(sql.contains("ST_AsGeoJSON(ST_Transform(g.native, 4326))::jsonb"));
        assert!(sql.contains(
            "WHERE src.\"parcel_idx\" >= $1::bigint AND src.\"parcel_idx\" < $2::bigint"
        ));
    }

    #[test]
    fn batch_sql_only_tags_loaded_layers() {
        let sql = populate_batch_sql(&config(), &[ConstraintLayer::ConservationArea]);

        assert!(sql.contains(
            "EXISTS (SELECT 1 FROM \"constraint_polygons\" c WHERE c.layer = 'CONSERVATION_AREA'"
        ));
        assert!(!sql.contains("'GREEN_BELT'"));
        assert!(!sql.contains("'BUILT_UP_AREA'"));
        assert_eq!(sql.matches("false").count(), 2);
    }

    #[test]
    fn batch_sql_rounds_and_guards_division() {
        let sql = populate_batch_sql(&config(), &[]);
        assert!(sql.contains("ROUND((src.\"parcelarea\")::numeric, 2)"));
        assert!(sql.contains("NULLIF((src.\"parcelarea\")::float8, 0)"));
    }

    #[test]
    fn radius_sql_projects_center_into_native_crs() {
        let sql = radius_sql(&config(), false);
        assert!(sql.contains("ST_Transform(ST_SetSRID(ST_MakePoint($1, $2), 4326), 27700)"));
        assert!(sql.contains("ST_DWithin(p.geometry, q.pt, $3)"));
        assert!(!sql.contains("LIMIT"));
        assert!(radius_sql(&config(), true).ends_with("LIMIT $4"));
    }

    #[test]
    fn ids_sql_has_one_placeholder_per_id() {
        let sql = ids_sql(&config(), 3);
        assert!(sql.contains("p.id IN ($1::text::uuid, $2::text::uuid, $3::text::uuid)"));
        assert!(sql.ends_with("ORDER BY p.id"));
    }

    #[test]
    fn constraint_insert_is_one_statement_over_json_array() {
        let sql = insert_constraints_sql(&config(), Srid::WGS84);
        assert!(sql.contains("json_array_elements($2::text::json)"));
        assert!(sql.contains(
            "ST_Transform(ST_SetSRID(ST_GeomFromGeoJSON(f->>'geometry'), 4326), 27700)"
        ));
    }

    #[test]
    fn parcel_table_uses_native_srid_and_uuid_key() {
        let sql = create_parcel_table_sql(&config());
        assert!(sql.contains("id UUID PRIMARY KEY DEFAULT gen_random_uuid()"));
        assert!(sql.contains("geometry geometry(Geometry, 27700)"));
        assert!(sql.contains("\"isInConservationArea\" BOOLEAN NOT NULL DEFAULT false"));
        assert!(create_constraint_table_sql(&config()).contains("IF NOT EXISTS"));
    }

    fn row(columns: Vec<(&str, DatabaseValue)>) -> switchy_database::Row {
        switchy_database::Row {
            columns: columns
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        }
    }

    fn parcel_columns(conservation_area: DatabaseValue) -> Vec<(&'static str, DatabaseValue)> {
        vec![
            ("id", DatabaseValue::String(Uuid::nil().to_string())),
            ("parcel_area", DatabaseValue::Real64(100.0)),
            ("free_area", DatabaseValue::Real64(40.5)),
            ("free_pct", DatabaseValue::Real64(40.5)),
            (
                "geometry",
                DatabaseValue::String(r#"{"type":"Point","coordinates":[0.0,0.0]}"#.to_string()),
            ),
            ("green_belt", DatabaseValue::Bool(false)),
            ("built_up_area", DatabaseValue::Bool(true)),
            ("conservation_area", conservation_area),
        ]
    }

    #[test]
    fn parcel_row_decodes_every_column() {
        let parcel = parcel_from_row(&row(parcel_columns(DatabaseValue::Bool(true)))).unwrap();
        assert_eq!(parcel.id, Uuid::nil());
        assert!((parcel.free_pct - 40.5).abs() < f64::EPSILON);
        assert!(parcel.flags.built_up_area);
        assert!(parcel.flags.conservation_area);
        assert_eq!(parcel.geometry["type"], serde_json::json!("Point"));
    }

    #[test]
    fn undecodable_flag_is_a_conversion_error() {
        let bad = row(parcel_columns(DatabaseValue::String("maybe".to_string())));
        assert!(matches!(
            parcel_from_row(&bad),
            Err(DbError::Conversion { .. })
        ));

        let mut missing = parcel_columns(DatabaseValue::Bool(true));
        missing.retain(|(name, _)| *name != "free_pct");
        assert!(matches!(
            parcel_from_row(&row(missing)),
            Err(DbError::Conversion { .. })
        ));
    }

    #[test]
    fn key_span_distinguishes_empty_source_from_bad_values() {
        let empty = row(vec![
            ("min_key", DatabaseValue::Null),
            ("max_key", DatabaseValue::Null),
        ]);
        assert_eq!(key_span_from_row(&empty).unwrap(), None);

        let span = row(vec![
            ("min_key", DatabaseValue::Int64(5)),
            ("max_key", DatabaseValue::Int64(99_999)),
        ]);
        assert_eq!(
            key_span_from_row(&span).unwrap(),
            Some(KeyRange::new(5, 100_000))
        );

        let garbled = row(vec![
            ("min_key", DatabaseValue::String("five".to_string())),
            ("max_key", DatabaseValue::Int64(10)),
        ]);
        assert!(matches!(
            key_span_from_row(&garbled),
            Err(DbError::Conversion { .. })
        ));

        let overflow = row(vec![
            ("min_key", DatabaseValue::Int64(0)),
            ("max_key", DatabaseValue::Int64(i64::MAX)),
        ]);
        assert!(key_span_from_row(&overflow).is_err());
    }
}
