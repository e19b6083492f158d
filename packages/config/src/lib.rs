#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Configuration for the plot finder toolchain.
//!
//! Settings are read from a TOML file (`plot_finder.toml` by default, or the
//! path in `PLOT_FINDER_CONFIG`) and then overridden by individual
//! environment variables. A missing file is not an error: every setting has
//! a default matching the `good_parcels` / `get_good_parcels` layout.

use std::path::{Path, PathBuf};

use plot_finder_parcel_models::ConstraintLayer;
use plot_finder_transform::{Srid, sql::validate_identifier};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "plot_finder.toml";

/// Default location of the conservation area collection.
pub const DEFAULT_CONSERVATION_AREAS: &str = "data/conservation_areas.geojson";

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`AppConfig`].
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A setting has an unusable value.
    #[error("Invalid config value for {key}: {message}")]
    Invalid {
        /// Setting name.
        key: String,
        /// Why the value was rejected.
        message: String,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Table, column, and CRS layout of the store.
    pub store: StoreConfig,
    /// Population pipeline tuning.
    pub population: PopulationConfig,
    /// Constraint layer sources.
    pub constraints: Vec<ConstraintLayerConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            population: PopulationConfig::default(),
            constraints: vec![ConstraintLayerConfig {
                layer: ConstraintLayer::ConservationArea,
                location: DEFAULT_CONSERVATION_AREAS.to_string(),
                srid: Srid::WGS84.value(),
                required: true,
            }],
        }
    }
}

/// Table, column, and CRS layout of the parcel store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Raw parcel table (read-only).
    pub source_table: String,
    /// Integer key column of the raw parcel table.
    pub source_key: String,
    /// Geometry column of the raw parcel table.
    pub source_geometry: String,
    /// Parcel area column of the raw parcel table.
    pub source_parcel_area: String,
    /// Free area column of the raw parcel table.
    pub source_free_area: String,
    /// Enriched parcel table rebuilt by population.
    pub target_table: String,
    /// Constraint polygon table.
    pub constraint_table: String,
    /// SRID of raw parcel geometry.
    pub source_srid: i32,
    /// SRID of indexed geometry columns. Must be metric.
    pub native_srid: i32,
    /// SRID of request centers and serialized `GeoJSON`.
    pub interchange_srid: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            source_table: "good_parcels".to_string(),
            source_key: "parcel_idx".to_string(),
            source_geometry: "geometry".to_string(),
            source_parcel_area: "parcelarea".to_string(),
            source_free_area: "freearea".to_string(),
            target_table: "get_good_parcels".to_string(),
            constraint_table: "constraint_polygons".to_string(),
            source_srid: Srid::BRITISH_NATIONAL_GRID.value(),
            native_srid: Srid::BRITISH_NATIONAL_GRID.value(),
            interchange_srid: Srid::WGS84.value(),
        }
    }
}

impl StoreConfig {
    /// SRID of raw parcel geometry.
    #[must_use]
    pub const fn source_srid(&self) -> Srid {
        Srid(self.source_srid)
    }

    /// SRID of indexed geometry columns.
    #[must_use]
    pub const fn native_srid(&self) -> Srid {
        Srid(self.native_srid)
    }

    /// SRID of request centers and serialized `GeoJSON`.
    #[must_use]
    pub const fn interchange_srid(&self) -> Srid {
        Srid(self.interchange_srid)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let identifiers = [
            ("store.source_table", &self.source_table),
            ("store.source_key", &self.source_key),
            ("store.source_geometry", &self.source_geometry),
            ("store.source_parcel_area", &self.source_parcel_area),
            ("store.source_free_area", &self.source_free_area),
            ("store.target_table", &self.target_table),
            ("store.constraint_table", &self.constraint_table),
        ];
        for (key, value) in identifiers {
            validate_identifier(value).map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// How the population pipeline bounds the source key space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeilingStrategy {
    /// Batches cover `[min(key), max(key) + 1)`. Safe with sparse keys.
    #[default]
    KeyRange,
    /// Batches cover `[0, count(*))`. Only correct for dense keys from 0.
    RowCount,
}

/// Population pipeline tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PopulationConfig {
    /// Source keys per batch.
    pub batch_size: u64,
    /// Batches launched together in one wave.
    pub concurrency: usize,
    /// Key space bounding strategy.
    pub ceiling: CeilingStrategy,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            concurrency: 2,
            ceiling: CeilingStrategy::KeyRange,
        }
    }
}

impl PopulationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "population.batch_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "population.concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Source of one constraint layer's polygon collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstraintLayerConfig {
    /// Layer the collection populates.
    pub layer: ConstraintLayer,
    /// File path or `http(s)://` URL of a `GeoJSON` `FeatureCollection`.
    pub location: String,
    /// SRID of the collection's coordinates.
    #[serde(default = "default_constraint_srid")]
    pub srid: i32,
    /// Whether population must fail if this layer cannot be loaded.
    #[serde(default)]
    pub required: bool,
}

impl ConstraintLayerConfig {
    /// SRID of the collection's coordinates.
    #[must_use]
    pub const fn srid(&self) -> Srid {
        Srid(self.srid)
    }
}

const fn default_constraint_srid() -> i32 {
    Srid::WGS84.value()
}

impl AppConfig {
    /// Loads configuration from `path`, `PLOT_FINDER_CONFIG`, or
    /// [`DEFAULT_CONFIG_PATH`], then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or
    /// parsed, or if any resulting value is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(
            || {
                std::env::var("PLOT_FINDER_CONFIG")
                    .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
            },
            Path::to_path_buf,
        );

        let mut config = if path.exists() {
            log::info!("Loading config from {}", path.display());
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            Self::from_toml(&text)?
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Parses configuration from TOML text without applying overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the text is not valid configuration.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides from a variable lookup (the process environment in
    /// [`Self::load`]).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a numeric override does not parse.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup("PLOT_FINDER_BATCH_SIZE") {
            self.population.batch_size = parse_override("PLOT_FINDER_BATCH_SIZE", &value)?;
        }
        if let Some(value) = lookup("PLOT_FINDER_CONCURRENCY") {
            self.population.concurrency = parse_override("PLOT_FINDER_CONCURRENCY", &value)?;
        }

        let layer_vars = [
            ("PLOT_FINDER_CONSERVATION_AREAS", ConstraintLayer::ConservationArea),
            ("PLOT_FINDER_GREEN_BELT", ConstraintLayer::GreenBelt),
            ("PLOT_FINDER_BUILT_UP_AREAS", ConstraintLayer::BuiltUpArea),
        ];
        for (var, layer) in layer_vars {
            if let Some(location) = lookup(var) {
                self.set_layer_location(layer, location);
            }
        }

        Ok(())
    }

    fn set_layer_location(&mut self, layer: ConstraintLayer, location: String) {
        if let Some(existing) = self.constraints.iter_mut().find(|c| c.layer == layer) {
            existing.location = location;
        } else {
            self.constraints.push(ConstraintLayerConfig {
                layer,
                location,
                srid: default_constraint_srid(),
                required: layer == ConstraintLayer::ConservationArea,
            });
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        self.population.validate()?;

        for (i, layer) in self.constraints.iter().enumerate() {
            if self.constraints[..i].iter().any(|c| c.layer == layer.layer) {
                return Err(ConfigError::Invalid {
                    key: "constraints".to_string(),
                    message: format!("layer {} configured more than once", layer.layer),
                });
            }
            if layer.location.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    key: format!("constraints.{}.location", layer.layer),
                    message: "must not be empty".to_string(),
                });
            }
        }

        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        message: format!("{value:?}: {e}"),
    })
}
