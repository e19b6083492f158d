#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Constraint polygon loading.
//!
//! Reads each configured constraint layer's `GeoJSON` `FeatureCollection`
//! (local file or `http(s)` URL) and stores its polygons in the constraint
//! table. Loading is idempotent per layer: a layer that already has rows is
//! never read again.

pub mod source;

use plot_finder_config::ConstraintLayerConfig;
use plot_finder_database::{DbError, ParcelStore};
use plot_finder_parcel_models::ConstraintLayer;
use thiserror::Error;

/// Layers that must always be configured and loaded.
pub const REQUIRED_LAYERS: &[ConstraintLayer] = &[ConstraintLayer::ConservationArea];

/// Errors that can occur while loading constraint layers.
#[derive(Debug, Error)]
pub enum ConstraintLoadError {
    /// A required layer has no configured source.
    #[error("Constraint layer {layer} is required but not configured")]
    MissingRequired {
        /// The missing layer.
        layer: ConstraintLayer,
    },

    /// The collection file could not be read.
    #[error("Failed to read {location}: {source}")]
    Read {
        /// File path that failed.
        location: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The collection URL could not be fetched.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The collection is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The collection parsed but holds no polygons.
    #[error("Constraint layer {layer} at {location} contains no polygons")]
    Empty {
        /// Layer being loaded.
        layer: ConstraintLayer,
        /// Where the collection came from.
        location: String,
    },

    /// The collection or one of its features is not usable polygon data.
    #[error("Malformed {layer} collection: {message}")]
    Malformed {
        /// Layer being loaded.
        layer: ConstraintLayer,
        /// Description of what went wrong.
        message: String,
    },

    /// The store rejected an operation.
    #[error(transparent)]
    Store(#[from] DbError),
}

impl ConstraintLoadError {
    /// Whether the failure came from an unreachable store.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }
}

/// What happened to one layer during [`ensure_loaded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerOutcome {
    /// The collection was read and this many polygons stored.
    Loaded(u64),
    /// The layer already held this many polygons; its source was not read.
    AlreadyPresent(u64),
    /// No source is configured; parcels get `false` for this layer.
    NotConfigured,
    /// An optional layer failed to load; parcels get `false` for it.
    Failed,
}

impl LayerOutcome {
    /// Whether the constraint table holds polygons for the layer.
    #[must_use]
    pub const fn has_polygons(self) -> bool {
        matches!(self, Self::Loaded(_) | Self::AlreadyPresent(_))
    }
}

/// Per-layer result of [`ensure_loaded`], in flag column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Outcome for every constraint layer.
    pub layers: Vec<(ConstraintLayer, LayerOutcome)>,
}

impl LoadReport {
    /// Layers that parcels should be tagged against.
    #[must_use]
    pub fn available_layers(&self) -> Vec<ConstraintLayer> {
        self.layers
            .iter()
            .filter(|(_, outcome)| outcome.has_polygons())
            .map(|(layer, _)| *layer)
            .collect()
    }

    /// Outcome for a single layer.
    #[must_use]
    pub fn outcome(&self, layer: ConstraintLayer) -> Option<LayerOutcome> {
        self.layers
            .iter()
            .find(|(l, _)| *l == layer)
            .map(|(_, outcome)| *outcome)
    }
}

/// Makes sure every configured constraint layer is present in the store.
///
/// Creates the constraint table if needed, then for each layer in flag
/// column order: skips it if it already has rows, otherwise reads its
/// collection once and inserts every polygon in a single statement. The
/// spatial index is ensured on every call.
///
/// # Errors
///
/// * [`ConstraintLoadError::MissingRequired`] if a layer in
///   [`REQUIRED_LAYERS`] is not configured
/// * any load error for a layer that is required (by [`REQUIRED_LAYERS`]
///   or its `required` setting); optional layers log and continue
/// * [`ConstraintLoadError::Store`] if a store operation fails
pub async fn ensure_loaded(
    store: &dyn ParcelStore,
    configs: &[ConstraintLayerConfig],
) -> Result<LoadReport, ConstraintLoadError> {
    for layer in REQUIRED_LAYERS {
        if !configs.iter().any(|c| c.layer == *layer) {
            return Err(ConstraintLoadError::MissingRequired { layer: *layer });
        }
    }

    store.ensure_constraint_table().await?;

    let mut layers = Vec::with_capacity(ConstraintLayer::all().len());

    for layer in ConstraintLayer::all() {
        let Some(config) = configs.iter().find(|c| c.layer == *layer) else {
            log::info!("Constraint layer {layer} not configured, flags will be false");
            layers.push((*layer, LayerOutcome::NotConfigured));
            continue;
        };

        let existing = store.count_constraints(*layer).await?;
        if existing > 0 {
            log::info!("Constraint layer {layer}: {existing} polygons already loaded, skipping");
            layers.push((*layer, LayerOutcome::AlreadyPresent(existing)));
            continue;
        }

        let required = config.required || REQUIRED_LAYERS.contains(layer);

        match load_layer(store, config).await {
            Ok(inserted) => layers.push((*layer, LayerOutcome::Loaded(inserted))),
            Err(e) if required || matches!(e, ConstraintLoadError::Store(_)) => return Err(e),
            Err(e) => {
                log::warn!("Optional constraint layer {layer} failed to load, flags will be false: {e}");
                layers.push((*layer, LayerOutcome::Failed));
            }
        }
    }

    // Also covers a previous run that stopped between insert and index.
    log::debug!("Ensuring constraint spatial index...");
    store.index_constraints().await?;

    Ok(LoadReport { layers })
}

async fn load_layer(
    store: &dyn ParcelStore,
    config: &ConstraintLayerConfig,
) -> Result<u64, ConstraintLoadError> {
    let layer = config.layer;
    log::info!("Loading constraint layer {layer} from {}...", config.location);

    let collection = source::read_collection(&config.location).await?;
    let polygons = source::collection_polygons(layer, &collection)?;

    if polygons.is_empty() {
        return Err(ConstraintLoadError::Empty {
            layer,
            location: config.location.clone(),
        });
    }

    let inserted = store
        .insert_constraints(layer, config.srid(), &polygons)
        .await?;

    log::info!(
        "Constraint layer {layer}: inserted {inserted} polygons from {}",
        config.location
    );
    Ok(inserted)
}
