#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Rebuilds the enriched parcel table from the raw source table.
//!
//! A run moves through `Preparing → Rebuilding → Indexing → Done` (or
//! `Failed`). Source keys are cut into batches that run in waves of
//! `concurrency`, each wave awaited in full before the next launches. The
//! spatial index is built only after every row is present.

pub mod plan;
pub mod progress;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use plot_finder_config::AppConfig;
use plot_finder_constraints::{ConstraintLoadError, LoadReport};
use plot_finder_database::{DbError, ParcelStore};
use plot_finder_parcel_models::KeyRange;
use strum_macros::Display;
use thiserror::Error;

use crate::progress::ProgressCallback;

/// Errors that can occur during a population run.
#[derive(Debug, Error)]
pub enum PopulateError {
    /// Another run is still in progress.
    #[error("A population run is already in progress")]
    AlreadyRunning,

    /// Constraint layers could not be loaded.
    #[error("Constraint loading failed: {0}")]
    Constraints(#[from] ConstraintLoadError),

    /// A setup or indexing statement failed.
    #[error("Store error: {0}")]
    Store(#[from] DbError),

    /// A batch failed; the run stopped after the batch's wave settled.
    #[error("Batch {range} failed: {source}")]
    Batch {
        /// Key range of the failed batch.
        range: KeyRange,
        /// The store error.
        source: DbError,
    },

    /// The run was cancelled before launching the next wave.
    #[error("Population cancelled after inserting {inserted} parcels")]
    Cancelled {
        /// Rows inserted by the waves that completed.
        inserted: u64,
    },
}

impl PopulateError {
    /// Whether the failure came from an unreachable store.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) | Self::Batch { source: e, .. } => e.is_transient(),
            Self::Constraints(e) => e.is_transient(),
            Self::AlreadyRunning | Self::Cancelled { .. } => false,
        }
    }
}

/// Phase of a population run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PopulationState {
    /// No run has started.
    Idle,
    /// Loading constraints and recreating the target table.
    Preparing,
    /// Running batch waves.
    Rebuilding,
    /// Building the spatial index.
    Indexing,
    /// The last run finished.
    Done,
    /// The last run failed or was cancelled.
    Failed,
}

impl PopulationState {
    /// Whether a run is in progress.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Preparing | Self::Rebuilding | Self::Indexing)
    }
}

/// Shared cancellation signal checked before each wave.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Requests cancellation. In-flight batches still finish.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Tracks the state of population runs against one store.
///
/// Only one run may be active at a time; starting a second fails with
/// [`PopulateError::AlreadyRunning`].
#[derive(Debug)]
pub struct PopulationRun {
    state: Mutex<PopulationState>,
    cancel: CancelFlag,
}

impl Default for PopulationRun {
    fn default() -> Self {
        Self {
            state: Mutex::new(PopulationState::Idle),
            cancel: CancelFlag::default(),
        }
    }
}

impl PopulationRun {
    /// Creates an idle run tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> PopulationState {
        self.state
            .lock()
            .map_or(PopulationState::Failed, |state| *state)
    }

    /// Handle for cancelling the active run.
    #[must_use]
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn begin(&self) -> Result<RunGuard<'_>, PopulateError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PopulateError::AlreadyRunning)?;
        if state.is_running() {
            return Err(PopulateError::AlreadyRunning);
        }
        *state = PopulationState::Preparing;
        self.cancel.reset();
        Ok(RunGuard {
            run: self,
            settled: false,
        })
    }

    fn transition(&self, next: PopulationState) {
        if let Ok(mut state) = self.state.lock() {
            log::info!("Population: {} -> {next}", *state);
            *state = next;
        }
    }
}

/// Marks a run `Failed` if it is dropped before reaching a final state, so
/// an abandoned future (client disconnect, caller timeout) does not leave
/// the tracker stuck in a running phase.
struct RunGuard<'a> {
    run: &'a PopulationRun,
    settled: bool,
}

impl RunGuard<'_> {
    fn transition(&self, next: PopulationState) {
        self.run.transition(next);
    }

    fn is_cancelled(&self) -> bool {
        self.run.cancel.is_cancelled()
    }

    fn settle(mut self, last: PopulationState) {
        self.run.transition(last);
        self.settled = true;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            log::warn!("Population run dropped before finishing");
            self.run.transition(PopulationState::Failed);
        }
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct PopulationReport {
    /// Rows inserted into the enriched table.
    pub inserted: u64,
    /// Rows in the source table when the run started.
    pub source_rows: u64,
    /// Batches executed.
    pub batches: usize,
    /// Waves executed.
    pub waves: usize,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    /// Constraint layer outcomes.
    pub constraints: LoadReport,
}

/// Rebuilds the enriched parcel table.
///
/// Loads constraint layers (skipping ones already present), drops and
/// recreates the target table, inserts every source row in batch waves,
/// then builds the spatial index. Queries running during a rebuild may see
/// a partially populated table.
///
/// # Errors
///
/// * [`PopulateError::AlreadyRunning`] if `run` has an active run
/// * [`PopulateError::Constraints`] if a required constraint layer fails
/// * [`PopulateError::Batch`] naming the first failed batch of a wave
/// * [`PopulateError::Cancelled`] if the cancel flag was set between waves
/// * [`PopulateError::Store`] if setup or indexing fails
pub async fn populate_get_good_parcels(
    store: &dyn ParcelStore,
    config: &AppConfig,
    run: &PopulationRun,
    progress: Arc<dyn ProgressCallback>,
) -> Result<PopulationReport, PopulateError> {
    let guard = run.begin()?;
    let result = rebuild(store, config, &guard, progress.as_ref()).await;

    match result {
        Ok(report) => {
            guard.settle(PopulationState::Done);
            Ok(report)
        }
        Err(e) => {
            log::error!("Population failed: {e}");
            progress.abandoned();
            guard.settle(PopulationState::Failed);
            Err(e)
        }
    }
}

async fn rebuild(
    store: &dyn ParcelStore,
    config: &AppConfig,
    guard: &RunGuard<'_>,
    progress: &dyn ProgressCallback,
) -> Result<PopulationReport, PopulateError> {
    let started = Instant::now();
    let population = &config.population;

    let constraints = plot_finder_constraints::ensure_loaded(store, &config.constraints).await?;
    let layers = constraints.available_layers();

    log::info!("Recreating parcel table...");
    store.recreate_parcel_table().await?;
    let source_rows = store.count_source_rows().await?;

    guard.transition(PopulationState::Rebuilding);

    let span = plan::key_span(store, population.ceiling, source_rows).await?;
    let batches = span.map_or_else(Vec::new, |span| {
        plan::plan_batches(span, population.batch_size)
    });
    let total_waves = batches.len().div_ceil(population.concurrency.max(1));

    log::info!(
        "Populating {source_rows} source rows in {} batches of {} ({total_waves} waves of {})",
        batches.len(),
        population.batch_size,
        population.concurrency,
    );
    progress.batches_planned(batches.len() as u64);

    let mut inserted = 0u64;
    let mut waves = 0usize;
    let layers = layers.as_slice();

    for wave in batches.chunks(population.concurrency.max(1)) {
        if guard.is_cancelled() {
            log::warn!("Cancellation requested, not launching wave {}", waves + 1);
            return Err(PopulateError::Cancelled { inserted });
        }

        log::info!(
            "Wave {}/{total_waves}: {} batches starting at key {}",
            waves + 1,
            wave.len(),
            wave.first().map_or(0, |r| r.start),
        );

        let results = futures::future::join_all(wave.iter().map(|range| async move {
            log::debug!("Batch {range} starting");
            (*range, store.populate_batch(*range, layers).await)
        }))
        .await;
        waves += 1;

        let mut failed = None;
        for (range, result) in results {
            match result {
                Ok(count) => {
                    log::debug!("Batch {range} inserted {count} rows");
                    inserted += count;
                    progress.batch_done(range, count);
                }
                Err(e) => {
                    log::error!("Batch {range} failed: {e}");
                    if failed.is_none() {
                        failed = Some(PopulateError::Batch { range, source: e });
                    }
                }
            }
        }
        if let Some(e) = failed {
            return Err(e);
        }
    }

    guard.transition(PopulationState::Indexing);
    log::info!("Building parcel spatial index...");
    store.index_parcel_table().await?;

    if inserted != source_rows {
        log::warn!(
            "Inserted {inserted} parcels but the source holds {source_rows} rows \
             (null keys, keys outside the batched span, or concurrent source writes)"
        );
    }

    let elapsed = started.elapsed();
    progress.finished(inserted);
    log::info!(
        "Population complete: {inserted} parcels in {:.1}s",
        elapsed.as_secs_f64()
    );

    Ok(PopulationReport {
        inserted,
        source_rows,
        batches: batches.len(),
        waves,
        elapsed,
        constraints,
    })
}

#[cfg(test)]
mod tests {
    use plot_finder_config::{CeilingStrategy, ConstraintLayerConfig};
    use plot_finder_database::memory::{MemoryStore, SourceParcel, square};
    use plot_finder_parcel_models::{Center, ConstraintLayer, ConstraintPolygon};
    use plot_finder_transform::Srid;
    use plot_finder_transform::geometry::polygon_to_geojson;

    use super::*;
    use crate::progress::null_progress;

    const INSIDE: (f64, f64) = (-0.1, 51.5);
    const OUTSIDE: (f64, f64) = (1.0, 52.0);

    fn config(batch_size: u64, concurrency: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.population.batch_size = batch_size;
        config.population.concurrency = concurrency;
        config.constraints = vec![ConstraintLayerConfig {
            layer: ConstraintLayer::ConservationArea,
            location: "/nonexistent/already_loaded.geojson".to_string(),
            srid: 4326,
            required: true,
        }];
        config
    }

    /// Store with a conservation area around `INSIDE` already loaded.
    async fn seeded_store(source: Vec<SourceParcel>) -> MemoryStore {
        let store = MemoryStore::with_source(source);
        store.ensure_constraint_table().await.unwrap();
        store
            .insert_constraints(
                ConstraintLayer::ConservationArea,
                Srid::WGS84,
                &[ConstraintPolygon {
                    layer: ConstraintLayer::ConservationArea,
                    name: Some("Old Town".to_string()),
                    geometry: polygon_to_geojson(&square(INSIDE.0, INSIDE.1, 0.01)),
                }],
            )
            .await
            .unwrap();
        store
    }

    fn dense_source(rows: i64) -> Vec<SourceParcel> {
        (0..rows)
            .map(|key| SourceParcel::square(key, OUTSIDE.0, OUTSIDE.1, 0.0001))
            .collect()
    }

    #[tokio::test]
    async fn twenty_five_thousand_rows_run_in_two_waves() {
        let store = seeded_store(dense_source(25_000)).await;
        let run = PopulationRun::new();

        let report = populate_get_good_parcels(&store, &config(10_000, 2), &run, null_progress())
            .await
            .unwrap();

        assert_eq!(report.inserted, 25_000);
        assert_eq!(report.source_rows, 25_000);
        assert_eq!(report.batches, 3);
        assert_eq!(report.waves, 2);
        assert_eq!(store.count_parcels().await.unwrap(), 25_000);
        assert_eq!(store.max_in_flight(), 2);
        assert!(store.parcels_indexed());
        assert_eq!(run.state(), PopulationState::Done);

        let log = store.batch_log();
        assert_eq!(log.len(), 3);
        let mut first_wave = log[..2].to_vec();
        first_wave.sort_by_key(|r| r.start);
        assert_eq!(
            first_wave,
            vec![KeyRange::new(0, 10_000), KeyRange::new(10_000, 20_000)]
        );
        assert_eq!(log[2], KeyRange::new(20_000, 25_000));
    }

    #[tokio::test]
    async fn sparse_keys_are_fully_covered() {
        let source = [5, 17, 40_000, 40_001, 99_999]
            .into_iter()
            .map(|key| SourceParcel::square(key, OUTSIDE.0, OUTSIDE.1, 0.0001))
            .collect();
        let store = seeded_store(source).await;

        let report = populate_get_good_parcels(
            &store,
            &config(10_000, 2),
            &PopulationRun::new(),
            null_progress(),
        )
        .await
        .unwrap();

        assert_eq!(report.inserted, 5);
        assert_eq!(store.batch_log().first(), Some(&KeyRange::new(5, 10_005)));
        assert_eq!(
            store.batch_log().iter().map(|r| r.end).max(),
            Some(100_000)
        );
    }

    #[tokio::test]
    async fn row_count_ceiling_misses_sparse_keys() {
        let source = [5, 17, 40_000]
            .into_iter()
            .map(|key| SourceParcel::square(key, OUTSIDE.0, OUTSIDE.1, 0.0001))
            .collect();
        let store = seeded_store(source).await;
        let mut config = config(10_000, 2);
        config.population.ceiling = CeilingStrategy::RowCount;

        let report = populate_get_good_parcels(&store, &config, &PopulationRun::new(), null_progress())
            .await
            .unwrap();

        assert_eq!(report.source_rows, 3);
        assert_eq!(report.inserted, 0);
        assert_eq!(store.batch_log(), vec![KeyRange::new(0, 3)]);
    }

    #[tokio::test]
    async fn failing_batch_stops_before_next_wave() {
        let store = seeded_store(dense_source(25_000)).await;
        store.fail_batch_at(10_000);
        let run = PopulationRun::new();

        let err = populate_get_good_parcels(&store, &config(10_000, 2), &run, null_progress())
            .await
            .unwrap_err();

        match err {
            PopulateError::Batch { range, source } => {
                assert_eq!(range, KeyRange::new(10_000, 20_000));
                assert!(source.is_transient());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.batch_log().len(), 2);
        assert!(!store.parcels_indexed());
        assert_eq!(run.state(), PopulationState::Failed);
    }

    struct CancelOnFirstBatch(CancelFlag);

    impl ProgressCallback for CancelOnFirstBatch {
        fn batches_planned(&self, _total: u64) {}
        fn batch_done(&self, _range: KeyRange, _inserted: u64) {
            self.0.cancel();
        }
        fn finished(&self, _inserted: u64) {}
        fn abandoned(&self) {}
    }

    #[tokio::test]
    async fn cancellation_stops_new_waves() {
        let store = seeded_store(dense_source(25_000)).await;
        let run = PopulationRun::new();
        let progress = Arc::new(CancelOnFirstBatch(run.cancel_flag()));

        let err = populate_get_good_parcels(&store, &config(10_000, 1), &run, progress)
            .await
            .unwrap_err();

        assert!(matches!(err, PopulateError::Cancelled { inserted: 10_000 }));
        assert_eq!(store.batch_log(), vec![KeyRange::new(0, 10_000)]);
        assert_eq!(run.state(), PopulationState::Failed);

        // The next run starts with a fresh flag.
        populate_get_good_parcels(&store, &config(10_000, 2), &run, null_progress())
            .await
            .unwrap();
        assert_eq!(run.state(), PopulationState::Done);
    }

    #[tokio::test]
    async fn flags_and_numbers_are_computed_per_parcel() {
        let source = vec![
            SourceParcel::square(0, INSIDE.0, INSIDE.1, 0.0001)
                .with_areas(Some(200.0), Some(50.0)),
            SourceParcel::square(1, OUTSIDE.0, OUTSIDE.1, 0.0001)
                .with_areas(Some(0.0), Some(10.0)),
            SourceParcel::square(2, OUTSIDE.0 + 0.01, OUTSIDE.1, 0.0001).with_areas(None, None),
        ];
        let store = seeded_store(source).await;
        populate_get_good_parcels(&store, &config(10, 2), &PopulationRun::new(), null_progress())
            .await
            .unwrap();

        let inside = store
            .parcels_within(Center::new(INSIDE.1, INSIDE.0), 1.0, None)
            .await
            .unwrap();
        assert_eq!(inside.len(), 1);
        assert!(inside[0].flags.conservation_area);
        assert!(!inside[0].flags.green_belt);
        assert!((inside[0].free_pct - 25.0).abs() < f64::EPSILON);

        let outside = store
            .parcels_within(Center::new(OUTSIDE.1, OUTSIDE.0), 1.0, None)
            .await
            .unwrap();
        assert_eq!(outside.len(), 1);
        assert!(!outside[0].flags.conservation_area);
        assert!(outside[0].free_pct.abs() < f64::EPSILON);
        assert!((outside[0].free_area - 10.0).abs() < f64::EPSILON);

        let missing = store
            .parcels_within(Center::new(OUTSIDE.1, OUTSIDE.0 + 0.01), 1.0, None)
            .await
            .unwrap();
        assert!(missing[0].parcel_area.abs() < f64::EPSILON);
        assert!(missing[0].free_pct.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn constraints_are_loaded_once_across_runs() {
        let store = seeded_store(dense_source(10)).await;
        let run = PopulationRun::new();

        for _ in 0..2 {
            let report = populate_get_good_parcels(&store, &config(10_000, 2), &run, null_progress())
                .await
                .unwrap();
            assert_eq!(report.inserted, 10);
        }
        assert_eq!(store.constraint_insert_calls(), 1);
        assert_eq!(store.count_parcels().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn empty_source_runs_zero_batches() {
        let store = seeded_store(Vec::new()).await;
        let report = populate_get_good_parcels(
            &store,
            &config(10_000, 2),
            &PopulationRun::new(),
            null_progress(),
        )
        .await
        .unwrap();

        assert_eq!(report.batches, 0);
        assert_eq!(report.inserted, 0);
        assert!(store.batch_log().is_empty());
        assert!(store.parcels_indexed());
    }

    #[tokio::test]
    async fn second_concurrent_run_is_rejected() {
        let store = seeded_store(dense_source(1)).await;
        let run = PopulationRun::new();
        let _active = run.begin().unwrap();

        let err = populate_get_good_parcels(&store, &config(10_000, 2), &run, null_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, PopulateError::AlreadyRunning));
        assert_eq!(run.state(), PopulationState::Preparing);
    }

    #[tokio::test]
    async fn dropped_run_can_be_restarted() {
        use futures::FutureExt as _;

        let store = seeded_store(dense_source(25_000)).await;
        let run = PopulationRun::new();

        // The first batch yields, so a single poll leaves the run mid-wave.
        let first = populate_get_good_parcels(&store, &config(10_000, 2), &run, null_progress())
            .now_or_never();
        assert!(first.is_none());
        assert_eq!(run.state(), PopulationState::Failed);
        assert!(!run.state().is_running());

        let report = populate_get_good_parcels(&store, &config(10_000, 2), &run, null_progress())
            .await
            .unwrap();
        assert_eq!(report.inserted, 25_000);
        assert_eq!(store.count_parcels().await.unwrap(), 25_000);
        assert_eq!(run.state(), PopulationState::Done);
    }
}
