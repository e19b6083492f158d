#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared CLI utilities for plot finder.
//!
//! Provides an `indicatif`-backed [`ProgressCallback`] for population runs,
//! a confirmation prompt for destructive commands, and [`init_logger`],
//! which sets up `indicatif-log-bridge` so that `log::info!` and friends
//! are suspended while progress bars redraw.

use std::sync::Arc;
use std::time::Duration;

use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use plot_finder_parcel_models::KeyRange;
use plot_finder_populate::progress::ProgressCallback;

pub use indicatif::MultiProgress;

/// An `indicatif` [`ProgressBar`] that implements [`ProgressCallback`].
pub struct IndicatifProgress {
    bar: ProgressBar,
    /// Style to switch to once the batch count is known.
    bar_style: ProgressStyle,
}

impl IndicatifProgress {
    /// Creates a bar for batch work. It spins until the pipeline reports
    /// its batch plan, then shows finished batches, percentage, and ETA.
    #[must_use]
    pub fn batch_bar(multi: &MultiProgress, message: &str) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_style(
            ProgressStyle::with_template("{spinner:.yellow} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(message.to_string());

        let bar_style = ProgressStyle::with_template(
            "  {msg} {wide_bar:.yellow/dim} {pos}/{len} batches {percent}% [{eta}]",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

        Arc::new(Self { bar, bar_style })
    }
}

impl ProgressCallback for IndicatifProgress {
    fn batches_planned(&self, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(0);
        self.bar.set_style(self.bar_style.clone());
    }

    fn batch_done(&self, range: KeyRange, inserted: u64) {
        self.bar.set_message(format!("{range}: {inserted} rows"));
        self.bar.inc(1);
    }

    fn finished(&self, inserted: u64) {
        self.bar.finish_with_message(format!("Inserted {inserted} parcels"));
    }

    fn abandoned(&self) {
        self.bar.abandon();
    }
}

/// Asks the user to confirm a destructive action. `assume_yes` skips the
/// prompt (for `--yes` and non-interactive use).
///
/// # Errors
///
/// Returns an error if the terminal cannot be read.
pub fn confirm(prompt: &str, assume_yes: bool) -> Result<bool, dialoguer::Error> {
    if assume_yes {
        return Ok(true);
    }
    Confirm::new().with_prompt(prompt).default(false).interact()
}

/// Initializes the global logger wrapped in `indicatif-log-bridge` so that
/// `log::info!` and friends are suspended while progress bars redraw.
///
/// Returns the [`MultiProgress`] that all progress bars must be added to.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let logger = pretty_env_logger::formatted_builder()
        .parse_env("RUST_LOG")
        .build();
    let level = logger.filter();

    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok(); // Already set in tests

    log::set_max_level(level);

    multi
}
