#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Command-line entry point for plot finder.
//!
//! Uses `indicatif-log-bridge` (via [`plot_finder_cli_utils::init_logger`])
//! so log lines and the population progress bar share the terminal.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use plot_finder_cli_utils::IndicatifProgress;
use plot_finder_config::AppConfig;
use plot_finder_constraints::LayerOutcome;
use plot_finder_database::ParcelStore;
use plot_finder_database::postgis::PostgisStore;
use plot_finder_populate::PopulationRun;
use plot_finder_query::RadiusQuery;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "plot_finder", about = "Parcel population pipeline and radius search")]
struct Cli {
    /// Config file (defaults to `PLOT_FINDER_CONFIG` or `plot_finder.toml`)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the constraint polygon table if it does not exist
    Migrate,
    /// Load configured constraint layers that are not yet in the store
    LoadConstraints,
    /// Drop and rebuild the enriched parcel table
    Populate {
        /// Source keys per batch
        #[arg(long)]
        batch_size: Option<u64>,
        /// Batches per wave
        #[arg(long)]
        concurrency: Option<usize>,
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
    /// Parcels within a radius of a point
    Radius {
        /// Latitude (WGS84)
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        /// Longitude (WGS84)
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
        /// Radius in meters
        #[arg(long)]
        radius: f64,
        /// Maximum parcels to return, nearest first
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Parcels within two miles of a point
    Sample {
        /// Latitude (WGS84)
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        /// Longitude (WGS84)
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
    },
    /// Parcels by id
    Ids {
        /// Parcel UUIDs
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },
    /// Start the API server
    Serve,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = plot_finder_cli_utils::init_logger();
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;

    if matches!(cli.command, Commands::Serve) {
        // The server uses actix-web's runtime, so run it in a blocking
        // task to avoid nesting tokio runtimes.
        tokio::task::spawn_blocking(move || {
            actix_web::rt::System::new().block_on(plot_finder_server::run_server(config))
        })
        .await??;
        return Ok(());
    }

    let store = PostgisStore::connect_from_env(config.store.clone()).await?;

    match cli.command {
        Commands::Migrate => {
            log::info!("Creating constraint table...");
            store.ensure_constraint_table().await?;
            log::info!("Schema ready.");
        }
        Commands::LoadConstraints => {
            let report = plot_finder_constraints::ensure_loaded(&store, &config.constraints).await?;
            for (layer, outcome) in &report.layers {
                let status = match outcome {
                    LayerOutcome::Loaded(n) => format!("loaded {n} polygons"),
                    LayerOutcome::AlreadyPresent(n) => format!("{n} polygons already present"),
                    LayerOutcome::NotConfigured => "not configured".to_string(),
                    LayerOutcome::Failed => "failed (optional)".to_string(),
                };
                println!("{:<20} {status}", layer.as_ref());
            }
        }
        Commands::Populate {
            batch_size,
            concurrency,
            yes,
        } => {
            if let Some(batch_size) = batch_size {
                config.population.batch_size = batch_size;
            }
            if let Some(concurrency) = concurrency {
                config.population.concurrency = concurrency;
            }
            if config.population.batch_size == 0 || config.population.concurrency == 0 {
                return Err("--batch-size and --concurrency must be at least 1".into());
            }

            let prompt = format!(
                "Drop and rebuild {} from {}?",
                config.store.target_table, config.store.source_table
            );
            if !plot_finder_cli_utils::confirm(&prompt, yes)? {
                println!("Cancelled.");
                return Ok(());
            }

            let run = PopulationRun::new();
            let cancel = run.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("Ctrl-C received, finishing the current wave...");
                    cancel.cancel();
                }
            });

            let progress = IndicatifProgress::batch_bar(&multi, "Populating parcels");
            let report =
                plot_finder_populate::populate_get_good_parcels(&store, &config, &run, progress)
                    .await?;

            println!(
                "Inserted {} parcels ({} source rows) in {} batches / {} waves, {:.1}s",
                report.inserted,
                report.source_rows,
                report.batches,
                report.waves,
                report.elapsed.as_secs_f64()
            );
        }
        Commands::Radius {
            lat,
            lon,
            radius,
            limit,
        } => {
            let mut query = RadiusQuery::new(lat, lon, radius);
            if let Some(limit) = limit {
                query = query.with_limit(limit);
            }
            let result = plot_finder_query::query_by_radius(&store, query).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Sample { lat, lon } => {
            let result = plot_finder_query::get_sample_parcels(&store, lat, lon).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Ids { ids } => {
            let result = plot_finder_query::get_parcels_by_ids(&store, &ids).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Serve => {}
    }

    Ok(())
}
