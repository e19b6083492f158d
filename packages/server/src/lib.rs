#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server for plot finder.
//!
//! Serves radius and ID-set parcel lookups plus an admin endpoint that
//! rebuilds the enriched parcel table. Handlers are thin: they validate the
//! request body, call the query engine or population pipeline, and map
//! errors to status codes.

mod handlers;

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use plot_finder_config::AppConfig;
use plot_finder_database::ParcelStore;
use plot_finder_database::postgis::PostgisStore;
use plot_finder_populate::PopulationRun;

/// Port used when `PORT` is not set.
pub const DEFAULT_PORT: u16 = 3001;

/// Shared application state.
pub struct AppState {
    /// Parcel store shared by every request.
    pub store: Arc<dyn ParcelStore>,
    /// Loaded configuration.
    pub config: Arc<AppConfig>,
    /// Tracks the admin-triggered population run.
    pub population: Arc<PopulationRun>,
}

/// Registers the `/api` routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(handlers::health))
            .route("/good-parcels", web::post().to(handlers::good_parcels))
            .route("/sample-parcels", web::post().to(handlers::sample_parcels))
            .route("/parcels/by-ids", web::post().to(handlers::parcels_by_ids))
            .route("/admin/populate", web::post().to(handlers::populate)),
    );
}

/// Connects to `PostGIS`, ensures the constraint table exists, and serves
/// the API on `BIND_ADDR`:`PORT`.
///
/// The caller provides the async runtime and initializes logging.
///
/// # Errors
///
/// Returns an `std::io::Result` error if the store is unreachable, the
/// server fails to bind, or the server hits a runtime error.
#[allow(clippy::future_not_send)]
pub async fn run_server(config: AppConfig) -> std::io::Result<()> {
    log::info!("Connecting to database...");
    let store = PostgisStore::connect_from_env(config.store.clone())
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    store
        .ensure_constraint_table()
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    serve(
        AppState {
            store: Arc::new(store),
            config: Arc::new(config),
            population: Arc::new(PopulationRun::new()),
        },
    )
    .await
}

/// Serves the API over an existing state.
///
/// # Errors
///
/// Returns an `std::io::Result` error if the server fails to bind or
/// encounters a runtime error.
#[allow(clippy::future_not_send)]
pub async fn serve(state: AppState) -> std::io::Result<()> {
    let state = web::Data::new(state);

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    log::info!("Starting server on {bind_addr}:{port}");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(configure)
    })
    .bind((bind_addr, port))?
    .run()
    .await
}
