//! HTTP handler functions for the plot finder API.

use actix_web::{HttpResponse, web};
use plot_finder_parcel_models::ValidationError;
use plot_finder_populate::PopulateError;
use plot_finder_populate::progress::null_progress;
use plot_finder_query::{QueryError, RadiusQuery};
use plot_finder_server_models::{
    ApiError, ApiHealth, GoodParcelsRequest, ParcelsByIdsRequest, PopulateResponse,
    SampleParcelsRequest,
};

use crate::AppState;

/// `GET /api/health`
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiHealth {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        population: state.population.state().to_string(),
    })
}

/// `POST /api/good-parcels`
///
/// Parcels within `radius` meters (at most 5000) of `center`.
pub async fn good_parcels(
    state: web::Data<AppState>,
    body: web::Json<GoodParcelsRequest>,
) -> HttpResponse {
    let center = match body.validate() {
        Ok(center) => center,
        Err(e) => return bad_request(&e),
    };

    let mut query = RadiusQuery::new(center.lat, center.lon, body.radius);
    if let Some(limit) = body.limit {
        query = query.with_limit(limit);
    }

    match plot_finder_query::query_by_radius(state.store.as_ref(), query).await {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(e) => query_error("good parcels", &e),
    }
}

/// `POST /api/sample-parcels`
///
/// Parcels within two miles of `center`.
pub async fn sample_parcels(
    state: web::Data<AppState>,
    body: web::Json<SampleParcelsRequest>,
) -> HttpResponse {
    let center = match body.validate() {
        Ok(center) => center,
        Err(e) => return bad_request(&e),
    };

    match plot_finder_query::get_sample_parcels(state.store.as_ref(), center.lat, center.lon).await
    {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(e) => query_error("sample parcels", &e),
    }
}

/// `POST /api/parcels/by-ids`
pub async fn parcels_by_ids(
    state: web::Data<AppState>,
    body: web::Json<ParcelsByIdsRequest>,
) -> HttpResponse {
    let ids = match body.parse_ids() {
        Ok(ids) => ids,
        Err(e) => return bad_request(&e),
    };

    match plot_finder_query::get_parcels_by_ids(state.store.as_ref(), &ids).await {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(e) => query_error("parcels by id", &e),
    }
}

/// `POST /api/admin/populate`
///
/// Rebuilds the enriched parcel table and reports the inserted row count.
/// Only one rebuild runs at a time.
pub async fn populate(state: web::Data<AppState>) -> HttpResponse {
    match plot_finder_populate::populate_get_good_parcels(
        state.store.as_ref(),
        &state.config,
        &state.population,
        null_progress(),
    )
    .await
    {
        Ok(report) => HttpResponse::Ok().json(PopulateResponse {
            inserted: report.inserted,
        }),
        Err(PopulateError::AlreadyRunning) => {
            HttpResponse::Conflict().json(ApiError::new("A population run is already in progress"))
        }
        Err(e) if e.is_transient() => {
            log::error!("Population failed, store unavailable: {e}");
            HttpResponse::ServiceUnavailable().json(ApiError::new("Parcel store unavailable"))
        }
        Err(e) => {
            log::error!("Population failed: {e}");
            HttpResponse::InternalServerError().json(ApiError::new(format!("Population failed: {e}")))
        }
    }
}

fn bad_request(e: &ValidationError) -> HttpResponse {
    HttpResponse::BadRequest().json(ApiError::new(e.to_string()))
}

fn query_error(what: &str, e: &QueryError) -> HttpResponse {
    match e {
        QueryError::Validation(e) => bad_request(e),
        e if e.is_transient() => {
            log::error!("Failed to query {what}, store unavailable: {e}");
            HttpResponse::ServiceUnavailable().json(ApiError::new("Parcel store unavailable"))
        }
        e => {
            log::error!("Failed to query {what}: {e}");
            HttpResponse::InternalServerError().json(ApiError::new(format!("Failed to query {what}")))
        }
    }
}
