#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! `PostGIS` connection and parcel store for plot finder.
//!
//! All spatial work (reprojection, intersection, distance) is delegated to
//! `PostGIS` through raw parametrized SQL via `query_raw_params()`. The
//! [`store::ParcelStore`] trait is the seam between the population and query
//! logic and the geometry engine; [`postgis::PostgisStore`] is the
//! production implementation. With the `memory` feature, an in-process
//! implementation backed by `geo` and `rstar` is available for tests.

pub mod db;
#[cfg(feature = "memory")]
pub mod memory;
pub mod postgis;
pub mod store;

pub use store::ParcelStore;

/// Maximum number of parameters `PostgreSQL` allows per statement.
pub const PG_MAX_PARAMS: usize = 65_535;

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Database query error.
    #[error("Database error: {0}")]
    Database(#[source] switchy_database::DatabaseError),

    /// The store could not be reached. Retryable by the caller.
    #[error("Store unavailable: {message}")]
    Unavailable {
        /// Description of the connection failure.
        message: String,
    },

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },
}

/// Fragments of `tokio-postgres` and pool error messages that mean the
/// server could not be reached, as opposed to a statement it rejected.
const CONNECTION_FAILURES: &[&str] = &[
    "connection closed",
    "connection refused",
    "connection reset",
    "error connecting to server",
    "error communicating with the server",
    "broken pipe",
    "no connection",
    "pool timed out",
    "pool is closed",
    "timed out waiting for connection",
];

impl From<switchy_database::DatabaseError> for DbError {
    fn from(e: switchy_database::DatabaseError) -> Self {
        let message = error_chain(&e);
        if is_connection_failure(&message) {
            Self::Unavailable { message }
        } else {
            Self::Database(e)
        }
    }
}

fn error_chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn is_connection_failure(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    CONNECTION_FAILURES
        .iter()
        .any(|fragment| message.contains(fragment))
}

impl DbError {
    /// Whether the caller may reasonably retry the operation later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
