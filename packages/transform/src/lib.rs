#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Pure transforms used by parcel population and querying.
//!
//! Nothing in this crate performs I/O. Coordinate reprojection itself is
//! delegated to `PostGIS`; [`crs`] only builds the SQL expressions that ask
//! for it. [`numeric`] holds the rounding and free-area rules in both Rust
//! and SQL form so the two stay in step.

pub mod crs;
pub mod geometry;
pub mod numeric;
pub mod sql;

pub use crs::Srid;
pub use numeric::{free_pct, round2};

use thiserror::Error;

/// Errors produced by geometry and identifier validation.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Geometry input was null, unparseable, or not a polygon.
    #[error("Invalid geometry: {message}")]
    InvalidGeometry {
        /// Description of what was wrong with the geometry.
        message: String,
    },

    /// A table or column name is not a plain SQL identifier.
    #[error("Invalid SQL identifier: {name:?}")]
    InvalidIdentifier {
        /// The rejected identifier.
        name: String,
    },
}
