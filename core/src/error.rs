//! Error types for filter construction and row geometry evaluation.
//!
//! Configuration problems are fatal and surface as [`FilterError`] when a filter
//! is built. Geometry problems are per-particle and recoverable: the measurement
//! models turn a [`GeometryError`] into a zero likelihood for that particle.

use std::io;
use std::path::PathBuf;

/// Errors raised while validating a configuration or constructing a filter.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("number of particles must be at least 1, got {0}")]
    NoParticles(usize),
    #[error("invalid bound for `{dimension}`: [{min}, {max}]")]
    InvalidBound {
        dimension: String,
        min: f64,
        max: f64,
    },
    #[error("invalid process noise for `{dimension}`: {value}")]
    InvalidNoise { dimension: String, value: f64 },
    #[error("expected {expected} dimensions, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid measurement model: {0}")]
    InvalidMeasurement(String),
    #[error("invalid world size: {width} x {height}")]
    InvalidWorld { width: f64, height: f64 },
    #[error("state `{dimension}` = {value} lies outside [{min}, {max}]")]
    StateOutOfBounds {
        dimension: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("scene geometry cannot be projected: {0}")]
    Geometry(#[from] GeometryError),
    #[error("invalid scene: {0}")]
    InvalidScene(String),
    #[error("configuration I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported configuration format: {}", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("malformed configuration {}: {message}", .path.display())]
    Format { path: PathBuf, message: String },
}

/// Reasons the projective row model cannot produce expected plant positions.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("at least two rows are needed to fix a vanishing point, found {found}")]
    NotEnoughRows { found: usize },
    #[error("bottom plants ({bottom}) and top crossing points ({top}) do not pair up")]
    PointCountMismatch { bottom: usize, top: usize },
    #[error("rows are parallel, the vanishing point is at infinity")]
    ParallelRows,
    #[error("row spacing must be positive and finite, got {0}")]
    InvalidSpacing(f64),
    #[error("vanishing point lies on the bottom image edge")]
    HorizonAtImageBottom,
}
