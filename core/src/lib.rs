//! Crop row geometry estimation with a sequential importance resampling particle filter
//!
//! A camera looking along crop rows sees plants laid out on converging lines. This crate estimates the geometry
//! of those rows (lateral offset and forward position of one tracked plant, inter-plant and inter-row spacing,
//! skew of the tracked row and perspective convergence) from a commanded forward motion and either a noisy
//! position of the tracked plant or a binary image of plant-coloured pixels.
//!
//! The estimator is a single generic SIR filter ([`sir::SirFilter`]) parameterized by the state type, a motion
//! model and a measurement likelihood. Every step runs
//!
//! $$
//! propagate \rightarrow weight \rightarrow normalize \rightarrow resample
//! $$
//!
//! over the particle set, with the resampling policy and algorithm selected by configuration.
//!
//! This crate is primarily built off of:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): points, homogeneous line intersection and state vectors.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): sampling of
//!   initial particles, process noise and resampling draws.
//! - [`rayon`](https://crates.io/crates/rayon): optional data-parallel particle evaluation.
//!
//! ## Crate overview
//!
//! - [state]: the [`state::FilterState`] trait and the six-parameter [`state::RowState`] and one-parameter
//!   [`state::PositionState`] implementations.
//! - [config]: per-dimension bounds with clamp/wrap policies, process noise and the serializable
//!   [`config::FilterConfig`].
//! - [geometry]: projection of a row state into expected plant pixels (vanishing point, perspective spacing).
//! - [measurements]: point and image likelihood models.
//! - [motion]: propagation models.
//! - [resampling]: multinomial, stratified, systematic and residual resampling.
//! - [particle]: particle storage, normalization and estimates.
//! - [sir]: the SIR filter driver.
//! - [sim]: a simulated row scene and the tracking loop used by the `croprow` binary.
//!
//! ## Coordinates
//!
//! Image coordinates have `x` growing to the right and `y` growing downward. The image covers
//! `[0, width) x [0, height)`; the robot drives forward so plants move toward larger `y`.
pub mod config;
pub mod error;
pub mod geometry;
pub mod measurements;
pub mod motion;
pub mod particle;
pub mod resampling;
pub mod sim;
pub mod sir;
pub mod state;

pub use config::{Bound, BoundPolicy, FilterConfig, MeasurementConfig, ProcessNoise, StateBounds, read_config, write_config};
pub use error::{FilterError, GeometryError};
pub use geometry::{ImageBounds, RowGeometryModel};
pub use measurements::{ImageLikelihood, ImageReduction, LikelihoodModel, PlantImage, PointLikelihood};
pub use motion::{ForwardMotion, MotionKind, MotionModel, RowMotionModel};
pub use particle::{AveragingStrategy, Particle, ParticleFilter};
pub use resampling::ResamplingAlgorithm;
pub use sir::{DegeneracyRule, ImageRowFilter, PointRowFilter, PositionFilter, ResamplingPolicy, SirFilter, SirSettings, UpdateReport, WeightUpdate};
pub use state::{FilterState, PositionState, RowState};
