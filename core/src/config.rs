//! Filter configuration: state bounds, noise levels and the serializable
//! configuration record used to build the row filters.
//!
//! Bounds carry an explicit per-dimension enforcement policy. For the row state
//! the policy is fixed as follows:
//!
//! | dimension     | policy |
//! |---------------|--------|
//! | offset        | clamp  |
//! | position      | wrap   |
//! | inter_plant   | clamp  |
//! | inter_row     | clamp  |
//! | skew          | clamp  |
//! | convergence   | clamp  |
//!
//! Position wraps because plants keep entering at the top of the image while
//! the tracked one leaves at the bottom; all other fields are physical
//! quantities with hard admissible ranges.
//!
//! A [`FilterConfig`] can be read from and written to JSON, YAML or TOML; the
//! format is picked from the file extension.

use std::fs;
use std::path::Path;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::FilterError;
use crate::geometry::{ImageBounds, RowGeometryModel};
use crate::measurements::{ImageLikelihood, ImageReduction, PointLikelihood};
use crate::motion::{MotionKind, RowMotionModel};
use crate::particle::AveragingStrategy;
use crate::resampling::ResamplingAlgorithm;
use crate::sir::{DegeneracyRule, ImageRowFilter, PointRowFilter, ResamplingPolicy, SirFilter, SirSettings, WeightUpdate};
use crate::state::{FilterState, RowState};

/// How a bound is enforced when a propagated value leaves it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundPolicy {
    /// Saturate at the nearest limit.
    #[default]
    Clamp,
    /// Treat `[min, max)` as a periodic domain.
    Wrap,
    /// Leave the value untouched; the bound only drives initial sampling.
    Free,
}

/// Closed admissible interval for one state dimension.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub policy: BoundPolicy,
}

impl Bound {
    /// A clamping bound.
    pub fn new(min: f64, max: f64) -> Self {
        Bound {
            min,
            max,
            policy: BoundPolicy::Clamp,
        }
    }
    /// A cyclic bound.
    pub fn wrapping(min: f64, max: f64) -> Self {
        Bound {
            min,
            max,
            policy: BoundPolicy::Wrap,
        }
    }
    pub fn with_policy(self, policy: BoundPolicy) -> Self {
        Bound { policy, ..self }
    }
    pub fn width(&self) -> f64 {
        self.max - self.min
    }
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
    /// Apply the bound policy to a single value.
    pub fn enforce(&self, value: f64) -> f64 {
        match self.policy {
            BoundPolicy::Clamp => value.clamp(self.min, self.max),
            BoundPolicy::Wrap => self.min + (value - self.min).rem_euclid(self.width()),
            BoundPolicy::Free => value,
        }
    }
    fn validate(&self, dimension: &str) -> Result<(), FilterError> {
        let degenerate_wrap = self.policy == BoundPolicy::Wrap && self.min >= self.max;
        if !self.min.is_finite() || !self.max.is_finite() || self.min > self.max || degenerate_wrap {
            return Err(FilterError::InvalidBound {
                dimension: dimension.to_string(),
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

/// Per-dimension bounds of a state space, in state vector order.
#[derive(Clone, Debug, PartialEq)]
pub struct StateBounds {
    bounds: Vec<Bound>,
}

impl StateBounds {
    pub fn new(bounds: Vec<Bound>) -> Self {
        StateBounds { bounds }
    }
    pub fn dim(&self) -> usize {
        self.bounds.len()
    }
    pub fn get(&self, index: usize) -> &Bound {
        &self.bounds[index]
    }
    pub fn iter(&self) -> impl Iterator<Item = &Bound> {
        self.bounds.iter()
    }
    /// Check that the bounds match the state layout and are well formed.
    pub fn validate<S: FilterState>(&self) -> Result<(), FilterError> {
        if self.bounds.len() != S::DIM {
            return Err(FilterError::DimensionMismatch {
                expected: S::DIM,
                actual: self.bounds.len(),
            });
        }
        for (bound, label) in self.bounds.iter().zip(S::LABELS) {
            bound.validate(label)?;
        }
        Ok(())
    }
    /// Enforce every dimension's policy on a state.
    pub fn enforce<S: FilterState>(&self, state: &S) -> S {
        let mut vector = state.to_vector();
        for (value, bound) in vector.iter_mut().zip(&self.bounds) {
            *value = bound.enforce(*value);
        }
        S::from_vector(&vector)
    }
    pub fn contains<S: FilterState>(&self, state: &S) -> bool {
        state
            .to_vector()
            .iter()
            .zip(&self.bounds)
            .all(|(value, bound)| bound.contains(*value))
    }
    /// Reject a state with any component outside its bound.
    pub fn check<S: FilterState>(&self, state: &S) -> Result<(), FilterError> {
        let vector = state.to_vector();
        for ((value, bound), label) in vector.iter().zip(&self.bounds).zip(S::LABELS) {
            if !bound.contains(*value) {
                return Err(FilterError::StateOutOfBounds {
                    dimension: label.to_string(),
                    value: *value,
                    min: bound.min,
                    max: bound.max,
                });
            }
        }
        Ok(())
    }
    /// Draw a state uniformly from the bounded box, each dimension independently.
    pub fn sample_uniform<S: FilterState, R: Rng + ?Sized>(&self, rng: &mut R) -> S {
        let values: Vec<f64> = self
            .bounds
            .iter()
            .map(|bound| rng.random_range(bound.min..=bound.max))
            .collect();
        S::from_vector(&nalgebra::DVector::from_vec(values))
    }
}

/// Process noise standard deviations, one per state dimension.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessNoise {
    std: Vec<f64>,
}

impl ProcessNoise {
    pub fn new(std: Vec<f64>) -> Self {
        ProcessNoise { std }
    }
    /// All-zero noise for a state of the given dimension.
    pub fn zeros(dim: usize) -> Self {
        ProcessNoise { std: vec![0.0; dim] }
    }
    pub fn std(&self, index: usize) -> f64 {
        self.std[index]
    }
    pub fn as_slice(&self) -> &[f64] {
        &self.std
    }
    pub fn validate<S: FilterState>(&self) -> Result<(), FilterError> {
        if self.std.len() != S::DIM {
            return Err(FilterError::DimensionMismatch {
                expected: S::DIM,
                actual: self.std.len(),
            });
        }
        for (value, label) in self.std.iter().zip(S::LABELS) {
            if !value.is_finite() || *value < 0.0 {
                return Err(FilterError::InvalidNoise {
                    dimension: label.to_string(),
                    value: *value,
                });
            }
        }
        Ok(())
    }
}

/// Named bounds for the six row parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowBounds {
    pub offset: Bound,
    pub position: Bound,
    pub inter_plant: Bound,
    pub inter_row: Bound,
    pub skew: Bound,
    pub convergence: Bound,
}

impl RowBounds {
    /// Bounds covering a `width` x `height` image with the default policies.
    pub fn for_world(world: &ImageBounds) -> Self {
        RowBounds {
            offset: Bound::new(0.0, world.width),
            position: Bound::wrapping(0.0, world.height),
            inter_plant: Bound::new(60.0, 140.0),
            inter_row: Bound::new(60.0, 140.0),
            skew: Bound::new(-0.2, 0.2),
            convergence: Bound::new(0.2, 0.8),
        }
    }
}

impl From<RowBounds> for StateBounds {
    fn from(bounds: RowBounds) -> Self {
        StateBounds::new(vec![
            bounds.offset,
            bounds.position,
            bounds.inter_plant,
            bounds.inter_row,
            bounds.skew,
            bounds.convergence,
        ])
    }
}

/// Named process noise standard deviations for the six row parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowNoise {
    pub offset: f64,
    pub position: f64,
    pub inter_plant: f64,
    pub inter_row: f64,
    pub skew: f64,
    pub convergence: f64,
}

impl Default for RowNoise {
    fn default() -> Self {
        RowNoise {
            offset: 2.0,
            position: 2.0,
            inter_plant: 1.0,
            inter_row: 1.0,
            skew: 0.005,
            convergence: 0.005,
        }
    }
}

impl From<RowNoise> for ProcessNoise {
    fn from(noise: RowNoise) -> Self {
        ProcessNoise::new(vec![
            noise.offset,
            noise.position,
            noise.inter_plant,
            noise.inter_row,
            noise.skew,
            noise.convergence,
        ])
    }
}

/// Measurement model selection and parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum MeasurementConfig {
    /// Scalar position measurement with Gaussian noise.
    Point { std: f64 },
    /// Binary plant image compared against the projected plant pattern.
    Image {
        p_in: f64,
        p_out: f64,
        plant_size: usize,
        #[serde(default)]
        reduction: ImageReduction,
    },
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        MeasurementConfig::Point { std: 7.0 }
    }
}

fn default_min_inter_plant_pixels() -> f64 {
    4.0
}

fn default_seed() -> u64 {
    42
}

/// Complete configuration of a row-geometry SIR filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub num_particles: usize,
    pub world: ImageBounds,
    pub bounds: RowBounds,
    #[serde(default)]
    pub process_noise: RowNoise,
    #[serde(default)]
    pub measurement: MeasurementConfig,
    #[serde(default)]
    pub resampling: ResamplingAlgorithm,
    #[serde(default)]
    pub resampling_policy: ResamplingPolicy,
    #[serde(default)]
    pub weight_update: WeightUpdate,
    #[serde(default)]
    pub degeneracy: DegeneracyRule,
    #[serde(default)]
    pub averaging: AveragingStrategy,
    #[serde(default)]
    pub motion: MotionKind,
    /// Smallest projected inter-plant distance still walked along a row.
    #[serde(default = "default_min_inter_plant_pixels")]
    pub min_inter_plant_pixels: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub parallel: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        let world = ImageBounds::new(500.0, 700.0);
        FilterConfig {
            num_particles: 500,
            world,
            bounds: RowBounds::for_world(&world),
            process_noise: RowNoise::default(),
            measurement: MeasurementConfig::default(),
            resampling: ResamplingAlgorithm::default(),
            resampling_policy: ResamplingPolicy::default(),
            weight_update: WeightUpdate::default(),
            degeneracy: DegeneracyRule::default(),
            averaging: AveragingStrategy::default(),
            motion: MotionKind::default(),
            min_inter_plant_pixels: default_min_inter_plant_pixels(),
            seed: default_seed(),
            parallel: false,
        }
    }
}

impl FilterConfig {
    /// Validate the whole record. Every filter builder calls this first.
    pub fn validate(&self) -> Result<(), FilterError> {
        if self.num_particles < 1 {
            return Err(FilterError::NoParticles(self.num_particles));
        }
        if !(self.world.width > 0.0 && self.world.height > 0.0)
            || !self.world.width.is_finite()
            || !self.world.height.is_finite()
        {
            return Err(FilterError::InvalidWorld {
                width: self.world.width,
                height: self.world.height,
            });
        }
        self.state_bounds().validate::<RowState>()?;
        self.noise().validate::<RowState>()?;
        if !(self.min_inter_plant_pixels > 0.0 && self.min_inter_plant_pixels.is_finite()) {
            return Err(FilterError::InvalidMeasurement(format!(
                "min_inter_plant_pixels must be positive, got {}",
                self.min_inter_plant_pixels
            )));
        }
        if let ResamplingPolicy::EffectiveSampleSize { threshold } = self.resampling_policy
            && !(0.0..=1.0).contains(&threshold)
        {
            return Err(FilterError::InvalidMeasurement(format!(
                "effective sample size threshold must lie in [0, 1], got {threshold}"
            )));
        }
        match self.measurement {
            MeasurementConfig::Point { std } => PointLikelihood::new(std).map(|_| ()),
            MeasurementConfig::Image {
                p_in,
                p_out,
                plant_size,
                reduction,
            } => ImageLikelihood::new(self.geometry(), plant_size, p_in, p_out, reduction).map(|_| ()),
        }
    }

    pub fn state_bounds(&self) -> StateBounds {
        self.bounds.into()
    }

    pub fn noise(&self) -> ProcessNoise {
        self.process_noise.into()
    }

    pub fn geometry(&self) -> RowGeometryModel {
        RowGeometryModel::new(self.world, self.min_inter_plant_pixels)
    }

    pub fn settings(&self) -> SirSettings {
        SirSettings {
            resampling: self.resampling,
            policy: self.resampling_policy,
            weight_update: self.weight_update,
            degeneracy: self.degeneracy,
            averaging: self.averaging,
            parallel: self.parallel,
            seed: self.seed,
        }
    }

    fn motion_model(&self) -> Result<RowMotionModel, FilterError> {
        RowMotionModel::new(self.motion, &self.noise(), self.bounds.position.max)
    }

    /// Build a filter driven by scalar position measurements.
    pub fn point_filter(&self) -> Result<PointRowFilter, FilterError> {
        self.validate()?;
        let MeasurementConfig::Point { std } = self.measurement else {
            return Err(FilterError::InvalidMeasurement(
                "configuration describes an image measurement, not a point measurement".to_string(),
            ));
        };
        SirFilter::new(
            self.num_particles,
            self.state_bounds(),
            self.motion_model()?,
            PointLikelihood::new(std)?,
            self.settings(),
        )
    }

    /// Build a filter driven by binary plant images.
    pub fn image_filter(&self) -> Result<ImageRowFilter, FilterError> {
        self.validate()?;
        let MeasurementConfig::Image {
            p_in,
            p_out,
            plant_size,
            reduction,
        } = self.measurement
        else {
            return Err(FilterError::InvalidMeasurement(
                "configuration describes a point measurement, not an image measurement".to_string(),
            ));
        };
        SirFilter::new(
            self.num_particles,
            self.state_bounds(),
            self.motion_model()?,
            ImageLikelihood::new(self.geometry(), plant_size, p_in, p_out, reduction)?,
            self.settings(),
        )
    }

    /// Write the configuration; the format follows the file extension.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), FilterError> {
        write_config(self, path)
    }
    /// Read a configuration; the format follows the file extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, FilterError> {
        read_config(path)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    fn of(path: &Path) -> Result<Self, FilterError> {
        match extension(path).as_deref() {
            Some("json") => Ok(ConfigFormat::Json),
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            _ => Err(FilterError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Serialize `value` to JSON (pretty-printed), YAML or TOML, chosen by the
/// extension of `path` (`.json`, `.yaml`/`.yml`, `.toml`).
pub fn write_config<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> Result<(), FilterError> {
    let path = path.as_ref();
    let text = match ConfigFormat::of(path)? {
        ConfigFormat::Json => serde_json::to_string_pretty(value).map_err(|e| e.to_string()),
        ConfigFormat::Yaml => serde_yaml::to_string(value).map_err(|e| e.to_string()),
        ConfigFormat::Toml => toml::to_string(value).map_err(|e| e.to_string()),
    }
    .map_err(|message| FilterError::Format {
        path: path.to_path_buf(),
        message,
    })?;
    fs::write(path, text)?;
    Ok(())
}

/// Counterpart of [`write_config`].
pub fn read_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T, FilterError> {
    let path = path.as_ref();
    let format = ConfigFormat::of(path)?;
    let text = fs::read_to_string(path)?;
    match format {
        ConfigFormat::Json => serde_json::from_str(&text).map_err(|e| e.to_string()),
        ConfigFormat::Yaml => serde_yaml::from_str(&text).map_err(|e| e.to_string()),
        ConfigFormat::Toml => toml::from_str(&text).map_err(|e| e.to_string()),
    }
    .map_err(|message| FilterError::Format {
        path: path.to_path_buf(),
        message,
    })
}

pub(crate) fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PositionState;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn clamp_saturates_at_limits() {
        let bound = Bound::new(0.0, 10.0);
        assert_eq!(bound.enforce(-3.0), 0.0);
        assert_eq!(bound.enforce(12.0), 10.0);
        assert_eq!(bound.enforce(4.5), 4.5);
    }

    #[test]
    fn wrap_is_cyclic() {
        let bound = Bound::wrapping(0.0, 700.0);
        assert_approx_eq!(bound.enforce(-10.0), 690.0, 1e-9);
        assert_approx_eq!(bound.enforce(710.0), 10.0, 1e-9);
        assert_approx_eq!(bound.enforce(-1410.0), 690.0, 1e-9);
        assert_approx_eq!(bound.enforce(350.0), 350.0, 1e-9);
    }

    #[test]
    fn free_leaves_value() {
        let bound = Bound::new(0.0, 1.0).with_policy(BoundPolicy::Free);
        assert_eq!(bound.enforce(5.0), 5.0);
    }

    #[test]
    fn inverted_bound_is_rejected() {
        let bounds = StateBounds::new(vec![Bound::new(5.0, 1.0)]);
        assert!(matches!(
            bounds.validate::<PositionState>(),
            Err(FilterError::InvalidBound { .. })
        ));
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let bounds = StateBounds::new(vec![Bound::new(0.0, 1.0); 2]);
        assert!(matches!(
            bounds.validate::<RowState>(),
            Err(FilterError::DimensionMismatch {
                expected: 6,
                actual: 2
            })
        ));
    }

    #[test]
    fn uniform_samples_stay_in_bounds() {
        let config = FilterConfig::default();
        let bounds = config.state_bounds();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let state: RowState = bounds.sample_uniform(&mut rng);
            assert!(bounds.contains(&state));
        }
    }

    #[test]
    fn check_reports_offending_dimension() {
        let bounds = FilterConfig::default().state_bounds();
        let state = RowState::new(250.0, 900.0, 80.0, 110.0, 0.0, 0.5);
        match bounds.check(&state) {
            Err(FilterError::StateOutOfBounds { dimension, .. }) => assert_eq!(dimension, "position"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(FilterConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_particles_is_fatal() {
        let config = FilterConfig {
            num_particles: 0,
            ..FilterConfig::default()
        };
        assert!(matches!(config.validate(), Err(FilterError::NoParticles(0))));
        assert!(config.point_filter().is_err());
    }

    #[test]
    fn negative_noise_is_fatal() {
        let mut config = FilterConfig::default();
        config.process_noise.skew = -1.0;
        assert!(matches!(config.validate(), Err(FilterError::InvalidNoise { .. })));
    }

    #[test]
    fn measurement_kind_must_match_builder() {
        let config = FilterConfig::default();
        assert!(config.point_filter().is_ok());
        assert!(matches!(
            config.image_filter(),
            Err(FilterError::InvalidMeasurement(_))
        ));
    }

    #[test]
    fn config_round_trips_through_every_format() {
        let config = FilterConfig {
            measurement: MeasurementConfig::Image {
                p_in: 0.9,
                p_out: 0.1,
                plant_size: 9,
                reduction: ImageReduction::FullImage,
            },
            ..FilterConfig::default()
        };
        let dir = std::env::temp_dir().join(format!("croprow-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["filter.json", "filter.yaml", "filter.toml"] {
            let path = dir.join(name);
            config.to_file(&path).unwrap();
            let loaded = FilterConfig::from_file(&path).unwrap();
            assert_eq!(loaded, config, "format {name}");
        }
        assert!(matches!(
            FilterConfig::from_file(dir.join("filter.ini")),
            Err(FilterError::UnsupportedFormat(_))
        ));
        std::fs::write(dir.join("broken.toml"), "num_particles = [").unwrap();
        assert!(matches!(
            FilterConfig::from_file(dir.join("broken.toml")),
            Err(FilterError::Format { .. })
        ));
        assert!(matches!(
            FilterConfig::from_file(dir.join("missing.json")),
            Err(FilterError::Io(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
