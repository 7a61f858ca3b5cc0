//! Simulated crop-row scene and the tracking loop used by the `croprow` binary
//! and the integration tests.
//!
//! This module provides:
//! - [`RowScene`]: a ground-truth row state that moves down the image, with
//!   noisy position measurements and rendered binary plant images
//! - [`SimulationConfig`]: filter and scene settings, loadable from JSON, YAML or TOML
//! - [`run_simulation`]: steps a scene and a filter together
//! - [`StepRecord`]: one CSV row of truth, estimate and filter diagnostics

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::{FilterConfig, MeasurementConfig, read_config, write_config};
use crate::error::FilterError;
use crate::geometry::RowGeometryModel;
use crate::measurements::{LikelihoodModel, PlantImage};
use crate::motion::RowMotionModel;
use crate::sir::{SirFilter, UpdateReport};
use crate::state::RowState;

/// Ground truth and noise levels of the simulated scene.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    /// True row geometry at the first step.
    pub initial: RowState,
    /// Commanded forward distance per step, in pixels.
    pub commanded_motion: f64,
    /// Standard deviation of the actual motion around the command.
    pub motion_std: f64,
    /// Standard deviation of the scalar position measurement.
    pub measurement_std: f64,
    /// Side of the square drawn around each plant in rendered images.
    pub plant_size: usize,
}

impl Default for SceneConfig {
    fn default() -> Self {
        SceneConfig {
            initial: RowState::new(250.0, 300.0, 80.0, 110.0, 0.0, 0.5),
            commanded_motion: 11.0,
            motion_std: 1.0,
            measurement_std: 2.0,
            plant_size: 9,
        }
    }
}

/// A row field seen by a forward-moving camera.
#[derive(Clone, Debug)]
pub struct RowScene {
    truth: RowState,
    config: SceneConfig,
    geometry: RowGeometryModel,
    motion_noise: Normal<f64>,
    measurement_noise: Normal<f64>,
    rng: StdRng,
}

impl SceneConfig {
    /// The tracked plant must start inside the image and the row must have a
    /// positive plant spacing, otherwise [`RowScene::advance`] cannot hand
    /// over to the next plant.
    pub fn validate(&self, height: f64) -> Result<(), FilterError> {
        let initial = &self.initial;
        let fields = [
            initial.offset,
            initial.position,
            initial.inter_plant,
            initial.inter_row,
            initial.skew,
            initial.convergence,
            self.commanded_motion,
        ];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(FilterError::InvalidScene(format!("non-finite scene value in {self:?}")));
        }
        if initial.inter_plant <= 0.0 || initial.inter_row <= 0.0 {
            return Err(FilterError::InvalidScene(format!(
                "plant spacing must be positive, got inter_plant {} and inter_row {}",
                initial.inter_plant, initial.inter_row
            )));
        }
        if !(0.0..height).contains(&initial.position) {
            return Err(FilterError::InvalidScene(format!(
                "tracked plant at {} lies outside [0, {height})",
                initial.position
            )));
        }
        Ok(())
    }
}

impl RowScene {
    pub fn new(config: SceneConfig, geometry: RowGeometryModel, seed: u64) -> Result<Self, FilterError> {
        config.validate(geometry.bounds.height)?;
        let noise = |std: f64, dimension: &str| {
            Normal::new(0.0, std).map_err(|_| FilterError::InvalidNoise {
                dimension: dimension.to_string(),
                value: std,
            })
        };
        Ok(RowScene {
            truth: config.initial,
            config,
            geometry,
            motion_noise: noise(config.motion_std, "scene motion")?,
            measurement_noise: noise(config.measurement_std, "scene measurement")?,
            rng: StdRng::seed_from_u64(seed),
        })
    }
    pub fn truth(&self) -> &RowState {
        &self.truth
    }
    pub fn commanded_motion(&self) -> f64 {
        self.config.commanded_motion
    }
    /// Move the plants down by the commanded distance plus noise. Once the
    /// tracked plant leaves the bottom of the image the next plant of the row
    /// becomes the tracked one. Returns the distance actually travelled.
    pub fn advance(&mut self) -> f64 {
        let travelled = self.config.commanded_motion + self.motion_noise.sample(&mut self.rng);
        self.truth.position += travelled;
        while self.truth.position >= self.geometry.bounds.height {
            self.truth.position -= self.truth.inter_plant;
        }
        while self.truth.position < 0.0 {
            self.truth.position += self.truth.inter_plant;
        }
        travelled
    }
    /// Noisy image row of the tracked plant.
    pub fn measure_position(&mut self) -> f64 {
        self.truth.position + self.measurement_noise.sample(&mut self.rng)
    }
    /// Binary image with a square window drawn around every true plant.
    pub fn render(&self) -> Result<PlantImage, FilterError> {
        let bounds = self.geometry.bounds;
        let mut image = PlantImage::new(bounds.width as usize, bounds.height as usize);
        for plant in self.geometry.all_plants(&self.truth)? {
            image.fill_window(plant, self.config.plant_size);
        }
        Ok(image)
    }
}

/// Everything needed for one simulation run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub scene: SceneConfig,
    #[serde(default = "default_steps")]
    pub steps: usize,
    /// CSV file receiving one [`StepRecord`] per step.
    #[serde(default)]
    pub output: Option<PathBuf>,
}

fn default_steps() -> usize {
    70
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            filter: FilterConfig::default(),
            scene: SceneConfig::default(),
            steps: default_steps(),
            output: None,
        }
    }
}

impl SimulationConfig {
    /// Write by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), FilterError> {
        write_config(self, path)
    }
    /// Read by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, FilterError> {
        read_config(path)
    }
}

/// Truth, estimate and diagnostics of one simulation step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub true_offset: f64,
    pub true_position: f64,
    pub true_inter_plant: f64,
    pub true_inter_row: f64,
    pub true_skew: f64,
    pub true_convergence: f64,
    /// Scalar measurement fed to the filter; empty for image measurements.
    pub measured_position: Option<f64>,
    pub est_offset: f64,
    pub est_position: f64,
    pub est_inter_plant: f64,
    pub est_inter_row: f64,
    pub est_skew: f64,
    pub est_convergence: f64,
    pub max_weight: f64,
    pub effective_sample_size: f64,
    pub rejected: usize,
    pub degenerate: bool,
    pub resampled: bool,
}

impl StepRecord {
    pub fn new(
        step: usize,
        truth: &RowState,
        measured_position: Option<f64>,
        estimate: &RowState,
        report: &UpdateReport,
    ) -> Self {
        StepRecord {
            step,
            true_offset: truth.offset,
            true_position: truth.position,
            true_inter_plant: truth.inter_plant,
            true_inter_row: truth.inter_row,
            true_skew: truth.skew,
            true_convergence: truth.convergence,
            measured_position,
            est_offset: estimate.offset,
            est_position: estimate.position,
            est_inter_plant: estimate.inter_plant,
            est_inter_row: estimate.inter_row,
            est_skew: estimate.skew,
            est_convergence: estimate.convergence,
            max_weight: report.max_weight_before_resampling,
            effective_sample_size: report.effective_sample_size,
            rejected: report.rejected,
            degenerate: report.degenerate,
            resampled: report.resampled,
        }
    }
    /// Absolute error of the estimated tracked-plant position.
    pub fn position_error(&self) -> f64 {
        (self.est_position - self.true_position).abs()
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    pub fn from_csv<P: AsRef<Path>>(path: P) -> io::Result<Vec<Self>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in reader.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Step a scene and the configured filter together for `config.steps` steps.
///
/// The filter kind follows `config.filter.measurement`: point filters receive
/// the noisy tracked-plant position, image filters the rendered plant image.
pub fn run_simulation(config: &SimulationConfig) -> Result<Vec<StepRecord>, FilterError> {
    let geometry = config.filter.geometry();
    let mut scene = RowScene::new(config.scene, geometry, config.filter.seed.wrapping_add(1))?;
    info!(
        "Simulating {} steps with {} particles ({:?} measurements)",
        config.steps, config.filter.num_particles, config.filter.measurement
    );
    match config.filter.measurement {
        MeasurementConfig::Point { .. } => {
            let mut filter = config.filter.point_filter()?;
            track(&mut filter, &mut scene, config.steps, |scene| {
                let z = scene.measure_position();
                Ok((z, Some(z)))
            })
        }
        MeasurementConfig::Image { .. } => {
            let mut filter = config.filter.image_filter()?;
            track(&mut filter, &mut scene, config.steps, |scene| Ok((scene.render()?, None)))
        }
    }
}

fn track<L, F>(
    filter: &mut SirFilter<RowState, RowMotionModel, L>,
    scene: &mut RowScene,
    steps: usize,
    mut measure: F,
) -> Result<Vec<StepRecord>, FilterError>
where
    L: LikelihoodModel<RowState>,
    F: FnMut(&mut RowScene) -> Result<(L::Measurement, Option<f64>), FilterError>,
{
    let mut records = Vec::with_capacity(steps);
    for step in 0..steps {
        scene.advance();
        let (measurement, measured_position) = measure(scene)?;
        let report = filter.update(scene.commanded_motion(), &measurement);
        let estimate = filter.estimate();
        let record = StepRecord::new(step, scene.truth(), measured_position, &estimate, &report);
        debug!(
            "step {step}: true position {:.1}, estimate {:.1}, max weight {:.3}",
            record.true_position, record.est_position, record.max_weight
        );
        records.push(record);
    }
    Ok(records)
}
