//! Measurement models mapping a particle state and a measurement to a likelihood.
//!
//! Two strategies are provided:
//!
//! - [`PointLikelihood`]: the measurement is the forward position of the
//!   particular plant and the likelihood is an unnormalized Gaussian,
//!   $\exp(-(x - z)^2 / 2\sigma^2)$.
//! - [`ImageLikelihood`]: the measurement is a binary [`PlantImage`] and the
//!   expected plant pattern comes from [`RowGeometryModel`]. Two reductions are
//!   available, see [`ImageReduction`].
//!
//! Models report log-likelihoods. The filter combines them with the prior
//! weights in log space, which keeps products of many per-plant or per-pixel
//! probabilities representable. A state whose geometry cannot be evaluated gets
//! a log-likelihood of negative infinity, i.e. a zero weight.

use log::debug;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::error::FilterError;
use crate::geometry::RowGeometryModel;
use crate::state::{FilterState, RowState};

/// Measurement likelihood `p(z | x)` for states of type `S`.
pub trait LikelihoodModel<S: FilterState>: Send + Sync {
    type Measurement: Sync;

    /// Natural log of the likelihood. `f64::NEG_INFINITY` marks a state the
    /// model cannot explain at all.
    fn log_likelihood(&self, state: &S, measurement: &Self::Measurement) -> f64;

    /// Likelihood in linear scale.
    fn likelihood(&self, state: &S, measurement: &Self::Measurement) -> f64 {
        self.log_likelihood(state, measurement).exp()
    }
}

/// Gaussian likelihood of a scalar position measurement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointLikelihood {
    std: f64,
}

impl PointLikelihood {
    pub fn new(std: f64) -> Result<Self, FilterError> {
        if !(std > 0.0 && std.is_finite()) {
            return Err(FilterError::InvalidMeasurement(format!(
                "point measurement standard deviation must be positive, got {std}"
            )));
        }
        Ok(PointLikelihood { std })
    }
    pub fn std(&self) -> f64 {
        self.std
    }
}

impl<S: FilterState> LikelihoodModel<S> for PointLikelihood {
    type Measurement = f64;

    fn log_likelihood(&self, state: &S, measurement: &f64) -> f64 {
        let residual = state.position() - measurement;
        -(residual * residual) / (2.0 * self.std * self.std)
    }
}

/// Binary image of plant-coloured pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct PlantImage {
    width: usize,
    height: usize,
    cells: Vec<bool>,
}

impl PlantImage {
    /// An image with no plant pixels.
    pub fn new(width: usize, height: usize) -> Self {
        PlantImage {
            width,
            height,
            cells: vec![false; width * height],
        }
    }
    /// Build an image by evaluating a per-pixel predicate, e.g. a colour
    /// threshold on a camera frame.
    pub fn from_fn<F: FnMut(usize, usize) -> bool>(width: usize, height: usize, mut is_plant: F) -> Self {
        let mut cells = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                cells.push(is_plant(x, y));
            }
        }
        PlantImage { width, height, cells }
    }
    pub fn width(&self) -> usize {
        self.width
    }
    pub fn height(&self) -> usize {
        self.height
    }
    /// Whether pixel `(x, y)` is plant-coloured. Pixels outside the image never are.
    pub fn is_plant(&self, x: i64, y: i64) -> bool {
        self.index(x, y).is_some_and(|i| self.cells[i])
    }
    pub fn set(&mut self, x: i64, y: i64, value: bool) {
        if let Some(i) = self.index(x, y) {
            self.cells[i] = value;
        }
    }
    /// Set every in-image pixel of the square window of side `size` around `center`.
    pub fn fill_window(&mut self, center: Point2<f64>, size: usize) {
        for (x, y) in window(center, size) {
            self.set(x, y, true);
        }
    }
    pub fn count(&self) -> usize {
        self.cells.iter().filter(|&&cell| cell).count()
    }
    fn index(&self, x: i64, y: i64) -> Option<usize> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        Some(y as usize * self.width + x as usize)
    }
}

/// Pixels of the square window of side `size` around `center`. For even sizes
/// the extra column and row fall on the low side.
fn window(center: Point2<f64>, size: usize) -> impl Iterator<Item = (i64, i64)> {
    let half = (size / 2) as i64;
    let x0 = center.x.round() as i64 - half;
    let y0 = center.y.round() as i64 - half;
    let size = size as i64;
    (y0..y0 + size).flat_map(move |y| (x0..x0 + size).map(move |x| (x, y)))
}

/// How per-pixel evidence is reduced to one likelihood.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageReduction {
    /// Product over expected plants. Each plant contributes
    /// `(n_match * p_in + n_other * p_out) / n_total` computed over the in-image
    /// pixels of its window. Pixels away from every expected plant are ignored,
    /// so states predicting fewer plants are not penalized for it.
    #[default]
    PlantWindows,
    /// Product over every image pixel of the Bernoulli term `q^z (1 - q)^(1 - z)`
    /// with `q = p_in` inside any expected plant window and `q = p_out`
    /// elsewhere, `z` being the observed plant bit. Every pixel is evidence.
    FullImage,
}

/// Likelihood of a binary plant image given a row state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImageLikelihood {
    geometry: RowGeometryModel,
    plant_size: usize,
    p_in: f64,
    p_out: f64,
    reduction: ImageReduction,
}

impl ImageLikelihood {
    /// `p_in` is the probability of observing a plant pixel inside an expected
    /// plant window and `p_out` the probability outside of one.
    pub fn new(
        geometry: RowGeometryModel,
        plant_size: usize,
        p_in: f64,
        p_out: f64,
        reduction: ImageReduction,
    ) -> Result<Self, FilterError> {
        if plant_size == 0 {
            return Err(FilterError::InvalidMeasurement(
                "plant window size must be at least one pixel".to_string(),
            ));
        }
        for (name, p) in [("p_in", p_in), ("p_out", p_out)] {
            if !(p > 0.0 && p < 1.0) {
                return Err(FilterError::InvalidMeasurement(format!(
                    "{name} must lie strictly between 0 and 1, got {p}"
                )));
            }
        }
        Ok(ImageLikelihood {
            geometry,
            plant_size,
            p_in,
            p_out,
            reduction,
        })
    }
    pub fn geometry(&self) -> &RowGeometryModel {
        &self.geometry
    }
    pub fn plant_size(&self) -> usize {
        self.plant_size
    }

    /// Log of the product over expected plants of the window match probability.
    pub fn plant_windows_log_likelihood(&self, plants: &[Point2<f64>], image: &PlantImage) -> f64 {
        let mut log_likelihood = 0.0;
        for plant in plants {
            let mut n_match = 0usize;
            let mut n_total = 0usize;
            for (x, y) in window(*plant, self.plant_size) {
                if image.index(x, y).is_none() {
                    continue;
                }
                n_total += 1;
                if image.is_plant(x, y) {
                    n_match += 1;
                }
            }
            if n_total == 0 {
                continue;
            }
            let n_other = n_total - n_match;
            let probability =
                (n_match as f64 * self.p_in + n_other as f64 * self.p_out) / n_total as f64;
            log_likelihood += probability.ln();
        }
        log_likelihood
    }

    /// Log of the product of per-pixel Bernoulli terms over the whole image.
    pub fn full_image_log_likelihood(&self, plants: &[Point2<f64>], image: &PlantImage) -> f64 {
        let mut expected = PlantImage::new(image.width(), image.height());
        for plant in plants {
            expected.fill_window(*plant, self.plant_size);
        }
        let (ln_in, ln_not_in) = (self.p_in.ln(), (1.0 - self.p_in).ln());
        let (ln_out, ln_not_out) = (self.p_out.ln(), (1.0 - self.p_out).ln());
        expected
            .cells
            .iter()
            .zip(&image.cells)
            .map(|(&inside, &observed)| match (inside, observed) {
                (true, true) => ln_in,
                (true, false) => ln_not_in,
                (false, true) => ln_out,
                (false, false) => ln_not_out,
            })
            .sum()
    }
}

impl LikelihoodModel<RowState> for ImageLikelihood {
    type Measurement = PlantImage;

    fn log_likelihood(&self, state: &RowState, image: &PlantImage) -> f64 {
        let plants = match self.geometry.all_plants(state) {
            Ok(plants) => plants,
            Err(err) => {
                debug!("No geometry for {state}: {err}");
                return f64::NEG_INFINITY;
            }
        };
        match self.reduction {
            ImageReduction::PlantWindows => self.plant_windows_log_likelihood(&plants, image),
            ImageReduction::FullImage => self.full_image_log_likelihood(&plants, image),
        }
    }
}
