//! Motion (propagation) models.
//!
//! The robot drives along the rows, so in image space the particular plant
//! moves down by the commanded distance each step. All other parameters are
//! modelled as random walks with the configured process noise.
//!
//! When the particular plant would leave the bottom of the image the particle
//! is reflected back instead of clamped: the next plant of the row takes its
//! place. Bounds are enforced by the filter after propagation.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::ProcessNoise;
use crate::error::FilterError;
use crate::state::{CONVERGENCE, FilterState, INTER_PLANT, INTER_ROW, OFFSET, POSITION, PositionState, RowState, SKEW};

/// Propagation of a single particle state by a commanded forward distance.
pub trait MotionModel<S: FilterState>: Send + Sync {
    fn propagate<R: Rng + ?Sized>(&self, state: &S, motion: f64, rng: &mut R) -> S;
}

/// Coupling between forward motion and lateral offset for [`RowMotionModel`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionKind {
    /// Offset is a pure random walk; only position moves with the command.
    #[default]
    Straight,
    /// Motion follows the skewed row direction: position advances by
    /// `cos(skew)` and offset drifts by `-sin(skew)` of the travelled distance.
    Skewed,
}

fn zero_mean(std: f64, dimension: &str) -> Result<Normal<f64>, FilterError> {
    Normal::new(0.0, std).map_err(|_| FilterError::InvalidNoise {
        dimension: dimension.to_string(),
        value: std,
    })
}

/// Forward position after a noisy move, reflected back below `position_max`.
///
/// A move that ends at or past `position_max` goes back by the travelled
/// distance plus the overshoot instead.
pub fn reflect_forward(position: f64, noisy_motion: f64, position_max: f64) -> f64 {
    let moved = position + noisy_motion;
    if moved >= position_max {
        position - (noisy_motion + (moved - position_max))
    } else {
        moved
    }
}

/// Motion model of the six-parameter row state.
#[derive(Clone, Debug)]
pub struct RowMotionModel {
    kind: MotionKind,
    noise: Vec<Normal<f64>>,
    position_max: f64,
}

impl RowMotionModel {
    pub fn new(kind: MotionKind, noise: &ProcessNoise, position_max: f64) -> Result<Self, FilterError> {
        noise.validate::<RowState>()?;
        let noise = noise
            .as_slice()
            .iter()
            .zip(RowState::LABELS)
            .map(|(std, label)| zero_mean(*std, label))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RowMotionModel {
            kind,
            noise,
            position_max,
        })
    }
    pub fn kind(&self) -> MotionKind {
        self.kind
    }
    fn walk<R: Rng + ?Sized>(&self, value: f64, index: usize, rng: &mut R) -> f64 {
        value + self.noise[index].sample(rng)
    }
}

impl MotionModel<RowState> for RowMotionModel {
    fn propagate<R: Rng + ?Sized>(&self, state: &RowState, motion: f64, rng: &mut R) -> RowState {
        let mut propagated = RowState {
            offset: self.walk(state.offset, OFFSET, rng),
            position: state.position,
            inter_plant: self.walk(state.inter_plant, INTER_PLANT, rng),
            inter_row: self.walk(state.inter_row, INTER_ROW, rng),
            skew: self.walk(state.skew, SKEW, rng),
            convergence: self.walk(state.convergence, CONVERGENCE, rng),
        };
        let noisy_motion = motion + self.noise[POSITION].sample(rng);

        match self.kind {
            MotionKind::Straight => {
                propagated.position = reflect_forward(state.position, noisy_motion, self.position_max);
            }
            MotionKind::Skewed => {
                let (sin, cos) = state.skew.sin_cos();
                propagated.offset -= noisy_motion * sin;
                propagated.position = state.position + noisy_motion * cos;
                if propagated.position > self.position_max {
                    // Step back to the previous plant of the same row.
                    let step = state.inter_plant + self.noise[POSITION].sample(rng);
                    let (sin, cos) = propagated.skew.sin_cos();
                    propagated.offset = state.offset + step * sin;
                    propagated.position = state.position - step * cos;
                }
            }
        }
        propagated
    }
}

/// Motion model of the position-only state.
#[derive(Clone, Debug)]
pub struct ForwardMotion {
    noise: Normal<f64>,
    position_max: f64,
}

impl ForwardMotion {
    pub fn new(std: f64, position_max: f64) -> Result<Self, FilterError> {
        if !std.is_finite() || std < 0.0 {
            return Err(FilterError::InvalidNoise {
                dimension: "position".to_string(),
                value: std,
            });
        }
        Ok(ForwardMotion {
            noise: zero_mean(std, "position")?,
            position_max,
        })
    }
}

impl MotionModel<PositionState> for ForwardMotion {
    fn propagate<R: Rng + ?Sized>(&self, state: &PositionState, motion: f64, rng: &mut R) -> PositionState {
        let noisy_motion = motion + self.noise.sample(rng);
        PositionState::new(reflect_forward(state.position, noisy_motion, self.position_max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RowBounds, StateBounds};
    use crate::geometry::ImageBounds;
    use crate::particle::ParticleFilter;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn state() -> RowState {
        RowState::new(250.0, 300.0, 80.0, 110.0, 0.1, 0.5)
    }

    #[test]
    fn zero_noise_zero_motion_is_identity() {
        let mut rng = StdRng::seed_from_u64(1);
        for kind in [MotionKind::Straight, MotionKind::Skewed] {
            let model = RowMotionModel::new(kind, &ProcessNoise::zeros(6), 700.0).unwrap();
            assert_eq!(model.propagate(&state(), 0.0, &mut rng), state());
        }
        let forward = ForwardMotion::new(0.0, 700.0).unwrap();
        let position = PositionState::new(123.0);
        assert_eq!(forward.propagate(&position, 0.0, &mut rng), position);
    }

    #[test]
    fn straight_motion_moves_position_only() {
        let mut rng = StdRng::seed_from_u64(2);
        let model = RowMotionModel::new(MotionKind::Straight, &ProcessNoise::zeros(6), 700.0).unwrap();
        let moved = model.propagate(&state(), 11.0, &mut rng);
        assert_eq!(moved, RowState { position: 311.0, ..state() });
    }

    #[test]
    fn overshoot_is_reflected() {
        assert_eq!(reflect_forward(690.0, 20.0, 700.0), 660.0);
        assert_eq!(reflect_forward(690.0, 10.0, 700.0), 680.0);
        assert_eq!(reflect_forward(600.0, 20.0, 700.0), 620.0);
    }

    #[test]
    fn skewed_motion_follows_the_row() {
        let mut rng = StdRng::seed_from_u64(3);
        let model = RowMotionModel::new(MotionKind::Skewed, &ProcessNoise::zeros(6), 700.0).unwrap();
        let moved = model.propagate(&state(), 10.0, &mut rng);
        assert_approx_eq!(moved.position, 300.0 + 10.0 * 0.1f64.cos(), 1e-12);
        assert_approx_eq!(moved.offset, 250.0 - 10.0 * 0.1f64.sin(), 1e-12);
    }

    #[test]
    fn skewed_overshoot_steps_back_one_plant() {
        let mut rng = StdRng::seed_from_u64(4);
        let model = RowMotionModel::new(MotionKind::Skewed, &ProcessNoise::zeros(6), 700.0).unwrap();
        let near_bottom = RowState { position: 695.0, ..state() };
        let moved = model.propagate(&near_bottom, 10.0, &mut rng);
        assert_approx_eq!(moved.position, 695.0 - 80.0 * 0.1f64.cos(), 1e-12);
        assert_approx_eq!(moved.offset, 250.0 + 80.0 * 0.1f64.sin(), 1e-12);
    }

    #[test]
    fn noise_spreads_random_walk_dimensions() {
        let mut rng = StdRng::seed_from_u64(5);
        let model = RowMotionModel::new(MotionKind::Straight, &ProcessNoise::new(vec![2.0, 0.0, 1.0, 1.0, 0.01, 0.01]), 700.0)
            .unwrap();
        let samples: Vec<RowState> = (0..2000).map(|_| model.propagate(&state(), 0.0, &mut rng)).collect();
        let mean_offset = samples.iter().map(|s| s.offset).sum::<f64>() / samples.len() as f64;
        let var_offset = samples.iter().map(|s| (s.offset - mean_offset).powi(2)).sum::<f64>() / samples.len() as f64;
        assert_approx_eq!(mean_offset, 250.0, 0.2);
        assert_approx_eq!(var_offset.sqrt(), 2.0, 0.15);
        assert!(samples.iter().all(|s| s.position == 300.0));
    }

    #[test]
    fn validated_propagation_stays_in_bounds_under_heavy_noise() {
        let world = ImageBounds::new(500.0, 700.0);
        let bounds: StateBounds = RowBounds::for_world(&world).into();
        let filter = ParticleFilter::<RowState>::new(200, bounds.clone(), 11).unwrap();
        let noise = ProcessNoise::new(vec![50.0, 50.0, 50.0, 50.0, 1.0, 1.0]);
        let mut rng = StdRng::seed_from_u64(6);
        for kind in [MotionKind::Straight, MotionKind::Skewed] {
            let model = RowMotionModel::new(kind, &noise, world.height).unwrap();
            for particle in filter.particles() {
                let mut state = particle.state;
                for _ in 0..25 {
                    let propagated = model.propagate(&state, 11.0, &mut rng);
                    state = filter.validate_state(&propagated);
                    assert!(bounds.contains(&state), "{kind:?} left the bounds: {state}");
                }
            }
        }
    }

    #[test]
    fn invalid_noise_is_rejected() {
        assert!(ForwardMotion::new(-1.0, 700.0).is_err());
        assert!(RowMotionModel::new(MotionKind::Straight, &ProcessNoise::zeros(3), 700.0).is_err());
    }
}
