//! Particle storage and the state-independent half of the particle filter:
//! uniform initialization, bounds enforcement, weight normalization and the
//! estimates derived from a weighted particle set.
use crate::config::StateBounds;
use crate::error::FilterError;
use crate::state::FilterState;

use clap::ValueEnum;
use log::{trace, warn};
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

/// Weight sums below this value are treated as a collapsed particle set.
pub const DEGENERACY_THRESHOLD: f64 = 1e-15;

/// One weighted state hypothesis. The state is a value; particles never share it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Particle<S: FilterState> {
    pub state: S,
    pub weight: f64,
}
impl<S: FilterState + Display> Display for Particle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Particle(weight: {:.6e}, {})", self.weight, self.state)
    }
}
impl<S: FilterState> Particle<S> {
    pub fn new(state: S, weight: f64) -> Self {
        Particle { state, weight }
    }
}

/// How a single state estimate is extracted from the particle set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AveragingStrategy {
    #[default]
    WeightedAverage,
    UnweightedAverage,
    HighestWeight,
}

/// Normalize weights in place so they sum to one.
///
/// If the weights sum to less than [`DEGENERACY_THRESHOLD`] (or to something
/// non-finite) every weight is reset to `1/N` instead and `true` is returned.
/// Particle order is preserved either way.
pub fn normalize_weights<S: FilterState>(particles: &mut [Particle<S>]) -> bool {
    if particles.is_empty() {
        return false;
    }
    let sum: f64 = particles.iter().map(|p| p.weight).sum();
    if sum < DEGENERACY_THRESHOLD || !sum.is_finite() {
        warn!(
            "Particle weights degenerated (sum = {sum:e}), resetting {} particles to uniform weights",
            particles.len()
        );
        let uniform = 1.0 / particles.len() as f64;
        for particle in particles.iter_mut() {
            particle.weight = uniform;
        }
        return true;
    }
    for particle in particles.iter_mut() {
        particle.weight /= sum;
    }
    false
}

/// Weighted particle set over a bounded state space.
#[derive(Clone)]
pub struct ParticleFilter<S: FilterState> {
    particles: Vec<Particle<S>>,
    bounds: StateBounds,
    rng: StdRng,
}
impl<S: FilterState> Debug for ParticleFilter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mean = self.average_state().to_vector();
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let mut s = f.debug_struct("ParticleFilter");
        s.field("num_particles", &self.particles.len())
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, self.max_weight()),
            );
        for (label, value) in S::LABELS.iter().zip(mean.iter()) {
            s.field(label, &format_args!("{value:.4}"));
        }
        s.finish()
    }
}
impl<S: FilterState> ParticleFilter<S> {
    /// Sample `num_particles` states uniformly within `bounds`.
    pub fn new(num_particles: usize, bounds: StateBounds, seed: u64) -> Result<Self, FilterError> {
        if num_particles < 1 {
            return Err(FilterError::NoParticles(num_particles));
        }
        bounds.validate::<S>()?;
        let mut filter = ParticleFilter {
            particles: Vec::new(),
            bounds,
            rng: StdRng::seed_from_u64(seed),
        };
        filter.initialize_uniform(num_particles);
        Ok(filter)
    }
    /// Start from explicit states with uniform weights. States outside the
    /// bounds are rejected rather than silently corrected.
    pub fn from_states(states: Vec<S>, bounds: StateBounds, seed: u64) -> Result<Self, FilterError> {
        if states.is_empty() {
            return Err(FilterError::NoParticles(0));
        }
        bounds.validate::<S>()?;
        for state in &states {
            bounds.check(state)?;
        }
        let weight = 1.0 / states.len() as f64;
        Ok(ParticleFilter {
            particles: states.into_iter().map(|s| Particle::new(s, weight)).collect(),
            bounds,
            rng: StdRng::seed_from_u64(seed),
        })
    }
    /// Replace the particle set with `n` uniform samples of weight `1/n`.
    pub fn initialize_uniform(&mut self, n: usize) {
        let weight = 1.0 / n as f64;
        let bounds = &self.bounds;
        let rng = &mut self.rng;
        self.particles = (0..n)
            .map(|_| Particle::new(bounds.sample_uniform(&mut *rng), weight))
            .collect();
    }
    /// Apply each dimension's bound policy.
    pub fn validate_state(&self, state: &S) -> S {
        self.bounds.enforce(state)
    }
    pub fn normalize_weights(&mut self) -> bool {
        normalize_weights(&mut self.particles)
    }
    pub fn particles(&self) -> &[Particle<S>] {
        &self.particles
    }
    pub fn set_particles(&mut self, particles: Vec<Particle<S>>) {
        self.particles = particles;
    }
    pub fn bounds(&self) -> &StateBounds {
        &self.bounds
    }
    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
    pub(crate) fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
    pub(crate) fn parts_mut(&mut self) -> (&mut Vec<Particle<S>>, &mut StdRng) {
        (&mut self.particles, &mut self.rng)
    }

    /// Weighted mean per dimension, `sum(w_i / sum(w) * x_i)`.
    pub fn average_state(&self) -> S {
        let total: f64 = self.particles.iter().map(|p| p.weight).sum();
        if !(total > 0.0 && total.is_finite()) {
            return self.unweighted_average_state();
        }
        let mut mean = DVector::<f64>::zeros(S::DIM);
        for particle in &self.particles {
            mean += particle.state.to_vector() * (particle.weight / total);
        }
        S::from_vector(&mean)
    }
    pub fn unweighted_average_state(&self) -> S {
        let mut mean = DVector::<f64>::zeros(S::DIM);
        for particle in &self.particles {
            mean += particle.state.to_vector();
        }
        S::from_vector(&(mean / self.particles.len() as f64))
    }
    /// State of the heaviest particle.
    pub fn highest_weight_state(&self) -> S {
        self.particles
            .iter()
            .max_by(|a, b| a.weight.total_cmp(&b.weight))
            .map(|p| p.state)
            .unwrap_or_else(|| S::from_vector(&DVector::zeros(S::DIM)))
    }
    pub fn estimate(&self, strategy: AveragingStrategy) -> S {
        match strategy {
            AveragingStrategy::WeightedAverage => self.average_state(),
            AveragingStrategy::UnweightedAverage => self.unweighted_average_state(),
            AveragingStrategy::HighestWeight => self.highest_weight_state(),
        }
    }
    pub fn max_weight(&self) -> f64 {
        self.particles.iter().map(|p| p.weight).fold(0.0, f64::max)
    }
    /// `1 / sum(w_i^2)` of the normalized weights.
    pub fn effective_sample_size(&self) -> f64 {
        effective_sample_size(&self.particles)
    }
    /// Weighted sample covariance around [`Self::average_state`].
    pub fn covariance(&self) -> DMatrix<f64> {
        let total: f64 = self.particles.iter().map(|p| p.weight).sum();
        let mean = self.average_state().to_vector();
        let mut cov = DMatrix::<f64>::zeros(S::DIM, S::DIM);
        if !(total > 0.0 && total.is_finite()) {
            return cov;
        }
        for particle in &self.particles {
            let diff = particle.state.to_vector() - &mean;
            cov += &diff * diff.transpose() * (particle.weight / total);
        }
        cov
    }
    /// Dump every particle at trace level.
    pub fn log_particles(&self) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }
        for (i, particle) in self.particles.iter().enumerate() {
            trace!("particle {i}: weight {:.6e}, state {:?}", particle.weight, particle.state);
        }
    }
}

pub fn effective_sample_size<S: FilterState>(particles: &[Particle<S>]) -> f64 {
    let total: f64 = particles.iter().map(|p| p.weight).sum();
    let sum_of_squares: f64 = particles.iter().map(|p| (p.weight / total).powi(2)).sum();
    if sum_of_squares > 0.0 && sum_of_squares.is_finite() {
        1.0 / sum_of_squares
    } else {
        0.0
    }
}
