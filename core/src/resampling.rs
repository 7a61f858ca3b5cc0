//! Resampling algorithms.
//!
//! Each algorithm takes normalized weights and returns `n` particle indices
//! drawn with replacement, proportionally to the weights. [`resample`] turns
//! the indices into a fresh particle set with uniform weights `1/n`.
//!
//! - Multinomial: `n` independent uniforms mapped through the inverse CDF.
//! - Stratified: one uniform per stratum `[i/n, (i+1)/n)`.
//! - Systematic: a single uniform offset shared by all strata.
//! - Residual: `floor(n w_i)` deterministic copies, the remainder drawn
//!   systematically from the residual weights.

use clap::ValueEnum;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::particle::Particle;
use crate::state::FilterState;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingAlgorithm {
    #[default]
    Multinomial,
    Stratified,
    Systematic,
    Residual,
}

impl ResamplingAlgorithm {
    /// Indices of the particles that survive resampling.
    pub fn indices<R: Rng + ?Sized>(&self, weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
        match self {
            ResamplingAlgorithm::Multinomial => multinomial_resample(weights, n, rng),
            ResamplingAlgorithm::Stratified => stratified_resample(weights, n, rng),
            ResamplingAlgorithm::Systematic => systematic_resample(weights, n, rng),
            ResamplingAlgorithm::Residual => residual_resample(weights, n, rng),
        }
    }
}

/// Running sum of the weights.
fn cumulative(weights: &[f64]) -> Vec<f64> {
    weights
        .iter()
        .scan(0.0, |sum, w| {
            *sum += w;
            Some(*sum)
        })
        .collect()
}

/// First index whose cumulative weight exceeds `u`. Round-off in the last
/// cumulative entry falls back to the last index.
fn inverse_cdf(cdf: &[f64], u: f64) -> usize {
    cdf.partition_point(|&c| c <= u).min(cdf.len() - 1)
}

/// Map sorted positions in `[0, total)` onto indices with a single sweep.
fn sweep(cdf: &[f64], positions: impl Iterator<Item = f64>) -> Vec<usize> {
    let mut indices = Vec::new();
    let mut i = 0;
    for u in positions {
        while i < cdf.len() - 1 && u >= cdf[i] {
            i += 1;
        }
        indices.push(i);
    }
    indices
}

pub fn multinomial_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    let cdf = cumulative(weights);
    let total = cdf[cdf.len() - 1];
    (0..n)
        .map(|_| inverse_cdf(&cdf, rng.random::<f64>() * total))
        .collect()
}

pub fn stratified_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    let cdf = cumulative(weights);
    let total = cdf[cdf.len() - 1];
    let positions: Vec<f64> = (0..n)
        .map(|i| (i as f64 + rng.random::<f64>()) / n as f64 * total)
        .collect();
    sweep(&cdf, positions.into_iter())
}

pub fn systematic_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    let cdf = cumulative(weights);
    let total = cdf[cdf.len() - 1];
    let start = rng.random::<f64>();
    sweep(&cdf, (0..n).map(|i| (i as f64 + start) / n as f64 * total))
}

pub fn residual_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    let total: f64 = weights.iter().sum();
    let mut indices = Vec::with_capacity(n);
    let mut residual = Vec::with_capacity(weights.len());
    for (i, w) in weights.iter().enumerate() {
        let expected = w / total * n as f64;
        let copies = expected.floor() as usize;
        indices.extend(std::iter::repeat_n(i, copies));
        residual.push(expected - copies as f64);
    }
    // Round-off can push the deterministic copies past n.
    indices.truncate(n);
    let remaining = n - indices.len();
    if remaining > 0 {
        indices.extend(systematic_resample(&residual, remaining, rng));
    }
    indices
}

/// Draw `n` particles from `particles` with the given algorithm. Every output
/// particle is an independent copy carrying weight `1/n`.
pub fn resample<S: FilterState, R: Rng + ?Sized>(
    algorithm: ResamplingAlgorithm,
    particles: &[Particle<S>],
    n: usize,
    rng: &mut R,
) -> Vec<Particle<S>> {
    let weights: Vec<f64> = particles.iter().map(|p| p.weight).collect();
    let weight = 1.0 / n as f64;
    algorithm
        .indices(&weights, n, rng)
        .into_iter()
        .map(|i| Particle::new(particles[i].state, weight))
        .collect()
}
