//! Sequential importance resampling filter.
//!
//! One [`SirFilter::update`] runs the full cycle
//! `propagate -> weight -> normalize -> resample` over the particle set held by
//! a [`ParticleFilter`]. Motion and measurement models are injected, so the
//! same driver serves the six-parameter row state with point or image
//! measurements and the position-only state.
//!
//! Weights are combined in log space: `ln w_i + ln L_i` is shifted by its
//! maximum before exponentiation and then normalized. After normalization this
//! equals the textbook `w_i * L_i / sum_j(w_j * L_j)`. The unnormalized total
//! `ln sum_j(w_j * L_j)` is recovered with log-sum-exp, so the set is still
//! reset to uniform weights when that total drops below
//! [`DEGENERACY_THRESHOLD`]. Image likelihoods multiply hundreds of
//! per-pixel or per-plant probabilities and fall below that threshold on
//! every step; [`DegeneracyRule::Rescaled`] keeps their relative weights.
//!
//! Per-particle work draws from its own `StdRng`, seeded from the filter's
//! master generator at every step. The sequential and the `rayon` paths
//! therefore produce identical particle sets for the same seed.
use crate::config::StateBounds;
use crate::error::FilterError;
use crate::measurements::{ImageLikelihood, LikelihoodModel, PointLikelihood};
use crate::motion::{ForwardMotion, MotionModel, RowMotionModel};
use crate::particle::{AveragingStrategy, DEGENERACY_THRESHOLD, Particle, ParticleFilter};
use crate::resampling::{ResamplingAlgorithm, resample};
use crate::state::{FilterState, PositionState, RowState};

use clap::ValueEnum;
use log::debug;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// When to resample after the weights have been normalized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingPolicy {
    /// Every step, the classic SIR scheme.
    #[default]
    Always,
    /// Only when the effective sample size drops below `threshold * N`.
    EffectiveSampleSize { threshold: f64 },
    /// Never; weights keep accumulating evidence.
    Never,
}

/// How the likelihood enters the new weight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WeightUpdate {
    /// `w' = w * L`
    #[default]
    Multiplicative,
    /// `w' = L`, the prior weight is discarded.
    Overwrite,
}

/// When an update counts as a collapsed particle set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DegeneracyRule {
    /// `sum(w_i * L_i) < DEGENERACY_THRESHOLD` resets every weight to `1/N`.
    #[default]
    WeightSum,
    /// Weights are rescaled by the largest one; only a set in which every
    /// particle was rejected is reset.
    Rescaled,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SirSettings {
    pub resampling: ResamplingAlgorithm,
    pub policy: ResamplingPolicy,
    pub weight_update: WeightUpdate,
    pub degeneracy: DegeneracyRule,
    pub averaging: AveragingStrategy,
    pub parallel: bool,
    pub seed: u64,
}

impl Default for SirSettings {
    fn default() -> Self {
        SirSettings {
            resampling: ResamplingAlgorithm::Multinomial,
            policy: ResamplingPolicy::Always,
            weight_update: WeightUpdate::Multiplicative,
            degeneracy: DegeneracyRule::WeightSum,
            averaging: AveragingStrategy::WeightedAverage,
            parallel: false,
            seed: 42,
        }
    }
}

/// Diagnostics of one [`SirFilter::update`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UpdateReport {
    /// Largest normalized weight, measured before any resampling.
    pub max_weight_before_resampling: f64,
    /// Effective sample size before any resampling.
    pub effective_sample_size: f64,
    /// Whether the weights collapsed and the set was reset to uniform weights.
    pub degenerate: bool,
    /// Particles whose likelihood could not be evaluated (weight zero).
    pub rejected: usize,
    pub resampled: bool,
}

/// Particle filter over states `S` with motion model `M` and likelihood `L`.
#[derive(Clone)]
pub struct SirFilter<S, M, L>
where
    S: FilterState,
    M: MotionModel<S>,
    L: LikelihoodModel<S>,
{
    core: ParticleFilter<S>,
    motion: M,
    likelihood: L,
    settings: SirSettings,
    steps: usize,
}

/// Row geometry tracked from scalar position measurements.
pub type PointRowFilter = SirFilter<RowState, RowMotionModel, PointLikelihood>;
/// Row geometry tracked from binary plant images.
pub type ImageRowFilter = SirFilter<RowState, RowMotionModel, ImageLikelihood>;
/// Forward position only, from scalar position measurements.
pub type PositionFilter = SirFilter<PositionState, ForwardMotion, PointLikelihood>;

impl<S, M, L> Debug for SirFilter<S, M, L>
where
    S: FilterState,
    M: MotionModel<S>,
    L: LikelihoodModel<S>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SirFilter")
            .field("steps", &self.steps)
            .field("settings", &self.settings)
            .field("particles", &self.core)
            .finish()
    }
}

impl<S, M, L> SirFilter<S, M, L>
where
    S: FilterState,
    M: MotionModel<S>,
    L: LikelihoodModel<S>,
{
    /// Build a filter with `num_particles` particles sampled uniformly within `bounds`.
    pub fn new(
        num_particles: usize,
        bounds: StateBounds,
        motion: M,
        likelihood: L,
        settings: SirSettings,
    ) -> Result<Self, FilterError> {
        let core = ParticleFilter::new(num_particles, bounds, settings.seed)?;
        Ok(Self::from_core(core, motion, likelihood, settings))
    }

    /// Build a filter from explicit initial states. Any state outside `bounds`
    /// is an error.
    pub fn with_states(
        states: Vec<S>,
        bounds: StateBounds,
        motion: M,
        likelihood: L,
        settings: SirSettings,
    ) -> Result<Self, FilterError> {
        let core = ParticleFilter::from_states(states, bounds, settings.seed)?;
        Ok(Self::from_core(core, motion, likelihood, settings))
    }

    fn from_core(core: ParticleFilter<S>, motion: M, likelihood: L, settings: SirSettings) -> Self {
        debug!(
            "SIR filter with {} particles, {:?} resampling, {:?} policy",
            core.len(),
            settings.resampling,
            settings.policy
        );
        SirFilter {
            core,
            motion,
            likelihood,
            settings,
            steps: 0,
        }
    }

    /// Whether the normalized set should be resampled, given its effective sample size.
    pub fn needs_resampling(&self, effective_sample_size: f64) -> bool {
        match self.settings.policy {
            ResamplingPolicy::Always => true,
            ResamplingPolicy::EffectiveSampleSize { threshold } => {
                effective_sample_size < threshold * self.core.len() as f64
            }
            ResamplingPolicy::Never => false,
        }
    }

    /// Run one propagate, weight, normalize and resample cycle.
    pub fn update(&mut self, motion: f64, measurement: &L::Measurement) -> UpdateReport {
        let n = self.core.len();
        let seeds: Vec<u64> = {
            let rng = self.core.rng_mut();
            (0..n).map(|_| rng.random()).collect()
        };

        let core = &self.core;
        let motion_model = &self.motion;
        let likelihood = &self.likelihood;
        let step = |(particle, seed): (&Particle<S>, &u64)| -> (S, f64) {
            let mut rng = StdRng::seed_from_u64(*seed);
            let propagated = core.validate_state(&motion_model.propagate(&particle.state, motion, &mut rng));
            let log_likelihood = likelihood.log_likelihood(&propagated, measurement);
            (propagated, log_likelihood)
        };
        let evaluated: Vec<(S, f64)> = if self.settings.parallel {
            core.particles().par_iter().zip(seeds.par_iter()).map(step).collect()
        } else {
            core.particles().iter().zip(seeds.iter()).map(step).collect()
        };

        let mut rejected = 0;
        let log_weights: Vec<f64> = core
            .particles()
            .iter()
            .zip(&evaluated)
            .map(|(particle, (_, log_likelihood))| {
                if log_likelihood.is_nan() || *log_likelihood == f64::NEG_INFINITY {
                    rejected += 1;
                    return f64::NEG_INFINITY;
                }
                match self.settings.weight_update {
                    WeightUpdate::Multiplicative => particle.weight.ln() + log_likelihood,
                    WeightUpdate::Overwrite => *log_likelihood,
                }
            })
            .collect();
        let max_log_weight = log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        // ln sum(w_i * L_i) without leaving log space.
        let log_total = if max_log_weight.is_finite() {
            max_log_weight + log_weights.iter().map(|lw| (lw - max_log_weight).exp()).sum::<f64>().ln()
        } else {
            f64::NEG_INFINITY
        };
        let collapsed = match self.settings.degeneracy {
            DegeneracyRule::WeightSum => !(log_total >= DEGENERACY_THRESHOLD.ln()),
            DegeneracyRule::Rescaled => !log_total.is_finite(),
        };
        if collapsed {
            debug!("ln sum(w * L) = {log_total:.3} at step {}", self.steps + 1);
        }

        // A collapsed set gets all-zero weights, which `normalize_weights` resets.
        let particles: Vec<Particle<S>> = evaluated
            .into_iter()
            .zip(&log_weights)
            .map(|((state, _), log_weight)| {
                let weight = if collapsed { 0.0 } else { (log_weight - max_log_weight).exp() };
                Particle::new(state, weight)
            })
            .collect();
        self.core.set_particles(particles);
        let degenerate = self.core.normalize_weights();

        let max_weight = self.core.max_weight();
        let effective_sample_size = self.core.effective_sample_size();
        let resampled = self.needs_resampling(effective_sample_size);
        if resampled {
            let algorithm = self.settings.resampling;
            let (particles, rng) = self.core.parts_mut();
            *particles = resample(algorithm, particles, n, rng);
        }
        self.steps += 1;

        debug!(
            "step {}: max weight {:.4}, ESS {:.1}/{}, rejected {}, resampled {}",
            self.steps, max_weight, effective_sample_size, n, rejected, resampled
        );
        self.core.log_particles();
        UpdateReport {
            max_weight_before_resampling: max_weight,
            effective_sample_size,
            degenerate,
            rejected,
            resampled,
        }
    }

    pub fn particles(&self) -> &[Particle<S>] {
        self.core.particles()
    }
    pub fn average_state(&self) -> S {
        self.core.average_state()
    }
    pub fn max_weight(&self) -> f64 {
        self.core.max_weight()
    }
    pub fn effective_sample_size(&self) -> f64 {
        self.core.effective_sample_size()
    }
    pub fn covariance(&self) -> DMatrix<f64> {
        self.core.covariance()
    }
    /// State estimate according to the configured averaging strategy.
    pub fn estimate(&self) -> S {
        self.core.estimate(self.settings.averaging)
    }
    pub fn settings(&self) -> &SirSettings {
        &self.settings
    }
    pub fn steps(&self) -> usize {
        self.steps
    }
    pub fn core(&self) -> &ParticleFilter<S> {
        &self.core
    }
    pub fn likelihood_model(&self) -> &L {
        &self.likelihood
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Bound;
    use assert_approx_eq::assert_approx_eq;

    fn position_filter(settings: SirSettings) -> PositionFilter {
        SirFilter::new(
            100,
            StateBounds::new(vec![Bound::wrapping(0.0, 1000.0)]),
            ForwardMotion::new(0.0, 1000.0).unwrap(),
            PointLikelihood::new(7.0).unwrap(),
            settings,
        )
        .unwrap()
    }

    #[test]
    fn always_policy_leaves_uniform_weights() {
        let mut filter = position_filter(SirSettings::default());
        let report = filter.update(5.0, &300.0);
        assert!(report.resampled);
        assert_eq!(filter.particles().len(), 100);
        assert!(filter.particles().iter().all(|p| p.weight == 0.01));
        assert!(report.max_weight_before_resampling > 0.01);
    }

    #[test]
    fn never_policy_keeps_normalized_weights() {
        let mut filter = position_filter(SirSettings {
            policy: ResamplingPolicy::Never,
            ..SirSettings::default()
        });
        let report = filter.update(0.0, &300.0);
        assert!(!report.resampled);
        let total: f64 = filter.particles().iter().map(|p| p.weight).sum();
        assert_approx_eq!(total, 1.0, 1e-9);
        assert_eq!(filter.max_weight(), report.max_weight_before_resampling);
    }

    #[test]
    fn ess_policy_compares_against_threshold() {
        let filter = position_filter(SirSettings {
            policy: ResamplingPolicy::EffectiveSampleSize { threshold: 0.5 },
            ..SirSettings::default()
        });
        assert!(filter.needs_resampling(49.0));
        assert!(!filter.needs_resampling(51.0));
    }

    #[test]
    fn multiplicative_update_matches_product_of_weights_and_likelihoods() {
        let settings = SirSettings {
            policy: ResamplingPolicy::Never,
            ..SirSettings::default()
        };
        let states = vec![PositionState::new(100.0), PositionState::new(107.0), PositionState::new(114.0)];
        let mut filter = SirFilter::with_states(
            states,
            StateBounds::new(vec![Bound::wrapping(0.0, 1000.0)]),
            ForwardMotion::new(0.0, 1000.0).unwrap(),
            PointLikelihood::new(7.0).unwrap(),
            settings,
        )
        .unwrap();
        filter.update(0.0, &100.0);
        filter.update(0.0, &100.0);
        // Two identical measurements: weights follow exp(-2 * d^2 / (2 * 49)).
        let raw: Vec<f64> = [0.0f64, 7.0, 14.0].iter().map(|d| (-d * d / 49.0).exp()).collect();
        let total: f64 = raw.iter().sum();
        for (particle, expected) in filter.particles().iter().zip(&raw) {
            assert_approx_eq!(particle.weight, expected / total, 1e-12);
        }
    }

    #[test]
    fn overwrite_update_ignores_prior_weight() {
        let settings = SirSettings {
            policy: ResamplingPolicy::Never,
            weight_update: WeightUpdate::Overwrite,
            ..SirSettings::default()
        };
        let mut filter = SirFilter::with_states(
            vec![PositionState::new(100.0), PositionState::new(107.0)],
            StateBounds::new(vec![Bound::wrapping(0.0, 1000.0)]),
            ForwardMotion::new(0.0, 1000.0).unwrap(),
            PointLikelihood::new(7.0).unwrap(),
            settings,
        )
        .unwrap();
        filter.update(0.0, &100.0);
        filter.update(0.0, &100.0);
        let expected = 1.0 / (1.0 + (-0.5f64).exp());
        assert_approx_eq!(filter.particles()[0].weight, expected, 1e-12);
    }

    fn far_pair(degeneracy: DegeneracyRule) -> PositionFilter {
        SirFilter::with_states(
            vec![PositionState::new(0.0), PositionState::new(1.0)],
            StateBounds::new(vec![Bound::wrapping(0.0, 1000.0)]),
            ForwardMotion::new(0.0, 1000.0).unwrap(),
            PointLikelihood::new(7.0).unwrap(),
            SirSettings {
                policy: ResamplingPolicy::Never,
                degeneracy,
                ..SirSettings::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn vanishing_weight_sum_resets_to_uniform() {
        let mut filter = far_pair(DegeneracyRule::WeightSum);
        // sum(w * L) is about 1e-1110: far below the threshold although both
        // log weights are finite.
        let report = filter.update(0.0, &500.0);
        assert!(report.degenerate);
        assert_eq!(report.rejected, 0);
        assert!(filter.particles().iter().all(|p| p.weight == 0.5));
        assert_eq!(report.max_weight_before_resampling, 0.5);
    }

    #[test]
    fn weight_sum_just_above_threshold_is_kept() {
        let mut filter = far_pair(DegeneracyRule::WeightSum);
        // L = exp(-d^2 / 98) with d = 35 and 36: the sum stays around 1e-6.
        let report = filter.update(0.0, &36.0);
        assert!(!report.degenerate);
        assert!(filter.particles()[1].weight > filter.particles()[0].weight);
    }

    #[test]
    fn rescaled_rule_keeps_tiny_likelihoods() {
        let mut filter = far_pair(DegeneracyRule::Rescaled);
        let report = filter.update(0.0, &500.0);
        assert!(!report.degenerate);
        assert!(filter.particles()[1].weight > 0.99);
        let total: f64 = filter.particles().iter().map(|p| p.weight).sum();
        assert_approx_eq!(total, 1.0, 1e-12);
    }

    #[test]
    fn parallel_and_sequential_runs_agree() {
        let run = |parallel: bool| {
            let mut filter = position_filter(SirSettings {
                parallel,
                seed: 9,
                ..SirSettings::default()
            });
            for step in 0..5 {
                filter.update(5.0, &(300.0 + 5.0 * step as f64));
            }
            filter.particles().to_vec()
        };
        assert_eq!(run(false), run(true));
    }
}
