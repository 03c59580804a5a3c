//! Resampling strategies for particle populations.
//!
//! Resampling redraws a weighted population in proportion to the weights, duplicating heavy
//! particles and discarding light ones. Every strategy here returns as many particles as it
//! was given, each with weight `1/N` and a [ParentRef] to the particle it was copied from.
//! Input weights need not be normalised.
use rand::{Rng, RngCore};

use crate::error::ResampleError;
use crate::particle::{ParentRef, Particle};

/// Redraws a population from a weighted population
pub trait Resampler: Send + Sync {
    fn resample(&self, particles: Vec<Particle>) -> Result<Vec<Particle>, ResampleError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResamplingStrategy {
    #[default]
    Systematic,
    Stratified,
    Multinomial,
    Residual,
}

impl Resampler for ResamplingStrategy {
    fn resample(&self, particles: Vec<Particle>) -> Result<Vec<Particle>, ResampleError> {
        let mut rng = rand::rng();
        self.resample_with_rng(particles, &mut rng)
    }
}

impl ResamplingStrategy {
    /// Resample drawing randomness from `rng`.
    ///
    /// # Arguments
    /// * `particles` - Population to redraw. Weights need not sum to one.
    /// * `rng` - Source of the uniform offsets; pass a seeded generator for repeatable draws.
    ///
    /// # Returns
    /// `particles.len()` particles of weight `1/N`, each with `parent` set to the index it
    /// was copied from.
    ///
    /// # Errors
    /// [ResampleError::Empty] for an empty population and [ResampleError::InvalidWeights]
    /// when a weight is negative or not finite, or the weights sum to zero.
    pub fn resample_with_rng(
        &self,
        particles: Vec<Particle>,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Particle>, ResampleError> {
        let weights = normalized_weights(&particles)?;
        let indices = match self {
            ResamplingStrategy::Systematic => systematic_indices(&weights, rng),
            ResamplingStrategy::Stratified => stratified_indices(&weights, rng),
            ResamplingStrategy::Multinomial => multinomial_indices(&weights, rng),
            ResamplingStrategy::Residual => residual_indices(&weights, rng),
        };
        Ok(draw(&particles, &indices))
    }
}

/// Resamples only when the effective sample size drops below `threshold * N`.
///
/// Above the threshold the population is returned in place with normalised weights. Each
/// particle still becomes a new generation and points at its own index in the input.
#[derive(Clone, Copy, Debug)]
pub struct AdaptiveResampler {
    pub strategy: ResamplingStrategy,
    pub threshold: f64,
}
impl Default for AdaptiveResampler {
    fn default() -> Self {
        AdaptiveResampler {
            strategy: ResamplingStrategy::Systematic,
            threshold: 0.5,
        }
    }
}
impl Resampler for AdaptiveResampler {
    fn resample(&self, mut particles: Vec<Particle>) -> Result<Vec<Particle>, ResampleError> {
        let weights = normalized_weights(&particles)?;
        let ess = 1.0 / weights.iter().map(|w| w * w).sum::<f64>();
        if ess < self.threshold * particles.len() as f64 {
            log::debug!(
                "Effective sample size {:.1} below {:.1}, resampling",
                ess,
                self.threshold * particles.len() as f64
            );
            return self.strategy.resample(particles);
        }
        for (index, (particle, w)) in particles.iter_mut().zip(weights).enumerate() {
            particle.weight = w;
            particle.parent = Some(ParentRef { index });
        }
        Ok(particles)
    }
}

fn normalized_weights(particles: &[Particle]) -> Result<Vec<f64>, ResampleError> {
    if particles.is_empty() {
        return Err(ResampleError::Empty);
    }
    if let Some(bad) = particles
        .iter()
        .find(|p| !p.weight.is_finite() || p.weight < 0.0)
    {
        return Err(ResampleError::InvalidWeights(format!(
            "weight {} is negative or not finite",
            bad.weight
        )));
    }
    let sum: f64 = particles.iter().map(|p| p.weight).sum();
    if sum <= 0.0 || !sum.is_finite() {
        return Err(ResampleError::InvalidWeights(format!(
            "weights sum to {sum}"
        )));
    }
    Ok(particles.iter().map(|p| p.weight / sum).collect())
}

fn cumulative(weights: &[f64]) -> Vec<f64> {
    let mut total = 0.0;
    let mut cdf: Vec<f64> = weights
        .iter()
        .map(|w| {
            total += w;
            total
        })
        .collect();
    if let Some(last) = cdf.last_mut() {
        *last = 1.0;
    }
    cdf
}

/// Map sorted positions in `[0, 1)` onto particle indices
fn indices_from_sorted_positions(cdf: &[f64], positions: &[f64]) -> Vec<usize> {
    let mut indices = Vec::with_capacity(positions.len());
    let mut i = 0;
    for &u in positions {
        while i + 1 < cdf.len() && u >= cdf[i] {
            i += 1;
        }
        indices.push(i);
    }
    indices
}

fn systematic_indices(weights: &[f64], rng: &mut dyn RngCore) -> Vec<usize> {
    let n = weights.len();
    let step = 1.0 / n as f64;
    let u0 = rng.random::<f64>() * step;
    let positions: Vec<f64> = (0..n).map(|k| u0 + k as f64 * step).collect();
    indices_from_sorted_positions(&cumulative(weights), &positions)
}

fn stratified_indices(weights: &[f64], rng: &mut dyn RngCore) -> Vec<usize> {
    let n = weights.len();
    let positions: Vec<f64> = (0..n)
        .map(|k| (k as f64 + rng.random::<f64>()) / n as f64)
        .collect();
    indices_from_sorted_positions(&cumulative(weights), &positions)
}

fn multinomial_indices(weights: &[f64], rng: &mut dyn RngCore) -> Vec<usize> {
    let cdf = cumulative(weights);
    (0..weights.len())
        .map(|_| {
            let u = rng.random::<f64>();
            cdf.partition_point(|&c| c <= u).min(cdf.len() - 1)
        })
        .collect()
}

/// Deterministic `floor(N w)` copies followed by systematic draws on the residuals
fn residual_indices(weights: &[f64], rng: &mut dyn RngCore) -> Vec<usize> {
    let n = weights.len();
    let mut indices = Vec::with_capacity(n);
    let mut residual = vec![0.0; n];
    for (i, &w) in weights.iter().enumerate() {
        let copies = (w * n as f64).floor() as usize;
        indices.extend(std::iter::repeat_n(i, copies));
        residual[i] = w * n as f64 - copies as f64;
    }
    let remaining = n.saturating_sub(indices.len());
    let sum_residual: f64 = residual.iter().sum();
    if remaining > 0 && sum_residual > 0.0 {
        let step = sum_residual / remaining as f64;
        let mut u = rng.random::<f64>() * step;
        let mut i = 0;
        let mut cumsum = residual[0];
        for _ in 0..remaining {
            while u >= cumsum && i + 1 < n {
                i += 1;
                cumsum += residual[i];
            }
            indices.push(i);
            u += step;
        }
    }
    indices.truncate(n);
    indices
}

fn draw(particles: &[Particle], indices: &[usize]) -> Vec<Particle> {
    let weight = 1.0 / indices.len() as f64;
    indices
        .iter()
        .map(|&i| {
            let source = &particles[i];
            Particle {
                state_vector: source.state_vector.clone(),
                weight,
                parent: Some(ParentRef { index: i }),
                timestamp: source.timestamp,
            }
        })
        .collect()
}
