//! Weighted particle populations.
//!
//! A [ParticleState] is one generation of weighted state hypotheses sharing a timestamp.
//! Particles refer to the particle they were drawn from in the previous generation through
//! a [ParentRef], a plain index rather than a pointer, so generations never own each other
//! and can be dropped independently.
use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector};
use std::fmt::{self, Debug, Display};

/// Index of a particle in the previous generation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ParentRef {
    pub index: usize,
}
impl From<usize> for ParentRef {
    fn from(index: usize) -> Self {
        ParentRef { index }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Particle {
    pub state_vector: DVector<f64>,
    pub weight: f64,
    pub parent: Option<ParentRef>,
    pub timestamp: Option<DateTime<Utc>>,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("state", &self.state_vector.as_slice())
            .field("weight", &self.weight)
            .field("parent", &self.parent.map(|p| p.index))
            .finish()
    }
}
impl Particle {
    pub fn new(state_vector: DVector<f64>, weight: f64) -> Particle {
        Particle {
            state_vector,
            weight,
            parent: None,
            timestamp: None,
        }
    }
    pub fn with_parent(mut self, parent: impl Into<ParentRef>) -> Particle {
        self.parent = Some(parent.into());
        self
    }
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Particle {
        self.timestamp = Some(timestamp);
        self
    }
    pub fn ndim(&self) -> usize {
        self.state_vector.len()
    }
}
impl From<(DVector<f64>, f64)> for Particle {
    fn from(tuple: (DVector<f64>, f64)) -> Self {
        let (state_vector, weight) = tuple;
        Particle::new(state_vector, weight)
    }
}
impl From<(Vec<f64>, f64)> for Particle {
    fn from(tuple: (Vec<f64>, f64)) -> Self {
        let (state, weight) = tuple;
        Particle::new(DVector::from_vec(state), weight)
    }
}

/// Method used to collapse a population into a point estimate
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParticleAveragingStrategy {
    #[default]
    WeightedAverage,
    UnweightedAverage,
    HighestWeight,
}

/// One generation of particles sharing a timestamp.
#[derive(Clone, Default, PartialEq)]
pub struct ParticleState {
    pub particles: Vec<Particle>,
    pub timestamp: Option<DateTime<Utc>>,
}
impl Debug for ParticleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        f.debug_struct("ParticleState")
            .field("num_particles", &self.particles.len())
            .field("ndim", &self.ndim())
            .field("timestamp", &self.timestamp)
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .finish()
    }
}
impl ParticleState {
    pub fn new(particles: Vec<Particle>, timestamp: Option<DateTime<Utc>>) -> Self {
        debug_assert!(
            particles
                .windows(2)
                .all(|pair| pair[0].ndim() == pair[1].ndim()),
            "All particles in a population must share one dimension"
        );
        ParticleState {
            particles,
            timestamp,
        }
    }
    /// Population of `states` with equal weights summing to one
    pub fn uniform(states: Vec<DVector<f64>>, timestamp: Option<DateTime<Utc>>) -> Self {
        let weight = 1.0 / states.len().max(1) as f64;
        let particles = states
            .into_iter()
            .map(|state| Particle::new(state, weight))
            .collect();
        ParticleState::new(particles, timestamp)
    }
    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
    /// State dimension shared by every particle, zero for an empty population
    pub fn ndim(&self) -> usize {
        self.particles.first().map_or(0, Particle::ndim)
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Particle> {
        self.particles.iter()
    }
    pub fn weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.weight).collect()
    }
    pub fn total_weight(&self) -> f64 {
        self.particles.iter().map(|p| p.weight).sum()
    }
    pub fn set_weights(&mut self, weights: &[f64]) {
        assert_eq!(weights.len(), self.particles.len());
        for (particle, &w) in self.particles.iter_mut().zip(weights.iter()) {
            particle.weight = w;
        }
    }
    /// Scale weights to sum to one, falling back to uniform weights when the sum is zero
    /// or not finite.
    pub fn normalize_weights(&mut self) {
        let sum = self.total_weight();
        if sum > 0.0 && sum.is_finite() {
            for particle in &mut self.particles {
                particle.weight /= sum;
            }
        } else {
            self.reset_weights_uniform();
        }
    }
    pub fn reset_weights_uniform(&mut self) {
        let uniform = 1.0 / self.particles.len().max(1) as f64;
        for particle in &mut self.particles {
            particle.weight = uniform;
        }
    }
    pub fn effective_sample_size(&self) -> f64 {
        let total = self.total_weight();
        if total <= 0.0 || !total.is_finite() {
            return 0.0;
        }
        let sum_of_squares: f64 = self
            .particles
            .iter()
            .map(|p| (p.weight / total).powi(2))
            .sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }
    /// Particle states as the columns of an `ndim × len` matrix
    pub fn particles_to_matrix(&self) -> DMatrix<f64> {
        let columns: Vec<DVector<f64>> = self
            .particles
            .iter()
            .map(|p| p.state_vector.clone())
            .collect();
        if columns.is_empty() {
            return DMatrix::zeros(0, 0);
        }
        DMatrix::from_columns(&columns)
    }
    pub fn mean(&self) -> DVector<f64> {
        self.estimate(ParticleAveragingStrategy::WeightedAverage).0
    }
    pub fn covariance(&self) -> DMatrix<f64> {
        self.estimate(ParticleAveragingStrategy::WeightedAverage).1
    }
    /// Point estimate and spread of the population
    pub fn estimate(&self, strategy: ParticleAveragingStrategy) -> (DVector<f64>, DMatrix<f64>) {
        match strategy {
            ParticleAveragingStrategy::WeightedAverage => self.weighted_average_state(),
            ParticleAveragingStrategy::UnweightedAverage => self.unweighted_average_state(),
            ParticleAveragingStrategy::HighestWeight => self.highest_weight_state(),
        }
    }
    fn weighted_average_state(&self) -> (DVector<f64>, DMatrix<f64>) {
        let total = self.total_weight();
        if total <= 0.0 || !total.is_finite() {
            return self.unweighted_average_state();
        }
        let n = self.ndim();
        let mut mean = DVector::<f64>::zeros(n);
        for particle in &self.particles {
            mean += &particle.state_vector * (particle.weight / total);
        }
        let mut cov = DMatrix::<f64>::zeros(n, n);
        for particle in &self.particles {
            let diff = &particle.state_vector - &mean;
            cov += (particle.weight / total) * &diff * diff.transpose();
        }
        (mean, cov)
    }
    fn unweighted_average_state(&self) -> (DVector<f64>, DMatrix<f64>) {
        let n = self.ndim();
        let count = self.particles.len().max(1) as f64;
        let mut mean = DVector::<f64>::zeros(n);
        for particle in &self.particles {
            mean += &particle.state_vector / count;
        }
        let mut cov = DMatrix::<f64>::zeros(n, n);
        for particle in &self.particles {
            let diff = &particle.state_vector - &mean;
            cov += (1.0 / count) * &diff * diff.transpose();
        }
        (mean, cov)
    }
    fn highest_weight_state(&self) -> (DVector<f64>, DMatrix<f64>) {
        let n = self.ndim();
        let best = self
            .particles
            .iter()
            .max_by(|a, b| a.weight.total_cmp(&b.weight));
        match best {
            Some(particle) => (particle.state_vector.clone(), DMatrix::zeros(n, n)),
            None => (DVector::zeros(0), DMatrix::zeros(0, 0)),
        }
    }
    /// Value snapshot of the population, used as a memoisation key
    pub fn cache_key(&self) -> ParticleStateKey {
        ParticleStateKey::from(self)
    }
}
impl FromIterator<Particle> for ParticleState {
    fn from_iter<I: IntoIterator<Item = Particle>>(iter: I) -> Self {
        ParticleState::new(iter.into_iter().collect(), None)
    }
}
impl<'a> IntoIterator for &'a ParticleState {
    type Item = &'a Particle;
    type IntoIter = std::slice::Iter<'a, Particle>;
    fn into_iter(self) -> Self::IntoIter {
        self.particles.iter()
    }
}

/// Hashable snapshot of every value in a [ParticleState].
///
/// Two populations produce equal keys exactly when their timestamps, particle order,
/// states, weights, parents, and particle timestamps are equal. Floats are compared
/// by bit pattern with `-0.0` folded onto `0.0`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParticleStateKey {
    timestamp: Option<(i64, u32)>,
    words: Vec<u64>,
}
impl From<&ParticleState> for ParticleStateKey {
    fn from(state: &ParticleState) -> Self {
        const NONE: u64 = u64::MAX;
        let mut words = Vec::with_capacity(state.len() * (state.ndim() + 5));
        for particle in &state.particles {
            words.push(particle.state_vector.len() as u64);
            words.extend(particle.state_vector.iter().map(|&x| float_bits(x)));
            words.push(float_bits(particle.weight));
            words.push(particle.parent.map_or(NONE, |p| p.index as u64));
            match particle.timestamp {
                Some(ts) => {
                    words.push(ts.timestamp() as u64);
                    words.push(u64::from(ts.timestamp_subsec_nanos()));
                }
                None => {
                    words.push(NONE);
                    words.push(NONE);
                }
            }
        }
        ParticleStateKey {
            timestamp: state
                .timestamp
                .map(|ts| (ts.timestamp(), ts.timestamp_subsec_nanos())),
            words,
        }
    }
}

#[inline]
fn float_bits(x: f64) -> u64 {
    if x == 0.0 { 0 } else { x.to_bits() }
}

/// Follow parent references back through stored generations.
///
/// `generations` is ordered oldest first. Starting from particle `index` of the newest
/// generation, returns the particle index in every generation back to the first one
/// reached, newest first. The walk stops early at a particle with no parent or at a parent
/// index outside the older generation.
pub fn trace_lineage(generations: &[ParticleState], index: usize) -> Vec<usize> {
    let mut lineage = Vec::with_capacity(generations.len());
    let mut current = Some(index);
    for generation in generations.iter().rev() {
        let Some(i) = current else { break };
        let Some(particle) = generation.particles.get(i) else {
            break;
        };
        lineage.push(i);
        current = particle.parent.map(|p| p.index);
    }
    lineage
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use chrono::TimeZone;

    fn population(weights: &[f64]) -> ParticleState {
        weights
            .iter()
            .enumerate()
            .map(|(i, &w)| Particle::from((vec![i as f64, 2.0 * i as f64], w)))
            .collect()
    }

    #[test]
    fn normalize_weights_sums_to_one() {
        let mut state = population(&[1.0, 3.0, 4.0]);
        state.normalize_weights();
        assert_approx_eq!(state.total_weight(), 1.0, 1e-12);
        assert_approx_eq!(state.particles[2].weight, 0.5, 1e-12);
    }

    #[test]
    fn normalize_zero_weights_falls_back_to_uniform() {
        let mut state = population(&[0.0, 0.0, 0.0, 0.0]);
        state.normalize_weights();
        assert_eq!(state.len(), 4);
        for p in &state {
            assert_approx_eq!(p.weight, 0.25, 1e-12);
        }
    }

    #[test]
    fn effective_sample_size_bounds() {
        let uniform = population(&[0.25; 4]);
        assert_approx_eq!(uniform.effective_sample_size(), 4.0, 1e-12);
        let degenerate = population(&[1.0, 0.0, 0.0, 0.0]);
        assert_approx_eq!(degenerate.effective_sample_size(), 1.0, 1e-12);
        assert_eq!(population(&[0.0, 0.0]).effective_sample_size(), 0.0);
    }

    #[test]
    fn weighted_mean_and_covariance() {
        let state = population(&[0.5, 0.5]);
        let (mean, cov) = state.estimate(ParticleAveragingStrategy::WeightedAverage);
        assert_approx_eq!(mean[0], 0.5, 1e-12);
        assert_approx_eq!(mean[1], 1.0, 1e-12);
        assert_approx_eq!(cov[(0, 0)], 0.25, 1e-12);
        assert_approx_eq!(cov[(1, 1)], 1.0, 1e-12);
        assert_approx_eq!(cov[(0, 1)], 0.5, 1e-12);
    }

    #[test]
    fn highest_weight_picks_best_particle() {
        let state = population(&[0.1, 0.7, 0.2]);
        let (best, cov) = state.estimate(ParticleAveragingStrategy::HighestWeight);
        assert_eq!(best.as_slice(), &[1.0, 2.0]);
        assert_eq!(cov, DMatrix::zeros(2, 2));
    }

    #[test]
    fn unweighted_average_ignores_weights() {
        let state = population(&[0.9, 0.05, 0.05]);
        let (mean, _) = state.estimate(ParticleAveragingStrategy::UnweightedAverage);
        assert_approx_eq!(mean[0], 1.0, 1e-12);
    }

    #[test]
    fn particles_to_matrix_columns() {
        let m = population(&[1.0, 1.0, 1.0]).particles_to_matrix();
        assert_eq!(m.shape(), (2, 3));
        assert_eq!(m[(1, 2)], 4.0);
    }

    #[test]
    fn cache_key_is_value_based() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut a = population(&[0.2, 0.8]);
        a.timestamp = Some(ts);
        let b = a.clone();
        assert_eq!(a.cache_key(), b.cache_key());

        let mut c = a.clone();
        c.particles[1].weight = 0.7;
        assert_ne!(a.cache_key(), c.cache_key());

        let mut d = a.clone();
        d.timestamp = None;
        assert_ne!(a.cache_key(), d.cache_key());

        let mut e = a.clone();
        e.particles[0].state_vector[0] = -0.0;
        assert_eq!(a.cache_key(), e.cache_key());
    }

    #[test]
    fn lineage_walks_back_through_generations() {
        let first = population(&[0.5, 0.5]);
        let second: ParticleState = vec![
            Particle::from((vec![0.0, 0.0], 0.5)).with_parent(1),
            Particle::from((vec![1.0, 1.0], 0.5)).with_parent(0),
        ]
        .into_iter()
        .collect();
        let third: ParticleState = vec![Particle::from((vec![0.0, 0.0], 1.0)).with_parent(0)]
            .into_iter()
            .collect();
        let generations = vec![first, second, third];
        assert_eq!(trace_lineage(&generations, 0), vec![0, 0, 1]);
    }

    #[test]
    fn lineage_stops_at_root() {
        let generations = vec![population(&[1.0]), population(&[1.0])];
        assert_eq!(trace_lineage(&generations, 0), vec![0]);
        assert!(trace_lineage(&generations, 5).is_empty());
    }
}
