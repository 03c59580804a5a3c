//! Sequential importance resampling measurement update.
//!
//! [ParticleUpdater::update] corrects a predicted particle population with one detection:
//!
//! 1. every particle weight is multiplied by the likelihood of the detection given the
//!    particle state,
//! 2. the weights are normalised,
//! 3. the normalised population is handed to the configured [Resampler].
//!
//! When every likelihood is zero (or the weight sum is not finite) the population carries
//! no information about the detection. The update then keeps all `N` particles, resets
//! their weights to `1/N`, skips resampling, and counts the event in
//! [UpdaterDiagnostics::degenerate_updates]. Repeated degenerate updates usually mean the
//! filter has diverged from the target or the measurement model does not match the sensor.
//!
//! [ParticleUpdater::measurement_prediction] projects a population into measurement space
//! with the noise-free model. Results are memoised by value in a bounded cache shared by
//! all callers of the updater. The cache key pairs the population with the model that
//! projected it, so [ParticleUpdater::measurement_prediction_for] can resolve a detection's
//! own model without colliding with predictions made by the updater's model.
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::{debug, trace, warn};
use nalgebra::DVector;
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::cache::{Lookup, MemoCache};
use crate::config::UpdaterConfig;
use crate::detection::Detection;
use crate::error::{ResampleError, Result, UpdateError};
use crate::measurements::MeasurementModel;
use crate::particle::{Particle, ParticleState, ParticleStateKey};
use crate::resampling::{Resampler, ResamplingStrategy};

/// Snapshot of the updater's counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdaterDiagnostics {
    /// Completed calls to `update`
    pub updates: u64,
    /// Updates where every likelihood was zero
    pub degenerate_updates: u64,
    /// Updates abandoned because the weighting stage exceeded its deadline
    pub deadline_aborts: u64,
    /// Particles projected through the measurement model by `measurement_prediction`
    pub prediction_evaluations: u64,
    /// `measurement_prediction` calls answered from the cache
    pub cache_hits: u64,
}

#[derive(Default)]
struct Counters {
    updates: AtomicU64,
    degenerate_updates: AtomicU64,
    deadline_aborts: AtomicU64,
    prediction_evaluations: AtomicU64,
    cache_hits: AtomicU64,
}

/// Result of the importance weighting stage
#[derive(Clone, Debug, PartialEq)]
pub enum WeightingOutcome {
    /// Weights multiplied by the likelihoods and normalised to sum to one
    Normalized(ParticleState),
    /// All likelihoods were zero; weights reset to uniform, population size kept
    Degenerate(ParticleState),
    /// The deadline ran out; the prior is returned untouched
    DeadlineExceeded(ParticleState),
}
impl WeightingOutcome {
    pub fn into_state(self) -> ParticleState {
        match self {
            WeightingOutcome::Normalized(state)
            | WeightingOutcome::Degenerate(state)
            | WeightingOutcome::DeadlineExceeded(state) => state,
        }
    }
    pub fn state(&self) -> &ParticleState {
        match self {
            WeightingOutcome::Normalized(state)
            | WeightingOutcome::Degenerate(state)
            | WeightingOutcome::DeadlineExceeded(state) => state,
        }
    }
}

/// Particle filter measurement updater
pub struct ParticleUpdater {
    measurement_model: Option<Arc<dyn MeasurementModel>>,
    resampler: Arc<dyn Resampler>,
    config: UpdaterConfig,
    predictions: MemoCache<PredictionKey, ParticleState>,
    counters: Counters,
}

/// Model identity by allocation. Holding the `Arc` keeps the address from being reused
/// while the entry is cached.
#[derive(Clone)]
struct ModelIdentity(Arc<dyn MeasurementModel>);
impl PartialEq for ModelIdentity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for ModelIdentity {}
impl Hash for ModelIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const () as usize).hash(state);
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct PredictionKey {
    model: ModelIdentity,
    population: ParticleStateKey,
}

impl Default for ParticleUpdater {
    fn default() -> Self {
        ParticleUpdater::new(ResamplingStrategy::default())
    }
}

impl ParticleUpdater {
    /// Create an updater with no measurement model and the default configuration.
    ///
    /// # Arguments
    /// * `resampler` - Strategy used to redraw the population after weighting.
    ///
    /// # Returns
    /// An updater that only accepts detections carrying their own model until
    /// [ParticleUpdater::with_measurement_model] is called.
    pub fn new(resampler: impl Resampler + 'static) -> Self {
        let config = UpdaterConfig::default();
        ParticleUpdater {
            measurement_model: None,
            resampler: Arc::new(resampler),
            predictions: MemoCache::new(config.prediction_cache_capacity),
            config,
            counters: Counters::default(),
        }
    }
    /// Model used for detections that do not carry their own
    pub fn with_measurement_model(mut self, model: Arc<dyn MeasurementModel>) -> Self {
        self.measurement_model = Some(model);
        self.predictions = MemoCache::new(self.config.prediction_cache_capacity);
        self
    }
    /// Replace the configuration.
    ///
    /// The prediction cache is rebuilt with the new capacity, so memoised predictions
    /// are discarded.
    pub fn with_config(mut self, config: UpdaterConfig) -> Self {
        self.predictions = MemoCache::new(config.prediction_cache_capacity);
        self.config = config;
        self
    }
    pub fn measurement_model(&self) -> Option<&Arc<dyn MeasurementModel>> {
        self.measurement_model.as_ref()
    }
    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }
    /// Snapshot of the update and cache counters accumulated since construction.
    ///
    /// Counters are read individually with relaxed ordering, so a snapshot taken while
    /// other threads are updating may mix values from neighbouring calls.
    pub fn diagnostics(&self) -> UpdaterDiagnostics {
        UpdaterDiagnostics {
            updates: self.counters.updates.load(Ordering::Relaxed),
            degenerate_updates: self.counters.degenerate_updates.load(Ordering::Relaxed),
            deadline_aborts: self.counters.deadline_aborts.load(Ordering::Relaxed),
            prediction_evaluations: self.counters.prediction_evaluations.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
        }
    }
    /// Drop all memoised measurement predictions
    pub fn clear_prediction_cache(&self) {
        self.predictions.clear();
    }

    /// Correct `prediction` with `detection`, returning the resampled posterior.
    ///
    /// The posterior carries the prior's timestamp. The prior is consumed.
    ///
    /// # Errors
    /// - [UpdateError::Configuration] if neither the detection nor the updater has a model
    /// - [UpdateError::EmptyPopulation] if `prediction` has no particles
    /// - [UpdateError::DimensionMismatch] if the detection does not fit the model
    /// - [UpdateError::Resampling] if the resampler fails
    pub fn update(&self, prediction: ParticleState, detection: &Detection) -> Result<ParticleState> {
        let timestamp = prediction.timestamp;
        let posterior = match self.weight(prediction, detection)? {
            WeightingOutcome::Normalized(weighted) => {
                let particles = self.resampler.resample(weighted.particles)?;
                if particles.is_empty() {
                    return Err(ResampleError::Empty.into());
                }
                ParticleState::new(particles, timestamp)
            }
            WeightingOutcome::Degenerate(state) | WeightingOutcome::DeadlineExceeded(state) => {
                state
            }
        };
        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Particle update: {} particles, effective size {:.1}",
            posterior.len(),
            posterior.effective_sample_size()
        );
        Ok(posterior)
    }

    /// Importance weighting and normalisation without resampling
    pub fn weight(&self, mut prediction: ParticleState, detection: &Detection) -> Result<WeightingOutcome> {
        let started = Instant::now();
        let model = detection
            .resolve_model(self.measurement_model.as_ref())
            .ok_or_else(|| {
                UpdateError::Configuration(
                    "no measurement model on the detection or the updater".to_string(),
                )
            })?;
        if prediction.is_empty() {
            return Err(UpdateError::EmptyPopulation);
        }
        check_state_dimension(model.as_ref(), &prediction)?;
        if detection.ndim() != model.ndim_meas() {
            return Err(UpdateError::DimensionMismatch {
                expected: model.ndim_meas(),
                actual: detection.ndim(),
            });
        }

        let Some(likelihoods) = self.likelihoods(
            model.as_ref(),
            &prediction.particles,
            &detection.state_vector,
            started,
        ) else {
            self.counters.deadline_aborts.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Likelihood evaluation exceeded {:?} for {} particles, keeping prior",
                self.config.deadline(),
                prediction.len()
            );
            return Ok(WeightingOutcome::DeadlineExceeded(prediction));
        };

        for (particle, likelihood) in prediction.particles.iter_mut().zip(&likelihoods) {
            particle.weight *= likelihood;
        }
        let sum_w = prediction.total_weight();
        if sum_w > 0.0 && sum_w.is_finite() {
            for particle in &mut prediction.particles {
                particle.weight /= sum_w;
            }
            Ok(WeightingOutcome::Normalized(prediction))
        } else {
            let count = self.counters.degenerate_updates.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "All {} particle likelihoods vanished (weight sum {sum_w}); resetting to uniform weights ({count} degenerate updates so far)",
                prediction.len()
            );
            prediction.reset_weights_uniform();
            Ok(WeightingOutcome::Degenerate(prediction))
        }
    }

    /// Project `prediction` into measurement space with the noise-free updater model.
    ///
    /// Weights and lineage are preserved. Calls with a value-equal population are served
    /// from the cache without evaluating the model.
    ///
    /// # Errors
    /// - [UpdateError::Configuration] if the updater has no model. Use
    ///   [ParticleUpdater::measurement_prediction_for] when the model travels with the
    ///   detection.
    /// - [UpdateError::DimensionMismatch] if the particles do not fit the model's state space
    pub fn measurement_prediction(&self, prediction: &ParticleState) -> Result<Arc<ParticleState>> {
        let model = self.measurement_model.as_ref().ok_or_else(|| {
            UpdateError::Configuration("no measurement model on the updater".to_string())
        })?;
        self.predict_with(model, prediction)
    }

    /// Project `prediction` with the model [ParticleUpdater::update] would use for
    /// `detection`: the detection's own model, or the updater's model as a fallback.
    ///
    /// # Arguments
    /// * `prediction` - Population to project.
    /// * `detection` - Detection whose model (if any) takes precedence.
    ///
    /// # Returns
    /// The projected population, shared with the cache. Predictions are cached per model,
    /// so the same population projected by two models occupies two entries.
    pub fn measurement_prediction_for(
        &self,
        prediction: &ParticleState,
        detection: &Detection,
    ) -> Result<Arc<ParticleState>> {
        let model = detection
            .resolve_model(self.measurement_model.as_ref())
            .ok_or_else(|| {
                UpdateError::Configuration(
                    "no measurement model on the detection or the updater".to_string(),
                )
            })?;
        self.predict_with(model, prediction)
    }

    fn predict_with(
        &self,
        model: &Arc<dyn MeasurementModel>,
        prediction: &ParticleState,
    ) -> Result<Arc<ParticleState>> {
        check_state_dimension(model.as_ref(), prediction)?;
        let key = PredictionKey {
            model: ModelIdentity(Arc::clone(model)),
            population: prediction.cache_key(),
        };
        let (predicted, lookup) = self.predictions.get_or_compute(key, || {
            self.counters
                .prediction_evaluations
                .fetch_add(prediction.len() as u64, Ordering::Relaxed);
            project(model.as_ref(), prediction)
        });
        if lookup == Lookup::Hit {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            trace!("Measurement prediction served from cache");
        }
        Ok(predicted)
    }

    #[cfg(feature = "parallel")]
    fn runs_parallel(&self, n: usize) -> bool {
        self.config.parallel && n >= self.config.parallel_threshold
    }

    /// Per-particle likelihoods, or `None` if the deadline ran out first
    fn likelihoods(
        &self,
        model: &dyn MeasurementModel,
        particles: &[Particle],
        measurement: &DVector<f64>,
        started: Instant,
    ) -> Option<Vec<f64>> {
        let deadline = self.config.deadline();
        let evaluate = |particle: &Particle| -> Option<f64> {
            if let Some(budget) = deadline
                && started.elapsed() > budget
            {
                return None;
            }
            Some(model.pdf(measurement, &particle.state_vector))
        };
        #[cfg(feature = "parallel")]
        if self.runs_parallel(particles.len()) {
            return particles.par_iter().map(&evaluate).collect();
        }
        particles.iter().map(&evaluate).collect()
    }
}

/// Particles must live in the model's state space. An empty population passes.
fn check_state_dimension(model: &dyn MeasurementModel, prediction: &ParticleState) -> Result<()> {
    match prediction.iter().find(|p| p.ndim() != model.ndim_state()) {
        Some(particle) => Err(UpdateError::DimensionMismatch {
            expected: model.ndim_state(),
            actual: particle.ndim(),
        }),
        None => Ok(()),
    }
}

fn project(model: &dyn MeasurementModel, prediction: &ParticleState) -> ParticleState {
    let particles = prediction
        .particles
        .iter()
        .map(|particle| Particle {
            state_vector: model.function(&particle.state_vector, None),
            weight: particle.weight,
            parent: particle.parent,
            timestamp: prediction.timestamp,
        })
        .collect();
    ParticleState::new(particles, prediction.timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::{LinearGaussian, ModelKind};
    use crate::particle::ParentRef;
    use assert_approx_eq::assert_approx_eq;
    use chrono::{TimeZone, Utc};
    use nalgebra::DMatrix;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// 1-D model with density `exp(-(z - x)²)`, counting forward evaluations
    #[derive(Debug, Default)]
    struct SquaredExp {
        forward_calls: AtomicUsize,
        delay: Option<Duration>,
    }
    impl MeasurementModel for SquaredExp {
        fn name(&self) -> &str {
            "SquaredExp"
        }
        fn ndim_state(&self) -> usize {
            1
        }
        fn ndim_meas(&self) -> usize {
            1
        }
        fn kind(&self) -> ModelKind {
            ModelKind::NonLinear
        }
        fn covar(&self) -> DMatrix<f64> {
            DMatrix::identity(1, 1)
        }
        fn function(&self, state: &DVector<f64>, _noise: Option<&DVector<f64>>) -> DVector<f64> {
            self.forward_calls.fetch_add(1, Ordering::SeqCst);
            state * 10.0
        }
        fn pdf(&self, measurement: &DVector<f64>, state: &DVector<f64>) -> f64 {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            (-(measurement[0] - state[0]).powi(2)).exp()
        }
    }

    /// Density is identically `value`
    #[derive(Debug)]
    struct Constant(f64);
    impl MeasurementModel for Constant {
        fn name(&self) -> &str {
            "Constant"
        }
        fn ndim_state(&self) -> usize {
            1
        }
        fn ndim_meas(&self) -> usize {
            1
        }
        fn kind(&self) -> ModelKind {
            ModelKind::NonLinear
        }
        fn covar(&self) -> DMatrix<f64> {
            DMatrix::identity(1, 1)
        }
        fn function(&self, state: &DVector<f64>, _noise: Option<&DVector<f64>>) -> DVector<f64> {
            state.clone()
        }
        fn pdf(&self, _measurement: &DVector<f64>, _state: &DVector<f64>) -> f64 {
            self.0
        }
    }

    struct FailingResampler;
    impl Resampler for FailingResampler {
        fn resample(&self, _particles: Vec<Particle>) -> std::result::Result<Vec<Particle>, ResampleError> {
            Err(ResampleError::InvalidWeights("refused".into()))
        }
    }

    fn three_particles() -> ParticleState {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        ParticleState::uniform(
            vec![
                DVector::from_element(1, 0.0),
                DVector::from_element(1, 1.0),
                DVector::from_element(1, 2.0),
            ],
            Some(ts),
        )
    }

    fn updater_with(model: impl MeasurementModel + 'static) -> ParticleUpdater {
        ParticleUpdater::new(ResamplingStrategy::Systematic).with_measurement_model(Arc::new(model))
    }

    #[test]
    fn weighting_matches_reference_values() {
        let updater = updater_with(SquaredExp::default());
        let outcome = updater
            .weight(three_particles(), &Detection::from(vec![1.0]))
            .unwrap();
        let WeightingOutcome::Normalized(state) = outcome else {
            panic!("expected a normalised population");
        };
        let w = state.weights();
        assert_approx_eq!(w[0], 0.2119, 1e-4);
        assert_approx_eq!(w[1], 0.5761, 1e-4);
        assert_approx_eq!(w[2], 0.2119, 1e-4);
        assert_approx_eq!(state.total_weight(), 1.0, 1e-12);
    }

    #[test]
    fn constant_likelihood_keeps_relative_weights() {
        let updater = updater_with(Constant(0.3));
        let mut prior = three_particles();
        prior.set_weights(&[0.2, 0.5, 0.3]);
        let state = updater
            .weight(prior, &Detection::from(vec![0.0]))
            .unwrap()
            .into_state();
        assert_eq!(state.len(), 3);
        assert_approx_eq!(state.particles[0].weight, 0.2, 1e-12);
        assert_approx_eq!(state.particles[1].weight, 0.5, 1e-12);
        assert_approx_eq!(state.particles[2].weight, 0.3, 1e-12);
    }

    #[test]
    fn posterior_is_normalised_and_keeps_timestamp() {
        let updater = updater_with(SquaredExp::default());
        let prior = three_particles();
        let ts = prior.timestamp;
        let posterior = updater.update(prior, &Detection::from(vec![1.0])).unwrap();
        assert_eq!(posterior.len(), 3);
        assert_eq!(posterior.timestamp, ts);
        assert_approx_eq!(posterior.total_weight(), 1.0, 1e-9);
        assert!(posterior.iter().all(|p| p.parent.is_some()));
        assert_eq!(updater.diagnostics().updates, 1);
    }

    #[test]
    fn degenerate_update_preserves_population_size() {
        let updater = updater_with(Constant(0.0));
        let prior = three_particles();
        let posterior = updater.update(prior.clone(), &Detection::from(vec![9.0])).unwrap();
        assert_eq!(posterior.len(), 3);
        assert_approx_eq!(posterior.total_weight(), 1.0, 1e-12);
        for (before, after) in prior.iter().zip(posterior.iter()) {
            assert_eq!(before.state_vector, after.state_vector);
            assert_approx_eq!(after.weight, 1.0 / 3.0, 1e-12);
        }
        assert_eq!(updater.diagnostics().degenerate_updates, 1);
    }

    #[test]
    fn non_finite_likelihood_is_degenerate() {
        let updater = updater_with(Constant(f64::INFINITY));
        let outcome = updater
            .weight(three_particles(), &Detection::from(vec![0.0]))
            .unwrap();
        assert!(matches!(outcome, WeightingOutcome::Degenerate(_)));
    }

    #[test]
    fn missing_model_is_a_configuration_error() {
        let updater = ParticleUpdater::default();
        let err = updater
            .update(three_particles(), &Detection::from(vec![1.0]))
            .unwrap_err();
        assert!(matches!(err, UpdateError::Configuration(_)));
    }

    #[test]
    fn detection_model_takes_precedence() {
        // Updater model would zero every likelihood; the detection's model must be used
        let updater = updater_with(Constant(0.0));
        let detection = Detection::from(vec![1.0]).with_model(Arc::new(SquaredExp::default()));
        let outcome = updater.weight(three_particles(), &detection).unwrap();
        assert!(matches!(outcome, WeightingOutcome::Normalized(_)));
    }

    #[test]
    fn empty_prior_and_bad_dimension_are_rejected() {
        let updater = updater_with(SquaredExp::default());
        let err = updater
            .update(ParticleState::default(), &Detection::from(vec![1.0]))
            .unwrap_err();
        assert!(matches!(err, UpdateError::EmptyPopulation));
        let err = updater
            .update(three_particles(), &Detection::from(vec![1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(
            err,
            UpdateError::DimensionMismatch {
                expected: 1,
                actual: 2
            }
        ));
    }

    #[test]
    fn resampler_failure_propagates_unchanged() {
        let updater = ParticleUpdater::new(FailingResampler)
            .with_measurement_model(Arc::new(SquaredExp::default()));
        let err = updater
            .update(three_particles(), &Detection::from(vec![1.0]))
            .unwrap_err();
        match err {
            UpdateError::Resampling(inner) => {
                assert_eq!(inner, ResampleError::InvalidWeights("refused".into()))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn deadline_overrun_returns_prior() {
        let model = SquaredExp {
            delay: Some(Duration::from_millis(5)),
            ..Default::default()
        };
        let updater = updater_with(model).with_config(UpdaterConfig {
            deadline_ms: Some(1),
            parallel: false,
            ..Default::default()
        });
        let prior = three_particles();
        let posterior = updater.update(prior.clone(), &Detection::from(vec![1.0])).unwrap();
        assert_eq!(posterior, prior);
        assert_eq!(updater.diagnostics().deadline_aborts, 1);
    }

    #[test]
    fn measurement_prediction_projects_and_preserves_lineage() {
        let updater = updater_with(SquaredExp::default());
        let mut prior = three_particles();
        prior.particles[1].parent = Some(ParentRef { index: 4 });
        let predicted = updater.measurement_prediction(&prior).unwrap();
        assert_eq!(predicted.len(), 3);
        assert_eq!(predicted.timestamp, prior.timestamp);
        assert_eq!(predicted.particles[2].state_vector[0], 20.0);
        assert_eq!(predicted.particles[1].parent, Some(ParentRef { index: 4 }));
        assert_approx_eq!(predicted.particles[0].weight, 1.0 / 3.0, 1e-12);
        assert!(predicted.iter().all(|p| p.timestamp == prior.timestamp));
    }

    #[test]
    fn measurement_prediction_is_memoised_by_value() {
        let model = Arc::new(SquaredExp::default());
        let updater = ParticleUpdater::default().with_measurement_model(model.clone());
        let first = updater.measurement_prediction(&three_particles()).unwrap();
        let calls_after_first = model.forward_calls.load(Ordering::SeqCst);
        assert_eq!(calls_after_first, 3);

        // A distinct but equal population
        let second = updater.measurement_prediction(&three_particles()).unwrap();
        assert_eq!(model.forward_calls.load(Ordering::SeqCst), calls_after_first);
        assert_eq!(first, second);

        let diagnostics = updater.diagnostics();
        assert_eq!(diagnostics.cache_hits, 1);
        assert_eq!(diagnostics.prediction_evaluations, 3);

        let mut changed = three_particles();
        changed.particles[0].weight = 0.5;
        updater.measurement_prediction(&changed).unwrap();
        assert_eq!(model.forward_calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn prediction_cache_is_bounded() {
        let model = Arc::new(SquaredExp::default());
        let updater = ParticleUpdater::default()
            .with_config(UpdaterConfig {
                prediction_cache_capacity: 1,
                ..Default::default()
            })
            .with_measurement_model(model.clone());
        let a = three_particles();
        let mut b = three_particles();
        b.timestamp = None;
        updater.measurement_prediction(&a).unwrap();
        updater.measurement_prediction(&b).unwrap();
        // `a` was evicted by `b`
        updater.measurement_prediction(&a).unwrap();
        assert_eq!(model.forward_calls.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn particles_outside_model_state_space_are_rejected() {
        // 4-D model, 1-D particles, detection of the right measurement length
        let model = LinearGaussian::new(4, vec![0, 2], DMatrix::identity(2, 2));
        let updater = updater_with(model);
        let err = updater
            .update(three_particles(), &Detection::from(vec![1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(
            err,
            UpdateError::DimensionMismatch {
                expected: 4,
                actual: 1
            }
        ));
        assert_eq!(updater.diagnostics().updates, 0);

        let err = updater.measurement_prediction(&three_particles()).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::DimensionMismatch {
                expected: 4,
                actual: 1
            }
        ));
        assert_eq!(updater.diagnostics().prediction_evaluations, 0);
    }

    #[test]
    fn prediction_for_detection_uses_its_model() {
        let own = Arc::new(SquaredExp::default());
        let detection = Detection::from(vec![1.0]).with_model(own.clone());

        // No updater model: only the detection-aware form can project
        let updater = ParticleUpdater::default();
        assert!(matches!(
            updater.measurement_prediction(&three_particles()),
            Err(UpdateError::Configuration(_))
        ));
        let predicted = updater
            .measurement_prediction_for(&three_particles(), &detection)
            .unwrap();
        assert_eq!(predicted.particles[1].state_vector[0], 10.0);
        assert_eq!(own.forward_calls.load(Ordering::SeqCst), 3);

        assert!(matches!(
            updater.measurement_prediction_for(&three_particles(), &Detection::from(vec![1.0])),
            Err(UpdateError::Configuration(_))
        ));
    }

    #[test]
    fn predictions_are_cached_per_model() {
        let fallback = Arc::new(SquaredExp::default());
        let own = Arc::new(SquaredExp::default());
        let updater = ParticleUpdater::default().with_measurement_model(fallback.clone());
        let tagged = Detection::from(vec![1.0]).with_model(own.clone());
        let untagged = Detection::from(vec![1.0]);

        updater.measurement_prediction(&three_particles()).unwrap();
        // Same population, same model through the fallback path: a hit
        updater
            .measurement_prediction_for(&three_particles(), &untagged)
            .unwrap();
        // Same population, different model: a separate entry
        updater
            .measurement_prediction_for(&three_particles(), &tagged)
            .unwrap();

        assert_eq!(fallback.forward_calls.load(Ordering::SeqCst), 3);
        assert_eq!(own.forward_calls.load(Ordering::SeqCst), 3);
        assert_eq!(updater.diagnostics().cache_hits, 1);
    }

    #[test]
    fn linear_gaussian_update_concentrates_near_measurement() {
        let model = LinearGaussian::new(1, vec![0], DMatrix::from_element(1, 1, 0.01));
        let updater = updater_with(model);
        let states = (0..200).map(|i| DVector::from_element(1, i as f64 * 0.05)).collect();
        let prior = ParticleState::uniform(states, None);
        let posterior = updater.update(prior, &Detection::from(vec![5.0])).unwrap();
        assert_eq!(posterior.len(), 200);
        assert!((posterior.mean()[0] - 5.0).abs() < 0.1);
    }
}
