//! Measurement models mapping state space into observation space.
//!
//! Every model exposes the two capabilities the particle update needs: a likelihood
//! ([MeasurementModel::pdf]) and a forward projection ([MeasurementModel::function]).
//! Models additionally report whether they are linear through [MeasurementModel::kind]. A
//! linear model hands back its projection matrix so callers can invert it directly, while a
//! nonlinear model may or may not implement [MeasurementModel::inverse_function]; an
//! unimplemented inverse is reported as `None` rather than as an error.
//!
//! Three models are provided:
//! - [LinearGaussian]: observes a subset of state components with additive Gaussian noise.
//! - [CartesianToBearingRange]: 2-D polar sensor with an analytic inverse.
//! - [CartesianToBearing]: bearing-only sensor, not invertible.

use std::f64::consts::PI;
use std::fmt::Debug;

use nalgebra::{DMatrix, DVector, Vector2};
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};

use crate::linalg::{gaussian_pdf, matrix_square_root};

/// Linearity of a measurement model
#[derive(Clone, Debug, PartialEq)]
pub enum ModelKind {
    /// Model is `z = H x + v`; carries `H`
    Linear(DMatrix<f64>),
    NonLinear,
}

/// Generic measurement model trait
pub trait MeasurementModel: Debug + Send + Sync {
    /// Short human readable name used in diagnostics
    fn name(&self) -> &str;
    /// Dimension of the state vectors this model accepts
    fn ndim_state(&self) -> usize;
    /// Dimension of the measurement vectors this model produces
    fn ndim_meas(&self) -> usize;
    fn kind(&self) -> ModelKind;
    /// Measurement noise covariance
    fn covar(&self) -> DMatrix<f64>;
    /// Map a state into measurement space. `noise`, when given, is added to the noise-free
    /// projection.
    fn function(&self, state: &DVector<f64>, noise: Option<&DVector<f64>>) -> DVector<f64>;
    /// Difference between two measurements. Models with angular components wrap them.
    fn residual(&self, measurement: &DVector<f64>, predicted: &DVector<f64>) -> DVector<f64> {
        measurement - predicted
    }
    /// Likelihood of `measurement` given `state`
    fn pdf(&self, measurement: &DVector<f64>, state: &DVector<f64>) -> f64 {
        let predicted = self.function(state, None);
        let innovation = self.residual(measurement, &predicted);
        gaussian_pdf(&innovation, &self.covar())
    }
    /// Map a measurement back into state space, if the model supports it
    fn inverse_function(&self, _measurement: &DVector<f64>) -> Option<DVector<f64>> {
        None
    }
    /// Draw one zero-mean noise vector from the measurement noise distribution
    fn sample_noise(&self, rng: &mut dyn RngCore) -> DVector<f64> {
        let n = self.ndim_meas();
        let white = DVector::<f64>::from_fn(n, |_, _| StandardNormal.sample(&mut *rng));
        matrix_square_root(&self.covar()) * white
    }
}

/// Wrap an angle into `[-π, π)`
pub fn wrap_to_pi(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped.is_nan() { angle } else { wrapped }
}

/// Observes the state components listed in `mapping` with additive Gaussian noise
#[derive(Clone, Debug)]
pub struct LinearGaussian {
    pub ndim_state: usize,
    pub mapping: Vec<usize>,
    pub noise_covar: DMatrix<f64>,
}
impl LinearGaussian {
    pub fn new(ndim_state: usize, mapping: Vec<usize>, noise_covar: DMatrix<f64>) -> Self {
        assert!(
            mapping.iter().all(|&i| i < ndim_state),
            "LinearGaussian: mapping index out of range"
        );
        assert_eq!(
            noise_covar.shape(),
            (mapping.len(), mapping.len()),
            "LinearGaussian: noise covariance must match the mapping length"
        );
        LinearGaussian {
            ndim_state,
            mapping,
            noise_covar,
        }
    }
    /// Selection matrix `H` with one unit entry per mapped component
    pub fn matrix(&self) -> DMatrix<f64> {
        let mut h = DMatrix::<f64>::zeros(self.mapping.len(), self.ndim_state);
        for (row, &col) in self.mapping.iter().enumerate() {
            h[(row, col)] = 1.0;
        }
        h
    }
}
impl MeasurementModel for LinearGaussian {
    fn name(&self) -> &str {
        "LinearGaussian"
    }
    fn ndim_state(&self) -> usize {
        self.ndim_state
    }
    fn ndim_meas(&self) -> usize {
        self.mapping.len()
    }
    fn kind(&self) -> ModelKind {
        ModelKind::Linear(self.matrix())
    }
    fn covar(&self) -> DMatrix<f64> {
        self.noise_covar.clone()
    }
    fn function(&self, state: &DVector<f64>, noise: Option<&DVector<f64>>) -> DVector<f64> {
        let projected =
            DVector::from_iterator(self.mapping.len(), self.mapping.iter().map(|&i| state[i]));
        match noise {
            Some(noise) => projected + noise,
            None => projected,
        }
    }
}

/// Bearing and range to a 2-D position from a sensor at `translation_offset`.
///
/// Measurements are `[bearing (rad), range]`.
#[derive(Clone, Debug)]
pub struct CartesianToBearingRange {
    pub ndim_state: usize,
    /// State indices of the x and y position components
    pub mapping: (usize, usize),
    pub noise_covar: DMatrix<f64>,
    pub translation_offset: Vector2<f64>,
}
impl CartesianToBearingRange {
    pub fn new(ndim_state: usize, mapping: (usize, usize), noise_covar: DMatrix<f64>) -> Self {
        assert!(mapping.0 < ndim_state && mapping.1 < ndim_state);
        assert_eq!(noise_covar.shape(), (2, 2));
        CartesianToBearingRange {
            ndim_state,
            mapping,
            noise_covar,
            translation_offset: Vector2::zeros(),
        }
    }
    pub fn with_offset(mut self, offset: Vector2<f64>) -> Self {
        self.translation_offset = offset;
        self
    }
}
impl MeasurementModel for CartesianToBearingRange {
    fn name(&self) -> &str {
        "CartesianToBearingRange"
    }
    fn ndim_state(&self) -> usize {
        self.ndim_state
    }
    fn ndim_meas(&self) -> usize {
        2
    }
    fn kind(&self) -> ModelKind {
        ModelKind::NonLinear
    }
    fn covar(&self) -> DMatrix<f64> {
        self.noise_covar.clone()
    }
    fn function(&self, state: &DVector<f64>, noise: Option<&DVector<f64>>) -> DVector<f64> {
        let dx = state[self.mapping.0] - self.translation_offset.x;
        let dy = state[self.mapping.1] - self.translation_offset.y;
        let mut z = DVector::from_vec(vec![dy.atan2(dx), dx.hypot(dy)]);
        if let Some(noise) = noise {
            z += noise;
        }
        z[0] = wrap_to_pi(z[0]);
        z
    }
    fn residual(&self, measurement: &DVector<f64>, predicted: &DVector<f64>) -> DVector<f64> {
        let mut diff = measurement - predicted;
        diff[0] = wrap_to_pi(diff[0]);
        diff
    }
    fn inverse_function(&self, measurement: &DVector<f64>) -> Option<DVector<f64>> {
        let (bearing, range) = (measurement[0], measurement[1]);
        let mut state = DVector::<f64>::zeros(self.ndim_state);
        state[self.mapping.0] = self.translation_offset.x + range * bearing.cos();
        state[self.mapping.1] = self.translation_offset.y + range * bearing.sin();
        Some(state)
    }
}

/// Bearing to a 2-D position. Range is unobserved so there is no inverse.
#[derive(Clone, Debug)]
pub struct CartesianToBearing {
    pub ndim_state: usize,
    pub mapping: (usize, usize),
    /// Bearing noise variance (rad²)
    pub noise_variance: f64,
    pub translation_offset: Vector2<f64>,
}
impl CartesianToBearing {
    pub fn new(ndim_state: usize, mapping: (usize, usize), noise_variance: f64) -> Self {
        assert!(mapping.0 < ndim_state && mapping.1 < ndim_state);
        CartesianToBearing {
            ndim_state,
            mapping,
            noise_variance,
            translation_offset: Vector2::zeros(),
        }
    }
}
impl MeasurementModel for CartesianToBearing {
    fn name(&self) -> &str {
        "CartesianToBearing"
    }
    fn ndim_state(&self) -> usize {
        self.ndim_state
    }
    fn ndim_meas(&self) -> usize {
        1
    }
    fn kind(&self) -> ModelKind {
        ModelKind::NonLinear
    }
    fn covar(&self) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, self.noise_variance)
    }
    fn function(&self, state: &DVector<f64>, noise: Option<&DVector<f64>>) -> DVector<f64> {
        let dx = state[self.mapping.0] - self.translation_offset.x;
        let dy = state[self.mapping.1] - self.translation_offset.y;
        let noise = noise.map_or(0.0, |n| n[0]);
        DVector::from_element(1, wrap_to_pi(dy.atan2(dx) + noise))
    }
    fn residual(&self, measurement: &DVector<f64>, predicted: &DVector<f64>) -> DVector<f64> {
        DVector::from_element(1, wrap_to_pi(measurement[0] - predicted[0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const EPS: f64 = 1e-12;

    fn position_model() -> LinearGaussian {
        LinearGaussian::new(4, vec![0, 2], DMatrix::<f64>::identity(2, 2) * 0.25)
    }

    #[test]
    fn linear_gaussian_matrix_and_projection() {
        let model = position_model();
        let h = model.matrix();
        assert_eq!(h.shape(), (2, 4));
        assert_eq!(h[(0, 0)], 1.0);
        assert_eq!(h[(1, 2)], 1.0);
        assert_eq!(h.sum(), 2.0);

        let state = DVector::from_vec(vec![1.0, 10.0, 2.0, 20.0]);
        let z = model.function(&state, None);
        assert_eq!(z.as_slice(), &[1.0, 2.0]);
        assert_eq!(&h * &state, z);

        let noisy = model.function(&state, Some(&DVector::from_vec(vec![0.5, -0.5])));
        assert_eq!(noisy.as_slice(), &[1.5, 1.5]);
        assert_eq!(model.kind(), ModelKind::Linear(h));
    }

    #[test]
    fn linear_gaussian_pdf_peaks_at_projection() {
        let model = position_model();
        let state = DVector::from_vec(vec![1.0, 0.0, 2.0, 0.0]);
        let at_truth = model.pdf(&DVector::from_vec(vec![1.0, 2.0]), &state);
        let off_truth = model.pdf(&DVector::from_vec(vec![1.5, 2.0]), &state);
        // det(0.25 I) = 1/16, so peak = 1 / (2π * 0.25)
        assert_approx_eq!(at_truth, 1.0 / (2.0 * PI * 0.25), EPS);
        assert_approx_eq!(off_truth, at_truth * (-0.5f64).exp(), EPS);
    }

    #[test]
    #[should_panic]
    fn linear_gaussian_rejects_bad_mapping() {
        let _ = LinearGaussian::new(2, vec![3], DMatrix::identity(1, 1));
    }

    #[test]
    fn bearing_range_forward_and_inverse() {
        let model = CartesianToBearingRange::new(4, (0, 2), DMatrix::identity(2, 2) * 0.01);
        let state = DVector::from_vec(vec![3.0, 0.0, 4.0, 0.0]);
        let z = model.function(&state, None);
        assert_approx_eq!(z[0], 4.0f64.atan2(3.0), EPS);
        assert_approx_eq!(z[1], 5.0, EPS);

        let back = model.inverse_function(&z).expect("bearing-range is invertible");
        assert_approx_eq!(back[0], 3.0, 1e-9);
        assert_approx_eq!(back[2], 4.0, 1e-9);
        assert_eq!(back[1], 0.0);
        assert_eq!(model.kind(), ModelKind::NonLinear);
    }

    #[test]
    fn bearing_range_respects_offset() {
        let model = CartesianToBearingRange::new(2, (0, 1), DMatrix::identity(2, 2))
            .with_offset(Vector2::new(1.0, 1.0));
        let z = model.function(&DVector::from_vec(vec![1.0, 3.0]), None);
        assert_approx_eq!(z[0], PI / 2.0, EPS);
        assert_approx_eq!(z[1], 2.0, EPS);
        let back = model.inverse_function(&z).unwrap();
        assert_approx_eq!(back[0], 1.0, 1e-9);
        assert_approx_eq!(back[1], 3.0, 1e-9);
    }

    #[test]
    fn bearing_residual_wraps() {
        let model = CartesianToBearing::new(2, (0, 1), 0.01);
        let r = model.residual(
            &DVector::from_element(1, PI - 0.05),
            &DVector::from_element(1, -PI + 0.05),
        );
        assert_approx_eq!(r[0], -0.1, 1e-9);
        assert!(model.inverse_function(&DVector::from_element(1, 0.3)).is_none());
    }

    #[test]
    fn wrap_to_pi_range() {
        assert_approx_eq!(wrap_to_pi(3.0 * PI / 2.0), -PI / 2.0, EPS);
        assert_approx_eq!(wrap_to_pi(-3.0 * PI / 2.0), PI / 2.0, EPS);
        assert_approx_eq!(wrap_to_pi(0.25), 0.25, EPS);
    }

    #[test]
    fn sampled_noise_matches_covariance() {
        let model = LinearGaussian::new(
            2,
            vec![0, 1],
            DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, 0.01])),
        );
        let mut rng = StdRng::seed_from_u64(7);
        let n = 20_000;
        let mut sum_sq = DVector::<f64>::zeros(2);
        for _ in 0..n {
            let v = model.sample_noise(&mut rng);
            sum_sq += v.component_mul(&v);
        }
        let var = sum_sq / n as f64;
        assert!((var[0] - 4.0).abs() < 0.2, "variance {}", var[0]);
        assert!((var[1] - 0.01).abs() < 0.001, "variance {}", var[1]);
    }
}
