//! Linear algebra helpers for measurement models.
//!
//! Public API:
//!     pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn pseudo_inverse(matrix: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn gaussian_log_pdf(innovation: &DVector<f64>, covariance: &DMatrix<f64>) -> f64
//!
//! Square root strategy:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp)
//! 4) Symmetric EVD with eigenvalue floor → S = U * sqrt(Λ⁺) * Uᵀ

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DVector};

/// Compute a robust square root `S` such that approximately `matrix ≈ S * Sᵀ`.
///
/// Attempts Cholesky decomposition first (yielding L such that matrix = L * L^T).
/// If Cholesky fails (e.g., matrix is not positive definite), a jittered Cholesky is tried
/// and finally a symmetric eigenvalue decomposition with floored eigenvalues.
///
/// # Arguments
/// * `matrix` - Square, nominally symmetric matrix.
///
/// # Returns
/// A matrix square root. The Cholesky result is lower triangular, the eigenvalue result
/// is symmetric.
pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    assert!(
        matrix.is_square(),
        "matrix_square_root: matrix must be square"
    );
    const INITIAL_JITTER: f64 = 1e-12;
    const MAX_JITTER: f64 = 1e-6;
    const MAX_TRIES: usize = 6;
    const EIGEN_FLOOR: f64 = 1e-12;
    let p = symmetrize(matrix);
    if let Some(s) = chol_sqrt(&p) {
        return s;
    }
    if let Some(s) = chol_sqrt_with_jitter(&p, INITIAL_JITTER, MAX_JITTER, MAX_TRIES) {
        return s;
    }
    evd_symmetric_sqrt_with_floor(&p, EIGEN_FLOOR)
}

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

fn chol_sqrt(p: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    Cholesky::new(p.clone()).map(|ch| ch.l().into_owned())
}

/// Cholesky with diagonal jitter on a geometric ramp. Returns None if all tries fail.
fn chol_sqrt_with_jitter(
    p: &DMatrix<f64>,
    initial_jitter: f64,
    max_jitter: f64,
    max_tries: usize,
) -> Option<DMatrix<f64>> {
    let n = p.nrows();
    let mut jitter = initial_jitter;
    for _ in 0..max_tries {
        let mut pj = p.clone();
        for i in 0..n {
            pj[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(pj) {
            return Some(ch.l().into_owned());
        }
        jitter *= 10.0;
        if jitter > max_jitter {
            break;
        }
    }
    None
}

/// S = U * sqrt(max(λ, floor)) * Uᵀ
fn evd_symmetric_sqrt_with_floor(p: &DMatrix<f64>, floor: f64) -> DMatrix<f64> {
    let se = SymmetricEigen::new(p.clone());
    let lambdas = se.eigenvalues.map(|l| l.max(floor).sqrt());
    let u = se.eigenvectors;
    let sigma_half = DMatrix::<f64>::from_diagonal(&lambdas);
    &u * sigma_half * u.transpose()
}

/// Moore–Penrose pseudo-inverse via SVD.
///
/// Singular values below `max(rows, cols) * ε * σ_max` are treated as zero, matching the
/// usual numerical rank cutoff. Always produces a `cols × rows` matrix; an ill-conditioned
/// input yields an ill-conditioned (but defined) result.
pub fn pseudo_inverse(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    let (rows, cols) = matrix.shape();
    if rows == 0 || cols == 0 {
        return DMatrix::zeros(cols, rows);
    }
    let svd = matrix.clone().svd(true, true);
    let sigma_max = svd.singular_values.max();
    let tolerance = rows.max(cols) as f64 * f64::EPSILON * sigma_max;
    match svd.pseudo_inverse(tolerance) {
        Ok(inverse) => inverse,
        // Only reachable with a negative tolerance, i.e. a NaN-poisoned input.
        Err(_) => DMatrix::from_element(cols, rows, f64::NAN),
    }
}

/// Natural log of the zero-mean multivariate normal density at `innovation`.
///
/// Returns `f64::NEG_INFINITY` when the covariance square root cannot be inverted, so the
/// corresponding density is exactly zero.
pub fn gaussian_log_pdf(innovation: &DVector<f64>, covariance: &DMatrix<f64>) -> f64 {
    assert_eq!(
        innovation.len(),
        covariance.nrows(),
        "gaussian_log_pdf: innovation and covariance incompatible"
    );
    let dimension = innovation.len() as f64;
    let s = matrix_square_root(covariance);
    let det_s = s.determinant();
    if det_s == 0.0 || !det_s.is_finite() {
        return f64::NEG_INFINITY;
    }
    let whitened = match s.lu().solve(innovation) {
        Some(y) => y,
        None => return f64::NEG_INFINITY,
    };
    let mahalanobis = whitened.norm_squared();
    -0.5 * (dimension * (2.0 * std::f64::consts::PI).ln() + mahalanobis) - det_s.abs().ln()
}

/// Zero-mean multivariate normal density at `innovation`.
#[inline]
pub fn gaussian_pdf(innovation: &DVector<f64>, covariance: &DMatrix<f64>) -> f64 {
    gaussian_log_pdf(innovation, covariance).exp()
}

/* =============================== Tests ==================================== */
