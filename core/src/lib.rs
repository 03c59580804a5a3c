//! Particle filter measurement update toolbox
//!
//! This crate implements the measurement-update half of a sequential importance resampling (SIR)
//! particle filter. A prior belief is represented as a weighted population of state hypotheses
//! ("particles"). Given a new detection, every particle's weight is multiplied by the likelihood of
//! the detection under that particle's state, the weights are normalised, and the population is
//! redrawn by a resampler to counteract weight degeneracy. Motion propagation between updates is not
//! part of this crate; callers advance the particles with whatever dynamics model they use and hand
//! the predicted population to [updater::ParticleUpdater::update].
//!
//! This crate is primarily built off of the following dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): state vectors, projection matrices, and the
//!   decompositions behind the Gaussian likelihood and pseudo-inverse.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr):
//!   random offsets for resampling and measurement noise draws.
//! - [`rayon`](https://crates.io/crates/rayon) (optional, `parallel` feature): likelihood evaluation
//!   across a thread pool for large populations.
//!
//! ## Crate overview
//!
//! - [particle]: Particle and population types, point estimates, and lineage tracing.
//! - [detection]: Measurements tagged with an optional producing model.
//! - [measurements]: The [measurements::MeasurementModel] trait and concrete linear and nonlinear models.
//! - [resampling]: The [resampling::Resampler] trait and systematic, stratified, multinomial, residual,
//!   and adaptive resamplers.
//! - [updater]: The SIR update and the memoised measurement prediction.
//! - [inversion]: Projection of detections back into state space.
//! - [cache]: Bounded single-flight memoisation used for measurement predictions.
//! - [config]: Serializable updater configuration.
//! - [linalg]: Linear algebra helpers.
//! - [error]: Error types.
//!
//! ## The update step
//!
//! For a population $\{(x_i, w_i)\}_{i=1}^N$ and a measurement $z$ the update computes
//!
//! $$
//! \tilde w_i = w_i \, p(z \mid x_i), \qquad w_i^+ = \frac{\tilde w_i}{\sum_j \tilde w_j}
//! $$
//!
//! and resamples. If $\sum_j \tilde w_j = 0$ every hypothesis is incompatible with the measurement.
//! The population is then kept at size $N$ with weights $1/N$ and the event is counted in
//! [updater::UpdaterDiagnostics].
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use nalgebra::{DMatrix, DVector};
//! use particle_update::detection::Detection;
//! use particle_update::measurements::LinearGaussian;
//! use particle_update::particle::ParticleState;
//! use particle_update::resampling::ResamplingStrategy;
//! use particle_update::updater::ParticleUpdater;
//!
//! let model = LinearGaussian::new(2, vec![0], DMatrix::from_element(1, 1, 0.5));
//! let updater = ParticleUpdater::new(ResamplingStrategy::Systematic)
//!     .with_measurement_model(Arc::new(model));
//!
//! let states = (0..100)
//!     .map(|i| DVector::from_vec(vec![i as f64 * 0.1, 1.0]))
//!     .collect();
//! let prior = ParticleState::uniform(states, None);
//! let posterior = updater.update(prior, &Detection::from(vec![4.0])).unwrap();
//! assert_eq!(posterior.len(), 100);
//! assert!((posterior.mean()[0] - 4.0).abs() < 0.5);
//! ```
pub mod cache;
pub mod config;
pub mod detection;
pub mod error;
pub mod inversion;
pub mod linalg;
pub mod measurements;
pub mod particle;
pub mod resampling;
pub mod updater;

pub use config::UpdaterConfig;
pub use detection::Detection;
pub use error::{InversionError, ResampleError, UpdateError};
pub use inversion::{convert_detection, convert_detections, try_convert_detection};
pub use measurements::{MeasurementModel, ModelKind};
pub use particle::{ParentRef, Particle, ParticleState};
pub use resampling::{Resampler, ResamplingStrategy};
pub use updater::{ParticleUpdater, UpdaterDiagnostics, WeightingOutcome};
