//! Error types for the particle update pipeline.
//!
//! Errors are split by who is expected to handle them. [UpdateError] is returned from the
//! measurement update and is fatal for that update cycle. [InversionError] describes why a
//! detection could not be projected back into state space; callers skip the detection.
//! [ResampleError] originates in a [crate::resampling::Resampler] and is propagated through
//! [UpdateError::Resampling] untouched.

use std::io;

use thiserror::Error;

/// Result type for update operations
pub type Result<T> = std::result::Result<T, UpdateError>;

/// Errors raised by [crate::updater::ParticleUpdater]
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Neither the detection nor the updater carries a measurement model
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The prior population holds no particles
    #[error("Cannot update an empty particle population")]
    EmptyPopulation,

    /// Detection length or particle dimension does not match the model
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Failure reported by the resampler
    #[error(transparent)]
    Resampling(#[from] ResampleError),
}

/// Errors raised by resampling strategies
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResampleError {
    /// Nothing to draw from
    #[error("Cannot resample an empty particle population")]
    Empty,

    /// Weights are negative, non-finite, or sum to zero
    #[error("Invalid particle weights: {0}")]
    InvalidWeights(String),
}

/// Reasons a detection could not be projected into state space
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InversionError {
    /// No model on the detection and no fallback supplied
    #[error("Measurement model type not specified for detection")]
    NoModel,

    /// The resolved model is nonlinear and has no inverse function
    #[error("Nonlinear measurement model '{0}' has no inverse function available")]
    UnsupportedInverse(String),

    /// Detection length does not match the resolved model's measurement space
    #[error("Detection dimension mismatch: model expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Errors raised while reading or writing [crate::config::UpdaterConfig]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access configuration file: {0}")]
    Io(#[from] io::Error),

    #[error("Unsupported configuration file extension: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}
