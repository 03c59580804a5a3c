//! Projection of detections back into state space.
//!
//! The effective model is the detection's own model, or the caller's fallback when the
//! detection carries none. Linear models are inverted with the Moore–Penrose pseudo-inverse
//! of their projection matrix, which always yields a state (unobserved components come back
//! as zero). Nonlinear models are inverted through [MeasurementModel::inverse_function];
//! a model without one yields no state.
//!
//! Failures here are never fatal. [try_convert_detection] reports the reason as an
//! [InversionError]; [convert_detection] logs it and returns `None` so callers can skip the
//! detection.
use chrono::{DateTime, Utc};
use log::warn;
use nalgebra::DVector;

use crate::detection::Detection;
use crate::error::InversionError;
use crate::linalg::pseudo_inverse;
use crate::measurements::{MeasurementModel, ModelKind};

/// Invert `detection` into state space, reporting why when it cannot be done
pub fn try_convert_detection(
    detection: &Detection,
    fallback: Option<&dyn MeasurementModel>,
) -> Result<DVector<f64>, InversionError> {
    let model: &dyn MeasurementModel = match (detection.measurement_model.as_deref(), fallback) {
        (Some(own), _) => own,
        (None, Some(fallback)) => fallback,
        (None, None) => return Err(InversionError::NoModel),
    };
    if detection.ndim() != model.ndim_meas() {
        return Err(InversionError::DimensionMismatch {
            expected: model.ndim_meas(),
            actual: detection.ndim(),
        });
    }
    match model.kind() {
        ModelKind::Linear(matrix) => Ok(pseudo_inverse(&matrix) * &detection.state_vector),
        ModelKind::NonLinear => model
            .inverse_function(&detection.state_vector)
            .ok_or_else(|| InversionError::UnsupportedInverse(model.name().to_string())),
    }
}

/// Invert `detection` into state space, logging a warning and returning `None` on failure
pub fn convert_detection(
    detection: &Detection,
    fallback: Option<&dyn MeasurementModel>,
) -> Option<DVector<f64>> {
    match try_convert_detection(detection, fallback) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!("Skipping detection: {e}");
            None
        }
    }
}

/// Invert a batch of detections, dropping those that cannot be inverted.
///
/// Each surviving state keeps its detection's timestamp.
pub fn convert_detections(
    detections: &[Detection],
    fallback: Option<&dyn MeasurementModel>,
) -> Vec<(Option<DateTime<Utc>>, DVector<f64>)> {
    detections
        .iter()
        .filter_map(|d| convert_detection(d, fallback).map(|state| (d.timestamp, state)))
        .collect()
}
