//! Detections: measurements tagged with the model that produced them.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nalgebra::DVector;

use crate::measurements::MeasurementModel;

/// A single measurement.
///
/// When `measurement_model` is set it takes precedence over any model configured on the
/// consumer (updater or inversion fallback).
#[derive(Clone, Debug)]
pub struct Detection {
    pub state_vector: DVector<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub measurement_model: Option<Arc<dyn MeasurementModel>>,
}
impl Detection {
    pub fn new(state_vector: DVector<f64>) -> Self {
        Detection {
            state_vector,
            timestamp: None,
            measurement_model: None,
        }
    }
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
    pub fn with_model(mut self, model: Arc<dyn MeasurementModel>) -> Self {
        self.measurement_model = Some(model);
        self
    }
    pub fn ndim(&self) -> usize {
        self.state_vector.len()
    }
    /// The detection's own model, or `fallback` when it has none
    pub fn resolve_model<'a>(
        &'a self,
        fallback: Option<&'a Arc<dyn MeasurementModel>>,
    ) -> Option<&'a Arc<dyn MeasurementModel>> {
        self.measurement_model.as_ref().or(fallback)
    }
}
impl From<DVector<f64>> for Detection {
    fn from(state_vector: DVector<f64>) -> Self {
        Detection::new(state_vector)
    }
}
impl From<Vec<f64>> for Detection {
    fn from(values: Vec<f64>) -> Self {
        Detection::new(DVector::from_vec(values))
    }
}
