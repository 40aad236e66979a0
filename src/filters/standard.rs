use nalgebra::{Matrix2, Vector2};

use crate::filters::{Innovation, KalmanCore};
use crate::model::{CovarianceForm, DiscreteModel};
use crate::EstimationError;

/// Linear time-invariant Kalman filter.
#[derive(Debug, Clone)]
pub struct StandardFilter {
    core: KalmanCore,
}

impl StandardFilter {
    pub fn new(
        model: DiscreteModel,
        mean: Vector2<f64>,
        covariance: Matrix2<f64>,
    ) -> Result<Self, EstimationError> {
        Ok(Self {
            core: KalmanCore::new(model, mean, covariance)?,
        })
    }

    pub fn with_covariance_form(mut self, form: CovarianceForm) -> Self {
        self.core = self.core.with_form(form);
        self
    }

    pub fn predict(&mut self, u: f64) {
        self.core.predict(u);
    }

    pub fn update(&mut self, y: f64) -> Result<Innovation, EstimationError> {
        self.core.correct(y)
    }

    pub fn mean(&self) -> Vector2<f64> {
        self.core.mean()
    }

    pub fn covariance(&self) -> Matrix2<f64> {
        self.core.covariance()
    }
}
