//! Variable forgetting-factor Kalman filter.
//!
//! Three exponentially weighted statistics are tracked: a fast innovation
//! energy, a fast state energy `x^T P x` (both with decay `alpha`) and a slow
//! innovation energy (decay `beta`). When the innovation outgrows what the
//! state uncertainty explains, the covariance is divided by a forgetting
//! factor `lambda` before the time update so older information fades faster.
//!
//! The innovation feeding the statistics is taken against the estimate
//! *before* the time update, using the measurement of the step being
//! predicted into.

use nalgebra::{Matrix2, Vector2};
use tracing::debug;

use crate::filters::{Innovation, KalmanCore};
use crate::model::{CovarianceForm, DiscreteModel};
use crate::EstimationError;

/// Decay rates and bounds for the forgetting factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForgettingParams {
    /// Fast decay, `1 - 1/K_alpha`
    pub alpha: f64,
    /// Slow decay, `1 - 1/K_beta`
    pub beta: f64,
    pub lambda_min: f64,
    pub lambda_max: f64,
    /// Guard added to both sides of the ratio
    pub eps: f64,
}

impl ForgettingParams {
    pub fn validate(&self) -> Result<(), EstimationError> {
        if !((0.0..1.0).contains(&self.alpha) && (0.0..1.0).contains(&self.beta)) {
            return Err(EstimationError::InvalidConfig(
                "forgetting decay rates must be in [0, 1)".to_string(),
            ));
        }
        if !(self.lambda_min > 0.0 && self.lambda_min <= self.lambda_max && self.lambda_max <= 1.0)
        {
            return Err(EstimationError::InvalidConfig(
                "forgetting bounds must satisfy 0 < lambda_min <= lambda_max <= 1".to_string(),
            ));
        }
        if !(self.eps.is_finite() && self.eps > 0.0) {
            return Err(EstimationError::InvalidConfig("eps must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Running statistics behind the forgetting factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForgettingStats {
    pub innovation_energy: f64,
    pub state_energy: f64,
    pub slow_innovation_energy: f64,
    /// Current forgetting factor
    pub lambda: f64,
}

impl ForgettingStats {
    pub fn new(params: &ForgettingParams) -> Self {
        Self {
            innovation_energy: 1.0,
            state_energy: 1.0,
            slow_innovation_energy: 1.0,
            lambda: params.lambda_max,
        }
    }

    /// Folds in one squared innovation and one state energy sample.
    pub fn advance(self, innovation_sq: f64, state_energy: f64, params: &ForgettingParams) -> Self {
        let innovation_energy =
            params.alpha * self.innovation_energy + (1.0 - params.alpha) * innovation_sq;
        let state_energy = params.alpha * self.state_energy + (1.0 - params.alpha) * state_energy;
        let slow_innovation_energy =
            params.beta * self.slow_innovation_energy + (1.0 - params.beta) * innovation_sq;

        let lambda = if innovation_energy.sqrt() <= state_energy.sqrt() {
            params.lambda_max
        } else {
            let ratio =
                (slow_innovation_energy + params.eps) / (innovation_energy - state_energy + params.eps);
            // min/max rather than clamp: a NaN ratio lands on a bound.
            ratio.min(params.lambda_max).max(params.lambda_min)
        };

        Self {
            innovation_energy,
            state_energy,
            slow_innovation_energy,
            lambda,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveForgettingFilter {
    core: KalmanCore,
    params: ForgettingParams,
    stats: ForgettingStats,
}

impl AdaptiveForgettingFilter {
    /// `model.q` is the process noise used after forgetting.
    pub fn new(
        model: DiscreteModel,
        params: ForgettingParams,
        mean: Vector2<f64>,
        covariance: Matrix2<f64>,
    ) -> Result<Self, EstimationError> {
        params.validate()?;
        Ok(Self {
            core: KalmanCore::new(model, mean, covariance)?,
            stats: ForgettingStats::new(&params),
            params,
        })
    }

    pub fn with_covariance_form(mut self, form: CovarianceForm) -> Self {
        self.core = self.core.with_form(form);
        self
    }

    pub fn predict(&mut self, u: f64, y: f64) {
        let mean = self.core.mean();
        let p = self.core.covariance();
        let residual = y - (self.core.model().c * mean)[0];
        let state_energy = (mean.transpose() * p * mean)[0];

        self.stats = self
            .stats
            .advance(residual * residual, state_energy, &self.params);
        let lambda = self.stats.lambda;
        if lambda < self.params.lambda_max {
            debug!(lambda, residual, "forgetting active");
        }

        let forgotten = p + p * (1.0 / lambda - 1.0);
        self.core.propagate(u, forgotten);
    }

    pub fn update(&mut self, y: f64) -> Result<Innovation, EstimationError> {
        self.core.correct(y)
    }

    pub fn forgetting_factor(&self) -> f64 {
        self.stats.lambda
    }

    pub fn stats(&self) -> ForgettingStats {
        self.stats
    }

    pub fn mean(&self) -> Vector2<f64> {
        self.core.mean()
    }

    pub fn covariance(&self) -> Matrix2<f64> {
        self.core.covariance()
    }
}
