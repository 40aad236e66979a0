//! Kalman filter with anomaly-triggered velocity covariance injection.
//!
//! Each update first scores the innovation by `d^2 = e^2 / S`. Above the
//! threshold the step is treated as an unmodeled impact: a fixed variance is
//! added to the velocity entry of `P` only, before the gain is formed, so
//! position confidence survives while velocity is allowed to jump.

use nalgebra::{Matrix2, Vector2};
use tracing::debug;

use crate::filters::{Innovation, KalmanCore};
use crate::model::{CovarianceForm, DiscreteModel};
use crate::EstimationError;

#[derive(Debug, Clone)]
pub struct TargetedInjectionFilter {
    core: KalmanCore,
    threshold: f64,
    injection: Matrix2<f64>,
    log: Vec<u8>,
}

impl TargetedInjectionFilter {
    pub fn new(
        model: DiscreteModel,
        threshold: f64,
        velocity_injection: f64,
        mean: Vector2<f64>,
        covariance: Matrix2<f64>,
    ) -> Result<Self, EstimationError> {
        if !(threshold.is_finite() && threshold > 0.0) {
            return Err(EstimationError::InvalidConfig(
                "injection threshold must be > 0".to_string(),
            ));
        }
        if !(velocity_injection.is_finite() && velocity_injection >= 0.0) {
            return Err(EstimationError::InvalidConfig(
                "velocity_injection must be >= 0".to_string(),
            ));
        }
        Ok(Self {
            core: KalmanCore::new(model, mean, covariance)?,
            threshold,
            injection: Matrix2::new(0.0, 0.0, 0.0, velocity_injection),
            log: Vec::new(),
        })
    }

    pub fn with_covariance_form(mut self, form: CovarianceForm) -> Self {
        self.core = self.core.with_form(form);
        self
    }

    pub fn predict(&mut self, u: f64) {
        self.core.predict(u);
    }

    /// Screens `y`, injects if anomalous, then runs the standard update.
    /// On error the covariance and log are left as they were.
    pub fn update(&mut self, y: f64) -> Result<Innovation, EstimationError> {
        let before = self.core.covariance();
        let injected = self.screen(y)?;
        match self.core.correct(y) {
            Ok(innovation) => {
                self.log.push(u8::from(injected));
                Ok(innovation)
            }
            Err(err) => {
                self.core.set_covariance(before);
                Err(err)
            }
        }
    }

    /// Anomaly test and pre-gain injection.
    fn screen(&mut self, y: f64) -> Result<bool, EstimationError> {
        let innovation = self.core.innovation(y)?;
        let d2 = innovation.normalized_squared();
        if d2 > self.threshold {
            debug!(
                step = self.log.len(),
                d2,
                threshold = self.threshold,
                "innovation anomaly, injecting velocity covariance"
            );
            self.core
                .set_covariance(self.core.covariance() + self.injection);
            return Ok(true);
        }
        Ok(false)
    }

    /// One 0/1 flag per completed update.
    pub fn injection_log(&self) -> &[u8] {
        &self.log
    }

    pub fn injection_count(&self) -> usize {
        self.log.iter().filter(|&&flag| flag == 1).count()
    }

    pub fn mean(&self) -> Vector2<f64> {
        self.core.mean()
    }

    pub fn covariance(&self) -> Matrix2<f64> {
        self.core.covariance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::{inputs, prior, reference_model};
    use crate::filters::StandardFilter;

    fn filter() -> TargetedInjectionFilter {
        let (mean, cov) = prior();
        TargetedInjectionFilter::new(reference_model(), 9.0, 0.1, mean, cov).unwrap()
    }

    #[test]
    fn quiet_run_matches_standard_filter() {
        let (mean, cov) = prior();
        let mut standard = StandardFilter::new(reference_model(), mean, cov).unwrap();
        let mut targeted = filter();

        for (u, y) in inputs(250) {
            standard.predict(u);
            targeted.predict(u);
            standard.update(y).unwrap();
            targeted.update(y).unwrap();
            assert_eq!(targeted.mean(), standard.mean());
            assert_eq!(targeted.covariance(), standard.covariance());
        }
        assert_eq!(targeted.injection_log().len(), 250);
        assert_eq!(targeted.injection_count(), 0);
    }

    #[test]
    fn anomaly_injects_velocity_variance_only() {
        let mut kf = filter();
        kf.predict(0.0);
        let before = kf.covariance();

        assert!(kf.screen(25.0).unwrap());
        let after = kf.covariance();

        assert!(after[(1, 1)] - before[(1, 1)] >= 0.1 - 1e-15);
        assert_eq!(after[(0, 0)], before[(0, 0)]);
        assert_eq!(after[(0, 1)], before[(0, 1)]);
        assert_eq!(after[(1, 0)], before[(1, 0)]);
    }

    #[test]
    fn forced_anomaly_is_logged_at_its_step() {
        let mut kf = filter();
        let seq = inputs(30);
        for (k, (u, y)) in seq.into_iter().enumerate() {
            let y = if k == 20 { y + 25.0 } else { y };
            kf.predict(u);
            kf.update(y).unwrap();
        }
        let log = kf.injection_log();
        assert_eq!(log.len(), 30);
        assert!(log[..20].iter().all(|&flag| flag == 0));
        assert_eq!(log[20], 1);
        assert!(kf.injection_count() >= 1);
    }

    #[test]
    fn injected_step_widens_velocity_uncertainty_vs_standard() {
        let (mean, cov) = prior();
        let mut standard = StandardFilter::new(reference_model(), mean, cov).unwrap();
        let mut targeted = filter();

        standard.predict(0.0);
        targeted.predict(0.0);
        standard.update(25.0).unwrap();
        targeted.update(25.0).unwrap();

        assert_eq!(targeted.injection_log(), &[1]);
        assert!(targeted.covariance()[(1, 1)] > standard.covariance()[(1, 1)]);
    }

    #[test]
    fn failed_update_leaves_state_untouched() {
        let mut kf = filter();
        kf.predict(0.0);
        let before = kf.covariance();
        assert!(kf.update(f64::NAN).is_err());
        assert_eq!(kf.covariance(), before);
        assert!(kf.injection_log().is_empty());
    }

    #[test]
    fn rejects_negative_injection() {
        let (mean, cov) = prior();
        assert!(TargetedInjectionFilter::new(reference_model(), 9.0, -0.1, mean, cov).is_err());
    }
}
