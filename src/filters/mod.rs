//! Recursive estimators for the collision benchmark.
//!
//! Every variant shares the same linear predict/correct machinery in
//! [`KalmanCore`]; the variants differ only in what they do around it.

use std::fmt;
use std::str::FromStr;

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::model::{check_pd, symmetrize, CovarianceForm, DiscreteModel};
use crate::EstimationError;

pub mod adaptive;
pub mod injection;
pub mod standard;

pub use adaptive::{AdaptiveForgettingFilter, ForgettingParams, ForgettingStats};
pub use injection::TargetedInjectionFilter;
pub use standard::StandardFilter;

/// Innovation variances at or below this are treated as singular.
const SINGULAR_TOL: f64 = 1e-12;

/// Scalar measurement residual and its predicted variance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Innovation {
    pub residual: f64,
    pub variance: f64,
}

impl Innovation {
    /// `e^T S^-1 e` for the scalar case.
    pub fn normalized_squared(&self) -> f64 {
        self.residual * self.residual / self.variance
    }
}

/// Linear-Gaussian mean/covariance pair plus the model that moves it.
#[derive(Debug, Clone)]
pub struct KalmanCore {
    model: DiscreteModel,
    form: CovarianceForm,
    mean: Vector2<f64>,
    covariance: Matrix2<f64>,
}

impl KalmanCore {
    pub fn new(
        model: DiscreteModel,
        mean: Vector2<f64>,
        covariance: Matrix2<f64>,
    ) -> Result<Self, EstimationError> {
        model.validate()?;
        if !mean.iter().all(|v| v.is_finite()) {
            return Err(EstimationError::InvalidConfig(
                "initial mean must be finite".to_string(),
            ));
        }
        check_pd("initial covariance", &covariance)?;
        Ok(Self {
            model,
            form: CovarianceForm::default(),
            mean,
            covariance,
        })
    }

    pub fn with_form(mut self, form: CovarianceForm) -> Self {
        self.form = form;
        self
    }

    pub fn model(&self) -> &DiscreteModel {
        &self.model
    }

    pub fn mean(&self) -> Vector2<f64> {
        self.mean
    }

    pub fn covariance(&self) -> Matrix2<f64> {
        self.covariance
    }

    /// `x <- A x + B u`, `P <- A P A^T + Q`.
    pub fn predict(&mut self, u: f64) {
        let prior = self.covariance;
        self.propagate(u, prior);
    }

    /// Time update starting from an arbitrary prior covariance.
    pub(crate) fn propagate(&mut self, u: f64, prior: Matrix2<f64>) {
        let m = &self.model;
        self.mean = m.a * self.mean + m.b * u;
        self.covariance = symmetrize(&(m.a * prior * m.a.transpose() + m.q));
    }

    /// Residual of `y` against the current estimate.
    pub fn innovation(&self, y: f64) -> Result<Innovation, EstimationError> {
        let m = &self.model;
        let residual = y - (m.c * self.mean)[0];
        let variance = (m.c * self.covariance * m.c.transpose())[0] + m.r;
        if !variance.is_finite() || variance.abs() <= SINGULAR_TOL {
            return Err(EstimationError::SingularInnovationCovariance { variance });
        }
        Ok(Innovation { residual, variance })
    }

    /// Measurement update. The estimate is left untouched on error.
    pub fn correct(&mut self, y: f64) -> Result<Innovation, EstimationError> {
        let innovation = self.innovation(y)?;
        let m = &self.model;

        let gain = self.covariance * m.c.transpose() / innovation.variance;
        let mean = self.mean + gain * innovation.residual;
        let i_kc = Matrix2::identity() - gain * m.c;
        let covariance = match self.form {
            CovarianceForm::Simple => i_kc * self.covariance,
            CovarianceForm::Joseph => {
                i_kc * self.covariance * i_kc.transpose() + gain * gain.transpose() * m.r
            }
        };
        let covariance = symmetrize(&covariance);

        if !(mean.iter().all(|v| v.is_finite()) && covariance.iter().all(|v| v.is_finite())) {
            return Err(EstimationError::NonFiniteState);
        }

        self.mean = mean;
        self.covariance = covariance;
        Ok(innovation)
    }

    pub(crate) fn set_covariance(&mut self, covariance: Matrix2<f64>) {
        self.covariance = covariance;
    }
}

/// Which estimator to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterKind {
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "adaptive")]
    AdaptiveForgetting,
    #[serde(rename = "injection")]
    TargetedInjection,
}

impl FilterKind {
    /// Canonical order used for runs and outputs.
    pub const ALL: [FilterKind; 3] = [
        FilterKind::Standard,
        FilterKind::AdaptiveForgetting,
        FilterKind::TargetedInjection,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FilterKind::Standard => "standard",
            FilterKind::AdaptiveForgetting => "adaptive",
            FilterKind::TargetedInjection => "injection",
        }
    }

    /// Short legend label.
    pub fn label(self) -> &'static str {
        match self {
            FilterKind::Standard => "KF",
            FilterKind::AdaptiveForgetting => "KF*",
            FilterKind::TargetedInjection => "KF+inj",
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FilterKind {
    type Err = EstimationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        FilterKind::ALL
            .into_iter()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| {
                EstimationError::InvalidConfig(format!(
                    "unknown filter '{wanted}'. valid filters: standard,adaptive,injection"
                ))
            })
    }
}

/// Deduplicates and sorts into [`FilterKind::ALL`] order.
pub fn canonical_filter_list(raw: &[FilterKind]) -> Vec<FilterKind> {
    FilterKind::ALL
        .into_iter()
        .filter(|k| raw.contains(k))
        .collect()
}

/// One estimator of any kind, selected at construction.
#[derive(Debug, Clone)]
pub enum Estimator {
    Standard(StandardFilter),
    AdaptiveForgetting(AdaptiveForgettingFilter),
    TargetedInjection(TargetedInjectionFilter),
}

impl Estimator {
    pub fn from_config(kind: FilterKind, cfg: &RunConfig) -> Result<Self, EstimationError> {
        let mean = cfg.initial_mean();
        let covariance = cfg.initial_covariance();
        let form = cfg.model.covariance_form;

        let estimator = match kind {
            FilterKind::Standard => Estimator::Standard(
                StandardFilter::new(cfg.model()?, mean, covariance)?.with_covariance_form(form),
            ),
            FilterKind::AdaptiveForgetting => Estimator::AdaptiveForgetting(
                AdaptiveForgettingFilter::new(
                    cfg.adaptive_model()?,
                    cfg.adaptive.forgetting_params(),
                    mean,
                    covariance,
                )?
                .with_covariance_form(form),
            ),
            FilterKind::TargetedInjection => Estimator::TargetedInjection(
                TargetedInjectionFilter::new(
                    cfg.model()?,
                    cfg.injection.threshold,
                    cfg.injection.velocity_injection,
                    mean,
                    covariance,
                )?
                .with_covariance_form(form),
            ),
        };
        Ok(estimator)
    }

    pub fn kind(&self) -> FilterKind {
        match self {
            Estimator::Standard(_) => FilterKind::Standard,
            Estimator::AdaptiveForgetting(_) => FilterKind::AdaptiveForgetting,
            Estimator::TargetedInjection(_) => FilterKind::TargetedInjection,
        }
    }

    /// Time update. `y` is only read by the forgetting-factor variant.
    pub fn predict(&mut self, u: f64, y: f64) {
        match self {
            Estimator::Standard(f) => f.predict(u),
            Estimator::AdaptiveForgetting(f) => f.predict(u, y),
            Estimator::TargetedInjection(f) => f.predict(u),
        }
    }

    pub fn update(&mut self, y: f64) -> Result<Innovation, EstimationError> {
        match self {
            Estimator::Standard(f) => f.update(y),
            Estimator::AdaptiveForgetting(f) => f.update(y),
            Estimator::TargetedInjection(f) => f.update(y),
        }
    }

    pub fn mean(&self) -> Vector2<f64> {
        match self {
            Estimator::Standard(f) => f.mean(),
            Estimator::AdaptiveForgetting(f) => f.mean(),
            Estimator::TargetedInjection(f) => f.mean(),
        }
    }

    pub fn covariance(&self) -> Matrix2<f64> {
        match self {
            Estimator::Standard(f) => f.covariance(),
            Estimator::AdaptiveForgetting(f) => f.covariance(),
            Estimator::TargetedInjection(f) => f.covariance(),
        }
    }

    pub fn forgetting_factor(&self) -> Option<f64> {
        match self {
            Estimator::AdaptiveForgetting(f) => Some(f.forgetting_factor()),
            _ => None,
        }
    }

    pub fn injection_log(&self) -> Option<&[u8]> {
        match self {
            Estimator::TargetedInjection(f) => Some(f.injection_log()),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use nalgebra::{Matrix2, RowVector2, Vector2};

    use crate::model::DiscreteModel;

    pub fn reference_model() -> DiscreteModel {
        DiscreteModel::new(
            Matrix2::new(0.9975, 0.09843, -0.04922, 0.9680),
            Vector2::new(4.948e-4, 9.843e-3),
            RowVector2::new(1.0, 1.0),
            Matrix2::identity() * 0.01,
            0.01,
        )
        .unwrap()
    }

    pub fn prior() -> (Vector2<f64>, Matrix2<f64>) {
        (Vector2::zeros(), Matrix2::identity() * 0.1)
    }

    /// Smooth sinusoid in the measurement with the matching forcing input.
    pub fn inputs(steps: usize) -> Vec<(f64, f64)> {
        (0..steps)
            .map(|k| {
                let t = k as f64 * 0.1;
                (10.0 * t.sin(), 1.5 * (0.8 * t).sin())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{prior, reference_model};
    use super::*;

    #[test]
    fn singular_innovation_is_reported() {
        let mut model = reference_model();
        model.c = nalgebra::RowVector2::new(0.0, 0.0);
        model.r = 1e-14;
        let (mean, cov) = prior();
        let mut core = KalmanCore::new(model, mean, cov).unwrap();
        let before = core.mean();
        let err = core.correct(1.0).unwrap_err();
        assert!(matches!(err, EstimationError::SingularInnovationCovariance { .. }));
        assert_eq!(core.mean(), before);
    }

    #[test]
    fn non_finite_measurement_is_surfaced() {
        let (mean, cov) = prior();
        let mut core = KalmanCore::new(reference_model(), mean, cov).unwrap();
        let err = core.correct(f64::NAN).unwrap_err();
        assert!(matches!(err, EstimationError::NonFiniteState));
        assert_eq!(core.covariance(), cov);
    }

    #[test]
    fn joseph_form_matches_simple_form_with_optimal_gain() {
        let (mean, cov) = prior();
        let mut simple = KalmanCore::new(reference_model(), mean, cov).unwrap();
        let mut joseph = simple.clone().with_form(CovarianceForm::Joseph);

        simple.predict(1.0);
        joseph.predict(1.0);
        simple.correct(0.3).unwrap();
        joseph.correct(0.3).unwrap();

        assert!((simple.covariance() - joseph.covariance()).norm() < 1e-12);
        assert!((simple.mean() - joseph.mean()).norm() < 1e-15);
    }

    #[test]
    fn rejects_indefinite_prior() {
        let bad = Matrix2::new(0.1, 0.0, 0.0, -0.1);
        assert!(KalmanCore::new(reference_model(), Vector2::zeros(), bad).is_err());
    }

    #[test]
    fn filter_names_parse_and_order() {
        assert_eq!("Adaptive".parse::<FilterKind>().unwrap(), FilterKind::AdaptiveForgetting);
        assert!("ukf".parse::<FilterKind>().is_err());

        let list = canonical_filter_list(&[
            FilterKind::TargetedInjection,
            FilterKind::Standard,
            FilterKind::TargetedInjection,
        ]);
        assert_eq!(list, vec![FilterKind::Standard, FilterKind::TargetedInjection]);
    }

    #[test]
    fn estimator_exposes_variant_extras() {
        let cfg = RunConfig::default();
        for kind in FilterKind::ALL {
            let est = Estimator::from_config(kind, &cfg).unwrap();
            assert_eq!(est.kind(), kind);
            assert_eq!(
                est.forgetting_factor().is_some(),
                kind == FilterKind::AdaptiveForgetting
            );
            assert_eq!(est.injection_log().is_some(), kind == FilterKind::TargetedInjection);
        }
    }
}
