//! Runs every requested estimator over one simulated trajectory.

use nalgebra::{Matrix2, Vector2};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::filters::{canonical_filter_list, Estimator, FilterKind};
use crate::sim::{simulate, SimulationData};
use crate::EstimationError;

/// Per-step record of one filter, aligned with [`SimulationData`].
///
/// Index 0 is the prior. `forgetting_factors` and `injections` are only
/// present for the filters that produce them.
#[derive(Debug, Clone)]
pub struct FilterHistory {
    pub kind: FilterKind,
    pub means: Vec<Vector2<f64>>,
    pub covariances: Vec<Matrix2<f64>>,
    pub forgetting_factors: Option<Vec<f64>>,
    pub injections: Option<Vec<u8>>,
}

impl FilterHistory {
    fn start(estimator: &Estimator, capacity: usize) -> Self {
        let mut history = Self {
            kind: estimator.kind(),
            means: Vec::with_capacity(capacity),
            covariances: Vec::with_capacity(capacity),
            forgetting_factors: estimator
                .forgetting_factor()
                .map(|_| Vec::with_capacity(capacity)),
            injections: estimator
                .injection_log()
                .map(|_| Vec::with_capacity(capacity)),
        };
        history.record(estimator, 0);
        history
    }

    fn record(&mut self, estimator: &Estimator, injected: u8) {
        self.means.push(estimator.mean());
        self.covariances.push(estimator.covariance());
        if let (Some(lambdas), Some(lambda)) =
            (self.forgetting_factors.as_mut(), estimator.forgetting_factor())
        {
            lambdas.push(lambda);
        }
        if let Some(flags) = self.injections.as_mut() {
            flags.push(injected);
        }
    }

    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterMetrics {
    pub filter: FilterKind,
    pub rmse_position: f64,
    pub rmse_velocity: f64,
    pub max_position_error: f64,
    pub final_position_error: f64,
    pub injection_count: Option<usize>,
    pub mean_forgetting_factor: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub data: SimulationData,
    pub histories: Vec<FilterHistory>,
    pub metrics: Vec<FilterMetrics>,
}

/// Simulates the truth and runs the configured filters over it.
pub fn run(cfg: &RunConfig) -> Result<RunOutcome, EstimationError> {
    cfg.validate()?;
    let data = simulate(cfg)?;
    info!(
        samples = data.len(),
        contacts = data.contacts.len(),
        seed = cfg.seed,
        "ground truth simulated"
    );
    run_with_data(cfg, data)
}

/// Runs the configured filters over an existing trajectory.
///
/// Step `k` predicts with `u[k-1]` and corrects with `y[k]`.
pub fn run_with_data(cfg: &RunConfig, data: SimulationData) -> Result<RunOutcome, EstimationError> {
    let n = data.len();
    if [data.true_states.len(), data.measurements.len(), data.controls.len()]
        .iter()
        .any(|&len| len != n)
    {
        return Err(EstimationError::InvalidConfig(format!(
            "simulation sequences differ in length: times {n}, states {}, measurements {}, controls {}",
            data.true_states.len(),
            data.measurements.len(),
            data.controls.len()
        )));
    }
    let kinds = canonical_filter_list(&cfg.filters);
    let mut histories = Vec::with_capacity(kinds.len());

    for kind in kinds {
        let mut estimator = Estimator::from_config(kind, cfg)?;
        let mut history = FilterHistory::start(&estimator, n);

        for step in 1..n {
            let u = data.controls[step - 1];
            let y = data.measurements[step];
            estimator.predict(u, y);
            estimator
                .update(y)
                .map_err(|source| EstimationError::StepFailed {
                    step,
                    filter: kind.name(),
                    source: Box::new(source),
                })?;

            let injected = estimator
                .injection_log()
                .and_then(|log| log.last().copied())
                .unwrap_or(0);
            if injected == 1 {
                debug!(step, time = data.times[step], "covariance injected");
            }
            history.record(&estimator, injected);
        }

        info!(filter = %kind, steps = history.len(), "filter run complete");
        histories.push(history);
    }

    let metrics = histories
        .iter()
        .map(|h| compute_metrics(h, &data))
        .collect();

    Ok(RunOutcome {
        data,
        histories,
        metrics,
    })
}

pub fn compute_metrics(history: &FilterHistory, data: &SimulationData) -> FilterMetrics {
    let pos_err: Vec<f64> = history
        .means
        .iter()
        .zip(&data.true_states)
        .map(|(est, truth)| est[0] - truth[0])
        .collect();
    let vel_err: Vec<f64> = history
        .means
        .iter()
        .zip(&data.true_states)
        .map(|(est, truth)| est[1] - truth[1])
        .collect();

    FilterMetrics {
        filter: history.kind,
        rmse_position: rms_error(&pos_err),
        rmse_velocity: rms_error(&vel_err),
        max_position_error: pos_err.iter().map(|e| e.abs()).fold(0.0, f64::max),
        final_position_error: pos_err.last().map(|e| e.abs()).unwrap_or(0.0),
        injection_count: history
            .injections
            .as_ref()
            .map(|flags| flags.iter().filter(|&&f| f == 1).count()),
        mean_forgetting_factor: history
            .forgetting_factors
            .as_ref()
            .filter(|l| !l.is_empty())
            .map(|l| l.iter().sum::<f64>() / l.len() as f64),
    }
}

/// Root mean square of `errors`; zero for an empty slice.
pub fn rms_error(errors: &[f64]) -> f64 {
    if errors.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = errors.iter().map(|&e| e * e).sum();
    (sum_sq / errors.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn default_run_produces_finite_symmetric_histories() {
        let cfg = RunConfig::default();
        let outcome = run(&cfg).unwrap();

        assert_eq!(outcome.histories.len(), 3);
        for history in &outcome.histories {
            assert_eq!(history.len(), 250);
            assert_eq!(history.covariances.len(), 250);
            for (mean, cov) in history.means.iter().zip(&history.covariances) {
                assert!(mean.iter().all(|v| v.is_finite()));
                assert!(cov.iter().all(|v| v.is_finite()));
                assert!((cov - cov.transpose()).norm() < 1e-9);
            }
        }
    }

    #[test]
    fn histories_start_at_the_prior() {
        let cfg = RunConfig::default();
        let outcome = run(&cfg).unwrap();
        for history in &outcome.histories {
            assert_eq!(history.means[0], cfg.initial_mean());
            assert_eq!(history.covariances[0], cfg.initial_covariance());
        }
        let adaptive = outcome
            .histories
            .iter()
            .find(|h| h.kind == FilterKind::AdaptiveForgetting)
            .unwrap();
        let lambdas = adaptive.forgetting_factors.as_ref().unwrap();
        assert_eq!(lambdas.len(), 250);
        assert_eq!(lambdas[0], cfg.adaptive.lambda_max);
        assert!(lambdas
            .iter()
            .all(|&l| l >= cfg.adaptive.lambda_min && l <= cfg.adaptive.lambda_max));
    }

    #[test]
    fn wall_contacts_trigger_injections() {
        let outcome = run(&RunConfig::default()).unwrap();
        assert!(!outcome.data.contacts.is_empty());

        let injection = outcome
            .histories
            .iter()
            .find(|h| h.kind == FilterKind::TargetedInjection)
            .unwrap();
        let flags = injection.injections.as_ref().unwrap();
        assert_eq!(flags.len(), 250);
        assert!(flags.contains(&1));
    }

    #[test]
    fn no_contact_no_injection() {
        let mut cfg = RunConfig::default();
        cfg.system.wall_pos = 100.0;
        cfg.model.measurement_noise_var = 1e-4;
        let outcome = run(&cfg).unwrap();
        assert!(outcome.data.contacts.is_empty());

        let metrics = outcome
            .metrics
            .iter()
            .find(|m| m.filter == FilterKind::TargetedInjection)
            .unwrap();
        assert_eq!(metrics.injection_count, Some(0));
    }

    #[test]
    fn filter_selection_follows_canonical_order() {
        let cfg = RunConfig {
            filters: vec![FilterKind::TargetedInjection, FilterKind::Standard],
            ..RunConfig::default()
        };
        let outcome = run(&cfg).unwrap();
        let kinds: Vec<_> = outcome.histories.iter().map(|h| h.kind).collect();
        assert_eq!(kinds, vec![FilterKind::Standard, FilterKind::TargetedInjection]);
        assert!(outcome.histories[0].forgetting_factors.is_none());
        assert!(outcome.histories[0].injections.is_none());
    }

    #[test]
    fn failure_reports_step_and_filter() {
        let cfg = RunConfig::default();
        let mut data = simulate(&cfg).unwrap();
        data.measurements[10] = f64::NAN;

        let err = run_with_data(&cfg, data).unwrap_err();
        match err {
            EstimationError::StepFailed {
                step,
                filter,
                source,
            } => {
                assert_eq!(step, 10);
                assert_eq!(filter, "standard");
                assert!(matches!(*source, EstimationError::NonFiniteState));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn mismatched_sequences_are_rejected() {
        let cfg = RunConfig::default();
        let mut data = simulate(&cfg).unwrap();
        data.controls.truncate(100);

        let err = run_with_data(&cfg, data).unwrap_err();
        assert!(matches!(err, EstimationError::InvalidConfig(_)));
    }

    #[test]
    fn metrics_match_histories() {
        let outcome = run(&RunConfig::default()).unwrap();
        for (history, metrics) in outcome.histories.iter().zip(&outcome.metrics) {
            let last = history.len() - 1;
            let expected = (history.means[last][0] - outcome.data.true_states[last][0]).abs();
            assert_relative_eq!(metrics.final_position_error, expected);
            assert!(metrics.rmse_position <= metrics.max_position_error);
            assert!(metrics.rmse_position.is_finite());
        }
    }

    #[test]
    fn test_rms_error() {
        let errors = vec![0.1, 0.2, 0.3];
        let expected = ((0.01_f64 + 0.04 + 0.09) / 3.0).sqrt();
        assert!((rms_error(&errors) - expected).abs() < 1e-10);
        assert_eq!(rms_error(&[]), 0.0);
    }
}
