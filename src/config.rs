use std::fs;
use std::path::Path;

use anyhow::Context;
use nalgebra::{Matrix2, RowVector2, Vector2};
use serde::{Deserialize, Serialize};

use crate::filters::adaptive::ForgettingParams;
use crate::filters::FilterKind;
use crate::model::{check_pd, check_psd, CovarianceForm, DiscreteModel};
use crate::EstimationError;

/// Physical plant, horizon and integration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemParameters {
    /// Mass [kg]
    pub mass: f64,
    /// Spring stiffness [N/m]
    pub stiffness: f64,
    /// Viscous damping [N s/m]
    pub damping: f64,
    /// Filter sample period [s]
    pub ts: f64,
    pub t_start: f64,
    pub t_end: f64,
    /// Wall position [m]; positions at or beyond it are clamped
    pub wall_pos: f64,
    /// Amplitude of the forcing `F(t) = amplitude * sin(t)` [N]
    pub force_amplitude: f64,
    /// Ground-truth Euler step [s]
    pub fine_dt: f64,
}

impl Default for SystemParameters {
    fn default() -> Self {
        Self {
            mass: 10.0,
            stiffness: 5.0,
            damping: 3.0,
            ts: 0.1,
            t_start: 0.0,
            t_end: 25.0,
            wall_pos: 2.0,
            force_amplitude: 10.0,
            fine_dt: 1e-3,
        }
    }
}

/// Filter model. When `a` and `b` are omitted they are derived from the
/// physical parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub a: Option<[[f64; 2]; 2]>,
    pub b: Option<[f64; 2]>,
    pub c: [f64; 2],
    pub process_noise: [[f64; 2]; 2],
    /// Process noise used by the forgetting-factor filter
    pub adaptive_process_noise: [[f64; 2]; 2],
    pub measurement_noise_var: f64,
    pub covariance_form: CovarianceForm,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            a: Some([[0.9975, 0.09843], [-0.04922, 0.9680]]),
            b: Some([4.948e-4, 9.843e-3]),
            c: [1.0, 1.0],
            process_noise: [[0.01, 0.0], [0.0, 0.01]],
            adaptive_process_noise: [[0.01, 0.0], [0.0, 0.01]],
            measurement_noise_var: 0.01,
            covariance_form: CovarianceForm::Simple,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialConditions {
    /// True (position, velocity) at `t_start`
    pub true_state: [f64; 2],
    /// Filter prior mean
    pub mean: [f64; 2],
    /// Filter prior covariance
    pub covariance: [[f64; 2]; 2],
}

impl Default for InitialConditions {
    fn default() -> Self {
        Self {
            true_state: [-1.0, 1.0],
            mean: [0.0, 0.0],
            covariance: [[0.1, 0.0], [0.0, 0.1]],
        }
    }
}

/// Forgetting-factor tuning. Decay rates come from the time constants as
/// `alpha = 1 - 1/k_alpha`, `beta = 1 - 1/k_beta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveParams {
    pub k_alpha: f64,
    pub k_beta: f64,
    pub lambda_min: f64,
    pub lambda_max: f64,
    pub eps: f64,
}

impl Default for AdaptiveParams {
    fn default() -> Self {
        Self {
            k_alpha: 2.0,
            k_beta: 10.0,
            lambda_min: 0.5,
            lambda_max: 1.0,
            eps: 1e-6,
        }
    }
}

impl AdaptiveParams {
    pub fn forgetting_params(&self) -> ForgettingParams {
        ForgettingParams {
            alpha: 1.0 - 1.0 / self.k_alpha,
            beta: 1.0 - 1.0 / self.k_beta,
            lambda_min: self.lambda_min,
            lambda_max: self.lambda_max,
            eps: self.eps,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionParams {
    /// Normalized squared innovation above which the step counts as anomalous
    pub threshold: f64,
    /// Variance added to the velocity entry of P on an anomalous step
    pub velocity_injection: f64,
}

impl Default for InjectionParams {
    fn default() -> Self {
        Self {
            threshold: 9.0,
            velocity_injection: 0.1,
        }
    }
}

/// Complete configuration for one comparison run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Seed for the measurement noise
    pub seed: u64,
    pub filters: Vec<FilterKind>,
    pub system: SystemParameters,
    pub model: ModelConfig,
    pub initial: InitialConditions,
    pub adaptive: AdaptiveParams,
    pub injection: InjectionParams,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            filters: FilterKind::ALL.to_vec(),
            system: SystemParameters::default(),
            model: ModelConfig::default(),
            initial: InitialConditions::default(),
            adaptive: AdaptiveParams::default(),
            injection: InjectionParams::default(),
        }
    }
}

impl RunConfig {
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: RunConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse TOML config: {}", path.display()))?;
        cfg.validate()
            .with_context(|| format!("invalid config: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), EstimationError> {
        let sys = &self.system;
        let scalars = [
            sys.mass,
            sys.stiffness,
            sys.damping,
            sys.ts,
            sys.t_start,
            sys.t_end,
            sys.wall_pos,
            sys.force_amplitude,
            sys.fine_dt,
        ];
        if scalars.iter().any(|v| !v.is_finite()) {
            return invalid("system parameters must be finite");
        }
        if sys.mass <= 0.0 {
            return invalid("mass must be > 0");
        }
        if sys.ts <= 0.0 {
            return invalid("ts must be > 0");
        }
        if sys.t_end <= sys.t_start {
            return invalid("t_end must be > t_start");
        }
        if sys.fine_dt <= 0.0 || sys.fine_dt > sys.ts {
            return invalid("fine_dt must be in (0, ts]");
        }
        if self.initial.true_state.iter().any(|v| !v.is_finite())
            || self.initial.mean.iter().any(|v| !v.is_finite())
        {
            return invalid("initial states must be finite");
        }
        if self.model.a.is_some() != self.model.b.is_some() {
            return invalid("model.a and model.b must be given together");
        }
        let r = self.model.measurement_noise_var;
        if !(r.is_finite() && r > 0.0) {
            return invalid("measurement_noise_var must be > 0");
        }

        check_pd("initial covariance", &self.initial_covariance())?;
        check_psd("adaptive process noise", &from_rows(&self.model.adaptive_process_noise))?;
        self.model()?;

        let ad = &self.adaptive;
        if !(ad.k_alpha >= 1.0 && ad.k_beta >= 1.0) {
            return invalid("k_alpha and k_beta must be >= 1");
        }
        if !(ad.lambda_min > 0.0 && ad.lambda_min <= ad.lambda_max && ad.lambda_max <= 1.0) {
            return invalid("forgetting bounds must satisfy 0 < lambda_min <= lambda_max <= 1");
        }
        if !(ad.eps.is_finite() && ad.eps > 0.0) {
            return invalid("eps must be > 0");
        }

        let inj = &self.injection;
        if !(inj.threshold.is_finite() && inj.threshold > 0.0) {
            return invalid("injection threshold must be > 0");
        }
        if !(inj.velocity_injection.is_finite() && inj.velocity_injection >= 0.0) {
            return invalid("velocity_injection must be >= 0");
        }

        if self.filters.is_empty() {
            return invalid("filters list cannot be empty");
        }
        Ok(())
    }

    /// Number of coarse samples, `ceil((t_end - t_start) / ts)`.
    pub fn steps(&self) -> usize {
        let ratio = (self.system.t_end - self.system.t_start) / self.system.ts;
        let nearest = ratio.round();
        if (ratio - nearest).abs() < 1e-9 {
            nearest as usize
        } else {
            ratio.ceil() as usize
        }
    }

    /// Model used by the standard and injection filters.
    pub fn model(&self) -> Result<DiscreteModel, EstimationError> {
        let m = &self.model;
        let c = RowVector2::new(m.c[0], m.c[1]);
        let q = from_rows(&m.process_noise);
        match (m.a, m.b) {
            (Some(a), Some(b)) => DiscreteModel::new(
                from_rows(&a),
                Vector2::new(b[0], b[1]),
                c,
                q,
                m.measurement_noise_var,
            ),
            _ => DiscreteModel::from_physical(
                self.system.mass,
                self.system.stiffness,
                self.system.damping,
                self.system.ts,
                c,
                q,
                m.measurement_noise_var,
            ),
        }
    }

    /// Model used by the forgetting-factor filter.
    pub fn adaptive_model(&self) -> Result<DiscreteModel, EstimationError> {
        self.model()?.with_process_noise(from_rows(&self.model.adaptive_process_noise))
    }

    pub fn initial_mean(&self) -> Vector2<f64> {
        Vector2::new(self.initial.mean[0], self.initial.mean[1])
    }

    pub fn initial_covariance(&self) -> Matrix2<f64> {
        from_rows(&self.initial.covariance)
    }

    pub fn initial_true_state(&self) -> Vector2<f64> {
        Vector2::new(self.initial.true_state[0], self.initial.true_state[1])
    }
}

fn from_rows(rows: &[[f64; 2]; 2]) -> Matrix2<f64> {
    Matrix2::new(rows[0][0], rows[0][1], rows[1][0], rows[1][1])
}

fn invalid<T>(msg: &str) -> Result<T, EstimationError> {
    Err(EstimationError::InvalidConfig(msg.to_string()))
}
