//! impact-kf - Kalman filtering through unmodeled wall impacts
//!
//! A mass-spring-damper is simulated at fine resolution with an inelastic
//! wall that the filters' linear model knows nothing about. Three recursive
//! estimators track position and velocity from noisy scalar measurements:
//! a standard Kalman filter, a variable forgetting-factor filter and a
//! filter that injects velocity uncertainty when the normalized innovation
//! flags an anomaly.

pub mod config;
pub mod driver;
pub mod filters;
pub mod model;
pub mod output;
pub mod sim;

use thiserror::Error;

// Re-export main types
pub use config::RunConfig;
pub use driver::{run, run_with_data, FilterHistory, FilterMetrics, RunOutcome};
pub use filters::{
    AdaptiveForgettingFilter, Estimator, FilterKind, ForgettingStats, StandardFilter,
    TargetedInjectionFilter,
};
pub use model::{CovarianceForm, DiscreteModel};
pub use sim::{simulate, SimulationData, WallContact};

#[derive(Debug, Error)]
pub enum EstimationError {
    #[error("innovation covariance is not invertible (S = {variance})")]
    SingularInnovationCovariance { variance: f64 },
    #[error("state estimate became non-finite")]
    NonFiniteState,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{filter} filter failed at step {step}: {source}")]
    StepFailed {
        step: usize,
        filter: &'static str,
        #[source]
        source: Box<EstimationError>,
    },
}
