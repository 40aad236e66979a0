//! Discrete-time linear model shared read-only by every filter.

use nalgebra::{Matrix2, Matrix3, RowVector2, Vector2};
use serde::{Deserialize, Serialize};

use crate::EstimationError;

/// Tolerance used for symmetry checks on configured matrices.
const SYMMETRY_TOL: f64 = 1e-9;

/// Covariance measurement-update form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceForm {
    /// `(I - K C) P`
    #[default]
    Simple,
    /// `(I - K C) P (I - K C)^T + K R K^T`
    Joseph,
}

impl std::str::FromStr for CovarianceForm {
    type Err = EstimationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "joseph" => Ok(Self::Joseph),
            other => Err(EstimationError::InvalidConfig(format!(
                "unknown covariance form '{other}', expected simple or joseph"
            ))),
        }
    }
}

/// `x[k+1] = A x[k] + B u[k] + w`, `y[k] = C x[k] + v`, `w ~ N(0, Q)`, `v ~ N(0, R)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscreteModel {
    pub a: Matrix2<f64>,
    pub b: Vector2<f64>,
    pub c: RowVector2<f64>,
    pub q: Matrix2<f64>,
    pub r: f64,
}

impl DiscreteModel {
    pub fn new(
        a: Matrix2<f64>,
        b: Vector2<f64>,
        c: RowVector2<f64>,
        q: Matrix2<f64>,
        r: f64,
    ) -> Result<Self, EstimationError> {
        let model = Self { a, b, c, q, r };
        model.validate()?;
        Ok(model)
    }

    /// Zero-order-hold discretization of `z'' = (u - k z - c z') / m`.
    ///
    /// A and B come out of one matrix exponential of the augmented system
    /// `[[A_c, B_c], [0, 0]] * ts`: the upper-left block is `A`, the last
    /// column is `B`.
    pub fn from_physical(
        mass: f64,
        stiffness: f64,
        damping: f64,
        ts: f64,
        c: RowVector2<f64>,
        q: Matrix2<f64>,
        r: f64,
    ) -> Result<Self, EstimationError> {
        if !(mass.is_finite() && mass > 0.0) {
            return Err(EstimationError::InvalidConfig(
                "mass must be finite and > 0".to_string(),
            ));
        }
        if !(ts.is_finite() && ts > 0.0) {
            return Err(EstimationError::InvalidConfig(
                "sample period must be finite and > 0".to_string(),
            ));
        }

        let augmented = Matrix3::new(
            0.0,
            1.0,
            0.0,
            -stiffness / mass,
            -damping / mass,
            1.0 / mass,
            0.0,
            0.0,
            0.0,
        ) * ts;
        let phi = augmented.exp();

        let a = Matrix2::new(phi[(0, 0)], phi[(0, 1)], phi[(1, 0)], phi[(1, 1)]);
        let b = Vector2::new(phi[(0, 2)], phi[(1, 2)]);
        Self::new(a, b, c, q, r)
    }

    pub fn validate(&self) -> Result<(), EstimationError> {
        let finite = self.a.iter().all(|v| v.is_finite())
            && self.b.iter().all(|v| v.is_finite())
            && self.c.iter().all(|v| v.is_finite())
            && self.q.iter().all(|v| v.is_finite())
            && self.r.is_finite();
        if !finite {
            return Err(EstimationError::InvalidConfig(
                "model matrices must be finite".to_string(),
            ));
        }
        if self.r <= 0.0 {
            return Err(EstimationError::InvalidConfig(
                "measurement noise variance R must be > 0".to_string(),
            ));
        }
        check_psd("process noise Q", &self.q)?;
        Ok(())
    }

    /// Same model with a different process-noise matrix.
    pub fn with_process_noise(&self, q: Matrix2<f64>) -> Result<Self, EstimationError> {
        check_psd("process noise Q", &q)?;
        Ok(Self { q, ..*self })
    }
}

/// Symmetric positive semi-definite check for a 2x2 matrix.
pub fn check_psd(name: &str, m: &Matrix2<f64>) -> Result<(), EstimationError> {
    if !is_symmetric(m) {
        return Err(EstimationError::InvalidConfig(format!("{name} must be symmetric")));
    }
    // 2x2: PSD iff both diagonals and the determinant are non-negative.
    if m[(0, 0)] < 0.0 || m[(1, 1)] < 0.0 || m.determinant() < -SYMMETRY_TOL {
        return Err(EstimationError::InvalidConfig(format!(
            "{name} must be positive semi-definite"
        )));
    }
    Ok(())
}

/// Symmetric positive definite check (Cholesky must succeed).
pub fn check_pd(name: &str, m: &Matrix2<f64>) -> Result<(), EstimationError> {
    if !m.iter().all(|v| v.is_finite()) {
        return Err(EstimationError::InvalidConfig(format!("{name} must be finite")));
    }
    if !is_symmetric(m) {
        return Err(EstimationError::InvalidConfig(format!("{name} must be symmetric")));
    }
    if m.cholesky().is_none() {
        return Err(EstimationError::InvalidConfig(format!(
            "{name} must be positive definite"
        )));
    }
    Ok(())
}

pub fn is_symmetric(m: &Matrix2<f64>) -> bool {
    (m - m.transpose()).norm() < SYMMETRY_TOL
}

pub fn symmetrize(m: &Matrix2<f64>) -> Matrix2<f64> {
    (m + m.transpose()) * 0.5
}
