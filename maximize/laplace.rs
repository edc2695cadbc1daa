//! Gaussian approximation of the likelihood surface at its mode.
//!
//! Both modes differentiate the analytic gradient numerically. `Full` inverts
//! the whole Hessian; `Diagonal` keeps only `H_ii` and treats the parameters as
//! independent, `sd_i = sqrt(-1/H_ii)`. The Hessian's sign is not checked: away from a
//! maximum the standard deviations come out as NaN.

use super::MaximizerError;
use crate::gradient::{GradientError, GradientProvider};
use finitediff::FiniteDiff;
use ndarray::{Array1, Array2};
use ndarray_linalg::{Determinant, Inverse};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaplaceMode {
    #[default]
    Full,
    Diagonal,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaplaceSummary {
    pub mode: LaplaceMode,
    pub location: Vec<f64>,
    pub standard_deviations: Vec<f64>,
    /// Row-major; `None` in diagonal mode.
    pub covariance: Option<Vec<Vec<f64>>>,
    /// `ℓ(θ̂) + d/2 log 2π + 1/2 log |Σ|`.
    pub log_marginal_likelihood: f64,
}

#[derive(Debug, Clone, Default)]
pub struct LaplaceApproximation {
    mode: LaplaceMode,
}

impl LaplaceApproximation {
    pub fn new(mode: LaplaceMode) -> Self {
        Self { mode }
    }

    /// Approximates around the provider's current parameters, which should be a
    /// mode. The parameters are left unchanged.
    pub fn approximate<P: GradientProvider + ?Sized>(
        &self,
        provider: &mut P,
    ) -> Result<LaplaceSummary, MaximizerError> {
        let location = provider.parameter_values();
        let log_likelihood = provider.log_likelihood()?;
        let dimension = location.len();

        let (standard_deviations, covariance, log_det) = match self.mode {
            LaplaceMode::Full => {
                let hessian = numerical_hessian(provider, &location)?;
                let covariance = (-hessian).inv()?;
                let (sign, log_abs_det) = covariance.sln_det()?;
                let log_det = if sign > 0.0 { log_abs_det } else { f64::NAN };
                let sds = covariance.diag().mapv(f64::sqrt).to_vec();
                let rows = covariance.outer_iter().map(|row| row.to_vec()).collect();
                (sds, Some(rows), log_det)
            }
            LaplaceMode::Diagonal => {
                let hessian = numerical_hessian(provider, &location)?;
                let variances = hessian.diag().mapv(|h| -1.0 / h);
                let log_det = variances.mapv(f64::ln).sum();
                (variances.mapv(f64::sqrt).to_vec(), None, log_det)
            }
        };
        if standard_deviations.iter().any(|sd| !sd.is_finite()) {
            log::warn!("Laplace approximation produced non-finite standard deviations; the point may not be a maximum");
        }

        let log_marginal_likelihood =
            log_likelihood + 0.5 * dimension as f64 * (2.0 * PI).ln() + 0.5 * log_det;
        log::info!(
            "Laplace approximation ({:?}) over {} parameters: log marginal likelihood {:.6}",
            self.mode,
            dimension,
            log_marginal_likelihood
        );
        Ok(LaplaceSummary {
            mode: self.mode,
            location: location.to_vec(),
            standard_deviations,
            covariance,
            log_marginal_likelihood,
        })
    }
}

/// Central differences of the analytic gradient, symmetrised.
fn numerical_hessian<P: GradientProvider + ?Sized>(
    provider: &mut P,
    location: &Array1<f64>,
) -> Result<Array2<f64>, MaximizerError> {
    let dimension = location.len();
    let cell = RefCell::new(&mut *provider);
    let closure_err: RefCell<Option<GradientError>> = RefCell::new(None);
    let gradient = |x: &Vec<f64>| -> Vec<f64> {
        let mut provider = cell.borrow_mut();
        let value = provider
            .set_parameter_values(Array1::from(x.clone()).view())
            .and_then(|()| provider.gradient_log_density());
        match value {
            Ok(g) => g.to_vec(),
            Err(e) => {
                let mut slot = closure_err.borrow_mut();
                if slot.is_none() {
                    *slot = Some(e);
                }
                vec![f64::NAN; dimension]
            }
        }
    };
    let rows = location.to_vec().central_hessian(&gradient);
    drop(cell);

    provider.set_parameter_values(location.view())?;
    if let Some(err) = closure_err.into_inner() {
        return Err(err.into());
    }

    let mut hessian = Array2::from_shape_fn((dimension, dimension), |(i, j)| rows[i][j]);
    for i in 0..dimension {
        for j in (i + 1)..dimension {
            let mean = 0.5 * (hessian[[i, j]] + hessian[[j, i]]);
            hessian[[i, j]] = mean;
            hessian[[j, i]] = mean;
        }
    }
    Ok(hessian)
}
