//! Maximum-likelihood search over any [`GradientProvider`] with BFGS.

pub mod laplace;

pub use laplace::{LaplaceApproximation, LaplaceMode, LaplaceSummary};

use crate::gradient::{GradientError, GradientProvider};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Cost returned to the line search when the likelihood cannot be evaluated.
const FAILED_COST: f64 = 1e10;

#[derive(Error, Debug)]
pub enum MaximizerError {
    #[error("Gradient evaluation failed: {0}")]
    Gradient(#[from] GradientError),

    #[error("Initial log-likelihood is not finite: {0}")]
    NonFiniteStart(f64),

    #[error("Optimization failed: {0}")]
    OptimizationFailed(String),

    #[error("Linear algebra error: {0}")]
    LinearAlgebra(#[from] ndarray_linalg::error::LinalgError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaximizerOptions {
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for MaximizerOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MaximizationResult {
    pub parameters: Vec<f64>,
    pub log_likelihood: f64,
    pub gradient_norm: f64,
    pub iterations: usize,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Default)]
pub struct MaximizerWrtParameter {
    options: MaximizerOptions,
}

impl MaximizerWrtParameter {
    pub fn new(options: MaximizerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MaximizerOptions {
        &self.options
    }

    /// Maximizes the provider's log-likelihood from its current parameters and
    /// leaves it at the optimum. The provider is handed back with the result.
    pub fn maximize<P>(&self, provider: P) -> Result<(P, MaximizationResult), MaximizerError>
    where
        P: GradientProvider + 'static,
    {
        let start = Instant::now();
        let shared = Rc::new(RefCell::new(provider));
        let initial = shared.borrow().parameter_values();
        let initial_value = shared.borrow_mut().log_likelihood()?;
        if !initial_value.is_finite() {
            return Err(MaximizerError::NonFiniteStart(initial_value));
        }
        log::info!(
            "Maximizing over {} parameters from log-likelihood {:.6}",
            initial.len(),
            initial_value
        );

        let for_closure = Rc::clone(&shared);
        let cost_and_grad = move |x: &Array1<f64>| -> (f64, Array1<f64>) {
            match evaluate(&mut *for_closure.borrow_mut(), x) {
                Ok((value, gradient)) if value.is_finite() => (-value, -gradient),
                Ok((value, _)) => {
                    log::warn!("Non-finite log-likelihood {value} at {x}, returning a large cost");
                    (FAILED_COST, Array1::zeros(x.len()))
                }
                Err(e) => {
                    log::warn!("Evaluation failed at {x}: {e}, returning a large cost");
                    (FAILED_COST, Array1::zeros(x.len()))
                }
            }
        };

        let BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        } = Bfgs::new(initial, cost_and_grad)
            .with_tolerance(self.options.tolerance)
            .with_max_iterations(self.options.max_iterations)
            .run()
            .map_err(|e| MaximizerError::OptimizationFailed(format!("BFGS failed: {e:?}")))?;

        let mut provider = Rc::try_unwrap(shared)
            .map_err(|_| {
                MaximizerError::OptimizationFailed("optimizer kept a handle to the provider".to_string())
            })?
            .into_inner();
        provider.set_parameter_values(final_point.view())?;
        let log_likelihood = provider.log_likelihood()?;
        let gradient = provider.gradient_log_density()?;
        let gradient_norm = gradient.dot(&gradient).sqrt();
        let elapsed_seconds = start.elapsed().as_secs_f64();
        log::info!(
            "BFGS finished after {iterations} iterations in {elapsed_seconds:.3}s: log-likelihood {log_likelihood:.6} (cost {final_value:.6}), |g| = {gradient_norm:.3e}"
        );

        Ok((
            provider,
            MaximizationResult {
                parameters: final_point.to_vec(),
                log_likelihood,
                gradient_norm,
                iterations,
                elapsed_seconds,
            },
        ))
    }
}

fn evaluate<P: GradientProvider + ?Sized>(
    provider: &mut P,
    x: &Array1<f64>,
) -> Result<(f64, Array1<f64>), GradientError> {
    provider.set_parameter_values(x.view())?;
    let value = provider.log_likelihood()?;
    Ok((value, provider.gradient_log_density()?))
}
