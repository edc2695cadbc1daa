//! Analytic-versus-numerical gradient comparison.

use super::{GradientError, GradientProvider};
use finitediff::FiniteDiff;
use ndarray::Array1;
use serde::Serialize;
use std::cell::RefCell;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
pub struct GradientReport {
    pub parameters: Vec<f64>,
    pub analytic: Vec<f64>,
    pub numerical: Vec<f64>,
    pub max_absolute_error: f64,
    /// Largest `|a - n| / max(|a|, |n|)`; entries where both vanish are skipped.
    pub max_relative_error: f64,
}

impl GradientReport {
    pub fn passes(&self, tolerance: f64) -> bool {
        self.max_relative_error <= tolerance || self.max_absolute_error <= tolerance
    }
}

impl fmt::Display for GradientReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>6} {:>14} {:>14} {:>14}", "index", "value", "analytic", "numerical")?;
        for (k, ((x, a), n)) in self
            .parameters
            .iter()
            .zip(&self.analytic)
            .zip(&self.numerical)
            .enumerate()
        {
            writeln!(f, "{k:>6} {x:>14.6e} {a:>14.6e} {n:>14.6e}")?;
        }
        write!(
            f,
            "max absolute error {:.3e}, max relative error {:.3e}",
            self.max_absolute_error, self.max_relative_error
        )
    }
}

/// Central-difference check of `provider`'s gradient at its current parameters.
/// The parameters are restored afterwards.
pub fn check_gradient<P: GradientProvider + ?Sized>(
    provider: &mut P,
) -> Result<GradientReport, GradientError> {
    let start = provider.parameter_values();
    let analytic = provider.gradient_log_density()?;

    let cell = RefCell::new(&mut *provider);
    let closure_err: RefCell<Option<GradientError>> = RefCell::new(None);
    let objective = |x: &Vec<f64>| -> f64 {
        let mut provider = cell.borrow_mut();
        let value = provider
            .set_parameter_values(Array1::from(x.clone()).view())
            .and_then(|()| provider.log_likelihood());
        match value {
            Ok(v) => v,
            Err(e) => {
                let mut slot = closure_err.borrow_mut();
                if slot.is_none() {
                    *slot = Some(e);
                }
                f64::NAN
            }
        }
    };
    let numerical = start.to_vec().central_diff(&objective);
    drop(cell);

    provider.set_parameter_values(start.view())?;
    if let Some(err) = closure_err.into_inner() {
        return Err(err);
    }

    let mut max_absolute_error = 0.0_f64;
    let mut max_relative_error = 0.0_f64;
    for (a, n) in analytic.iter().zip(&numerical) {
        let diff = (a - n).abs();
        max_absolute_error = max_absolute_error.max(diff);
        let scale = a.abs().max(n.abs());
        if scale > 0.0 {
            max_relative_error = max_relative_error.max(diff / scale);
        }
    }
    Ok(GradientReport {
        parameters: start.to_vec(),
        analytic: analytic.to_vec(),
        numerical,
        max_absolute_error,
        max_relative_error,
    })
}
