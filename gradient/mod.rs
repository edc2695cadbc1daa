//! Gradients of the log-likelihood with respect to named parameter vectors.
//!
//! A [`LikelihoodGradient`] knows how to read, write and differentiate one
//! parameter vector of a [`TreeDataLikelihood`]. [`BoundGradient`] pairs one with
//! the context it acts on and exposes the result as a [`GradientProvider`], the
//! interface the maximizer and Laplace approximation consume.

pub mod affine;
pub mod check;
pub mod strategy;
pub mod substitution;

pub use affine::AffineCorrection;
pub use check::{GradientReport, check_gradient};
pub use strategy::{ApproximationMode, GradientTarget, ParameterMap};
pub use substitution::SubstitutionModelGradient;

use crate::branchrates::BranchRateError;
use crate::substmodel::SubstModelError;
use crate::transform::TransformError;
use crate::tree::TreeError;
use crate::treedatalikelihood::{LikelihoodError, TreeDataLikelihood};
use ndarray::{Array1, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GradientError {
    #[error("Likelihood evaluation failed: {0}")]
    Likelihood(#[from] LikelihoodError),

    #[error("Substitution model error: {0}")]
    Model(#[from] SubstModelError),

    #[error("Branch rate model error: {0}")]
    BranchRate(#[from] BranchRateError),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Height transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Expected {expected} parameter values, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    #[error("Not yet implemented: {0}")]
    NotYetImplemented(&'static str),
}

/// A differentiable log-density over a flat parameter vector.
pub trait GradientProvider {
    fn dimension(&self) -> usize;

    fn parameter_values(&self) -> Array1<f64>;

    fn set_parameter_values(&mut self, values: ArrayView1<f64>) -> Result<(), GradientError>;

    fn log_likelihood(&mut self) -> Result<f64, GradientError>;

    fn gradient_log_density(&mut self) -> Result<Array1<f64>, GradientError>;

    fn diagonal_hessian_log_density(&mut self) -> Result<Array1<f64>, GradientError> {
        Err(GradientError::NotYetImplemented("diagonal Hessian"))
    }
}

/// One parameter vector of a likelihood context and its derivatives.
pub trait LikelihoodGradient {
    fn dimension(&self, likelihood: &TreeDataLikelihood) -> usize;

    fn parameter_values(&self, likelihood: &TreeDataLikelihood) -> Array1<f64>;

    fn set_parameter_values(
        &mut self,
        likelihood: &mut TreeDataLikelihood,
        values: ArrayView1<f64>,
    ) -> Result<(), GradientError>;

    fn gradient(&mut self, likelihood: &mut TreeDataLikelihood) -> Result<Array1<f64>, GradientError>;

    fn diagonal_hessian(
        &mut self,
        _likelihood: &mut TreeDataLikelihood,
    ) -> Result<Array1<f64>, GradientError> {
        Err(GradientError::NotYetImplemented("diagonal Hessian"))
    }
}

pub(crate) fn check_dimension(expected: usize, values: ArrayView1<f64>) -> Result<(), GradientError> {
    if values.len() != expected {
        return Err(GradientError::DimensionMismatch {
            expected,
            found: values.len(),
        });
    }
    Ok(())
}

/// A likelihood context together with the gradient of one of its parameters.
pub struct BoundGradient<G> {
    likelihood: TreeDataLikelihood,
    gradient: G,
}

impl<G: LikelihoodGradient> BoundGradient<G> {
    pub fn new(likelihood: TreeDataLikelihood, gradient: G) -> Self {
        Self {
            likelihood,
            gradient,
        }
    }

    pub fn likelihood(&self) -> &TreeDataLikelihood {
        &self.likelihood
    }

    pub fn likelihood_mut(&mut self) -> &mut TreeDataLikelihood {
        &mut self.likelihood
    }

    pub fn gradient_strategy(&self) -> &G {
        &self.gradient
    }

    pub fn into_parts(self) -> (TreeDataLikelihood, G) {
        (self.likelihood, self.gradient)
    }
}

impl<G: LikelihoodGradient> GradientProvider for BoundGradient<G> {
    fn dimension(&self) -> usize {
        self.gradient.dimension(&self.likelihood)
    }

    fn parameter_values(&self) -> Array1<f64> {
        self.gradient.parameter_values(&self.likelihood)
    }

    fn set_parameter_values(&mut self, values: ArrayView1<f64>) -> Result<(), GradientError> {
        self.gradient.set_parameter_values(&mut self.likelihood, values)
    }

    fn log_likelihood(&mut self) -> Result<f64, GradientError> {
        Ok(self.likelihood.log_likelihood()?)
    }

    fn gradient_log_density(&mut self) -> Result<Array1<f64>, GradientError> {
        self.gradient.gradient(&mut self.likelihood)
    }

    fn diagonal_hessian_log_density(&mut self) -> Result<Array1<f64>, GradientError> {
        self.gradient.diagonal_hessian(&mut self.likelihood)
    }
}

impl<P: GradientProvider + ?Sized> GradientProvider for Box<P> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn parameter_values(&self) -> Array1<f64> {
        (**self).parameter_values()
    }

    fn set_parameter_values(&mut self, values: ArrayView1<f64>) -> Result<(), GradientError> {
        (**self).set_parameter_values(values)
    }

    fn log_likelihood(&mut self) -> Result<f64, GradientError> {
        (**self).log_likelihood()
    }

    fn gradient_log_density(&mut self) -> Result<Array1<f64>, GradientError> {
        (**self).gradient_log_density()
    }

    fn diagonal_hessian_log_density(&mut self) -> Result<Array1<f64>, GradientError> {
        (**self).diagonal_hessian_log_density()
    }
}
