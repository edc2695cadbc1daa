//! Gradient of the log-likelihood with respect to generator parameters.
//!
//! Every target goes through the same assembly: the cross products `Z` give
//! `∂ℓ/∂Q`, a [`ParameterMap`] says which entries each parameter moves, and the
//! normalisation constant contributes `-C · ∂μ/μ` with `C = Σ_ij Z_ij G_ij`.

use super::{
    AffineCorrection, ApproximationMode, GradientError, GradientTarget, LikelihoodGradient,
    ParameterMap, check_dimension,
};
use crate::engine::DifferentialKind;
use crate::substmodel::{GlmSubstitutionModel, SubstitutionModel};
use crate::treedatalikelihood::{SubstitutionModelCrossProductDelegate, TreeDataLikelihood};
use ndarray::{Array1, Array2, ArrayView1};

#[derive(Debug, Clone)]
pub struct SubstitutionModelGradient {
    model: usize,
    target: GradientTarget,
    delegate: SubstitutionModelCrossProductDelegate,
    mode: ApproximationMode,
    affine: AffineCorrection,
}

impl SubstitutionModelGradient {
    pub fn new(
        likelihood: &TreeDataLikelihood,
        model: usize,
        target: GradientTarget,
        kind: DifferentialKind,
        mode: ApproximationMode,
    ) -> Result<Self, GradientError> {
        target.validate(likelihood.model(model)?)?;
        if mode == ApproximationMode::AffineCorrected {
            if likelihood.models().len() > 1 {
                return Err(GradientError::NotYetImplemented(
                    "affine correction with more than one substitution model",
                ));
            }
            if kind != DifferentialKind::FirstOrder {
                return Err(GradientError::Unsupported(
                    "affine correction applies to first-order cross products only".to_string(),
                ));
            }
        }
        Ok(Self {
            model,
            target,
            delegate: SubstitutionModelCrossProductDelegate::new(kind),
            mode,
            affine: AffineCorrection::new(),
        })
    }

    pub fn target(&self) -> &GradientTarget {
        &self.target
    }

    pub fn mode(&self) -> ApproximationMode {
        self.mode
    }

    pub fn differential_kind(&self) -> DifferentialKind {
        self.delegate.kind()
    }

    /// `∂ℓ/∂Q` for the model this gradient targets, corrected when asked.
    pub fn cross_products(
        &mut self,
        likelihood: &mut TreeDataLikelihood,
    ) -> Result<(Array2<f64>, Array1<f64>), GradientError> {
        let statistics = self.delegate.gradient(likelihood)?;
        let raw = &statistics.per_model[self.model];
        let z = match self.mode {
            ApproximationMode::FirstOrder => raw.clone(),
            ApproximationMode::AffineCorrected => self.affine.correct(likelihood, self.model, raw)?,
        };
        Ok((z, statistics.root_frequency_gradient.clone()))
    }

    pub fn compute(&mut self, likelihood: &mut TreeDataLikelihood) -> Result<Array1<f64>, GradientError> {
        let (z, root_gradient) = self.cross_products(likelihood)?;
        let model = likelihood.model(self.model)?;
        let g = model.infinitesimal_matrix();
        let c = (&z * &g).sum();
        let gradient = match self.target.parameter_map(model)? {
            Some(map) => assemble(&map, &z, &g, model.frequencies(), model.is_normalized(), c),
            None => {
                let mut gradient = frequency_gradient(model, &z, &g, c);
                // The root distribution is taken from the first model.
                if self.model == 0 {
                    gradient += &root_gradient;
                }
                gradient
            }
        };
        Ok(gradient)
    }
}

fn assemble(
    map: &ParameterMap,
    z: &Array2<f64>,
    g: &Array2<f64>,
    pi: ArrayView1<f64>,
    normalize: bool,
    c: f64,
) -> Array1<f64> {
    Array1::from_shape_fn(map.dimension(), |k| {
        map.entries(k)
            .iter()
            .map(|&(i, j, w)| {
                let mut term = (z[[i, j]] - z[[i, i]]) * g[[i, j]];
                if normalize {
                    term -= g[[i, j]] * pi[i] * c;
                }
                w * term
            })
            .sum()
    })
}

fn frequency_gradient(
    model: &GlmSubstitutionModel,
    z: &Array2<f64>,
    g: &Array2<f64>,
    c: f64,
) -> Array1<f64> {
    let pi = model.frequencies();
    let n = pi.len();
    Array1::from_shape_fn(n, |k| {
        let mut value = 0.0;
        let mut inflow = 0.0;
        for i in (0..n).filter(|&i| i != k) {
            let rate = g[[i, k]] / pi[k];
            value += rate * (z[[i, k]] - z[[i, i]]);
            inflow += pi[i] * rate;
        }
        if model.is_normalized() {
            let outflow: f64 = (0..n).filter(|&j| j != k).map(|j| g[[k, j]]).sum();
            value -= c * (outflow + inflow);
        }
        value
    })
}

impl LikelihoodGradient for SubstitutionModelGradient {
    fn dimension(&self, likelihood: &TreeDataLikelihood) -> usize {
        likelihood
            .model(self.model)
            .map_or(0, |model| self.target.dimension(model))
    }

    fn parameter_values(&self, likelihood: &TreeDataLikelihood) -> Array1<f64> {
        likelihood
            .model(self.model)
            .map_or_else(|_| Array1::zeros(0), |model| self.target.values(model))
    }

    fn set_parameter_values(
        &mut self,
        likelihood: &mut TreeDataLikelihood,
        values: ArrayView1<f64>,
    ) -> Result<(), GradientError> {
        check_dimension(self.dimension(likelihood), values)?;
        let model = likelihood.model_mut(self.model)?;
        self.target.set_values(model, values)
    }

    fn gradient(&mut self, likelihood: &mut TreeDataLikelihood) -> Result<Array1<f64>, GradientError> {
        self.compute(likelihood)
    }

    fn diagonal_hessian(
        &mut self,
        _likelihood: &mut TreeDataLikelihood,
    ) -> Result<Array1<f64>, GradientError> {
        Err(GradientError::NotYetImplemented(
            "Hessian with respect to generator parameters",
        ))
    }
}
