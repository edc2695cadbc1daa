use super::{LikelihoodError, TreeDataLikelihood, TreeTraitKey};
use crate::engine::{CrossProductRequest, DifferentialKind};
use ndarray::{Array1, Array2};
use std::rc::Rc;

/// Sufficient statistics for every generator-parameter gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossProducts {
    /// `Z[m][k, l] = ∂ℓ/∂Q_kl` for substitution model `m`, summed over its branches.
    pub per_model: Vec<Array2<f64>>,
    /// `∂ℓ/∂π_k` through the root distribution only.
    pub root_frequency_gradient: Array1<f64>,
}

impl CrossProducts {
    /// All models' matrices concatenated, each row-major.
    pub fn flattened(&self) -> Array1<f64> {
        self.per_model
            .iter()
            .flat_map(|z| z.iter().copied())
            .collect()
    }
}

/// Gathers every branch into one batched engine call.
#[derive(Debug, Clone, Copy)]
pub struct SubstitutionModelCrossProductDelegate {
    kind: DifferentialKind,
}

impl SubstitutionModelCrossProductDelegate {
    pub fn new(kind: DifferentialKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> DifferentialKind {
        self.kind
    }

    pub fn gradient(
        &self,
        likelihood: &mut TreeDataLikelihood,
    ) -> Result<Rc<CrossProducts>, LikelihoodError> {
        let kind = self.kind;
        likelihood.cached_trait(
            TreeTraitKey::CrossProducts(kind),
            |lik| -> Result<_, LikelihoodError> {
                let nodes = lik.branch_nodes();
                let distances = lik.distances();
                let models: Vec<usize> = nodes.iter().map(|&n| lik.branch_model.model_for(n)).collect();
                let branch_distances: Vec<f64> = nodes.iter().map(|&n| distances[n]).collect();
                let n = lik.engine.state_count();
                let mut per_model = vec![Array2::<f64>::zeros((n, n)); lik.models.len()];
                lik.engine.calculate_cross_product_differentials(
                    &CrossProductRequest {
                        nodes: &nodes,
                        models: &models,
                        distances: &branch_distances,
                        kind,
                    },
                    &mut per_model,
                    None,
                )?;
                let root_frequency_gradient = lik.engine.root_frequency_differentials()?;
                log::debug!(
                    "Computed {:?} cross products over {} branches",
                    kind,
                    nodes.len()
                );
                Ok(CrossProducts {
                    per_model,
                    root_frequency_gradient,
                })
            },
        )
    }
}
