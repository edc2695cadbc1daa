//! Gradient and diagonal Hessian with respect to branch-rate parameters.
//!
//! The engine differentiates with respect to each branch's distance
//! `d_b = rate_b · t_b`; the chain rule through the rate model maps those onto
//! parameters, several branches summing into one slot under a strict clock.

use super::{LikelihoodError, TreeDataLikelihood, TreeTraitKey};
use crate::engine::EdgeDifferentials;
use crate::gradient::{GradientError, LikelihoodGradient, check_dimension};
use ndarray::{Array1, ArrayView1};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, Default)]
pub struct BranchRateGradient;

impl BranchRateGradient {
    pub fn new() -> Self {
        Self
    }

    pub fn gradient(
        &self,
        likelihood: &mut TreeDataLikelihood,
    ) -> Result<Rc<Array1<f64>>, LikelihoodError> {
        likelihood.cached_trait(
            TreeTraitKey::BranchRateGradient,
            |lik| -> Result<_, LikelihoodError> {
                let (nodes, edges) = distance_differentials(lik, false)?;
                let rates = lik.branch_rates();
                let tree = lik.tree();
                let mut gradient = Array1::<f64>::zeros(rates.parameter_count());
                for (k, &node) in nodes.iter().enumerate() {
                    if let Some(index) = rates.parameter_index_from_node(tree, node) {
                        gradient[index] += edges.gradient[k]
                            * tree.branch_length(node)
                            * rates.branch_rate_differential(tree, node);
                    }
                }
                Ok(gradient)
            },
        )
    }

    /// `h_b (t_b r'_b)² + g_b t_b r''_b`, summed per parameter.
    pub fn diagonal_hessian(
        &self,
        likelihood: &mut TreeDataLikelihood,
    ) -> Result<Rc<Array1<f64>>, LikelihoodError> {
        likelihood.cached_trait(
            TreeTraitKey::BranchRateHessian,
            |lik| -> Result<_, LikelihoodError> {
                let (nodes, edges) = distance_differentials(lik, true)?;
                let second = edges.hessian.unwrap_or_default();
                let rates = lik.branch_rates();
                let tree = lik.tree();
                let mut hessian = Array1::<f64>::zeros(rates.parameter_count());
                for (k, &node) in nodes.iter().enumerate() {
                    let Some(index) = rates.parameter_index_from_node(tree, node) else {
                        continue;
                    };
                    let length = tree.branch_length(node);
                    let slope = length * rates.branch_rate_differential(tree, node);
                    let curvature = length * rates.branch_rate_second_differential(tree, node);
                    hessian[index] += second[k] * slope * slope + edges.gradient[k] * curvature;
                }
                Ok(hessian)
            },
        )
    }
}

fn distance_differentials(
    lik: &mut TreeDataLikelihood,
    second_order: bool,
) -> Result<(Vec<usize>, EdgeDifferentials), LikelihoodError> {
    lik.cache_differentials(second_order)?;
    let nodes = lik.branch_nodes();
    let buffers: Vec<usize> = nodes
        .iter()
        .map(|&node| lik.model_buffer(lik.branch_model().model_for(node)))
        .collect();
    let edges = lik.engine().calculate_edge_differentials(
        &nodes,
        &buffers,
        second_order.then_some(buffers.as_slice()),
    )?;
    Ok((nodes, edges))
}

impl LikelihoodGradient for BranchRateGradient {
    fn dimension(&self, likelihood: &TreeDataLikelihood) -> usize {
        likelihood.branch_rates().parameter_count()
    }

    fn parameter_values(&self, likelihood: &TreeDataLikelihood) -> Array1<f64> {
        likelihood.branch_rates().parameters().to_owned()
    }

    fn set_parameter_values(
        &mut self,
        likelihood: &mut TreeDataLikelihood,
        values: ArrayView1<f64>,
    ) -> Result<(), GradientError> {
        check_dimension(self.dimension(likelihood), values)?;
        likelihood.branch_rates_mut().set_parameters(values)?;
        Ok(())
    }

    fn gradient(&mut self, likelihood: &mut TreeDataLikelihood) -> Result<Array1<f64>, GradientError> {
        Ok(BranchRateGradient::gradient(self, likelihood)?.as_ref().clone())
    }

    fn diagonal_hessian(
        &mut self,
        likelihood: &mut TreeDataLikelihood,
    ) -> Result<Array1<f64>, GradientError> {
        Ok(BranchRateGradient::diagonal_hessian(self, likelihood)?.as_ref().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::{likelihood, likelihood_with_rates, tree};
    use super::*;
    use crate::branchrates::{ArbitraryBranchRates, RateTransform};
    use approx::assert_relative_eq;
    use ndarray::Array1;

    fn relaxed() -> TreeDataLikelihood {
        let tree = tree();
        let values = Array1::from_shape_fn(tree.node_count() - 1, |i| 0.1 * i as f64 - 0.2);
        let rates = ArbitraryBranchRates::new(
            &tree,
            values,
            RateTransform::LocationScaleLogNormal {
                location: 1.2,
                scale: 0.7,
            },
        )
        .unwrap();
        likelihood_with_rates(Box::new(rates))
    }

    fn shifted_log_likelihood(lik: &mut TreeDataLikelihood, index: usize, delta: f64) -> f64 {
        let mut values = lik.branch_rates().parameters().to_owned();
        values[index] += delta;
        lik.branch_rates_mut().set_parameters(values.view()).unwrap();
        let value = lik.log_likelihood().unwrap();
        values[index] -= delta;
        lik.branch_rates_mut().set_parameters(values.view()).unwrap();
        value
    }

    #[test]
    fn relaxed_gradient_and_hessian_match_finite_differences() {
        let mut lik = relaxed();
        let delegate = BranchRateGradient::new();
        let gradient = delegate.gradient(&mut lik).unwrap();
        let hessian = delegate.diagonal_hessian(&mut lik).unwrap();
        let centre = lik.log_likelihood().unwrap();
        let h = 1e-4;
        for index in 0..gradient.len() {
            let up = shifted_log_likelihood(&mut lik, index, h);
            let down = shifted_log_likelihood(&mut lik, index, -h);
            let fd = (up - down) / (2.0 * h);
            let fd2 = (up - 2.0 * centre + down) / (h * h);
            assert_relative_eq!(gradient[index], fd, epsilon = 1e-6, max_relative = 1e-5);
            assert_relative_eq!(hessian[index], fd2, epsilon = 1e-3, max_relative = 1e-3);
        }
    }

    #[test]
    fn strict_clock_sums_every_branch() {
        let mut lik = likelihood();
        let gradient = BranchRateGradient::new().gradient(&mut lik).unwrap();
        assert_eq!(gradient.len(), 1);
        let h = 1e-6;
        let up = shifted_log_likelihood(&mut lik, 0, h);
        let down = shifted_log_likelihood(&mut lik, 0, -h);
        assert_relative_eq!(gradient[0], (up - down) / (2.0 * h), max_relative = 1e-5);
    }
}
