//! Gradient and diagonal Hessian with respect to internal node heights.
//!
//! Raising node `v` lengthens each child branch and shortens its own, so
//! `∂ℓ/∂h_v = Σ_children ∂ℓ/∂t_c − ∂ℓ/∂t_v`. The Hessian needs the cross terms
//! between every pair of branches touching `v`, so it is assembled here from the
//! engine's partials instead of from per-edge reductions.

use super::{LikelihoodError, TreeDataLikelihood, TreeTraitKey};
use crate::engine::{DifferentialMatrices, EngineError, LikelihoodEngine};
use crate::gradient::{GradientError, LikelihoodGradient, check_dimension};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, Default)]
pub struct NodeHeightGradient;

impl NodeHeightGradient {
    pub fn new() -> Self {
        Self
    }

    /// Ordered by internal node index.
    pub fn gradient(
        &self,
        likelihood: &mut TreeDataLikelihood,
    ) -> Result<Rc<Array1<f64>>, LikelihoodError> {
        likelihood.cached_trait(
            TreeTraitKey::NodeHeightGradient,
            |lik| -> Result<_, LikelihoodError> {
                let lengths = branch_length_differentials(lik)?;
                let tree = lik.tree();
                let tips = tree.external_node_count();
                let mut gradient = Array1::<f64>::zeros(tree.internal_node_count());
                for v in tips..tree.node_count() {
                    let mut value: f64 = tree.children(v).iter().map(|&c| lengths[c]).sum();
                    if !tree.is_root(v) {
                        value -= lengths[v];
                    }
                    gradient[v - tips] = value;
                }
                Ok(gradient)
            },
        )
    }

    pub fn diagonal_hessian(
        &self,
        likelihood: &mut TreeDataLikelihood,
    ) -> Result<Rc<Array1<f64>>, LikelihoodError> {
        likelihood.cached_trait(
            TreeTraitKey::NodeHeightHessian,
            |lik| -> Result<_, LikelihoodError> {
                lik.cache_branch_differentials(true)?;
                let tree = lik.tree();
                let tips = tree.external_node_count();
                let mut hessian = Array1::<f64>::zeros(tree.internal_node_count());
                for v in tips..tree.node_count() {
                    hessian[v - tips] = node_hessian(lik, v)?;
                }
                Ok(hessian)
            },
        )
    }
}

/// `∂ℓ/∂t_b` per node; zero at the root.
fn branch_length_differentials(lik: &mut TreeDataLikelihood) -> Result<Vec<f64>, LikelihoodError> {
    lik.cache_branch_differentials(false)?;
    let nodes = lik.branch_nodes();
    let buffers: Vec<usize> = nodes.iter().map(|&node| lik.branch_buffer(node)).collect();
    let edges = lik.engine().calculate_edge_differentials(&nodes, &buffers, None)?;
    let mut lengths = vec![0.0; lik.tree().node_count()];
    for (&node, &g) in nodes.iter().zip(edges.gradient.iter()) {
        lengths[node] = g;
    }
    Ok(lengths)
}

fn branch_matrix(
    engine: &dyn LikelihoodEngine,
    buffer: usize,
    second_order: bool,
) -> Result<Array2<f64>, LikelihoodError> {
    let cached = if second_order {
        engine.second_order_differential_matrix(buffer)
    } else {
        engine.first_order_differential_matrix(buffer)
    };
    match cached {
        Some(DifferentialMatrices::Branch(matrix)) => Ok(matrix.clone()),
        _ => Err(EngineError::MissingDifferential(buffer).into()),
    }
}

/// Element-wise product of every message except those listed.
fn product_except(messages: &[Array2<f64>], skip: &[usize], shape: (usize, usize)) -> Array2<f64> {
    let mut product = Array2::<f64>::ones(shape);
    for (k, message) in messages.iter().enumerate() {
        if !skip.contains(&k) {
            product *= message;
        }
    }
    product
}

fn row_dot(a: ArrayView2<f64>, b: &Array2<f64>) -> Array1<f64> {
    (&a * b).sum_axis(Axis(1))
}

fn node_hessian(lik: &TreeDataLikelihood, v: usize) -> Result<f64, LikelihoodError> {
    let engine = lik.engine();
    let tree = lik.tree();
    let children = tree.children(v);
    let patterns = engine.pattern_count();
    let shape = (patterns, engine.state_count());

    let own = if tree.is_root(v) {
        None
    } else {
        let buffer = lik.branch_buffer(v);
        Some((
            branch_matrix(engine, buffer, false)?,
            branch_matrix(engine, buffer, true)?,
        ))
    };
    let child_matrices = children
        .iter()
        .map(|&c| {
            let buffer = lik.branch_buffer(c);
            Ok((
                branch_matrix(engine, buffer, false)?,
                branch_matrix(engine, buffer, true)?,
            ))
        })
        .collect::<Result<Vec<_>, LikelihoodError>>()?;

    let pre = engine.pre_order_partials(v)?;
    let mut l0 = Array1::<f64>::zeros(patterns);
    let mut l1 = Array1::<f64>::zeros(patterns);
    let mut l2 = Array1::<f64>::zeros(patterns);

    for c in 0..engine.category_count() {
        let rate = engine.category_rates()[c];
        let weight = engine.category_weights()[c];
        let pre_c = pre.index_axis(Axis(0), c);

        let mut messages = Vec::with_capacity(children.len());
        let mut first = Vec::with_capacity(children.len());
        let mut second = Vec::with_capacity(children.len());
        for (k, &child) in children.iter().enumerate() {
            let post = engine.post_order_partials(child)?.index_axis_move(Axis(0), c);
            let transition = engine.transition_matrix(child, c)?;
            let message = post.dot(&transition.t());
            let (m1, m2) = &child_matrices[k];
            first.push(message.dot(&(m1 * rate).t()));
            second.push(message.dot(&(m2 * (rate * rate)).t()));
            messages.push(message);
        }

        let all = product_except(&messages, &[], shape);
        let mut d0 = row_dot(pre_c, &all);
        let mut d1 = Array1::<f64>::zeros(patterns);
        let mut d2 = Array1::<f64>::zeros(patterns);
        for k in 0..children.len() {
            let rest = product_except(&messages, &[k], shape);
            d1 += &row_dot(pre_c, &(&first[k] * &rest));
            d2 += &row_dot(pre_c, &(&second[k] * &rest));
            for j in (k + 1)..children.len() {
                let rest_pair = product_except(&messages, &[k, j], shape);
                d2.scaled_add(2.0, &row_dot(pre_c, &(&(&first[k] * &first[j]) * &rest_pair)));
            }
        }
        if let Some((m1, m2)) = &own {
            let q1 = pre_c.dot(&(m1 * rate));
            let q2 = pre_c.dot(&(m2 * (rate * rate)));
            d1 -= &row_dot(q1.view(), &all);
            for k in 0..children.len() {
                let rest = product_except(&messages, &[k], shape);
                d2.scaled_add(-2.0, &row_dot(q1.view(), &(&first[k] * &rest)));
            }
            d2 += &row_dot(q2.view(), &all);
        }

        d0 *= weight;
        l0 += &d0;
        l1.scaled_add(weight, &d1);
        l2.scaled_add(weight, &d2);
    }

    let weights = engine.pattern_weights();
    let mut total = 0.0;
    for p in 0..patterns {
        let ratio = l1[p] / l0[p];
        total += weights[p] * (l2[p] / l0[p] - ratio * ratio);
    }
    Ok(total)
}

impl LikelihoodGradient for NodeHeightGradient {
    fn dimension(&self, likelihood: &TreeDataLikelihood) -> usize {
        likelihood.tree().internal_node_count()
    }

    fn parameter_values(&self, likelihood: &TreeDataLikelihood) -> Array1<f64> {
        let tree = likelihood.tree();
        Array1::from(tree.heights()[tree.external_node_count()..].to_vec())
    }

    fn set_parameter_values(
        &mut self,
        likelihood: &mut TreeDataLikelihood,
        values: ArrayView1<f64>,
    ) -> Result<(), GradientError> {
        check_dimension(self.dimension(likelihood), values)?;
        likelihood.tree_mut().set_internal_heights(&values.to_vec())?;
        Ok(())
    }

    fn gradient(&mut self, likelihood: &mut TreeDataLikelihood) -> Result<Array1<f64>, GradientError> {
        Ok(NodeHeightGradient::gradient(self, likelihood)?.as_ref().clone())
    }

    fn diagonal_hessian(
        &mut self,
        likelihood: &mut TreeDataLikelihood,
    ) -> Result<Array1<f64>, GradientError> {
        Ok(NodeHeightGradient::diagonal_hessian(self, likelihood)?.as_ref().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::{likelihood, likelihood_with_rates, tree};
    use super::*;
    use crate::branchrates::{ArbitraryBranchRates, RateTransform};
    use approx::assert_relative_eq;

    fn log_likelihood_at(lik: &mut TreeDataLikelihood, node: usize, height: f64) -> f64 {
        let original = lik.tree().node_height(node);
        lik.tree_mut().set_node_height(node, height).unwrap();
        let value = lik.log_likelihood().unwrap();
        lik.tree_mut().set_node_height(node, original).unwrap();
        value
    }

    fn check_against_finite_differences(mut lik: TreeDataLikelihood) {
        let delegate = NodeHeightGradient::new();
        let gradient = delegate.gradient(&mut lik).unwrap();
        let hessian = delegate.diagonal_hessian(&mut lik).unwrap();
        let centre = lik.log_likelihood().unwrap();
        let tips = lik.tree().external_node_count();
        let h = 1e-4;
        for v in tips..lik.tree().node_count() {
            let height = lik.tree().node_height(v);
            let up = log_likelihood_at(&mut lik, v, height + h);
            let down = log_likelihood_at(&mut lik, v, height - h);
            let fd = (up - down) / (2.0 * h);
            let fd2 = (up - 2.0 * centre + down) / (h * h);
            assert_relative_eq!(gradient[v - tips], fd, epsilon = 1e-5, max_relative = 1e-5);
            assert_relative_eq!(hessian[v - tips], fd2, epsilon = 1e-2, max_relative = 1e-3);
        }
    }

    #[test]
    fn strict_clock_heights_match_finite_differences() {
        check_against_finite_differences(likelihood());
    }

    #[test]
    fn relaxed_clock_heights_match_finite_differences() {
        let tree = tree();
        let values = Array1::from_shape_fn(tree.node_count() - 1, |i| 0.3 + 0.25 * i as f64);
        let rates = ArbitraryBranchRates::new(&tree, values, RateTransform::Identity).unwrap();
        check_against_finite_differences(likelihood_with_rates(Box::new(rates)));
    }

    #[test]
    fn parameter_round_trip_through_tree() {
        let mut lik = likelihood();
        let mut delegate = NodeHeightGradient::new();
        let values = delegate.parameter_values(&lik);
        assert_eq!(values.len(), 3);
        let mut moved = values.clone();
        moved[1] += 0.05;
        delegate.set_parameter_values(&mut lik, moved.view()).unwrap();
        assert_eq!(lik.tree().node_height(5), values[1] + 0.05);
        moved[0] = 10.0;
        assert!(delegate.set_parameter_values(&mut lik, moved.view()).is_err());
    }
}
