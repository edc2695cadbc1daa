//! Reference engine: dense per-node partials on the CPU.

use super::{
    CrossProductRequest, DifferentialKind, DifferentialMatrices, EdgeDifferentials, EngineError,
    LikelihoodEngine, PartialsUpdate,
};
use crate::alignment::SitePatterns;
use crate::substmodel::EigenDecomposition;
use ahash::AHashMap;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use ndarray_linalg::c64;

pub struct CpuLikelihoodEngine {
    state_count: usize,
    pattern_weights: Array1<f64>,
    tip_partials: Vec<Array2<f64>>,
    category_rates: Array1<f64>,
    category_weights: Array1<f64>,
    eigen_systems: Vec<EigenDecomposition>,
    transitions: Vec<Array3<f64>>,
    post: Vec<Array3<f64>>,
    messages: Vec<Array3<f64>>,
    above: Vec<Array3<f64>>,
    pre: Vec<Array3<f64>>,
    log_scales: Vec<Array1<f64>>,
    root: usize,
    root_likelihoods: Array1<f64>,
    log_likelihood: Option<f64>,
    first_order: AHashMap<usize, DifferentialMatrices>,
    second_order: AHashMap<usize, DifferentialMatrices>,
}

impl CpuLikelihoodEngine {
    pub fn new(patterns: &SitePatterns) -> Self {
        let tip_partials = (0..patterns.tip_count())
            .map(|tip| patterns.tip_partials(tip))
            .collect();
        Self {
            state_count: patterns.state_count(),
            pattern_weights: patterns.weights().to_owned(),
            tip_partials,
            category_rates: Array1::ones(1),
            category_weights: Array1::ones(1),
            eigen_systems: Vec::new(),
            transitions: Vec::new(),
            post: Vec::new(),
            messages: Vec::new(),
            above: Vec::new(),
            pre: Vec::new(),
            log_scales: Vec::new(),
            root: 0,
            root_likelihoods: Array1::zeros(patterns.pattern_count()),
            log_likelihood: None,
            first_order: AHashMap::new(),
            second_order: AHashMap::new(),
        }
    }

    fn require_node(&self, node: usize) -> Result<(), EngineError> {
        if self.log_likelihood.is_none() {
            return Err(EngineError::NotComputed);
        }
        if node >= self.post.len() {
            return Err(EngineError::NodeOutOfRange {
                node,
                node_count: self.post.len(),
            });
        }
        Ok(())
    }

    /// `Σ_c w_c pre · post` per pattern at the bottom of a branch.
    fn edge_denominators(&self, node: usize) -> Array1<f64> {
        let mut den = Array1::<f64>::zeros(self.pattern_count());
        for (c, &w) in self.category_weights.iter().enumerate() {
            let pre = self.pre[node].index_axis(Axis(0), c);
            let post = self.post[node].index_axis(Axis(0), c);
            den.scaled_add(w, &(&pre * &post).sum_axis(Axis(1)));
        }
        den
    }

    fn validate_matrices(&self, matrices: &DifferentialMatrices) -> Result<(), EngineError> {
        let n = self.state_count;
        let (rows, cols) = match matrices {
            DifferentialMatrices::PerCategory(blocks) => (blocks.shape()[1], blocks.shape()[2]),
            DifferentialMatrices::Branch(matrix) => matrix.dim(),
        };
        for found in [rows, cols] {
            if found != n {
                return Err(EngineError::DimensionMismatch {
                    what: "differential matrix",
                    expected: n,
                    found,
                });
            }
        }
        Ok(())
    }
}

fn category_matrix(
    matrices: &DifferentialMatrices,
    category: usize,
    rate: f64,
    power: i32,
) -> Result<Array2<f64>, EngineError> {
    match matrices {
        DifferentialMatrices::PerCategory(blocks) => {
            let available = blocks.len_of(Axis(0));
            if category >= available {
                return Err(EngineError::DimensionMismatch {
                    what: "differential categories",
                    expected: category + 1,
                    found: available,
                });
            }
            Ok(blocks.index_axis(Axis(0), category).to_owned())
        }
        DifferentialMatrices::Branch(matrix) => Ok(matrix * rate.powi(power)),
    }
}

/// Divides each pattern by its largest entry across categories and states and
/// returns the log of the factors.
fn rescale(partials: &mut Array3<f64>) -> Array1<f64> {
    let patterns = partials.len_of(Axis(1));
    let mut log_scales = Array1::<f64>::zeros(patterns);
    for p in 0..patterns {
        let mut slice = partials.index_axis_mut(Axis(1), p);
        let max = slice.iter().copied().fold(0.0_f64, f64::max);
        if max > 0.0 && max.is_finite() {
            slice.mapv_inplace(|v| v / max);
            log_scales[p] = max.ln();
        }
    }
    log_scales
}

/// `m[c, p, i] = Σ_j P_c[i, j] x[c, p, j]`.
fn propagate_up(partials: &Array3<f64>, transitions: &Array3<f64>) -> Array3<f64> {
    let mut out = Array3::<f64>::zeros(partials.raw_dim());
    for (c, mut block) in out.outer_iter_mut().enumerate() {
        let p = transitions.index_axis(Axis(0), c);
        block.assign(&partials.index_axis(Axis(0), c).dot(&p.t()));
    }
    out
}

/// `y[c, p, j] = Σ_i x[c, p, i] P_c[i, j]`.
fn propagate_down(partials: &Array3<f64>, transitions: &Array3<f64>) -> Array3<f64> {
    let mut out = Array3::<f64>::zeros(partials.raw_dim());
    for (c, mut block) in out.outer_iter_mut().enumerate() {
        let p = transitions.index_axis(Axis(0), c);
        block.assign(&partials.index_axis(Axis(0), c).dot(&p));
    }
    out
}

fn complexify(values: ArrayView2<f64>) -> Array2<c64> {
    values.mapv(|v| c64::new(v, 0.0))
}

impl LikelihoodEngine for CpuLikelihoodEngine {
    fn state_count(&self) -> usize {
        self.state_count
    }

    fn pattern_count(&self) -> usize {
        self.pattern_weights.len()
    }

    fn category_count(&self) -> usize {
        self.category_rates.len()
    }

    fn pattern_weights(&self) -> ArrayView1<'_, f64> {
        self.pattern_weights.view()
    }

    fn category_rates(&self) -> ArrayView1<'_, f64> {
        self.category_rates.view()
    }

    fn category_weights(&self) -> ArrayView1<'_, f64> {
        self.category_weights.view()
    }

    fn compute_partials(&mut self, update: &PartialsUpdate<'_>) -> Result<f64, EngineError> {
        let tree = update.tree;
        let node_count = tree.node_count();
        let n = self.state_count;
        let mismatch = |what, expected, found| EngineError::DimensionMismatch {
            what,
            expected,
            found,
        };
        if tree.external_node_count() != self.tip_partials.len() {
            return Err(mismatch("tips", self.tip_partials.len(), tree.external_node_count()));
        }
        if update.distances.len() != node_count {
            return Err(mismatch("branch distances", node_count, update.distances.len()));
        }
        if update.branch_models.len() != node_count {
            return Err(mismatch("branch model map", node_count, update.branch_models.len()));
        }
        if update.root_frequencies.len() != n {
            return Err(mismatch("root frequencies", n, update.root_frequencies.len()));
        }
        if update.category_rates.is_empty()
            || update.category_rates.len() != update.category_weights.len()
        {
            return Err(mismatch(
                "category weights",
                update.category_rates.len(),
                update.category_weights.len(),
            ));
        }
        if let Some(eigen) = update.eigen_systems.iter().find(|e| e.state_count() != n) {
            return Err(mismatch("generator dimension", n, eigen.state_count()));
        }
        for (node, &model) in update.branch_models.iter().enumerate() {
            if !tree.is_root(node) && model >= update.eigen_systems.len() {
                return Err(mismatch("substitution model index", update.eigen_systems.len(), model));
            }
        }

        self.log_likelihood = None;
        self.category_rates = update.category_rates.to_owned();
        self.category_weights = update.category_weights.to_owned();
        self.eigen_systems = update.eigen_systems.to_vec();
        self.root = tree.root();
        let categories = self.category_rates.len();
        let patterns = self.pattern_count();
        let shape = (categories, patterns, n);

        self.transitions = (0..node_count)
            .map(|node| {
                let mut blocks = Array3::<f64>::zeros((categories, n, n));
                if tree.is_root(node) {
                    for mut block in blocks.outer_iter_mut() {
                        block.diag_mut().fill(1.0);
                    }
                } else {
                    let eigen = &self.eigen_systems[update.branch_models[node]];
                    for (c, mut block) in blocks.outer_iter_mut().enumerate() {
                        let distance = self.category_rates[c] * update.distances[node];
                        block.assign(&eigen.transition_probabilities(distance));
                    }
                }
                blocks
            })
            .collect();

        let empty = Array3::<f64>::zeros((0, 0, 0));
        self.post = vec![empty.clone(); node_count];
        self.messages = vec![empty.clone(); node_count];
        self.log_scales = vec![Array1::zeros(patterns); node_count];

        for node in tree.post_order() {
            let partials = if tree.is_external(node) {
                let tip = &self.tip_partials[node];
                Array3::from_shape_fn(shape, |(_, p, s)| tip[[p, s]])
            } else {
                let mut product = Array3::<f64>::ones(shape);
                for &child in tree.children(node) {
                    product *= &self.messages[child];
                }
                self.log_scales[node] = rescale(&mut product);
                product
            };
            if !tree.is_root(node) {
                self.messages[node] = propagate_up(&partials, &self.transitions[node]);
            }
            self.post[node] = partials;
        }

        let pi = update.root_frequencies;
        let mut root_likelihoods = Array1::<f64>::zeros(patterns);
        for (c, &w) in self.category_weights.iter().enumerate() {
            let root_post = self.post[self.root].index_axis(Axis(0), c);
            root_likelihoods.scaled_add(w, &root_post.dot(&pi));
        }
        let mut total_scales = Array1::<f64>::zeros(patterns);
        for scales in &self.log_scales {
            total_scales += scales;
        }
        let log_likelihood: f64 = (0..patterns)
            .map(|p| self.pattern_weights[p] * (root_likelihoods[p].ln() + total_scales[p]))
            .sum();
        self.root_likelihoods = root_likelihoods;

        self.pre = vec![empty.clone(); node_count];
        self.above = vec![empty; node_count];
        self.pre[self.root] = Array3::from_shape_fn(shape, |(_, _, s)| pi[s]);
        self.above[self.root] = self.pre[self.root].clone();
        for node in tree.pre_order() {
            let children = tree.children(node);
            for &child in children {
                let mut above = self.pre[node].clone();
                for &sibling in children {
                    if sibling != child {
                        above *= &self.messages[sibling];
                    }
                }
                rescale(&mut above);
                self.pre[child] = propagate_down(&above, &self.transitions[child]);
                self.above[child] = above;
            }
        }

        self.log_likelihood = Some(log_likelihood);
        Ok(log_likelihood)
    }

    fn log_likelihood(&self) -> Result<f64, EngineError> {
        self.log_likelihood.ok_or(EngineError::NotComputed)
    }

    fn post_order_partials(&self, node: usize) -> Result<ArrayView3<'_, f64>, EngineError> {
        self.require_node(node)?;
        Ok(self.post[node].view())
    }

    fn pre_order_partials(&self, node: usize) -> Result<ArrayView3<'_, f64>, EngineError> {
        self.require_node(node)?;
        Ok(self.pre[node].view())
    }

    fn transition_matrix(
        &self,
        node: usize,
        category: usize,
    ) -> Result<ArrayView2<'_, f64>, EngineError> {
        self.require_node(node)?;
        if category >= self.category_count() {
            return Err(EngineError::DimensionMismatch {
                what: "rate category",
                expected: self.category_count(),
                found: category,
            });
        }
        Ok(self.transitions[node].index_axis(Axis(0), category))
    }

    fn cache_first_order_differential_matrix(
        &mut self,
        buffer: usize,
        matrices: DifferentialMatrices,
    ) -> Result<(), EngineError> {
        self.validate_matrices(&matrices)?;
        self.first_order.insert(buffer, matrices);
        Ok(())
    }

    fn cache_second_order_differential_matrix(
        &mut self,
        buffer: usize,
        matrices: DifferentialMatrices,
    ) -> Result<(), EngineError> {
        self.validate_matrices(&matrices)?;
        self.second_order.insert(buffer, matrices);
        Ok(())
    }

    fn first_order_differential_matrix(&self, buffer: usize) -> Option<&DifferentialMatrices> {
        self.first_order.get(&buffer)
    }

    fn second_order_differential_matrix(&self, buffer: usize) -> Option<&DifferentialMatrices> {
        self.second_order.get(&buffer)
    }

    fn calculate_edge_differentials(
        &self,
        nodes: &[usize],
        first_buffers: &[usize],
        second_buffers: Option<&[usize]>,
    ) -> Result<EdgeDifferentials, EngineError> {
        if first_buffers.len() != nodes.len() {
            return Err(EngineError::DimensionMismatch {
                what: "first-order buffer indices",
                expected: nodes.len(),
                found: first_buffers.len(),
            });
        }
        if let Some(second) = second_buffers {
            if second.len() != nodes.len() {
                return Err(EngineError::DimensionMismatch {
                    what: "second-order buffer indices",
                    expected: nodes.len(),
                    found: second.len(),
                });
            }
        }

        let patterns = self.pattern_count();
        let mut gradient = Vec::with_capacity(nodes.len());
        let mut hessian = second_buffers.map(|_| Vec::with_capacity(nodes.len()));

        for (k, &node) in nodes.iter().enumerate() {
            self.require_node(node)?;
            let first = self
                .first_order
                .get(&first_buffers[k])
                .ok_or(EngineError::MissingDifferential(first_buffers[k]))?;
            let second = match second_buffers {
                Some(buffers) => Some(
                    self.second_order
                        .get(&buffers[k])
                        .ok_or(EngineError::MissingDifferential(buffers[k]))?,
                ),
                None => None,
            };

            let mut den = Array1::<f64>::zeros(patterns);
            let mut num1 = Array1::<f64>::zeros(patterns);
            let mut num2 = Array1::<f64>::zeros(patterns);
            for c in 0..self.category_count() {
                let w = self.category_weights[c];
                let rate = self.category_rates[c];
                let pre = self.pre[node].index_axis(Axis(0), c);
                let post = self.post[node].index_axis(Axis(0), c);
                den.scaled_add(w, &(&pre * &post).sum_axis(Axis(1)));

                let d1 = category_matrix(first, c, rate, 1)?;
                num1.scaled_add(w, &(&pre * &post.dot(&d1.t())).sum_axis(Axis(1)));
                if let Some(second) = second {
                    let d2 = category_matrix(second, c, rate, 2)?;
                    num2.scaled_add(w, &(&pre * &post.dot(&d2.t())).sum_axis(Axis(1)));
                }
            }

            let mut g = 0.0;
            let mut h = 0.0;
            for p in 0..patterns {
                let weight = self.pattern_weights[p];
                let ratio = num1[p] / den[p];
                g += weight * ratio;
                h += weight * (num2[p] / den[p] - ratio * ratio);
            }
            gradient.push(g);
            if let Some(values) = hessian.as_mut() {
                values.push(h);
            }
        }
        Ok(EdgeDifferentials { gradient, hessian })
    }

    fn calculate_cross_product_differentials(
        &self,
        request: &CrossProductRequest<'_>,
        first: &mut [Array2<f64>],
        second: Option<&mut [Array2<f64>]>,
    ) -> Result<(), EngineError> {
        if second.is_some() {
            return Err(EngineError::NotYetImplemented(
                "second-order cross-product differentials",
            ));
        }
        if self.log_likelihood.is_none() {
            return Err(EngineError::NotComputed);
        }
        let count = request.nodes.len();
        for (what, found) in [
            ("cross-product models", request.models.len()),
            ("cross-product distances", request.distances.len()),
        ] {
            if found != count {
                return Err(EngineError::DimensionMismatch {
                    what,
                    expected: count,
                    found,
                });
            }
        }
        let n = self.state_count;
        if let Some(bad) = first.iter().find(|z| z.dim() != (n, n)) {
            return Err(EngineError::DimensionMismatch {
                what: "cross-product output",
                expected: n,
                found: bad.nrows(),
            });
        }

        for k in 0..count {
            let node = request.nodes[k];
            let model = request.models[k];
            let distance = request.distances[k];
            self.require_node(node)?;
            if model >= first.len() || model >= self.eigen_systems.len() {
                return Err(EngineError::DimensionMismatch {
                    what: "cross-product model index",
                    expected: first.len().min(self.eigen_systems.len()),
                    found: model,
                });
            }

            let coefficients = &self.pattern_weights / &self.edge_denominators(node);
            match request.kind {
                DifferentialKind::FirstOrder => {
                    for c in 0..self.category_count() {
                        let scale = self.category_weights[c] * self.category_rates[c] * distance;
                        let mut pre = self.pre[node].index_axis(Axis(0), c).to_owned();
                        for (mut row, &coef) in pre.outer_iter_mut().zip(coefficients.iter()) {
                            row *= coef * scale;
                        }
                        let post = self.post[node].index_axis(Axis(0), c);
                        first[model] += &pre.t().dot(&post);
                    }
                }
                DifferentialKind::Exact => {
                    let eigen = &self.eigen_systems[model];
                    let v = eigen.eigenvectors();
                    let v_inv = eigen.inverse_eigenvectors();
                    let mut z = Array2::<c64>::zeros((n, n));
                    for c in 0..self.category_count() {
                        let s = self.category_rates[c] * distance;
                        let w = self.category_weights[c];
                        let a = complexify(self.above[node].index_axis(Axis(0), c));
                        let b = complexify(self.post[node].index_axis(Axis(0), c));
                        let mut left = a.dot(&v);
                        for (mut row, &coef) in left.outer_iter_mut().zip(coefficients.iter()) {
                            row *= c64::new(coef * w, 0.0);
                        }
                        let right = b.dot(&v_inv.t());
                        let mut spectral = left.t().dot(&right);
                        for ((m, l), value) in spectral.indexed_iter_mut() {
                            *value *= eigen.exp_integral(m, l, s);
                        }
                        z += &v_inv.t().dot(&spectral).dot(&v.t());
                    }
                    first[model].zip_mut_with(&z, |out, value| *out += value.re);
                }
            }
        }
        Ok(())
    }

    fn root_frequency_differentials(&self) -> Result<Array1<f64>, EngineError> {
        if self.log_likelihood.is_none() {
            return Err(EngineError::NotComputed);
        }
        let coefficients = &self.pattern_weights / &self.root_likelihoods;
        let mut out = Array1::<f64>::zeros(self.state_count);
        for (c, &w) in self.category_weights.iter().enumerate() {
            let post = self.post[self.root].index_axis(Axis(0), c);
            out.scaled_add(w, &post.t().dot(&coefficients));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substmodel::{
        FixedEffects, GeneralizedLinearModel, GlmSubstitutionModel, SubstitutionModel,
    };
    use crate::tree::Tree;
    use ndarray::{Array2, array};

    fn model() -> GlmSubstitutionModel {
        let glm = GeneralizedLinearModel::new(6)
            .with_fixed_effects(
                FixedEffects::new(
                    "rates",
                    Array2::eye(6),
                    array![0.3, 1.2, -0.2, 0.1, 1.0, -0.4],
                )
                .unwrap(),
            )
            .unwrap();
        GlmSubstitutionModel::new(4, array![0.15, 0.25, 0.35, 0.25], glm, true, true).unwrap()
    }

    fn patterns() -> SitePatterns {
        // 4 tips, 5 patterns; 4 encodes a gap.
        let states = array![
            [0, 1, 2, 3, 0],
            [0, 1, 2, 1, 4],
            [1, 1, 3, 3, 2],
            [0, 3, 2, 1, 2]
        ];
        SitePatterns::new(states, array![3.0, 1.0, 2.0, 1.0, 1.0], 4).unwrap()
    }

    struct Fixture {
        tree: Tree,
        eigen: Vec<EigenDecomposition>,
        distances: Vec<f64>,
        rates: Array1<f64>,
        weights: Array1<f64>,
        pi: Array1<f64>,
    }

    impl Fixture {
        fn new() -> Self {
            let tree = Tree::balanced(4, 0.2).unwrap();
            let m = model();
            let distances: Vec<f64> = (0..tree.node_count())
                .map(|n| tree.branch_length(n) * (1.0 + 0.1 * n as f64))
                .collect();
            Self {
                eigen: vec![m.eigen_decomposition().unwrap()],
                pi: m.frequencies().to_owned(),
                tree,
                distances,
                rates: array![0.4, 1.6],
                weights: array![0.5, 0.5],
            }
        }

        fn run(&self, engine: &mut CpuLikelihoodEngine) -> f64 {
            let models = vec![0; self.tree.node_count()];
            engine
                .compute_partials(&PartialsUpdate {
                    tree: &self.tree,
                    eigen_systems: &self.eigen,
                    branch_models: &models,
                    distances: &self.distances,
                    root_frequencies: self.pi.view(),
                    category_rates: self.rates.view(),
                    category_weights: self.weights.view(),
                })
                .unwrap()
        }
    }

    #[test]
    fn two_tip_likelihood_matches_direct_sum() {
        let tree = Tree::balanced(2, 0.3).unwrap();
        let states = array![[0, 2], [1, 2]];
        let patterns = SitePatterns::new(states, array![1.0, 2.0], 4).unwrap();
        let m = model();
        let eigen = vec![m.eigen_decomposition().unwrap()];
        let mut engine = CpuLikelihoodEngine::new(&patterns);
        let log_l = engine
            .compute_partials(&PartialsUpdate {
                tree: &tree,
                eigen_systems: &eigen,
                branch_models: &[0, 0, 0],
                distances: &[0.3, 0.3, 0.0],
                root_frequencies: m.frequencies(),
                category_rates: array![1.0].view(),
                category_weights: array![1.0].view(),
            })
            .unwrap();
        let p = m.transition_probabilities(0.3).unwrap();
        let pi = m.frequencies();
        let site = |x: usize, y: usize| (0..4).map(|i| pi[i] * p[[i, x]] * p[[i, y]]).sum::<f64>();
        let expected = site(0, 1).ln() + 2.0 * site(2, 2).ln();
        assert!((log_l - expected).abs() < 1e-12, "{log_l} vs {expected}");
    }

    #[test]
    fn edge_gradient_matches_finite_difference() {
        let fixture = Fixture::new();
        let mut engine = CpuLikelihoodEngine::new(&patterns());
        fixture.run(&mut engine);
        let q = model().infinitesimal_matrix();
        engine
            .cache_first_order_differential_matrix(0, DifferentialMatrices::Branch(q.clone()))
            .unwrap();
        engine
            .cache_second_order_differential_matrix(0, DifferentialMatrices::Branch(q.dot(&q)))
            .unwrap();
        let node = 1;
        let edge = engine
            .calculate_edge_differentials(&[node], &[0], Some(&[0]))
            .unwrap();

        let h = 1e-5;
        let mut shifted = Fixture::new();
        let mut eval = |delta: f64| {
            shifted.distances[node] = fixture.distances[node] + delta;
            let mut e = CpuLikelihoodEngine::new(&patterns());
            shifted.run(&mut e)
        };
        let (up, mid, down) = (eval(h), eval(0.0), eval(-h));
        let fd_gradient = (up - down) / (2.0 * h);
        let fd_hessian = (up - 2.0 * mid + down) / (h * h);
        assert!((edge.gradient[0] - fd_gradient).abs() < 1e-6);
        let analytic_hessian = edge.hessian.unwrap()[0];
        assert!(
            (analytic_hessian - fd_hessian).abs() < 1e-3 * fd_hessian.abs().max(1.0),
            "{analytic_hessian} vs {fd_hessian}"
        );
    }

    #[test]
    fn exact_cross_products_match_generator_perturbation() {
        let fixture = Fixture::new();
        let mut engine = CpuLikelihoodEngine::new(&patterns());
        fixture.run(&mut engine);
        let nodes: Vec<usize> = (0..fixture.tree.node_count())
            .filter(|&n| !fixture.tree.is_root(n))
            .collect();
        let distances: Vec<f64> = nodes.iter().map(|&n| fixture.distances[n]).collect();
        let mut z = vec![Array2::<f64>::zeros((4, 4))];
        engine
            .calculate_cross_product_differentials(
                &CrossProductRequest {
                    nodes: &nodes,
                    models: &vec![0; nodes.len()],
                    distances: &distances,
                    kind: DifferentialKind::Exact,
                },
                &mut z,
                None,
            )
            .unwrap();

        let q = model().infinitesimal_matrix();
        let h = 1e-6;
        for (k, l) in [(0, 1), (2, 3), (3, 0), (1, 1)] {
            let mut eval = |delta: f64| {
                let mut perturbed = q.clone();
                perturbed[[k, l]] += delta;
                let mut shifted = Fixture::new();
                shifted.eigen = vec![EigenDecomposition::general(perturbed.view()).unwrap()];
                let mut e = CpuLikelihoodEngine::new(&patterns());
                shifted.run(&mut e)
            };
            let fd = (eval(h) - eval(-h)) / (2.0 * h);
            assert!(
                (z[0][[k, l]] - fd).abs() < 1e-5 * fd.abs().max(1.0),
                "entry ({k}, {l}): {} vs {fd}",
                z[0][[k, l]]
            );
        }
    }

    #[test]
    fn root_frequency_differentials_match_perturbation() {
        let fixture = Fixture::new();
        let mut engine = CpuLikelihoodEngine::new(&patterns());
        fixture.run(&mut engine);
        let analytic = engine.root_frequency_differentials().unwrap();
        let h = 1e-6;
        for k in 0..4 {
            let mut eval = |delta: f64| {
                let mut shifted = Fixture::new();
                shifted.pi[k] += delta;
                let mut e = CpuLikelihoodEngine::new(&patterns());
                shifted.run(&mut e)
            };
            let fd = (eval(h) - eval(-h)) / (2.0 * h);
            assert!((analytic[k] - fd).abs() < 1e-5 * fd.abs().max(1.0));
        }
    }

    #[test]
    fn second_order_cross_products_are_not_implemented() {
        let fixture = Fixture::new();
        let mut engine = CpuLikelihoodEngine::new(&patterns());
        fixture.run(&mut engine);
        let mut first = vec![Array2::<f64>::zeros((4, 4))];
        let mut second = vec![Array2::<f64>::zeros((4, 4))];
        let result = engine.calculate_cross_product_differentials(
            &CrossProductRequest {
                nodes: &[0],
                models: &[0],
                distances: &[0.2],
                kind: DifferentialKind::FirstOrder,
            },
            &mut first,
            Some(&mut second),
        );
        assert!(matches!(result, Err(EngineError::NotYetImplemented(_))));
    }

    #[test]
    fn accessors_require_computed_partials() {
        let engine = CpuLikelihoodEngine::new(&patterns());
        assert!(matches!(engine.post_order_partials(0), Err(EngineError::NotComputed)));
        assert!(matches!(engine.log_likelihood(), Err(EngineError::NotComputed)));
    }

    #[test]
    fn rejects_wrong_sized_differentials() {
        let mut engine = CpuLikelihoodEngine::new(&patterns());
        let result = engine
            .cache_first_order_differential_matrix(0, DifferentialMatrices::Branch(Array2::eye(5)));
        assert!(matches!(result, Err(EngineError::DimensionMismatch { expected: 4, found: 5, .. })));
    }
}
