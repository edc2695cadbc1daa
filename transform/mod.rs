//! Node heights reparameterised as a root height plus one ratio per non-root
//! internal node.
//!
//! With `a_v` the anchor of node `v` (see [`epochs`]) and `p` its parent,
//! `r_v = (h_v - a_v) / (h_p - a_v)`. Any root height above the oldest tip together
//! with ratios in `[0, 1]` maps to a valid tree.

pub mod epochs;

pub use epochs::{Epoch, Epochs};

use crate::gradient::{GradientError, LikelihoodGradient, check_dimension};
use crate::tree::{Tree, TreeError};
use crate::treedatalikelihood::{NodeHeightGradient, TreeDataLikelihood};
use ndarray::{Array1, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Expected {expected} transform parameters, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Ratio {index} must lie in [0, 1], found {value}")]
    RatioOutOfRange { index: usize, value: f64 },

    #[error("Root height {height} lies below the oldest tip at {anchor}")]
    RootBelowAnchor { height: f64, anchor: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformState {
    Valid,
    /// The tree moved; ratios must be recomputed from heights.
    HeightsDirty,
    /// Ratios were set; heights have not been written back yet.
    RatiosDirty,
}

#[derive(Debug, Clone)]
pub struct NodeHeightTransform {
    epochs: Epochs,
    /// Internal non-root nodes in index order; ratio `k` belongs to `ratio_nodes[k]`.
    ratio_nodes: Vec<usize>,
    ratios: Array1<f64>,
    root_height: f64,
    state: TransformState,
    tree_version: u64,
}

impl NodeHeightTransform {
    pub fn new(tree: &Tree) -> Self {
        let mut transform = Self {
            epochs: Epochs::build(tree),
            ratio_nodes: Vec::new(),
            ratios: Array1::zeros(0),
            root_height: tree.node_height(tree.root()),
            state: TransformState::HeightsDirty,
            tree_version: tree.version(),
        };
        transform.rebuild_layout(tree);
        transform.update_ratios(tree);
        transform
    }

    fn rebuild_layout(&mut self, tree: &Tree) {
        self.ratio_nodes = (tree.external_node_count()..tree.node_count())
            .filter(|&v| !tree.is_root(v))
            .collect();
        self.ratios = Array1::zeros(self.ratio_nodes.len());
    }

    /// Notices topology and height changes made directly on the tree.
    fn sync(&mut self, tree: &Tree) {
        if !self.epochs.is_current(tree) {
            self.epochs = Epochs::build(tree);
            self.rebuild_layout(tree);
            self.state = TransformState::HeightsDirty;
        } else if self.state == TransformState::Valid && tree.version() != self.tree_version {
            self.state = TransformState::HeightsDirty;
        }
    }

    pub fn state(&self) -> TransformState {
        self.state
    }

    pub fn epochs(&self) -> &Epochs {
        &self.epochs
    }

    pub fn ratio_nodes(&self) -> &[usize] {
        &self.ratio_nodes
    }

    /// `1 + number of ratios`.
    pub fn dimension(&self) -> usize {
        self.ratio_nodes.len() + 1
    }

    /// Recomputes ratios from heights when the tree has moved.
    pub fn update_ratios(&mut self, tree: &Tree) {
        self.sync(tree);
        if self.state != TransformState::HeightsDirty {
            return;
        }
        self.ratios = ratios_from_heights(&self.epochs, &self.ratio_nodes, tree);
        self.root_height = tree.node_height(tree.root());
        self.tree_version = tree.version();
        self.state = TransformState::Valid;
    }

    /// Writes pending ratios back to the tree top-down, then fires one change.
    pub fn update_node_heights(&mut self, tree: &mut Tree) -> Result<(), TransformError> {
        if self.state != TransformState::RatiosDirty {
            return Ok(());
        }
        let root = tree.root();
        let root_anchor = self.epochs.anchor_height(tree, root);
        if self.root_height < root_anchor {
            return Err(TransformError::RootBelowAnchor {
                height: self.root_height,
                anchor: root_anchor,
            });
        }
        let mut slot = vec![None; tree.node_count()];
        for (k, &v) in self.ratio_nodes.iter().enumerate() {
            slot[v] = Some(k);
        }
        tree.set_node_height_quietly(root, self.root_height)?;
        for v in tree.pre_order() {
            let Some(k) = slot[v] else { continue };
            let anchor = self.epochs.anchor_height(tree, v);
            let parent = tree.parent(v).map_or(anchor, |p| tree.node_height(p));
            tree.set_node_height_quietly(v, anchor + self.ratios[k] * (parent - anchor))?;
        }
        tree.push_tree_changed();
        self.tree_version = tree.version();
        self.state = TransformState::Valid;
        Ok(())
    }

    /// `(root height, ratios…)`.
    pub fn parameters(&mut self, tree: &Tree) -> Array1<f64> {
        self.update_ratios(tree);
        let mut values = Array1::zeros(self.dimension());
        values[0] = self.root_height;
        values.slice_mut(ndarray::s![1..]).assign(&self.ratios);
        values
    }

    /// Like [`Self::parameters`], but leaves the cached state alone. Stored values are
    /// returned while they are current; otherwise the ratios are read off the tree.
    pub fn current_parameters(&self, tree: &Tree) -> Array1<f64> {
        let mut values = Array1::zeros(self.dimension());
        let stored = self.epochs.is_current(tree)
            && match self.state {
                TransformState::RatiosDirty => true,
                TransformState::Valid => tree.version() == self.tree_version,
                TransformState::HeightsDirty => false,
            };
        if stored {
            values[0] = self.root_height;
            values.slice_mut(ndarray::s![1..]).assign(&self.ratios);
        } else if self.epochs.is_current(tree) {
            values[0] = tree.node_height(tree.root());
            values
                .slice_mut(ndarray::s![1..])
                .assign(&ratios_from_heights(&self.epochs, &self.ratio_nodes, tree));
        } else {
            return Self::new(tree).current_parameters(tree);
        }
        values
    }

    pub fn set_parameters(&mut self, tree: &Tree, values: ArrayView1<f64>) -> Result<(), TransformError> {
        self.sync(tree);
        if values.len() != self.dimension() {
            return Err(TransformError::DimensionMismatch {
                expected: self.dimension(),
                found: values.len(),
            });
        }
        for (index, &value) in values.iter().enumerate().skip(1) {
            if !(0.0..=1.0).contains(&value) {
                return Err(TransformError::RatioOutOfRange {
                    index: index - 1,
                    value,
                });
            }
        }
        self.root_height = values[0];
        self.ratios.assign(&values.slice(ndarray::s![1..]));
        self.state = TransformState::RatiosDirty;
        Ok(())
    }

    /// Chain rule from `∂ℓ/∂h` (internal nodes in index order) to
    /// `(∂ℓ/∂h_root, ∂ℓ/∂r…)` by one post-order pass.
    pub fn gradient_wrt_parameters(
        &mut self,
        tree: &Tree,
        height_gradient: ArrayView1<f64>,
    ) -> Result<Array1<f64>, TransformError> {
        self.update_ratios(tree);
        let tips = tree.external_node_count();
        if height_gradient.len() != tree.internal_node_count() {
            return Err(TransformError::DimensionMismatch {
                expected: tree.internal_node_count(),
                found: height_gradient.len(),
            });
        }
        let mut ratio_of = vec![0.0; tree.node_count()];
        let mut slot = vec![None; tree.node_count()];
        for (k, &v) in self.ratio_nodes.iter().enumerate() {
            ratio_of[v] = self.ratios[k];
            slot[v] = Some(k);
        }

        let mut adjoint = vec![0.0; tree.node_count()];
        let mut out = Array1::<f64>::zeros(self.dimension());
        for v in tree.internal_post_order() {
            let mut value = height_gradient[v - tips];
            for &c in tree.children(v) {
                if !tree.is_external(c) {
                    value += ratio_of[c] * adjoint[c];
                }
            }
            adjoint[v] = value;
            match slot[v] {
                Some(k) => {
                    let anchor = self.epochs.anchor_height(tree, v);
                    let parent = tree.parent(v).map_or(anchor, |p| tree.node_height(p));
                    out[k + 1] = value * (parent - anchor);
                }
                None => out[0] = value,
            }
        }
        Ok(out)
    }

    /// `log |∂h/∂(root, r)| = Σ_k log(h_{p(k)} - a_k)`.
    pub fn log_jacobian(&mut self, tree: &Tree) -> f64 {
        self.update_ratios(tree);
        self.ratio_nodes
            .iter()
            .map(|&v| {
                let anchor = self.epochs.anchor_height(tree, v);
                let parent = tree.parent(v).map_or(anchor, |p| tree.node_height(p));
                (parent - anchor).ln()
            })
            .sum()
    }

    /// Gradient of [`Self::log_jacobian`] in `(root, ratios…)` coordinates.
    pub fn log_jacobian_gradient(&mut self, tree: &Tree) -> Result<Array1<f64>, TransformError> {
        self.update_ratios(tree);
        let tips = tree.external_node_count();
        let mut height_gradient = Array1::<f64>::zeros(tree.internal_node_count());
        for &v in &self.ratio_nodes {
            if let Some(p) = tree.parent(v) {
                let anchor = self.epochs.anchor_height(tree, v);
                height_gradient[p - tips] += 1.0 / (tree.node_height(p) - anchor);
            }
        }
        self.gradient_wrt_parameters(tree, height_gradient.view())
    }
}

fn ratios_from_heights(epochs: &Epochs, ratio_nodes: &[usize], tree: &Tree) -> Array1<f64> {
    ratio_nodes
        .iter()
        .map(|&v| {
            let anchor = epochs.anchor_height(tree, v);
            let parent = tree.parent(v).map_or(anchor, |p| tree.node_height(p));
            let span = parent - anchor;
            if span > 0.0 {
                (tree.node_height(v) - anchor) / span
            } else {
                0.0
            }
        })
        .collect()
}

/// Likelihood gradient in `(root height, ratios…)` coordinates.
#[derive(Debug, Clone)]
pub struct RatioGradient {
    transform: NodeHeightTransform,
    heights: NodeHeightGradient,
    include_log_jacobian: bool,
}

impl RatioGradient {
    pub fn new(tree: &Tree, include_log_jacobian: bool) -> Self {
        Self {
            transform: NodeHeightTransform::new(tree),
            heights: NodeHeightGradient::new(),
            include_log_jacobian,
        }
    }

    pub fn transform(&self) -> &NodeHeightTransform {
        &self.transform
    }
}

impl LikelihoodGradient for RatioGradient {
    fn dimension(&self, likelihood: &TreeDataLikelihood) -> usize {
        likelihood.tree().internal_node_count()
    }

    fn parameter_values(&self, likelihood: &TreeDataLikelihood) -> Array1<f64> {
        self.transform.current_parameters(likelihood.tree())
    }

    fn set_parameter_values(
        &mut self,
        likelihood: &mut TreeDataLikelihood,
        values: ArrayView1<f64>,
    ) -> Result<(), GradientError> {
        check_dimension(self.dimension(likelihood), values)?;
        self.transform.set_parameters(likelihood.tree(), values)?;
        self.transform.update_node_heights(likelihood.tree_mut())?;
        Ok(())
    }

    fn gradient(&mut self, likelihood: &mut TreeDataLikelihood) -> Result<Array1<f64>, GradientError> {
        let heights = self.heights.gradient(likelihood)?;
        let mut gradient = self
            .transform
            .gradient_wrt_parameters(likelihood.tree(), heights.view())?;
        if self.include_log_jacobian {
            gradient += &self.transform.log_jacobian_gradient(likelihood.tree())?;
        }
        Ok(gradient)
    }
}
