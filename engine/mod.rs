//! The likelihood-engine boundary.
//!
//! Derivative delegates never touch partial-likelihood arithmetic directly; they
//! ask an engine for post-order and pre-order partials, hand it cached differential
//! matrices, and request batched edge or cross-product reductions.
//! [`CpuLikelihoodEngine`] is the reference implementation.
//!
//! Partials are laid out `(category, pattern, state)`. Each node's partials are
//! rescaled per pattern; scale factors cancel in every ratio the delegates form.

pub mod cpu;

pub use cpu::CpuLikelihoodEngine;

use crate::substmodel::EigenDecomposition;
use crate::tree::Tree;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Partials have not been computed yet")]
    NotComputed,

    #[error("Node {node} is out of range for {node_count} nodes")]
    NodeOutOfRange { node: usize, node_count: usize },

    #[error("Dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("No differential matrix cached in buffer {0}")]
    MissingDifferential(usize),

    #[error("Not yet implemented: {0}")]
    NotYetImplemented(&'static str),
}

/// How the derivative of `exp(Qs)` with respect to a generator entry is formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferentialKind {
    /// `s · exp(Qs)` placed at the bottom of the branch; exact only as `s → 0`.
    FirstOrder,
    /// The eigen-integral `∫ exp(Qu) E exp(Q(s-u)) du`.
    Exact,
}

/// Differential matrices stored in one engine buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum DifferentialMatrices {
    /// One pre-scaled `S × S` block per rate category.
    PerCategory(Array3<f64>),
    /// A single matrix the engine scales by the category rate (first order) or
    /// its square (second order).
    Branch(Array2<f64>),
}

/// Everything the engine needs to refresh its partials.
pub struct PartialsUpdate<'a> {
    pub tree: &'a Tree,
    pub eigen_systems: &'a [EigenDecomposition],
    /// Substitution-model index per node; the root entry is ignored.
    pub branch_models: &'a [usize],
    /// Branch rate times branch length per node; the root entry is ignored.
    pub distances: &'a [f64],
    pub root_frequencies: ArrayView1<'a, f64>,
    pub category_rates: ArrayView1<'a, f64>,
    pub category_weights: ArrayView1<'a, f64>,
}

/// Per-node first and optional second derivatives of the log-likelihood with
/// respect to the scalar each node's differential buffer represents.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeDifferentials {
    pub gradient: Vec<f64>,
    pub hessian: Option<Vec<f64>>,
}

pub struct CrossProductRequest<'a> {
    pub nodes: &'a [usize],
    pub models: &'a [usize],
    pub distances: &'a [f64],
    pub kind: DifferentialKind,
}

pub trait LikelihoodEngine {
    fn state_count(&self) -> usize;

    fn pattern_count(&self) -> usize;

    fn category_count(&self) -> usize;

    fn pattern_weights(&self) -> ArrayView1<'_, f64>;

    fn category_rates(&self) -> ArrayView1<'_, f64>;

    fn category_weights(&self) -> ArrayView1<'_, f64>;

    /// Runs the post-order and pre-order passes; returns the log-likelihood.
    fn compute_partials(&mut self, update: &PartialsUpdate<'_>) -> Result<f64, EngineError>;

    fn log_likelihood(&self) -> Result<f64, EngineError>;

    fn post_order_partials(&self, node: usize) -> Result<ArrayView3<'_, f64>, EngineError>;

    /// Partials conditioned on everything outside the subtree, taken at the bottom
    /// of the node's branch.
    fn pre_order_partials(&self, node: usize) -> Result<ArrayView3<'_, f64>, EngineError>;

    fn transition_matrix(&self, node: usize, category: usize)
    -> Result<ArrayView2<'_, f64>, EngineError>;

    fn cache_first_order_differential_matrix(
        &mut self,
        buffer: usize,
        matrices: DifferentialMatrices,
    ) -> Result<(), EngineError>;

    fn cache_second_order_differential_matrix(
        &mut self,
        buffer: usize,
        matrices: DifferentialMatrices,
    ) -> Result<(), EngineError>;

    fn first_order_differential_matrix(&self, buffer: usize) -> Option<&DifferentialMatrices>;

    fn second_order_differential_matrix(&self, buffer: usize) -> Option<&DifferentialMatrices>;

    fn calculate_edge_differentials(
        &self,
        nodes: &[usize],
        first_buffers: &[usize],
        second_buffers: Option<&[usize]>,
    ) -> Result<EdgeDifferentials, EngineError>;

    /// Accumulates one `S × S` cross-product matrix per substitution model into
    /// `first` in a single pass over the requested branches.
    fn calculate_cross_product_differentials(
        &self,
        request: &CrossProductRequest<'_>,
        first: &mut [Array2<f64>],
        second: Option<&mut [Array2<f64>]>,
    ) -> Result<(), EngineError>;

    /// `Σ_p w_p Σ_c w_c post_root[c, p, k] / L_p` per state `k`.
    fn root_frequency_differentials(&self) -> Result<Array1<f64>, EngineError>;
}
