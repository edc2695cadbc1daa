//! Generator models for discrete-state CTMCs.
//!
//! A [`SubstitutionModel`] exposes an instantaneous-rate matrix `Q` (rows sum to
//! zero), its equilibrium frequencies, and an eigensystem from which transition
//! probabilities `exp(Qt)` are formed. [`glm::GlmSubstitutionModel`] parameterises
//! the off-diagonal rates log-additively; [`sites::SiteRateModel`] supplies the
//! among-site rate categories that scale every branch.

pub mod eigen;
pub mod glm;
pub mod sites;

use itertools::Itertools;
use ndarray::{Array2, ArrayView1};
use thiserror::Error;

pub use eigen::EigenDecomposition;
pub use glm::{FixedEffects, GeneralizedLinearModel, GlmSubstitutionModel};
pub use sites::SiteRateModel;

#[derive(Error, Debug)]
pub enum SubstModelError {
    #[error("Dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Invalid frequencies: {0}")]
    InvalidFrequencies(String),

    #[error("Rate {index} evaluated to a non-finite value ({value})")]
    NonFiniteRate { index: usize, value: f64 },

    #[error("Eigendecomposition failed: {0}")]
    EigendecompositionFailed(ndarray_linalg::error::LinalgError),

    #[error("Fixed-effect block {0} does not exist")]
    UnknownBlock(usize),

    #[error("Invalid site-rate model: {0}")]
    InvalidSiteModel(String),
}

pub trait SubstitutionModel {
    fn state_count(&self) -> usize;

    /// The generator `Q`, already normalised if the model asks for it.
    fn infinitesimal_matrix(&self) -> Array2<f64>;

    fn frequencies(&self) -> ArrayView1<'_, f64>;

    fn eigen_decomposition(&self) -> Result<EigenDecomposition, SubstModelError>;

    fn transition_probabilities(&self, distance: f64) -> Result<Array2<f64>, SubstModelError> {
        Ok(self.eigen_decomposition()?.transition_probabilities(distance))
    }

    /// Monotone counter bumped by every parameter change.
    fn version(&self) -> u64;
}

/// Enumerates the off-diagonal generator entries that carry a free rate.
///
/// The upper triangle comes first in row-major order. Asymmetric models continue
/// with the lower triangle in column-major order, so entry `k` of the upper block
/// and entry `k` of the lower block are transposes of each other.
pub fn rate_entries(state_count: usize, symmetric: bool) -> Vec<(usize, usize)> {
    let upper = (0..state_count).tuple_combinations::<(usize, usize)>();
    if symmetric {
        upper.collect()
    } else {
        upper
            .clone()
            .chain(upper.map(|(col, row)| (row, col)))
            .collect()
    }
}

pub fn rate_count(state_count: usize, symmetric: bool) -> usize {
    let upper = state_count * state_count.saturating_sub(1) / 2;
    if symmetric { upper } else { 2 * upper }
}
