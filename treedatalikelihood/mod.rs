//! The likelihood context.
//!
//! [`TreeDataLikelihood`] owns everything the log-likelihood depends on: the tree,
//! the substitution models and their branch assignment, the branch-rate and
//! site-rate models, the compressed patterns, and the engine holding partials.
//! Each component carries a version counter; the context folds them into a
//! [`StateKey`] and recomputes partials or derived traits only when the key moves.

pub mod branch_rate;
pub mod cross_product;
pub mod differentials;
pub mod node_height;
pub mod traits;

pub use branch_rate::BranchRateGradient;
pub use cross_product::{CrossProducts, SubstitutionModelCrossProductDelegate};
pub use node_height::NodeHeightGradient;
pub use traits::{TreeTraitCache, TreeTraitKey};

use crate::alignment::SitePatterns;
use crate::branchrates::{BranchRateError, BranchRateModel};
use crate::engine::{CpuLikelihoodEngine, EngineError, LikelihoodEngine, PartialsUpdate};
use crate::substmodel::{GlmSubstitutionModel, SiteRateModel, SubstModelError, SubstitutionModel};
use crate::tree::{Tree, TreeError};
use ndarray::ArrayView1;
use std::any::Any;
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LikelihoodError {
    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Substitution model error: {0}")]
    Model(#[from] SubstModelError),

    #[error("Likelihood engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Branch rate model error: {0}")]
    BranchRate(#[from] BranchRateError),

    #[error("Dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Substitution model {model} does not exist; {model_count} models are defined")]
    UnknownModel { model: usize, model_count: usize },

    #[error("The log-likelihood is not finite: {0}")]
    NonFiniteLikelihood(f64),
}

/// Which substitution model each branch evolves under.
#[derive(Debug, Clone)]
pub struct BranchModel {
    assignments: Vec<usize>,
    model_count: usize,
    version: u64,
}

impl BranchModel {
    /// Every branch under model 0.
    pub fn homogeneous(node_count: usize) -> Self {
        Self {
            assignments: vec![0; node_count],
            model_count: 1,
            version: 0,
        }
    }

    pub fn new(assignments: Vec<usize>, model_count: usize) -> Result<Self, LikelihoodError> {
        if let Some(&model) = assignments.iter().find(|&&m| m >= model_count) {
            return Err(LikelihoodError::UnknownModel { model, model_count });
        }
        Ok(Self {
            assignments,
            model_count,
            version: 0,
        })
    }

    pub fn model_for(&self, node: usize) -> usize {
        self.assignments[node]
    }

    pub fn assignments(&self) -> &[usize] {
        &self.assignments
    }

    pub fn model_count(&self) -> usize {
        self.model_count
    }

    pub fn set_model(&mut self, node: usize, model: usize) -> Result<(), LikelihoodError> {
        if model >= self.model_count {
            return Err(LikelihoodError::UnknownModel {
                model,
                model_count: self.model_count,
            });
        }
        if node >= self.assignments.len() {
            return Err(TreeError::NodeOutOfRange {
                node,
                node_count: self.assignments.len(),
            }
            .into());
        }
        self.assignments[node] = model;
        self.version += 1;
        Ok(())
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Snapshot of every version counter the partials depend on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    tree: u64,
    models: Vec<u64>,
    branch_model: u64,
    branch_rates: u64,
    site_model: u64,
}

pub struct TreeDataLikelihood {
    tree: Tree,
    models: Vec<GlmSubstitutionModel>,
    branch_model: BranchModel,
    branch_rates: Box<dyn BranchRateModel>,
    site_model: SiteRateModel,
    patterns: SitePatterns,
    engine: Box<dyn LikelihoodEngine>,
    traits: TreeTraitCache,
    computed: Option<StateKey>,
}

impl TreeDataLikelihood {
    /// A context on the CPU reference engine.
    pub fn new(
        tree: Tree,
        models: Vec<GlmSubstitutionModel>,
        branch_model: BranchModel,
        branch_rates: Box<dyn BranchRateModel>,
        site_model: SiteRateModel,
        patterns: SitePatterns,
    ) -> Result<Self, LikelihoodError> {
        let engine = Box::new(CpuLikelihoodEngine::new(&patterns));
        Self::with_engine(tree, models, branch_model, branch_rates, site_model, patterns, engine)
    }

    pub fn with_engine(
        tree: Tree,
        models: Vec<GlmSubstitutionModel>,
        branch_model: BranchModel,
        branch_rates: Box<dyn BranchRateModel>,
        site_model: SiteRateModel,
        patterns: SitePatterns,
        engine: Box<dyn LikelihoodEngine>,
    ) -> Result<Self, LikelihoodError> {
        if models.is_empty() || branch_model.model_count() != models.len() {
            return Err(LikelihoodError::DimensionMismatch {
                what: "substitution models",
                expected: branch_model.model_count(),
                found: models.len(),
            });
        }
        if branch_model.assignments().len() != tree.node_count() {
            return Err(LikelihoodError::DimensionMismatch {
                what: "branch model assignments",
                expected: tree.node_count(),
                found: branch_model.assignments().len(),
            });
        }
        if patterns.tip_count() != tree.external_node_count() {
            return Err(LikelihoodError::DimensionMismatch {
                what: "tips with data",
                expected: tree.external_node_count(),
                found: patterns.tip_count(),
            });
        }
        let state_count = engine.state_count();
        if let Some(model) = models.iter().find(|m| m.state_count() != state_count) {
            return Err(LikelihoodError::DimensionMismatch {
                what: "generator states",
                expected: state_count,
                found: model.state_count(),
            });
        }
        Ok(Self {
            tree,
            models,
            branch_model,
            branch_rates,
            site_model,
            patterns,
            engine,
            traits: TreeTraitCache::new(),
            computed: None,
        })
    }

    pub fn state_key(&self) -> StateKey {
        StateKey {
            tree: self.tree.version(),
            models: self.models.iter().map(|m| m.version()).collect(),
            branch_model: self.branch_model.version(),
            branch_rates: self.branch_rates.version(),
            site_model: self.site_model.version(),
        }
    }

    /// Brings the engine's partials up to date; returns the log-likelihood.
    pub fn ensure_partials(&mut self) -> Result<f64, LikelihoodError> {
        let key = self.state_key();
        if self.computed.as_ref() == Some(&key) {
            return Ok(self.engine.log_likelihood()?);
        }
        self.computed = None;
        let eigen_systems = self
            .models
            .iter()
            .map(|m| m.eigen_decomposition())
            .collect::<Result<Vec<_>, _>>()?;
        let distances = self.distances();
        let root_frequencies = self.models[0].frequencies();
        let log_likelihood = self.engine.compute_partials(&PartialsUpdate {
            tree: &self.tree,
            eigen_systems: &eigen_systems,
            branch_models: self.branch_model.assignments(),
            distances: &distances,
            root_frequencies,
            category_rates: self.site_model.category_rates(),
            category_weights: self.site_model.category_weights(),
        })?;
        log::debug!("Recomputed partials: log-likelihood {log_likelihood:.6}");
        self.computed = Some(key);
        Ok(log_likelihood)
    }

    pub fn log_likelihood(&mut self) -> Result<f64, LikelihoodError> {
        self.ensure_partials()
    }

    /// `branchRate × branchLength` per node; zero at the root.
    pub fn distances(&self) -> Vec<f64> {
        (0..self.tree.node_count())
            .map(|node| {
                if self.tree.is_root(node) {
                    0.0
                } else {
                    self.branch_rates.branch_rate(&self.tree, node) * self.tree.branch_length(node)
                }
            })
            .collect()
    }

    /// Stationary distribution used at the root.
    pub fn root_frequencies(&self) -> ArrayView1<'_, f64> {
        self.models[0].frequencies()
    }

    /// Non-root nodes in index order.
    pub fn branch_nodes(&self) -> Vec<usize> {
        (0..self.tree.node_count())
            .filter(|&node| !self.tree.is_root(node))
            .collect()
    }

    /// Looks a derived trait up for the current state, computing and storing it on a
    /// miss.
    pub fn cached_trait<T, E, F>(&mut self, key: TreeTraitKey, compute: F) -> Result<Rc<T>, E>
    where
        T: Any,
        E: From<LikelihoodError>,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        self.ensure_partials()?;
        let state = self.state_key();
        if let Some(hit) = self.traits.get::<T>(key, &state) {
            return Ok(hit);
        }
        let value = compute(self)?;
        Ok(self.traits.insert(key, &state, value))
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    pub fn models(&self) -> &[GlmSubstitutionModel] {
        &self.models
    }

    pub fn model(&self, index: usize) -> Result<&GlmSubstitutionModel, LikelihoodError> {
        let model_count = self.models.len();
        self.models.get(index).ok_or(LikelihoodError::UnknownModel {
            model: index,
            model_count,
        })
    }

    pub fn model_mut(&mut self, index: usize) -> Result<&mut GlmSubstitutionModel, LikelihoodError> {
        let model_count = self.models.len();
        self.models.get_mut(index).ok_or(LikelihoodError::UnknownModel {
            model: index,
            model_count,
        })
    }

    pub fn branch_model(&self) -> &BranchModel {
        &self.branch_model
    }

    pub fn branch_model_mut(&mut self) -> &mut BranchModel {
        &mut self.branch_model
    }

    pub fn branch_rates(&self) -> &dyn BranchRateModel {
        self.branch_rates.as_ref()
    }

    pub fn branch_rates_mut(&mut self) -> &mut dyn BranchRateModel {
        self.branch_rates.as_mut()
    }

    pub fn site_model(&self) -> &SiteRateModel {
        &self.site_model
    }

    pub fn site_model_mut(&mut self) -> &mut SiteRateModel {
        &mut self.site_model
    }

    pub fn patterns(&self) -> &SitePatterns {
        &self.patterns
    }

    pub fn engine(&self) -> &dyn LikelihoodEngine {
        self.engine.as_ref()
    }

    pub fn trait_cache(&self) -> &TreeTraitCache {
        &self.traits
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::likelihood;
    use super::*;
    use ndarray::array;

    #[test]
    fn partials_are_reused_until_a_version_moves() {
        let mut lik = likelihood();
        let first = lik.log_likelihood().unwrap();
        let key = lik.state_key();
        assert_eq!(lik.log_likelihood().unwrap(), first);
        assert_eq!(lik.state_key(), key);

        lik.model_mut(0)
            .unwrap()
            .set_coefficients(0, array![0.0, 0.0, 0.0, 0.0, 0.0, 0.0].view())
            .unwrap();
        assert_ne!(lik.state_key(), key);
        let second = lik.log_likelihood().unwrap();
        assert!(second.is_finite());
        assert_ne!(second, first);
    }

    #[test]
    fn branch_rate_scales_distances() {
        let lik = likelihood();
        let distances = lik.distances();
        let tree = lik.tree();
        assert_eq!(distances[tree.root()], 0.0);
        assert!((distances[0] - 1.3 * 0.15).abs() < 1e-12);
    }

    #[test]
    fn rejects_mismatched_model_map() {
        let lik = likelihood();
        let result = BranchModel::new(vec![0, 1, 0], 1);
        assert!(matches!(result, Err(LikelihoodError::UnknownModel { model: 1, .. })));
        assert_eq!(lik.branch_model().model_count(), 1);
    }
}
