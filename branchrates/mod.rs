//! Branch-rate models: the per-branch multiplier turning a branch length into an
//! expected number of substitutions.

use crate::tree::Tree;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BranchRateError {
    #[error("Expected {expected} branch-rate parameters, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Branch rate parameter {index} is invalid: {value}")]
    InvalidRate { index: usize, value: f64 },

    #[error("Invalid rate transform: {0}")]
    InvalidTransform(String),
}

pub trait BranchRateModel {
    fn branch_rate(&self, tree: &Tree, node: usize) -> f64;

    /// Derivative of the branch rate with respect to the parameter the node maps to.
    fn branch_rate_differential(&self, tree: &Tree, node: usize) -> f64;

    fn branch_rate_second_differential(&self, tree: &Tree, node: usize) -> f64;

    /// Parameter index a non-root node's rate depends on; `None` at the root.
    fn parameter_index_from_node(&self, tree: &Tree, node: usize) -> Option<usize>;

    fn parameter_count(&self) -> usize;

    fn parameters(&self) -> ArrayView1<'_, f64>;

    fn set_parameters(&mut self, values: ArrayView1<f64>) -> Result<(), BranchRateError>;

    fn version(&self) -> u64;
}

/// One rate shared by every branch.
#[derive(Debug, Clone)]
pub struct StrictClock {
    rate: Array1<f64>,
    version: u64,
}

impl StrictClock {
    pub fn new(rate: f64) -> Result<Self, BranchRateError> {
        check_rate(0, rate)?;
        Ok(Self {
            rate: Array1::from_elem(1, rate),
            version: 0,
        })
    }
}

impl BranchRateModel for StrictClock {
    fn branch_rate(&self, _tree: &Tree, _node: usize) -> f64 {
        self.rate[0]
    }

    fn branch_rate_differential(&self, _tree: &Tree, _node: usize) -> f64 {
        1.0
    }

    fn branch_rate_second_differential(&self, _tree: &Tree, _node: usize) -> f64 {
        0.0
    }

    fn parameter_index_from_node(&self, tree: &Tree, node: usize) -> Option<usize> {
        (!tree.is_root(node)).then_some(0)
    }

    fn parameter_count(&self) -> usize {
        1
    }

    fn parameters(&self) -> ArrayView1<'_, f64> {
        self.rate.view()
    }

    fn set_parameters(&mut self, values: ArrayView1<f64>) -> Result<(), BranchRateError> {
        if values.len() != 1 {
            return Err(BranchRateError::DimensionMismatch {
                expected: 1,
                found: values.len(),
            });
        }
        check_rate(0, values[0])?;
        self.rate[0] = values[0];
        self.version += 1;
        Ok(())
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Maps a real-valued parameter onto a branch rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RateTransform {
    Identity,
    /// `rate = location · exp(scale · x)`.
    LocationScaleLogNormal { location: f64, scale: f64 },
}

impl RateTransform {
    pub fn rate(&self, x: f64) -> f64 {
        match *self {
            RateTransform::Identity => x,
            RateTransform::LocationScaleLogNormal { location, scale } => location * (scale * x).exp(),
        }
    }

    pub fn differential(&self, x: f64) -> f64 {
        match *self {
            RateTransform::Identity => 1.0,
            RateTransform::LocationScaleLogNormal { scale, .. } => scale * self.rate(x),
        }
    }

    pub fn second_differential(&self, x: f64) -> f64 {
        match *self {
            RateTransform::Identity => 0.0,
            RateTransform::LocationScaleLogNormal { scale, .. } => scale * scale * self.rate(x),
        }
    }

    fn validate(&self) -> Result<(), BranchRateError> {
        if let RateTransform::LocationScaleLogNormal { location, scale } = *self {
            if !(location.is_finite() && location > 0.0 && scale.is_finite()) {
                return Err(BranchRateError::InvalidTransform(format!(
                    "location {location} and scale {scale} must be finite with a positive location"
                )));
            }
        }
        Ok(())
    }
}

/// One parameter per branch. Nodes above the root shift down by one so the
/// parameter vector has no slot for the root.
#[derive(Debug, Clone)]
pub struct ArbitraryBranchRates {
    values: Array1<f64>,
    transform: RateTransform,
    version: u64,
}

impl ArbitraryBranchRates {
    pub fn new(
        tree: &Tree,
        values: Array1<f64>,
        transform: RateTransform,
    ) -> Result<Self, BranchRateError> {
        transform.validate()?;
        let expected = tree.node_count() - 1;
        if values.len() != expected {
            return Err(BranchRateError::DimensionMismatch {
                expected,
                found: values.len(),
            });
        }
        let model = Self {
            values,
            transform,
            version: 0,
        };
        model.check_values(model.values.view())?;
        Ok(model)
    }

    /// Every branch at `rate`, expressed in the transform's parameter space.
    pub fn uniform(tree: &Tree, rate: f64, transform: RateTransform) -> Result<Self, BranchRateError> {
        let x = match transform {
            RateTransform::Identity => rate,
            RateTransform::LocationScaleLogNormal { location, scale } => (rate / location).ln() / scale,
        };
        Self::new(tree, Array1::from_elem(tree.node_count() - 1, x), transform)
    }

    pub fn transform(&self) -> RateTransform {
        self.transform
    }

    fn value_at(&self, tree: &Tree, node: usize) -> f64 {
        match self.parameter_index_from_node(tree, node) {
            Some(index) => self.values[index],
            None => 0.0,
        }
    }

    fn check_values(&self, values: ArrayView1<f64>) -> Result<(), BranchRateError> {
        for (index, &value) in values.iter().enumerate() {
            let rate = self.transform.rate(value);
            if !value.is_finite() || !(rate.is_finite() && rate >= 0.0) {
                return Err(BranchRateError::InvalidRate { index, value });
            }
        }
        Ok(())
    }
}

impl BranchRateModel for ArbitraryBranchRates {
    fn branch_rate(&self, tree: &Tree, node: usize) -> f64 {
        if tree.is_root(node) {
            return 1.0;
        }
        self.transform.rate(self.value_at(tree, node))
    }

    fn branch_rate_differential(&self, tree: &Tree, node: usize) -> f64 {
        if tree.is_root(node) {
            return 0.0;
        }
        self.transform.differential(self.value_at(tree, node))
    }

    fn branch_rate_second_differential(&self, tree: &Tree, node: usize) -> f64 {
        if tree.is_root(node) {
            return 0.0;
        }
        self.transform.second_differential(self.value_at(tree, node))
    }

    fn parameter_index_from_node(&self, tree: &Tree, node: usize) -> Option<usize> {
        let root = tree.root();
        match node.cmp(&root) {
            std::cmp::Ordering::Less => Some(node),
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => Some(node - 1),
        }
    }

    fn parameter_count(&self) -> usize {
        self.values.len()
    }

    fn parameters(&self) -> ArrayView1<'_, f64> {
        self.values.view()
    }

    fn set_parameters(&mut self, values: ArrayView1<f64>) -> Result<(), BranchRateError> {
        if values.len() != self.values.len() {
            return Err(BranchRateError::DimensionMismatch {
                expected: self.values.len(),
                found: values.len(),
            });
        }
        self.check_values(values)?;
        self.values.assign(&values);
        self.version += 1;
        Ok(())
    }

    fn version(&self) -> u64 {
        self.version
    }
}

fn check_rate(index: usize, value: f64) -> Result<(), BranchRateError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(BranchRateError::InvalidRate { index, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn strict_clock_maps_every_branch_to_one_parameter() {
        let tree = Tree::balanced(4, 1.0).unwrap();
        let clock = StrictClock::new(0.7).unwrap();
        for node in 0..tree.node_count() {
            let expected = if tree.is_root(node) { None } else { Some(0) };
            assert_eq!(clock.parameter_index_from_node(&tree, node), expected);
        }
        assert_eq!(clock.branch_rate(&tree, 2), 0.7);
        assert!(StrictClock::new(-1.0).is_err());
    }

    #[test]
    fn arbitrary_rates_skip_the_root_slot() {
        // Root of a caterpillar is the last node, so use a tree whose root is not.
        let tree = Tree::from_parents(
            vec![Some(3), Some(4), Some(4), None, Some(3)],
            vec![0.0, 0.0, 0.0, 2.0, 1.0],
            vec!["a".into(), "b".into(), "c".into()],
        )
        .unwrap();
        let rates = ArbitraryBranchRates::new(
            &tree,
            array![1.0, 2.0, 3.0, 4.0],
            RateTransform::Identity,
        )
        .unwrap();
        assert_eq!(rates.parameter_index_from_node(&tree, 2), Some(2));
        assert_eq!(rates.parameter_index_from_node(&tree, 3), None);
        assert_eq!(rates.parameter_index_from_node(&tree, 4), Some(3));
        assert_eq!(rates.branch_rate(&tree, 4), 4.0);
    }

    #[test]
    fn log_normal_differentials_match_finite_differences() {
        let transform = RateTransform::LocationScaleLogNormal {
            location: 0.8,
            scale: 0.4,
        };
        let x = 0.3;
        let h = 1e-5;
        let fd = (transform.rate(x + h) - transform.rate(x - h)) / (2.0 * h);
        assert_relative_eq!(transform.differential(x), fd, max_relative = 1e-8);
        let fd2 = (transform.differential(x + h) - transform.differential(x - h)) / (2.0 * h);
        assert_relative_eq!(transform.second_differential(x), fd2, max_relative = 1e-8);
    }

    #[test]
    fn uniform_rates_invert_the_transform() {
        let tree = Tree::balanced(4, 1.0).unwrap();
        let transform = RateTransform::LocationScaleLogNormal {
            location: 2.0,
            scale: 0.5,
        };
        let rates = ArbitraryBranchRates::uniform(&tree, 1.5, transform).unwrap();
        assert_relative_eq!(rates.branch_rate(&tree, 0), 1.5, max_relative = 1e-12);
    }

    #[test]
    fn setters_validate_and_bump_version() {
        let tree = Tree::balanced(2, 1.0).unwrap();
        let mut rates =
            ArbitraryBranchRates::new(&tree, array![1.0, 1.0], RateTransform::Identity).unwrap();
        assert!(rates.set_parameters(array![1.0].view()).is_err());
        assert!(rates.set_parameters(array![1.0, -2.0].view()).is_err());
        rates.set_parameters(array![0.5, 2.0].view()).unwrap();
        assert_eq!(rates.version(), 1);
    }
}
