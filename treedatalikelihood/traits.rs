//! Derived tree traits cached against the likelihood state.

use super::StateKey;
use crate::engine::DifferentialKind;
use ahash::AHashMap;
use std::any::Any;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeTraitKey {
    CrossProducts(DifferentialKind),
    BranchRateGradient,
    BranchRateHessian,
    NodeHeightGradient,
    NodeHeightHessian,
}

impl fmt::Display for TreeTraitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TreeTraitKey::CrossProducts(DifferentialKind::FirstOrder) => {
                "BranchSubstitutionGradient:crossProducts"
            }
            TreeTraitKey::CrossProducts(DifferentialKind::Exact) => {
                "BranchSubstitutionGradient:exactCrossProducts"
            }
            TreeTraitKey::BranchRateGradient => "BranchRateGradient",
            TreeTraitKey::BranchRateHessian => "BranchRateHessian",
            TreeTraitKey::NodeHeightGradient => "NodeHeightGradient",
            TreeTraitKey::NodeHeightHessian => "NodeHeightHessian",
        };
        f.write_str(name)
    }
}

/// Values computed for one [`StateKey`]. Inserting under a different key drops
/// everything stored for the previous one.
#[derive(Default)]
pub struct TreeTraitCache {
    state: Option<StateKey>,
    entries: AHashMap<TreeTraitKey, Rc<dyn Any>>,
}

impl TreeTraitCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: Any>(&self, key: TreeTraitKey, state: &StateKey) -> Option<Rc<T>> {
        if self.state.as_ref() != Some(state) {
            return None;
        }
        let entry = Rc::clone(self.entries.get(&key)?);
        entry.downcast::<T>().ok()
    }

    pub fn insert<T: Any>(&mut self, key: TreeTraitKey, state: &StateKey, value: T) -> Rc<T> {
        if self.state.as_ref() != Some(state) {
            self.entries.clear();
            self.state = Some(state.clone());
        }
        let value = Rc::new(value);
        self.entries.insert(key, Rc::clone(&value) as Rc<dyn Any>);
        log::debug!("Cached tree trait {key}");
        value
    }

    pub fn contains(&self, key: TreeTraitKey, state: &StateKey) -> bool {
        self.state.as_ref() == Some(state) && self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.state = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(tree: u64) -> StateKey {
        StateKey {
            tree,
            models: vec![0],
            branch_model: 0,
            branch_rates: 0,
            site_model: 0,
        }
    }

    #[test]
    fn entries_are_typed_and_scoped_to_one_state() {
        let mut cache = TreeTraitCache::new();
        let s0 = state(0);
        cache.insert(TreeTraitKey::NodeHeightGradient, &s0, vec![1.0, 2.0]);
        let hit: Rc<Vec<f64>> = cache.get(TreeTraitKey::NodeHeightGradient, &s0).unwrap();
        assert_eq!(*hit, vec![1.0, 2.0]);
        assert!(cache.get::<String>(TreeTraitKey::NodeHeightGradient, &s0).is_none());
        assert!(cache.get::<Vec<f64>>(TreeTraitKey::NodeHeightGradient, &state(1)).is_none());

        cache.insert(TreeTraitKey::BranchRateGradient, &state(1), 3.0_f64);
        assert_eq!(cache.len(), 1);
        assert!(!cache.contains(TreeTraitKey::NodeHeightGradient, &state(1)));
    }

    #[test]
    fn display_uses_reporting_names() {
        assert_eq!(
            TreeTraitKey::CrossProducts(DifferentialKind::FirstOrder).to_string(),
            "BranchSubstitutionGradient:crossProducts"
        );
        assert_eq!(TreeTraitKey::NodeHeightHessian.to_string(), "NodeHeightHessian");
    }
}
