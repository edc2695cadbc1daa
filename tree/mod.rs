//! Rooted trees stored as parent-index arrays.
//!
//! Tips occupy indices `0..tip_count` and internal nodes `tip_count..node_count`.
//! Heights are measured backwards in time, so every node sits at or below its
//! parent. Any height change bumps [`Tree::version`]; topology changes also bump
//! [`Tree::topology_version`]. Caches elsewhere in the crate compare these counters
//! instead of registering listeners.

pub mod newick;

use thiserror::Error;

/// Relative slack allowed when checking that a node does not rise above its parent.
const HEIGHT_TOLERANCE: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TreeError {
    #[error("A tree needs at least two tips, found {0}")]
    TooFewTips(usize),

    #[error("Node {node} is out of range for a tree with {node_count} nodes")]
    NodeOutOfRange { node: usize, node_count: usize },

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Node {node} at height {height} would sit above its parent at {parent_height}")]
    HeightAboveParent {
        node: usize,
        height: f64,
        parent_height: f64,
    },

    #[error("Node {node} at height {height} would sit below its child {child} at {child_height}")]
    HeightBelowChild {
        node: usize,
        height: f64,
        child: usize,
        child_height: f64,
    },

    #[error("Node height must be finite, got {0}")]
    NonFiniteHeight(f64),

    #[error("Tip heights are fixed; cannot move tip {0}")]
    TipHeightFixed(usize),

    #[error("Unknown taxon '{0}'")]
    UnknownTaxon(String),

    #[error("Newick parse error at byte {position}: {message}")]
    Newick { position: usize, message: String },
}

#[derive(Debug, Clone)]
pub struct Tree {
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    heights: Vec<f64>,
    tip_names: Vec<String>,
    root: usize,
    version: u64,
    topology_version: u64,
}

impl Tree {
    /// Builds a tree from a parent array. `parents[v]` is `None` only for the root.
    pub fn from_parents(
        parents: Vec<Option<usize>>,
        heights: Vec<f64>,
        tip_names: Vec<String>,
    ) -> Result<Self, TreeError> {
        let node_count = parents.len();
        let tip_count = tip_names.len();
        if tip_count < 2 {
            return Err(TreeError::TooFewTips(tip_count));
        }
        if heights.len() != node_count {
            return Err(TreeError::InvalidTopology(format!(
                "{} heights supplied for {} nodes",
                heights.len(),
                node_count
            )));
        }
        if node_count <= tip_count {
            return Err(TreeError::InvalidTopology(
                "a tree needs at least one internal node".to_string(),
            ));
        }

        let mut root = None;
        let mut children = vec![Vec::new(); node_count];
        for (node, parent) in parents.iter().enumerate() {
            match *parent {
                Some(p) if p >= node_count => {
                    return Err(TreeError::NodeOutOfRange { node: p, node_count });
                }
                Some(p) if p < tip_count => {
                    return Err(TreeError::InvalidTopology(format!(
                        "tip {p} cannot be the parent of node {node}"
                    )));
                }
                Some(p) if p == node => {
                    return Err(TreeError::InvalidTopology(format!(
                        "node {node} is its own parent"
                    )));
                }
                Some(p) => children[p].push(node),
                None if root.is_some() => {
                    return Err(TreeError::InvalidTopology(
                        "more than one node without a parent".to_string(),
                    ));
                }
                None => root = Some(node),
            }
        }
        let root =
            root.ok_or_else(|| TreeError::InvalidTopology("no root node".to_string()))?;
        if root < tip_count {
            return Err(TreeError::InvalidTopology(format!(
                "tip {root} cannot be the root"
            )));
        }
        for (node, kids) in children.iter().enumerate().skip(tip_count) {
            if kids.is_empty() {
                return Err(TreeError::InvalidTopology(format!(
                    "internal node {node} has no children"
                )));
            }
        }

        let tree = Self {
            parents,
            children,
            heights,
            tip_names,
            root,
            version: 0,
            topology_version: 0,
        };

        // Every node must be reachable from the root exactly once.
        let order = tree.pre_order();
        if order.len() != node_count {
            return Err(TreeError::InvalidTopology(format!(
                "{} of {} nodes are reachable from the root",
                order.len(),
                node_count
            )));
        }
        for &node in &order {
            let height = tree.heights[node];
            if !height.is_finite() {
                return Err(TreeError::NonFiniteHeight(height));
            }
            if let Some(parent) = tree.parents[node] {
                let parent_height = tree.heights[parent];
                if height > parent_height + HEIGHT_TOLERANCE * parent_height.abs().max(1.0) {
                    return Err(TreeError::HeightAboveParent {
                        node,
                        height,
                        parent_height,
                    });
                }
            }
        }
        Ok(tree)
    }

    /// Balanced ultrametric tree. Tips are merged pairwise level by level; with a
    /// power-of-two tip count every branch has length `branch_length`.
    pub fn balanced(tip_count: usize, branch_length: f64) -> Result<Self, TreeError> {
        if tip_count < 2 {
            return Err(TreeError::TooFewTips(tip_count));
        }
        let node_count = 2 * tip_count - 1;
        let mut parents = vec![None; node_count];
        let mut heights = vec![0.0_f64; node_count];
        let mut level: Vec<usize> = (0..tip_count).collect();
        let mut next = tip_count;
        while level.len() > 1 {
            let mut merged = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                if let [left, right] = *pair {
                    parents[left] = Some(next);
                    parents[right] = Some(next);
                    heights[next] = heights[left].max(heights[right]) + branch_length;
                    merged.push(next);
                    next += 1;
                } else {
                    merged.push(pair[0]);
                }
            }
            level = merged;
        }
        Self::from_parents(parents, heights, default_tip_names(tip_count))
    }

    /// Caterpillar (ladder) tree: internal node `tip_count + k` joins the clade below
    /// it with tip `k + 1`; the last internal node is the root.
    pub fn caterpillar(tip_heights: &[f64], internal_heights: &[f64]) -> Result<Self, TreeError> {
        let tip_count = tip_heights.len();
        if tip_count < 2 {
            return Err(TreeError::TooFewTips(tip_count));
        }
        if internal_heights.len() != tip_count - 1 {
            return Err(TreeError::InvalidTopology(format!(
                "a caterpillar on {} tips needs {} internal heights, got {}",
                tip_count,
                tip_count - 1,
                internal_heights.len()
            )));
        }
        let node_count = 2 * tip_count - 1;
        let mut parents = vec![None; node_count];
        let mut below = 0;
        for k in 0..tip_count - 1 {
            let node = tip_count + k;
            parents[below] = Some(node);
            parents[k + 1] = Some(node);
            below = node;
        }
        let heights = tip_heights
            .iter()
            .chain(internal_heights.iter())
            .copied()
            .collect();
        Self::from_parents(parents, heights, default_tip_names(tip_count))
    }

    pub fn node_count(&self) -> usize {
        self.parents.len()
    }

    pub fn external_node_count(&self) -> usize {
        self.tip_names.len()
    }

    pub fn internal_node_count(&self) -> usize {
        self.node_count() - self.external_node_count()
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn is_root(&self, node: usize) -> bool {
        node == self.root
    }

    pub fn is_external(&self, node: usize) -> bool {
        node < self.external_node_count()
    }

    pub fn parent(&self, node: usize) -> Option<usize> {
        self.parents[node]
    }

    pub fn children(&self, node: usize) -> &[usize] {
        &self.children[node]
    }

    pub fn child_count(&self, node: usize) -> usize {
        self.children[node].len()
    }

    pub fn child(&self, node: usize, index: usize) -> usize {
        self.children[node][index]
    }

    pub fn node_height(&self, node: usize) -> f64 {
        self.heights[node]
    }

    pub fn heights(&self) -> &[f64] {
        &self.heights
    }

    /// Parent height minus own height; zero at the root.
    pub fn branch_length(&self, node: usize) -> f64 {
        match self.parents[node] {
            Some(parent) => self.heights[parent] - self.heights[node],
            None => 0.0,
        }
    }

    pub fn tip_name(&self, tip: usize) -> &str {
        &self.tip_names[tip]
    }

    pub fn tip_names(&self) -> &[String] {
        &self.tip_names
    }

    pub fn tip_index(&self, name: &str) -> Result<usize, TreeError> {
        self.tip_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| TreeError::UnknownTaxon(name.to_string()))
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn topology_version(&self) -> u64 {
        self.topology_version
    }

    /// Moves an internal node and fires a tree-changed event. The new height must
    /// stay between the node's oldest child and its parent.
    pub fn set_node_height(&mut self, node: usize, height: f64) -> Result<(), TreeError> {
        self.check_node(node)?;
        if self.is_external(node) {
            return Err(TreeError::TipHeightFixed(node));
        }
        if !height.is_finite() {
            return Err(TreeError::NonFiniteHeight(height));
        }
        if let Some(parent) = self.parents[node] {
            let parent_height = self.heights[parent];
            if height > parent_height {
                return Err(TreeError::HeightAboveParent {
                    node,
                    height,
                    parent_height,
                });
            }
        }
        for &child in &self.children[node] {
            let child_height = self.heights[child];
            if height < child_height {
                return Err(TreeError::HeightBelowChild {
                    node,
                    height,
                    child,
                    child_height,
                });
            }
        }
        self.heights[node] = height;
        self.push_tree_changed();
        Ok(())
    }

    /// Sets a height without ordering checks and without firing an event; callers
    /// moving several nodes at once finish with [`Tree::push_tree_changed`].
    pub fn set_node_height_quietly(&mut self, node: usize, height: f64) -> Result<(), TreeError> {
        self.check_node(node)?;
        if self.is_external(node) {
            return Err(TreeError::TipHeightFixed(node));
        }
        if !height.is_finite() {
            return Err(TreeError::NonFiniteHeight(height));
        }
        self.heights[node] = height;
        Ok(())
    }

    pub fn push_tree_changed(&mut self) {
        self.version += 1;
    }

    /// Replaces every internal height at once (ordered by internal node index) and
    /// fires one event. On an ordering violation the old heights are kept.
    pub fn set_internal_heights(&mut self, heights: &[f64]) -> Result<(), TreeError> {
        let tip_count = self.external_node_count();
        if heights.len() != self.internal_node_count() {
            return Err(TreeError::InvalidTopology(format!(
                "{} heights supplied for {} internal nodes",
                heights.len(),
                self.internal_node_count()
            )));
        }
        let mut proposed = self.heights.clone();
        proposed[tip_count..].copy_from_slice(heights);
        for (node, &height) in proposed.iter().enumerate() {
            if !height.is_finite() {
                return Err(TreeError::NonFiniteHeight(height));
            }
            if let Some(parent) = self.parents[node] {
                if height > proposed[parent] {
                    return Err(TreeError::HeightAboveParent {
                        node,
                        height,
                        parent_height: proposed[parent],
                    });
                }
            }
        }
        self.heights = proposed;
        self.push_tree_changed();
        Ok(())
    }

    /// Swaps the subtrees under two nodes that share no ancestry, keeping heights.
    pub fn exchange_subtrees(&mut self, a: usize, b: usize) -> Result<(), TreeError> {
        self.check_node(a)?;
        self.check_node(b)?;
        let (pa, pb) = match (self.parents[a], self.parents[b]) {
            (Some(pa), Some(pb)) => (pa, pb),
            _ => {
                return Err(TreeError::InvalidTopology(
                    "cannot exchange the root".to_string(),
                ));
            }
        };
        if self.is_ancestor(a, b) || self.is_ancestor(b, a) {
            return Err(TreeError::InvalidTopology(format!(
                "nodes {a} and {b} are on the same lineage"
            )));
        }
        if self.heights[a] > self.heights[pb] || self.heights[b] > self.heights[pa] {
            return Err(TreeError::InvalidTopology(format!(
                "exchanging {a} and {b} would break height ordering"
            )));
        }
        if pa == pb {
            return Ok(());
        }
        self.children[pa].retain(|&c| c != a);
        self.children[pb].retain(|&c| c != b);
        self.children[pa].push(b);
        self.children[pb].push(a);
        self.parents[a] = Some(pb);
        self.parents[b] = Some(pa);
        self.topology_version += 1;
        self.push_tree_changed();
        Ok(())
    }

    pub fn is_ancestor(&self, ancestor: usize, node: usize) -> bool {
        let mut current = self.parents[node];
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.parents[p];
        }
        false
    }

    /// Children before parents, root last.
    pub fn post_order(&self) -> Vec<usize> {
        let mut order = self.pre_order_reversed_children();
        order.reverse();
        order
    }

    /// Parents before children, root first, children in stored order.
    pub fn pre_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.node_count());
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(self.children[node].iter().rev());
        }
        order
    }

    /// Internal nodes in post-order.
    pub fn internal_post_order(&self) -> Vec<usize> {
        self.post_order()
            .into_iter()
            .filter(|&n| !self.is_external(n))
            .collect()
    }

    fn pre_order_reversed_children(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.node_count());
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(self.children[node].iter());
        }
        order
    }

    fn check_node(&self, node: usize) -> Result<(), TreeError> {
        if node >= self.node_count() {
            return Err(TreeError::NodeOutOfRange {
                node,
                node_count: self.node_count(),
            });
        }
        Ok(())
    }
}

fn default_tip_names(tip_count: usize) -> Vec<String> {
    (0..tip_count).map(|i| format!("t{i}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_tip_tree() -> Tree {
        // ((t0,t1)4,(t2,t3)5)6
        Tree::from_parents(
            vec![Some(4), Some(4), Some(5), Some(5), Some(6), Some(6), None],
            vec![0.0, 0.0, 0.0, 0.0, 0.1, 0.2, 0.5],
            default_tip_names(4),
        )
        .unwrap()
    }

    #[test]
    fn post_order_visits_children_before_parents() {
        let tree = four_tip_tree();
        let order = tree.post_order();
        assert_eq!(order.len(), 7);
        assert_eq!(*order.last().unwrap(), tree.root());
        let position = |n: usize| order.iter().position(|&x| x == n).unwrap();
        for node in 0..tree.node_count() {
            if let Some(parent) = tree.parent(node) {
                assert!(position(node) < position(parent), "node {node} after parent");
            }
        }
    }

    #[test]
    fn pre_order_starts_at_root() {
        let tree = four_tip_tree();
        let order = tree.pre_order();
        assert_eq!(order[0], 6);
        assert_eq!(order, vec![6, 4, 0, 1, 5, 2, 3]);
    }

    #[test]
    fn branch_lengths_follow_heights() {
        let tree = four_tip_tree();
        assert!((tree.branch_length(0) - 0.1).abs() < 1e-15);
        assert!((tree.branch_length(5) - 0.3).abs() < 1e-15);
        assert_eq!(tree.branch_length(tree.root()), 0.0);
    }

    #[test]
    fn rejects_child_above_parent() {
        let result = Tree::from_parents(
            vec![Some(2), Some(2), None],
            vec![0.0, 1.0, 0.5],
            default_tip_names(2),
        );
        assert!(matches!(result, Err(TreeError::HeightAboveParent { node: 1, .. })));
    }

    #[test]
    fn rejects_disconnected_nodes() {
        let result = Tree::from_parents(
            vec![Some(3), Some(3), Some(4), None, Some(4)],
            vec![0.0, 0.0, 0.0, 1.0, 0.5],
            default_tip_names(3),
        );
        assert!(result.is_err());
    }

    #[test]
    fn set_node_height_bumps_version_and_checks_bounds() {
        let mut tree = four_tip_tree();
        let before = tree.version();
        tree.set_node_height(4, 0.3).unwrap();
        assert_eq!(tree.version(), before + 1);
        assert!(matches!(
            tree.set_node_height(4, 0.6),
            Err(TreeError::HeightAboveParent { .. })
        ));
        assert!(matches!(
            tree.set_node_height(6, 0.25),
            Err(TreeError::HeightBelowChild { child: 4, .. })
        ));
        assert!(matches!(tree.set_node_height(0, 0.05), Err(TreeError::TipHeightFixed(0))));
    }

    #[test]
    fn quiet_updates_do_not_fire_until_pushed() {
        let mut tree = four_tip_tree();
        let before = tree.version();
        tree.set_node_height_quietly(5, 0.25).unwrap();
        assert_eq!(tree.version(), before);
        tree.push_tree_changed();
        assert_eq!(tree.version(), before + 1);
    }

    #[test]
    fn bulk_height_updates_are_atomic() {
        let mut tree = four_tip_tree();
        tree.set_internal_heights(&[0.3, 0.4, 1.0]).unwrap();
        assert_eq!(tree.heights()[4..], [0.3, 0.4, 1.0]);
        assert!(tree.set_internal_heights(&[0.3, 1.2, 1.0]).is_err());
        assert_eq!(tree.node_height(5), 0.4);
    }

    #[test]
    fn balanced_tree_has_uniform_branches() {
        let tree = Tree::balanced(8, 0.1).unwrap();
        assert_eq!(tree.node_count(), 15);
        for node in 0..tree.node_count() {
            if !tree.is_root(node) {
                assert!((tree.branch_length(node) - 0.1).abs() < 1e-12);
            }
        }
        assert!((tree.node_height(tree.root()) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn caterpillar_links_ladder() {
        let tree = Tree::caterpillar(&[0.0, 0.3, 0.1, 0.5, 0.2], &[0.6, 0.9, 1.2, 1.5]).unwrap();
        assert_eq!(tree.root(), 8);
        assert_eq!(tree.children(5), &[0, 1]);
        assert_eq!(tree.children(8), &[4, 7]);
        assert_eq!(tree.children(6), &[2, 5]);
        assert_eq!(tree.parent(6), Some(7));
    }

    #[test]
    fn exchange_subtrees_bumps_topology() {
        let mut tree = four_tip_tree();
        tree.exchange_subtrees(1, 2).unwrap();
        assert_eq!(tree.topology_version(), 1);
        assert_eq!(tree.parent(1), Some(5));
        assert_eq!(tree.parent(2), Some(4));
        assert!(tree.exchange_subtrees(4, 0).is_err());
    }
}
