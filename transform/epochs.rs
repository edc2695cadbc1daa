//! Anchors and epochs of a serially sampled tree.
//!
//! The anchor of an internal node is the oldest tip below it. An epoch is a chain
//! of internal nodes sharing one anchor, each the parent of the previous one.

use crate::tree::Tree;

#[derive(Debug, Clone, PartialEq)]
pub struct Epoch {
    pub anchor_tip: usize,
    /// Bottom to top.
    pub nodes: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct Epochs {
    anchor_tip: Vec<usize>,
    epoch_of: Vec<Option<usize>>,
    epochs: Vec<Epoch>,
    topology_version: u64,
}

impl Epochs {
    /// One post-order pass. Ties between children go to the first child.
    pub fn build(tree: &Tree) -> Self {
        let node_count = tree.node_count();
        let mut anchor_tip: Vec<usize> = (0..node_count).collect();
        let mut epoch_of: Vec<Option<usize>> = vec![None; node_count];
        let mut epochs: Vec<Epoch> = Vec::new();

        for node in tree.internal_post_order() {
            let mut best = tree.child(node, 0);
            for &child in &tree.children(node)[1..] {
                if tree.node_height(anchor_tip[child]) > tree.node_height(anchor_tip[best]) {
                    best = child;
                }
            }
            anchor_tip[node] = anchor_tip[best];
            if tree.is_root(node) {
                continue;
            }
            let epoch = match epoch_of[best] {
                Some(epoch) => {
                    epochs[epoch].nodes.push(node);
                    epoch
                }
                None => {
                    epochs.push(Epoch {
                        anchor_tip: anchor_tip[best],
                        nodes: vec![node],
                    });
                    epochs.len() - 1
                }
            };
            epoch_of[node] = Some(epoch);
        }
        log::debug!("Built {} epochs over {} internal nodes", epochs.len(), tree.internal_node_count());

        Self {
            anchor_tip,
            epoch_of,
            epochs,
            topology_version: tree.topology_version(),
        }
    }

    pub fn anchor_tip(&self, node: usize) -> usize {
        self.anchor_tip[node]
    }

    pub fn anchor_height(&self, tree: &Tree, node: usize) -> f64 {
        tree.node_height(self.anchor_tip[node])
    }

    pub fn epoch_of(&self, node: usize) -> Option<usize> {
        self.epoch_of[node]
    }

    pub fn epochs(&self) -> &[Epoch] {
        &self.epochs
    }

    pub fn is_current(&self, tree: &Tree) -> bool {
        self.topology_version == tree.topology_version() && self.anchor_tip.len() == tree.node_count()
    }
}
