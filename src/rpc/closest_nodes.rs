use std::vec::IntoIter;

use crate::common::{Id, Node};

/// A set of nodes sorted by their distance to a target, deduplicated by
/// id.
#[derive(Debug, Clone)]
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<Node>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::with_capacity(200),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The `count` closest nodes seen so far.
    pub fn take(&self, count: usize) -> &[Node] {
        &self.nodes[..count.min(self.nodes.len())]
    }

    // === Public Methods ===

    pub fn add(&mut self, node: Node) {
        let seek = node.id.xor(&self.target);

        if let Err(pos) = self.nodes.binary_search_by(|probe| {
            if probe.id == node.id {
                std::cmp::Ordering::Equal
            } else {
                probe.id.xor(&self.target).cmp(&seek)
            }
        }) {
            self.nodes.insert(pos, node)
        }
    }
}

impl IntoIterator for ClosestNodes {
    type Item = Node;
    type IntoIter = IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sorts_and_dedupes() {
        let target = Id::random();

        let mut closest_nodes = ClosestNodes::new(target);

        for _ in 0..10 {
            let node = Node::random();
            closest_nodes.add(node.clone());
            closest_nodes.add(node);
        }

        assert_eq!(closest_nodes.nodes().len(), 10);

        let distances = closest_nodes
            .nodes()
            .iter()
            .map(|n| n.id.xor(&target))
            .collect::<Vec<_>>();

        let mut sorted = distances.clone();
        sorted.sort();

        assert_eq!(sorted, distances);
    }
}
