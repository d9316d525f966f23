//! Neighbourhood graph
//!
//! Nodes learned through membership gossip. Only first-hop neighbours
//! carry a populated `neighbours` sub-map: it holds the view that
//! neighbour reported to us, giving 2-hop visibility.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// A known network node
#[derive(Clone, Debug)]
pub struct Node {
    /// Node id
    pub id: String,
    /// Node bind address
    pub address: String,
    /// The neighbourhood this node reported to us
    pub neighbours: HashMap<String, Node>,
    /// When we last heard this node announce itself; `None` until its
    /// first `neighbour` message
    pub last_seen: Option<Instant>,
}

impl Node {
    /// Create a node with an empty neighbourhood
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            neighbours: HashMap::new(),
            last_seen: None,
        }
    }

    /// One-hop snapshot of this node's reported neighbours
    pub fn neighbourhood(&self) -> Vec<Node> {
        self.neighbours
            .values()
            .map(|n| Node::new(&n.id, &n.address))
            .collect()
    }
}

/// Breadth-first traversal of the 2-hop graph rooted at `root`,
/// returning every reachable node (root included) exactly once.
pub(crate) fn flatten(root: &Node) -> Vec<Node> {
    let mut visited: HashMap<String, Node> = HashMap::new();
    let mut queue: VecDeque<&Node> = VecDeque::new();

    visited.insert(root.id.clone(), Node::new(&root.id, &root.address));
    queue.push_back(root);

    while let Some(node) = queue.pop_front() {
        for (id, neighbour) in &node.neighbours {
            if !visited.contains_key(id) {
                visited.insert(id.clone(), Node::new(id, &neighbour.address));
                queue.push_back(neighbour);
            }
        }
    }

    visited.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with(id: &str, neighbours: Vec<Node>) -> Node {
        let mut node = Node::new(id, format!("{}:8080", id));
        for n in neighbours {
            node.neighbours.insert(n.id.clone(), n);
        }
        node
    }

    #[test]
    fn test_flatten_two_hops() {
        let n2 = node_with("n2", vec![]);
        let n1 = node_with("n1", vec![n2]);
        let root = node_with("self", vec![n1]);

        let mut ids: Vec<String> = flatten(&root).into_iter().map(|n| n.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["n1", "n2", "self"]);
    }

    #[test]
    fn test_flatten_deduplicates_cycles() {
        // n1 reports us back as its own neighbour
        let us = node_with("self", vec![]);
        let n1 = node_with("n1", vec![us]);
        let root = node_with("self", vec![n1]);

        let nodes = flatten(&root);
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn test_neighbourhood_is_one_hop() {
        let n2 = node_with("n2", vec![]);
        let n1 = node_with("n1", vec![n2]);
        let root = node_with("self", vec![n1]);

        let hood = root.neighbourhood();
        assert_eq!(hood.len(), 1);
        assert_eq!(hood[0].id, "n1");
        assert!(hood[0].neighbours.is_empty());
    }
}
