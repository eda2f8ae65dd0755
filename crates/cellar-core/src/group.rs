//! Cluster groups.
//!
//! A group is a named subset of nodes sharing one synchronization policy.
//! Groups live in the distributed map [`GROUPS_MAP`](crate::configuration::GROUPS_MAP)
//! keyed by name, so every process observes the same membership.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use crate::node::Node;

/// A named set of nodes.
///
/// Two groups with the same name are equal whatever their node sets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Group {
    name: String,
    nodes: HashSet<Node>,
}

impl Group {
    /// Creates an empty group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: HashSet::new(),
        }
    }

    /// Group name, the unique key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current members.
    pub fn nodes(&self) -> &HashSet<Node> {
        &self.nodes
    }

    /// Adds a node. Returns true if it was not already a member.
    pub fn add_node(&mut self, node: Node) -> bool {
        self.nodes.insert(node)
    }

    /// Removes a node. Returns true if it was a member.
    pub fn remove_node(&mut self, node: &Node) -> bool {
        self.nodes.remove(node)
    }

    /// Returns true if the node is a member.
    pub fn contains(&self, node: &Node) -> bool {
        self.nodes.contains(node)
    }

    /// Members sorted by id.
    pub fn sorted_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().cloned().collect();
        nodes.sort();
        nodes
    }
}

impl PartialEq for Group {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Group {}

impl Hash for Group {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}
