//! Execution nodes and round-robin node pools.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A host that actions can be dispatched to. Identity is the hostname.
#[derive(Debug, Serialize, Deserialize)]
pub struct Node {
    hostname: String,
}

impl Node {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.hostname == other.hostname
    }
}
impl Eq for Node {}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hostname)
    }
}

/// An ordered set of nodes with a round-robin cursor.
///
/// Pools are compared by their hostname lists (in order); the cursor does not
/// participate in equality.
#[derive(Debug, Clone, Default)]
pub struct NodePool {
    nodes: Vec<Arc<Node>>,
    next: usize,
}

impl NodePool {
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        Self { nodes, next: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Hostnames in pool order.
    pub fn hostnames(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.hostname()).collect()
    }

    /// Look up a member node by hostname.
    pub fn get(&self, hostname: &str) -> Option<Arc<Node>> {
        self.nodes
            .iter()
            .find(|n| n.hostname() == hostname)
            .cloned()
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.nodes.iter().any(|n| n.as_ref() == node)
    }

    /// Take the next node in rotation. Returns `None` on an empty pool.
    pub fn next_round_robin(&mut self) -> Option<Arc<Node>> {
        if self.nodes.is_empty() {
            return None;
        }
        let node = self.nodes[self.next % self.nodes.len()].clone();
        self.next = (self.next + 1) % self.nodes.len();
        Some(node)
    }
}

impl PartialEq for NodePool {
    fn eq(&self, other: &Self) -> bool {
        self.hostnames() == other.hostnames()
    }
}
impl Eq for NodePool {}
