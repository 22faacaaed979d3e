//! Graph Nodes
//!
//! This module defines the node type that lives in the slice dependency
//! graph. A node carries only ids: the validator never needs slice state.

use crate::id::SliceId;

/// A slice in the dependency graph, with edges to the slices it reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceNode {
    /// Unique identifier for this node.
    id: SliceId,

    /// Slices that this slice depends on, in declaration order.
    dependencies: Vec<SliceId>,
}

impl SliceNode {
    /// Create a node with the given dependencies.
    pub fn new(id: SliceId, dependencies: Vec<SliceId>) -> Self {
        Self { id, dependencies }
    }

    /// Create a node with no dependencies.
    pub fn root(id: SliceId) -> Self {
        Self::new(id, Vec::new())
    }

    /// Get the node's ID.
    pub fn id(&self) -> &SliceId {
        &self.id
    }

    /// Get all dependencies.
    pub fn dependencies(&self) -> &[SliceId] {
        &self.dependencies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_no_dependencies() {
        let node = SliceNode::root(SliceId::from("sl_a$"));
        assert!(node.dependencies().is_empty());
    }

    #[test]
    fn dependency_lookup() {
        let a = SliceId::from("sl_a$");
        let b = SliceId::from("sl_b$");
        let node = SliceNode::new(b.clone(), vec![a.clone()]);

        assert_eq!(node.id(), &b);
        assert_eq!(node.dependencies(), &[a]);
    }
}
