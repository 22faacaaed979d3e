//! Dependency Validator
//!
//! Runs once per store construction over the ordered slice list and rejects
//! declarations the effect scheduler could not reason about.
//!
//! # Checks
//!
//! 1. No slice lists the same dependency twice.
//! 2. No two slices share an id.
//! 3. No cycle exists. The search is a DFS with an explicit recursion
//!    stack, so the error can report the cycle in traversal order
//!    (`sl_a$ -> sl_b$ -> sl_a$`).
//! 4. Every dependency is registered earlier than its dependent.
//!
//! A cycle always implies a forward reference, so check 3 runs before
//! check 4: the cycle path is the more useful report.
//!
//! Because dependencies precede dependents, the transitive closures in
//! [`ReverseDependencies`] are computed in a single forward pass.

use std::collections::{HashMap, HashSet};

use super::node::SliceNode;
use crate::error::{Result, StoreError};
use crate::id::SliceId;

/// Validate an ordered list of slice nodes.
pub fn validate(nodes: &[SliceNode]) -> Result<()> {
    check_unique_dependencies(nodes)?;
    check_unique_ids(nodes)?;
    if let Some(path) = find_cycle(nodes) {
        return Err(StoreError::DependencyCycle { path });
    }
    check_registration_order(nodes)
}

fn check_unique_dependencies(nodes: &[SliceNode]) -> Result<()> {
    for node in nodes {
        let mut seen = HashSet::new();
        for dep in node.dependencies() {
            if !seen.insert(dep) {
                return Err(StoreError::DuplicateDependency {
                    slice: node.id().clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

fn check_unique_ids(nodes: &[SliceNode]) -> Result<()> {
    let mut seen = HashSet::new();
    for node in nodes {
        if !seen.insert(node.id()) {
            return Err(StoreError::DuplicateSliceId(node.id().clone()));
        }
    }
    Ok(())
}

fn check_registration_order(nodes: &[SliceNode]) -> Result<()> {
    let positions: HashMap<&SliceId, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.id(), i))
        .collect();

    for (i, node) in nodes.iter().enumerate() {
        for dep in node.dependencies() {
            match positions.get(dep) {
                None => {
                    return Err(StoreError::MissingDependency {
                        slice: node.id().clone(),
                        dependency: dep.clone(),
                    })
                }
                Some(&pos) if pos >= i => {
                    return Err(StoreError::DependencyOrder {
                        slice: node.id().clone(),
                        dependency: dep.clone(),
                    })
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Find a dependency cycle, returned as the path walked to discover it with
/// the first slice repeated at the end.
///
/// Edges that point at unknown slices are ignored here; the ordering check
/// reports them.
pub fn find_cycle(nodes: &[SliceNode]) -> Option<Vec<SliceId>> {
    let graph: HashMap<&SliceId, &SliceNode> = nodes.iter().map(|n| (n.id(), n)).collect();
    let mut visited: HashSet<&SliceId> = HashSet::new();
    let mut stack: Vec<&SliceId> = Vec::new();

    for node in nodes {
        if let Some(cycle) = visit(node.id(), &graph, &mut visited, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    id: &'a SliceId,
    graph: &HashMap<&'a SliceId, &'a SliceNode>,
    visited: &mut HashSet<&'a SliceId>,
    stack: &mut Vec<&'a SliceId>,
) -> Option<Vec<SliceId>> {
    if let Some(pos) = stack.iter().position(|s| *s == id) {
        let mut path: Vec<SliceId> = stack[pos..].iter().map(|s| (*s).clone()).collect();
        path.push(id.clone());
        return Some(path);
    }
    if !visited.insert(id) {
        return None;
    }

    let node: &'a SliceNode = *graph.get(id)?;
    stack.push(id);
    for dep in node.dependencies() {
        if let Some(cycle) = visit(dep, graph, visited, stack) {
            return Some(cycle);
        }
    }
    stack.pop();
    None
}

/// For every slice, the set of slices that transitively depend on it.
#[derive(Debug, Clone, Default)]
pub struct ReverseDependencies {
    dependents: HashMap<SliceId, HashSet<SliceId>>,
}

impl ReverseDependencies {
    /// Compute the map. Expects nodes that already passed [`validate`].
    pub fn compute(nodes: &[SliceNode]) -> Self {
        // transitive dependencies of each slice; earlier entries are final
        // by the time a later slice reads them
        let mut upstream: HashMap<&SliceId, HashSet<SliceId>> = HashMap::new();

        for node in nodes {
            let mut all = HashSet::new();
            for dep in node.dependencies() {
                all.insert(dep.clone());
                if let Some(transitive) = upstream.get(dep) {
                    all.extend(transitive.iter().cloned());
                }
            }
            upstream.insert(node.id(), all);
        }

        let mut dependents: HashMap<SliceId, HashSet<SliceId>> = nodes
            .iter()
            .map(|n| (n.id().clone(), HashSet::new()))
            .collect();
        for (slice, deps) in upstream {
            for dep in deps {
                dependents.entry(dep).or_default().insert(slice.clone());
            }
        }

        Self { dependents }
    }

    /// Slices that transitively depend on `slice`.
    pub fn dependents_of(&self, slice: &SliceId) -> Option<&HashSet<SliceId>> {
        self.dependents.get(slice)
    }

    /// Expand a set of changed slices into every slice whose view may have
    /// changed: the inputs plus all their transitive dependents.
    pub fn closure<'a, I>(&self, changed: I) -> HashSet<SliceId>
    where
        I: IntoIterator<Item = &'a SliceId>,
    {
        let mut affected = HashSet::new();
        for slice in changed {
            affected.insert(slice.clone());
            if let Some(dependents) = self.dependents.get(slice) {
                affected.extend(dependents.iter().cloned());
            }
        }
        affected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SliceId {
        SliceId::from(s)
    }

    fn node(s: &str, deps: &[&str]) -> SliceNode {
        SliceNode::new(id(s), deps.iter().map(|d| id(d)).collect())
    }

    #[test]
    fn accepts_dependencies_before_dependents() {
        let nodes = vec![node("a", &[]), node("b", &["a"]), node("c", &["a", "b"])];
        assert!(validate(&nodes).is_ok());
    }

    #[test]
    fn rejects_forward_reference() {
        let nodes = vec![node("b", &["a"]), node("a", &[])];
        let err = validate(&nodes).unwrap_err();
        assert!(matches!(err, StoreError::DependencyOrder { .. }));
        assert!(err.to_string().contains("registered after this slice"));
    }

    #[test]
    fn rejects_missing_dependency() {
        let nodes = vec![node("b", &["ghost"])];
        assert!(matches!(
            validate(&nodes),
            Err(StoreError::MissingDependency { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_dependency() {
        let nodes = vec![node("a", &[]), node("b", &["a", "a"])];
        assert!(matches!(
            validate(&nodes),
            Err(StoreError::DuplicateDependency { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let nodes = vec![node("a", &[]), node("a", &[])];
        assert!(matches!(
            validate(&nodes),
            Err(StoreError::DuplicateSliceId(_))
        ));
    }

    #[test]
    fn reports_cycle_in_traversal_order() {
        let nodes = vec![
            node("sl0", &["sl1"]),
            node("sl1", &["sl3"]),
            node("sl2", &[]),
            node("sl3", &["sl4"]),
            node("sl4", &["sl0"]),
        ];
        let err = validate(&nodes).unwrap_err();
        assert_eq!(
            err.to_string(),
            "circular dependency detected: sl0 -> sl1 -> sl3 -> sl4 -> sl0"
        );
    }

    #[test]
    fn reports_self_cycle() {
        let nodes = vec![node("a", &["a"])];
        let path = find_cycle(&nodes).unwrap();
        assert_eq!(path, vec![id("a"), id("a")]);
    }

    #[test]
    fn cycle_not_reachable_from_first_node() {
        let nodes = vec![node("a", &[]), node("b", &["c"]), node("c", &["b"])];
        let path = find_cycle(&nodes).unwrap();
        assert_eq!(path, vec![id("b"), id("c"), id("b")]);
    }

    #[test]
    fn reverse_dependencies_are_transitive() {
        // a <- b <- c, and d independent
        let nodes = vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["b"]),
            node("d", &[]),
        ];
        let reverse = ReverseDependencies::compute(&nodes);

        let of_a = reverse.dependents_of(&id("a")).unwrap();
        assert!(of_a.contains(&id("b")));
        assert!(of_a.contains(&id("c")));
        assert!(!of_a.contains(&id("d")));
        assert!(reverse.dependents_of(&id("c")).unwrap().is_empty());

        let closure = reverse.closure([&id("b")]);
        assert_eq!(closure.len(), 2);
        assert!(closure.contains(&id("b")));
        assert!(closure.contains(&id("c")));
    }
}
