//! Graph - Resource dependency graph
//!
//! Dependency edges come from two places: explicit `depends_on` lists and the
//! references found by walking every attribute expression. The graph is
//! validated on construction, so a `ResourceGraph` is always acyclic and every
//! edge points at a declared node.

use std::collections::{BTreeMap, BTreeSet};

use crate::resource::{Resource, ResourceId};

/// Graph construction error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("Resource {0} is declared more than once")]
    Duplicate(ResourceId),

    #[error("{from} references {target}, which is not declared")]
    UnresolvedReference { from: ResourceId, target: ResourceId },

    #[error("Dependency cycle: {}", format_cycle(.path))]
    Cycle { path: Vec<ResourceId> },
}

fn format_cycle(path: &[ResourceId]) -> String {
    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Validated, acyclic dependency graph of desired resources
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: BTreeMap<ResourceId, Resource>,
    /// Resource -> resources it depends on
    edges: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
    /// Resource -> resources that depend on it
    reverse_edges: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
    order: Vec<ResourceId>,
}

impl ResourceGraph {
    /// Build the graph, resolving and checking every dependency edge
    pub fn build(resources: impl IntoIterator<Item = Resource>) -> Result<Self, GraphError> {
        let mut nodes = BTreeMap::new();
        for resource in resources {
            let id = resource.id.clone();
            if nodes.insert(id.clone(), resource).is_some() {
                return Err(GraphError::Duplicate(id));
            }
        }

        let mut edges: BTreeMap<ResourceId, BTreeSet<ResourceId>> = BTreeMap::new();
        let mut reverse_edges: BTreeMap<ResourceId, BTreeSet<ResourceId>> = BTreeMap::new();
        for (id, resource) in &nodes {
            let deps = resource.dependencies();
            for dep in &deps {
                if !nodes.contains_key(dep) {
                    return Err(GraphError::UnresolvedReference {
                        from: id.clone(),
                        target: dep.clone(),
                    });
                }
                reverse_edges
                    .entry(dep.clone())
                    .or_default()
                    .insert(id.clone());
            }
            edges.insert(id.clone(), deps);
        }

        let order = topological_sort(&edges).map_err(|path| GraphError::Cycle { path })?;
        log::debug!("Built resource graph with {} nodes", order.len());

        Ok(Self {
            nodes,
            edges,
            reverse_edges,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Dependencies first; ties broken by address
    pub fn topological_order(&self) -> &[ResourceId] {
        &self.order
    }

    /// Resources in topological order
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Get direct dependencies of a resource
    pub fn dependencies_of(&self, id: &ResourceId) -> impl Iterator<Item = &ResourceId> {
        self.edges.get(id).into_iter().flatten()
    }

    /// Get resources that directly depend on this resource
    pub fn dependents_of(&self, id: &ResourceId) -> impl Iterator<Item = &ResourceId> {
        self.reverse_edges.get(id).into_iter().flatten()
    }

    /// Every resource that depends on `id`, directly or not
    pub fn transitive_dependents(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&ResourceId> = self.dependents_of(id).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents_of(next));
            }
        }
        seen
    }
}

/// Order nodes so that every node follows its dependencies.
///
/// `edges` maps each node to its dependencies and must contain every node as a
/// key. Nodes with no ordering constraint between them come out in key order.
/// On a cycle the offending path is returned, first node repeated at the end.
pub fn topological_sort(
    edges: &BTreeMap<ResourceId, BTreeSet<ResourceId>>,
) -> Result<Vec<ResourceId>, Vec<ResourceId>> {
    if let Some(cycle) = find_cycle(edges) {
        return Err(cycle);
    }

    let mut remaining: BTreeMap<&ResourceId, usize> = edges
        .iter()
        .map(|(id, deps)| (id, deps.iter().filter(|d| edges.contains_key(*d)).count()))
        .collect();
    let mut dependents: BTreeMap<&ResourceId, Vec<&ResourceId>> = BTreeMap::new();
    for (id, deps) in edges {
        for dep in deps.iter().filter(|d| edges.contains_key(*d)) {
            dependents.entry(dep).or_default().push(id);
        }
    }

    let mut ready: BTreeSet<&ResourceId> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(edges.len());

    while let Some(id) = ready.pop_first() {
        order.push(id.clone());
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    Ok(order)
}

fn find_cycle(edges: &BTreeMap<ResourceId, BTreeSet<ResourceId>>) -> Option<Vec<ResourceId>> {
    let mut visited = BTreeSet::new();
    let mut stack = Vec::new();

    for node in edges.keys() {
        if let Some(cycle) = find_cycle_from(node, edges, &mut visited, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn find_cycle_from<'a>(
    node: &'a ResourceId,
    edges: &'a BTreeMap<ResourceId, BTreeSet<ResourceId>>,
    visited: &mut BTreeSet<&'a ResourceId>,
    stack: &mut Vec<&'a ResourceId>,
) -> Option<Vec<ResourceId>> {
    if let Some(pos) = stack.iter().position(|n| *n == node) {
        let mut cycle: Vec<ResourceId> = stack[pos..].iter().map(|id| (*id).clone()).collect();
        cycle.push(node.clone());
        return Some(cycle);
    }
    if !visited.insert(node) {
        return None;
    }

    stack.push(node);
    for dep in edges.get(node).into_iter().flatten() {
        if let Some(cycle) = find_cycle_from(dep, edges, visited, stack) {
            return Some(cycle);
        }
    }
    stack.pop();
    None
}
