//! Differ - Compare desired state with current state to generate a Plan
//!
//! Compares the desired graph with the recorded states and produces the
//! ordered change set. References are resolved against recorded state; a
//! reference to a resource that is about to be created or replaced becomes
//! `Value::Unknown`, which always counts as a change.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::graph::{ResourceGraph, topological_sort};
use crate::plan::{Action, AttributeDiff, ChangeEntry, DeleteReason, Plan};
use crate::resource::{Resource, ResolveError, ResourceId, State, Value};
use crate::schema::ResourceSchema;

/// Error while computing a Plan
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DiffError {
    #[error("{id}: {source}")]
    Resolve { id: ResourceId, source: ResolveError },

    #[error("Recorded state has a dependency cycle: {}", .path.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" -> "))]
    StateCycle { path: Vec<ResourceId> },
}

/// Result of comparing one resource
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// No recorded state
    Create,
    /// Attributes differ and every changed attribute can be updated in place
    Update(Vec<AttributeDiff>),
    /// At least one changed attribute forces replacement
    Replace(Vec<AttributeDiff>),
    NoChange,
}

impl Diff {
    pub fn is_change(&self) -> bool {
        !matches!(self, Diff::NoChange)
    }
}

/// Compare resolved desired attributes with a recorded state
pub fn diff(
    desired: &HashMap<String, Value>,
    current: Option<&State>,
    schema: Option<&ResourceSchema>,
) -> Diff {
    let Some(current) = current.filter(|s| s.exists) else {
        return Diff::Create;
    };

    let diffs = find_changed_attributes(desired, &current.attributes, schema);
    if diffs.is_empty() {
        Diff::NoChange
    } else if diffs.iter().any(|d| d.requires_replacement) {
        Diff::Replace(diffs)
    } else {
        Diff::Update(diffs)
    }
}

/// Attribute-level differences, sorted by key
fn find_changed_attributes(
    desired: &HashMap<String, Value>,
    current: &HashMap<String, Value>,
    schema: Option<&ResourceSchema>,
) -> Vec<AttributeDiff> {
    let keys: BTreeSet<&String> = desired.keys().chain(current.keys()).collect();

    keys.into_iter()
        .filter_map(|key| {
            let before = current.get(key);
            let after = desired.get(key);
            // Unknown never equals a recorded value
            let changed = match (before, after) {
                (Some(b), Some(a)) => a == &Value::Unknown || a != b,
                (None, None) => false,
                _ => true,
            };
            changed.then(|| AttributeDiff {
                key: key.clone(),
                before: before.cloned(),
                after: after.cloned(),
                requires_replacement: schema.is_some_and(|s| s.requires_replacement(key)),
            })
        })
        .collect()
}

/// What the plan will do to a resource, as seen by resources referencing it
enum Planned {
    /// Created or replaced: every attribute is unknown until apply
    Unknown,
    /// Updated in place with these resolved inputs
    Updated(HashMap<String, Value>),
    Unchanged,
}

/// Compute the change set reconciling `current` with `graph`
pub fn create_plan(
    graph: &ResourceGraph,
    current: &HashMap<ResourceId, State>,
    schemas: &HashMap<String, ResourceSchema>,
) -> Result<Plan, DiffError> {
    let mut planned: HashMap<ResourceId, Planned> = HashMap::new();
    let mut decisions: Vec<(&Resource, Diff, HashMap<String, Value>)> = Vec::new();

    for resource in graph.resources() {
        let lookup = |target: &ResourceId, attribute: &str| match planned.get(target) {
            Some(Planned::Unknown) => Some(Value::Unknown),
            Some(Planned::Updated(attrs)) => attrs
                .get(attribute)
                .cloned()
                .or_else(|| current.get(target).and_then(|s| s.attribute(attribute))),
            Some(Planned::Unchanged) | None => current.get(target).and_then(|s| s.attribute(attribute)),
        };
        let resolved = resource
            .resolve(&lookup)
            .map_err(|source| DiffError::Resolve {
                id: resource.id.clone(),
                source,
            })?
            .attributes;

        let d = diff(
            &resolved,
            current.get(&resource.id),
            schemas.get(&resource.id.resource_type),
        );
        let next = match &d {
            Diff::Create | Diff::Replace(_) => Planned::Unknown,
            Diff::Update(_) => Planned::Updated(resolved.clone()),
            Diff::NoChange => Planned::Unchanged,
        };
        log::debug!("{}: {:?}", resource.id, d);
        planned.insert(resource.id.clone(), next);
        decisions.push((resource, d, resolved));
    }

    // Everything recorded that is either orphaned or replaced gets deleted
    let mut deletes: BTreeMap<ResourceId, DeleteReason> = current
        .values()
        .filter(|s| s.exists && !graph.contains(&s.id))
        .map(|s| (s.id.clone(), DeleteReason::Orphaned))
        .collect();
    for (resource, d, _) in &decisions {
        if matches!(d, Diff::Replace(_)) {
            deletes.insert(resource.id.clone(), DeleteReason::Replaced);
        }
    }

    let mut plan = Plan::new();
    let delete_index = add_deletes(&mut plan, current, &deletes)?;

    let mut entry_index: HashMap<&ResourceId, usize> = HashMap::new();
    for (resource, d, resolved) in decisions {
        let mut predecessors: Vec<usize> = graph
            .dependencies_of(&resource.id)
            .filter_map(|dep| entry_index.get(dep).copied())
            .collect();
        let state = current.get(&resource.id).filter(|s| s.exists).cloned();

        let entry = match d {
            Diff::Create => ChangeEntry {
                diffs: additions(&resolved),
                ..ChangeEntry::new(resource.id.clone(), Action::Create)
            },
            Diff::Replace(diffs) => {
                predecessors.extend(delete_index.get(&resource.id).copied());
                ChangeEntry {
                    replacement: true,
                    current: state,
                    diffs,
                    ..ChangeEntry::new(resource.id.clone(), Action::Create)
                }
            }
            Diff::Update(diffs) => ChangeEntry {
                current: state,
                diffs,
                ..ChangeEntry::new(resource.id.clone(), Action::Update)
            },
            Diff::NoChange => ChangeEntry {
                current: state,
                ..ChangeEntry::new(resource.id.clone(), Action::NoOp)
            },
        };

        let index = plan.add(ChangeEntry {
            desired: Some(resource.clone()),
            predecessors,
            ..entry
        });
        entry_index.insert(&resource.id, index);
    }

    Ok(plan)
}

/// Plan that deletes every recorded resource, dependents first
pub fn destroy_plan(current: &HashMap<ResourceId, State>) -> Result<Plan, DiffError> {
    let deletes: BTreeMap<ResourceId, DeleteReason> = current
        .values()
        .filter(|s| s.exists)
        .map(|s| (s.id.clone(), DeleteReason::Destroy))
        .collect();

    let mut plan = Plan::new();
    add_deletes(&mut plan, current, &deletes)?;
    Ok(plan)
}

/// Append delete entries in reverse dependency order of the recorded state.
///
/// A delete waits for the deletes of every resource recorded as depending on
/// it. Returns the entry index of each delete.
fn add_deletes(
    plan: &mut Plan,
    current: &HashMap<ResourceId, State>,
    deletes: &BTreeMap<ResourceId, DeleteReason>,
) -> Result<HashMap<ResourceId, usize>, DiffError> {
    let edges: BTreeMap<ResourceId, BTreeSet<ResourceId>> = deletes
        .keys()
        .map(|id| {
            let deps = current
                .get(id)
                .map(|s| {
                    s.dependencies
                        .iter()
                        .filter(|d| deletes.contains_key(*d))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (id.clone(), deps)
        })
        .collect();

    let mut order = topological_sort(&edges).map_err(|path| DiffError::StateCycle { path })?;
    order.reverse();

    let mut dependents: HashMap<&ResourceId, Vec<&ResourceId>> = HashMap::new();
    for (id, deps) in &edges {
        for dep in deps {
            dependents.entry(dep).or_default().push(id);
        }
    }

    let mut index_of = HashMap::new();
    for id in order {
        let reason = deletes[&id];
        let predecessors = dependents
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|d| index_of.get(*d).copied())
            .collect();
        let index = plan.add(ChangeEntry {
            delete_reason: Some(reason),
            replacement: reason == DeleteReason::Replaced,
            current: current.get(&id).cloned(),
            predecessors,
            ..ChangeEntry::new(id.clone(), Action::Delete)
        });
        index_of.insert(id, index);
    }
    Ok(index_of)
}

fn additions(attributes: &HashMap<String, Value>) -> Vec<AttributeDiff> {
    let mut diffs: Vec<AttributeDiff> = attributes
        .iter()
        .map(|(key, value)| AttributeDiff {
            key: key.clone(),
            before: None,
            after: Some(value.clone()),
            requires_replacement: false,
        })
        .collect();
    diffs.sort_by(|a, b| a.key.cmp(&b.key));
    diffs
}
