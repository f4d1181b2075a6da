//! Plan - Ordered change set
//!
//! A Plan is the ordered list of changes needed to reconcile the backend with
//! the desired graph. Entries are stored in a valid execution order and carry
//! explicit predecessor indices; no side effects occur until it is executed.

use std::fmt;

use crate::resource::{Resource, ResourceId, State, Value};

/// What a change entry does to its resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Update,
    Delete,
    NoOp,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Update => write!(f, "update"),
            Action::Delete => write!(f, "delete"),
            Action::NoOp => write!(f, "no-op"),
        }
    }
}

/// Why a resource is being deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// No longer declared
    Orphaned,
    /// First half of a replacement
    Replaced,
    /// Explicit destroy
    Destroy,
}

/// Change of a single attribute
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDiff {
    pub key: String,
    /// `None` when the attribute is being added
    pub before: Option<Value>,
    /// `None` when the attribute is being removed
    pub after: Option<Value>,
    pub requires_replacement: bool,
}

/// One step of a Plan
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    /// Position in the Plan
    pub index: usize,
    pub id: ResourceId,
    pub action: Action,
    /// Set for Delete entries
    pub delete_reason: Option<DeleteReason>,
    /// Both halves of a replacement carry this flag
    pub replacement: bool,
    /// Desired resource with references unresolved (Create, Update, NoOp)
    pub desired: Option<Resource>,
    /// Recorded state (Update, Delete, NoOp, and the Create half of a replacement)
    pub current: Option<State>,
    pub diffs: Vec<AttributeDiff>,
    /// Entries that must complete before this one starts
    pub predecessors: Vec<usize>,
}

impl ChangeEntry {
    pub fn new(id: ResourceId, action: Action) -> Self {
        Self {
            index: 0,
            id,
            action,
            delete_reason: None,
            replacement: false,
            desired: None,
            current: None,
            diffs: Vec::new(),
            predecessors: Vec::new(),
        }
    }

    /// Whether this entry changes the backend
    pub fn is_mutating(&self) -> bool {
        self.action != Action::NoOp
    }

    pub fn symbol(&self) -> &'static str {
        match (self.action, self.replacement) {
            (Action::Create, true) => "+/-",
            (Action::Delete, true) => "-/+",
            (Action::Create, false) => "+",
            (Action::Update, _) => "~",
            (Action::Delete, false) => "-",
            (Action::NoOp, _) => " ",
        }
    }
}

/// Ordered change set
#[derive(Debug, Clone, Default)]
pub struct Plan {
    entries: Vec<ChangeEntry>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, returning its index.
    ///
    /// Predecessors must already be in the plan, which keeps the entry order a
    /// valid execution order.
    pub fn add(&mut self, mut entry: ChangeEntry) -> usize {
        let index = self.entries.len();
        debug_assert!(entry.predecessors.iter().all(|p| *p < index));
        entry.index = index;
        entry.predecessors.sort_unstable();
        entry.predecessors.dedup();
        self.entries.push(entry);
        index
    }

    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&ChangeEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if at least one entry changes the backend
    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(ChangeEntry::is_mutating)
    }

    /// Number of mutating entries
    pub fn mutation_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_mutating()).count()
    }

    /// For each entry, the entries that list it as a predecessor
    pub fn successors(&self) -> Vec<Vec<usize>> {
        let mut successors = vec![Vec::new(); self.entries.len()];
        for entry in &self.entries {
            for pred in &entry.predecessors {
                successors[*pred].push(entry.index);
            }
        }
        successors
    }

    /// Generate a summary of the Plan for display
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for entry in &self.entries {
            match (entry.action, entry.replacement) {
                (Action::Create, true) => summary.replace += 1,
                (Action::Create, false) => summary.create += 1,
                (Action::Update, _) => summary.update += 1,
                (Action::Delete, true) => {}
                (Action::Delete, false) => summary.delete += 1,
                (Action::NoOp, _) => summary.no_op += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub no_op: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Plan: {} to add, {} to change, {} to replace, {} to destroy",
            self.create, self.update, self.replace, self.delete
        )
    }
}

/// Format an entry briefly for display
pub fn format_entry_brief(entry: &ChangeEntry) -> String {
    format!("{} {}", entry.symbol(), entry.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, action: Action, predecessors: Vec<usize>) -> ChangeEntry {
        ChangeEntry {
            predecessors,
            ..ChangeEntry::new(ResourceId::new("table", name), action)
        }
    }

    #[test]
    fn empty_plan() {
        let plan = Plan::new();
        assert!(plan.is_empty());
        assert!(!plan.has_changes());
        assert_eq!(plan.mutation_count(), 0);
    }

    #[test]
    fn add_assigns_indices_and_dedups_predecessors() {
        let mut plan = Plan::new();
        assert_eq!(plan.add(entry("a", Action::Create, vec![])), 0);
        assert_eq!(plan.add(entry("b", Action::Create, vec![0, 0])), 1);

        assert_eq!(plan.entries()[1].index, 1);
        assert_eq!(plan.entries()[1].predecessors, vec![0]);
        assert_eq!(plan.successors(), vec![vec![1], vec![]]);
    }

    #[test]
    fn plan_summary_counts_replacement_once() {
        let mut plan = Plan::new();
        let delete = plan.add(ChangeEntry {
            delete_reason: Some(DeleteReason::Replaced),
            replacement: true,
            ..ChangeEntry::new(ResourceId::new("table", "t"), Action::Delete)
        });
        plan.add(ChangeEntry {
            replacement: true,
            predecessors: vec![delete],
            ..ChangeEntry::new(ResourceId::new("table", "t"), Action::Create)
        });
        plan.add(entry("u", Action::NoOp, vec![]));
        plan.add(entry("v", Action::Delete, vec![]));

        let summary = plan.summary();
        assert_eq!(summary.replace, 1);
        assert_eq!(summary.create, 0);
        assert_eq!(summary.delete, 1);
        assert_eq!(summary.no_op, 1);
        assert_eq!(plan.mutation_count(), 3);
        assert_eq!(
            summary.to_string(),
            "Plan: 0 to add, 0 to change, 1 to replace, 1 to destroy"
        );
    }

    #[test]
    fn brief_format_uses_symbols() {
        let e = entry("a", Action::Update, vec![]);
        assert_eq!(format_entry_brief(&e), "~ table.a");
    }
}
