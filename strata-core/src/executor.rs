//! Executor - Apply a Plan through the registered Providers
//!
//! Entries run on a bounded set of tokio tasks. An entry is dispatched once
//! every predecessor is Applied or Unchanged; its references are resolved at
//! that moment from the states produced so far. A failed entry is not rolled
//! back: its transitive dependents are Skipped and unrelated entries continue.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::{self, JoinSet};

use crate::plan::{Action, ChangeEntry, Plan};
use crate::provider::{Provider, ProviderError, ProviderRegistry, ProviderResult, UpdateOutcome};
use crate::resource::{Resource, ResourceId, State};
use crate::retry::{RetryOn, RetryPolicy, with_retry};

/// Lifecycle of a change entry during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Running,
    Applied,
    Failed,
    /// A predecessor failed or the run was cancelled first
    Skipped,
    /// NoOp entry
    Unchanged,
}

impl EntryStatus {
    /// Whether dependents may proceed
    pub fn is_success(self) -> bool {
        matches!(self, EntryStatus::Applied | EntryStatus::Unchanged)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Running => "running",
            EntryStatus::Applied => "applied",
            EntryStatus::Failed => "failed",
            EntryStatus::Skipped => "skipped",
            EntryStatus::Unchanged => "unchanged",
        };
        write!(f, "{}", s)
    }
}

/// What an applied entry did to the backend
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Created(State),
    Updated(State),
    /// Deleted and created again, either planned or because the provider
    /// refused an in-place update
    Replaced(State),
    Deleted(ResourceId),
}

impl EntryOutcome {
    /// New state of the resource, `None` after a delete
    pub fn state(&self) -> Option<&State> {
        match self {
            EntryOutcome::Created(s) | EntryOutcome::Updated(s) | EntryOutcome::Replaced(s) => {
                Some(s)
            }
            EntryOutcome::Deleted(_) => None,
        }
    }
}

/// Result of one entry
#[derive(Debug)]
pub struct EntryReport {
    pub index: usize,
    pub id: ResourceId,
    pub action: Action,
    pub status: EntryStatus,
    pub outcome: Option<EntryOutcome>,
    pub error: Option<ProviderError>,
    pub skip_reason: Option<String>,
}

impl EntryReport {
    fn pending(entry: &ChangeEntry) -> Self {
        Self {
            index: entry.index,
            id: entry.id.clone(),
            action: entry.action,
            status: EntryStatus::Pending,
            outcome: None,
            error: None,
            skip_reason: None,
        }
    }

    fn skip(&mut self, reason: impl Into<String>) {
        self.status = EntryStatus::Skipped;
        self.skip_reason = Some(reason.into());
    }
}

/// Result of executing an entire Plan
#[derive(Debug)]
pub struct ApplyReport {
    pub entries: Vec<EntryReport>,
    /// The run was cancelled before every entry was dispatched
    pub cancelled: bool,
}

impl ApplyReport {
    pub fn summary(&self) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for entry in &self.entries {
            match entry.status {
                EntryStatus::Applied => summary.applied += 1,
                EntryStatus::Failed => summary.failed += 1,
                EntryStatus::Skipped => summary.skipped += 1,
                EntryStatus::Unchanged => summary.unchanged += 1,
                EntryStatus::Pending | EntryStatus::Running => {}
            }
        }
        summary
    }

    pub fn is_success(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.status != EntryStatus::Failed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntryReport> {
        self.entries
            .iter()
            .filter(|e| e.status == EntryStatus::Failed)
    }

    /// Applied outcomes in plan order
    pub fn outcomes(&self) -> impl Iterator<Item = &EntryOutcome> {
        self.entries.iter().filter_map(|e| e.outcome.as_ref())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplySummary {
    pub applied: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unchanged: usize,
}

impl fmt::Display for ApplySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied, {} failed, {} skipped, {} unchanged",
            self.applied, self.failed, self.skipped, self.unchanged
        )
    }
}

/// Run-level cancellation flag.
///
/// Once cancelled no further entries are dispatched; entries already running
/// finish normally.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            log::warn!("Cancellation requested, waiting for running entries to finish");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of entries running at once
    pub parallelism: usize,
    /// If true, skip every mutating entry
    pub dry_run: bool,
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            dry_run: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Executes Plans using the Providers of a registry
pub struct Executor {
    registry: ProviderRegistry,
    config: ExecutorConfig,
    cancel: CancelSignal,
}

impl Executor {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry,
            config: ExecutorConfig::default(),
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Execute a Plan computed against `current`
    pub async fn apply(&self, plan: &Plan, current: &HashMap<ResourceId, State>) -> ApplyReport {
        let mut reports: Vec<EntryReport> = plan.entries().iter().map(EntryReport::pending).collect();

        if self.config.dry_run {
            for report in &mut reports {
                if report.action == Action::NoOp {
                    report.status = EntryStatus::Unchanged;
                } else {
                    report.skip("dry run");
                }
            }
            return ApplyReport {
                entries: reports,
                cancelled: false,
            };
        }

        let successors = plan.successors();
        let mut known: HashMap<ResourceId, State> = current
            .iter()
            .filter(|(_, s)| s.exists)
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();
        let mut ready: BTreeSet<usize> = plan
            .entries()
            .iter()
            .filter(|e| e.predecessors.is_empty())
            .map(|e| e.index)
            .collect();
        let mut join_set = JoinSet::new();
        let mut running: HashMap<task::Id, usize> = HashMap::new();
        let parallelism = self.config.parallelism.max(1);

        loop {
            while running.len() < parallelism && !self.cancel.is_cancelled() {
                let Some(index) = ready.pop_first() else {
                    break;
                };
                let entry = &plan.entries()[index];
                match self.prepare(entry, &known) {
                    Ok(None) => {
                        reports[index].status = EntryStatus::Unchanged;
                        release_successors(plan, &reports, &successors[index], &mut ready);
                    }
                    Ok(Some((provider, operation))) => {
                        log::debug!("Dispatching {} {}", entry.action, entry.id);
                        reports[index].status = EntryStatus::Running;
                        let handle = join_set.spawn(operation.run(provider, self.config.retry));
                        running.insert(handle.id(), index);
                    }
                    Err(error) => fail(&mut reports, &successors, index, error),
                }
            }

            let Some(joined) = join_set.join_next_with_id().await else {
                break;
            };
            let (index, result) = match joined {
                Ok((task_id, result)) => (running.remove(&task_id), result),
                Err(join_error) => (
                    running.remove(&join_error.id()),
                    Err(ProviderError::new(format!("Task failed: {}", join_error))),
                ),
            };
            let Some(index) = index else {
                continue;
            };

            match result {
                Ok(outcome) => {
                    log::info!("{} {}: applied", reports[index].action, reports[index].id);
                    match &outcome {
                        EntryOutcome::Deleted(id) => {
                            known.remove(id);
                        }
                        other => {
                            if let Some(state) = other.state() {
                                known.insert(state.id.clone(), state.clone());
                            }
                        }
                    }
                    reports[index].status = EntryStatus::Applied;
                    reports[index].outcome = Some(outcome);
                    release_successors(plan, &reports, &successors[index], &mut ready);
                }
                Err(error) => fail(&mut reports, &successors, index, error),
            }
        }

        let cancelled = self.cancel.is_cancelled();
        for report in &mut reports {
            if report.status == EntryStatus::Pending {
                report.skip(if cancelled {
                    "run cancelled"
                } else {
                    "not reached"
                });
            }
        }

        ApplyReport {
            entries: reports,
            cancelled,
        }
    }

    /// Resolve an entry into a provider operation. `None` for NoOp entries.
    fn prepare(
        &self,
        entry: &ChangeEntry,
        known: &HashMap<ResourceId, State>,
    ) -> ProviderResult<Option<(Arc<dyn Provider>, Operation)>> {
        if entry.action == Action::NoOp {
            return Ok(None);
        }
        let provider = self.registry.require(&entry.id)?;

        let kind = match entry.action {
            Action::Delete => OperationKind::Delete {
                identifier: recorded_identifier(entry)?,
            },
            Action::Create | Action::Update => {
                let desired = entry.desired.as_ref().ok_or_else(|| {
                    ProviderError::new("Entry has no desired resource").for_resource(entry.id.clone())
                })?;
                let resolved = desired
                    .resolve(&|target, attribute| {
                        known.get(target).and_then(|s| s.attribute(attribute))
                    })
                    .map_err(|e| ProviderError::new(e.to_string()).for_resource(entry.id.clone()))?;
                let dependencies = desired.dependencies().into_iter().collect();

                if entry.action == Action::Create {
                    OperationKind::Create {
                        resource: resolved,
                        dependencies,
                    }
                } else {
                    let from = entry.current.clone().ok_or_else(|| {
                        ProviderError::new("Update has no recorded state").for_resource(entry.id.clone())
                    })?;
                    OperationKind::Update {
                        identifier: recorded_identifier(entry)?,
                        from,
                        to: resolved,
                        dependencies,
                    }
                }
            }
            Action::NoOp => return Ok(None),
        };

        Ok(Some((
            provider,
            Operation {
                id: entry.id.clone(),
                kind,
                replacement: entry.replacement,
            },
        )))
    }
}

fn recorded_identifier(entry: &ChangeEntry) -> ProviderResult<String> {
    entry
        .current
        .as_ref()
        .and_then(|s| s.identifier.clone())
        .ok_or_else(|| {
            ProviderError::new("No provider identifier recorded").for_resource(entry.id.clone())
        })
}

/// Queue successors whose predecessors have all succeeded
fn release_successors(
    plan: &Plan,
    reports: &[EntryReport],
    successors: &[usize],
    ready: &mut BTreeSet<usize>,
) {
    for &next in successors {
        if reports[next].status == EntryStatus::Pending
            && plan.entries()[next]
                .predecessors
                .iter()
                .all(|p| reports[*p].status.is_success())
        {
            ready.insert(next);
        }
    }
}

/// Mark an entry failed and skip everything downstream of it
fn fail(reports: &mut [EntryReport], successors: &[Vec<usize>], index: usize, error: ProviderError) {
    log::error!("{} {} failed: {}", reports[index].action, reports[index].id, error);
    let failed_id = reports[index].id.clone();
    reports[index].status = EntryStatus::Failed;
    reports[index].error = Some(error);

    let mut stack = successors[index].clone();
    while let Some(next) = stack.pop() {
        if reports[next].status == EntryStatus::Pending {
            log::debug!("Skipping {}: {} failed", reports[next].id, failed_id);
            reports[next].skip(format!("dependency {} failed", failed_id));
            stack.extend(&successors[next]);
        }
    }
}

/// Provider call for one entry, with references already resolved
struct Operation {
    id: ResourceId,
    kind: OperationKind,
    replacement: bool,
}

enum OperationKind {
    Create {
        resource: Resource,
        dependencies: Vec<ResourceId>,
    },
    Update {
        identifier: String,
        from: State,
        to: Resource,
        dependencies: Vec<ResourceId>,
    },
    Delete {
        identifier: String,
    },
}

impl Operation {
    async fn run(self, provider: Arc<dyn Provider>, policy: RetryPolicy) -> ProviderResult<EntryOutcome> {
        let id = self.id;
        let provider = provider.as_ref();
        let result = match self.kind {
            OperationKind::Create {
                resource,
                dependencies,
            } => create(provider, &resource, &dependencies, &policy)
                .await
                .map(|state| {
                    if self.replacement {
                        EntryOutcome::Replaced(state)
                    } else {
                        EntryOutcome::Created(state)
                    }
                }),
            OperationKind::Update {
                identifier,
                from,
                to,
                dependencies,
            } => update(provider, &identifier, &from, &to, &dependencies, &policy).await,
            OperationKind::Delete { identifier } => delete(provider, &id, &identifier, &policy)
                .await
                .map(|()| EntryOutcome::Deleted(id.clone())),
        };
        result.map_err(|e| match e.resource_id {
            Some(_) => e,
            None => e.for_resource(id),
        })
    }
}

async fn create(
    provider: &dyn Provider,
    resource: &Resource,
    dependencies: &[ResourceId],
    policy: &RetryPolicy,
) -> ProviderResult<State> {
    let label = format!("create {}", resource.id);
    let created = with_retry(policy, RetryOn::Transient, &label, || provider.create(resource)).await?;
    Ok(applied_state(resource, created, dependencies))
}

async fn update(
    provider: &dyn Provider,
    identifier: &str,
    from: &State,
    to: &Resource,
    dependencies: &[ResourceId],
    policy: &RetryPolicy,
) -> ProviderResult<EntryOutcome> {
    let label = format!("update {}", to.id);
    let outcome = with_retry(policy, RetryOn::Transient, &label, || {
        provider.update(&to.id, identifier, from, to)
    })
    .await?;

    match outcome {
        UpdateOutcome::Updated(state) => Ok(EntryOutcome::Updated(applied_state(to, state, dependencies))),
        UpdateOutcome::RequiresReplacement => {
            log::info!("{} cannot be updated in place, replacing", to.id);
            delete(provider, &to.id, identifier, policy).await?;
            let state = create(provider, to, dependencies, policy).await?;
            Ok(EntryOutcome::Replaced(state))
        }
    }
}

async fn delete(
    provider: &dyn Provider,
    id: &ResourceId,
    identifier: &str,
    policy: &RetryPolicy,
) -> ProviderResult<()> {
    let label = format!("delete {}", id);
    with_retry(policy, RetryOn::Transient, &label, || provider.delete(id, identifier)).await
}

/// State to record for an applied resource.
///
/// Inputs are recorded as they were sent, so diffing the same configuration
/// again yields no changes.
fn applied_state(resource: &Resource, returned: State, dependencies: &[ResourceId]) -> State {
    State {
        id: resource.id.clone(),
        identifier: returned.identifier,
        attributes: resource.attributes.clone(),
        outputs: returned.outputs,
        dependencies: dependencies.to_vec(),
        exists: true,
    }
}
