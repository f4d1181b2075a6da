//! Command implementations
//!
//! Every command that reads state does so inside a [`StateSession`], and every
//! path out of a session releases the lock.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use strata_core::config::{ConfigError, Configuration};
use strata_core::differ::{create_plan, destroy_plan};
use strata_core::executor::{ApplyReport, CancelSignal, Executor, ExecutorConfig};
use strata_core::graph::ResourceGraph;
use strata_core::plan::{Action, Plan};
use strata_core::provider::ProviderRegistry;
use strata_core::refresh::refresh;
use strata_core::resource::{ResourceId, State, Value};
use strata_core::retry::RetryPolicy;
use strata_core::schema::validate_resources;
use strata_provider_local::{LocalProvider, LocalProviderConfig};
use strata_state::{BackendConfig, StateBackend, StateSession, create_backend};

use crate::display;
use crate::error::{CliError, Outcome};

/// Where state lives and which simulated account the provider talks to
#[derive(Debug, Clone)]
pub struct Context {
    pub state_dir: PathBuf,
    pub env: String,
    /// Backend type ("local" or "memory")
    pub backend: String,
    pub cloud: Option<PathBuf>,
    pub throttle_every: Option<u64>,
}

impl Context {
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig::new(&self.backend)
            .with_attribute("path", Value::string(self.state_dir.display().to_string()))
            .with_attribute("key", Value::string(&self.env))
    }

    pub async fn backend(&self) -> Result<Arc<dyn StateBackend>, CliError> {
        if self.backend == "memory" {
            log::warn!("Memory backend: state and lock are discarded when this command exits");
        }
        Ok(Arc::from(create_backend(&self.backend_config()).await?))
    }

    pub fn cloud_path(&self) -> PathBuf {
        self.cloud
            .clone()
            .unwrap_or_else(|| self.state_dir.join("cloud.json"))
    }

    fn provider_config(&self) -> LocalProviderConfig {
        LocalProviderConfig {
            throttle_every: self.throttle_every,
            persist_path: Some(self.cloud_path()),
            ..Default::default()
        }
    }

    /// Registry backed by the persisted simulated account
    pub async fn registry(&self) -> Result<ProviderRegistry, CliError> {
        let provider = LocalProvider::open(self.provider_config()).await?;
        Ok(ProviderRegistry::new().with_provider(Arc::new(provider)))
    }

    /// Registry for schema lookups only; never touches the account
    pub fn schema_registry(&self) -> ProviderRegistry {
        let provider = LocalProvider::new(LocalProviderConfig::default());
        ProviderRegistry::new().with_provider(Arc::new(provider))
    }
}

/// Options of the apply command
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub parallelism: usize,
    pub lock_timeout: Duration,
    pub refresh: bool,
    pub auto_approve: bool,
}

/// Read, build and validate a configuration
pub fn load_graph(file: &Path, registry: &ProviderRegistry) -> Result<ResourceGraph, CliError> {
    let graph = Configuration::from_path(file)?.into_graph()?;
    validate_resources(graph.resources(), registry.schemas()).map_err(ConfigError::Validation)?;
    log::debug!("Loaded {} resources from {}", graph.len(), file.display());
    Ok(graph)
}

/// Release the session's lock, keeping the first error
async fn finish<T>(session: StateSession, result: Result<T, CliError>) -> Result<T, CliError> {
    match session.close().await {
        Ok(()) => result,
        Err(e) if result.is_err() => {
            log::error!("Failed to release state lock: {}", e);
            result
        }
        Err(e) => Err(e.into()),
    }
}

fn confirm(question: &str) -> Result<bool, CliError> {
    print!("{} Only 'yes' will be accepted: ", question.bold());
    std::io::stdout().flush().map_err(CliError::Prompt)?;

    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .map_err(CliError::Prompt)?;
    println!();
    Ok(input.trim() == "yes")
}

/// Deletes in `plan` that touch protected resources
fn protected_deletes(plan: &Plan, protected: &BTreeSet<ResourceId>) -> Vec<ResourceId> {
    plan.entries()
        .iter()
        .filter(|e| e.action == Action::Delete && protected.contains(&e.id))
        .map(|e| e.id.clone())
        .collect()
}

fn check_protected(plan: &Plan, protected: &BTreeSet<ResourceId>) -> Result<(), CliError> {
    let blocked = protected_deletes(plan, protected);
    if blocked.is_empty() {
        Ok(())
    } else {
        Err(CliError::Protected(blocked))
    }
}

/// Cancel `signal` on Ctrl-C until the returned handle is aborted
fn watch_ctrl_c(signal: CancelSignal) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\n{}",
                "Interrupt received: finishing in-flight changes, starting no new ones.".yellow()
            );
            signal.cancel();
        }
    })
}

/// Entries whose provider call took effect
fn unrecorded_changes(report: &ApplyReport) -> Vec<String> {
    report
        .entries
        .iter()
        .filter(|entry| entry.outcome.is_some())
        .map(|entry| format!("{} {}", entry.action, entry.id))
        .collect()
}

/// Run a plan through the executor and record the outcome in the session
async fn execute(
    session: &mut StateSession,
    registry: &ProviderRegistry,
    plan: &Plan,
    parallelism: usize,
) -> Result<Outcome, CliError> {
    let cancel = CancelSignal::new();
    let watcher = watch_ctrl_c(cancel.clone());

    println!("{}", "Applying changes...".cyan().bold());
    let executor = Executor::new(registry.clone())
        .with_config(ExecutorConfig {
            parallelism,
            ..Default::default()
        })
        .with_cancel_signal(cancel);
    let report = executor.apply(plan, session.current_states()).await;
    watcher.abort();

    let recorded = session.record(&report, registry);
    log::debug!("Recorded {} state changes", recorded);
    display::print_report(&report);

    // Resources were already changed, so a failed write is a partial failure
    if let Err(e) = session.commit().await {
        eprintln!("{} Failed to save state: {}", "Error:".red().bold(), e);
        eprintln!("Changes applied but not recorded in state:");
        for change in unrecorded_changes(&report) {
            eprintln!("  {}", change);
        }
        return Ok(Outcome::PartialFailure);
    }

    if report.is_success() && !report.cancelled {
        Ok(Outcome::Success)
    } else {
        Ok(Outcome::PartialFailure)
    }
}

pub fn run_validate(ctx: &Context, file: &Path) -> Result<Outcome, CliError> {
    let graph = load_graph(file, &ctx.schema_registry())?;
    println!(
        "{}",
        format!("Configuration is valid ({} resources).", graph.len()).green()
    );
    Ok(Outcome::Success)
}

pub async fn run_plan(
    ctx: &Context,
    file: &Path,
    refresh_first: bool,
    lock_timeout: Duration,
) -> Result<Outcome, CliError> {
    let registry = ctx.registry().await?;
    let graph = load_graph(file, &registry)?;

    let session = StateSession::begin(ctx.backend().await?, "plan", lock_timeout).await?;
    let result = plan_locked(&session, &registry, &graph, refresh_first).await;
    let plan = finish(session, result).await?;

    display::print_plan(&plan);
    Ok(if plan.has_changes() {
        Outcome::Success
    } else {
        Outcome::NoChanges
    })
}

async fn plan_locked(
    session: &StateSession,
    registry: &ProviderRegistry,
    graph: &ResourceGraph,
    refresh_first: bool,
) -> Result<Plan, CliError> {
    let current: HashMap<ResourceId, State> = if refresh_first {
        let report = refresh(registry, session.current_states(), &RetryPolicy::default()).await?;
        display::print_refresh(&report);
        report.states
    } else {
        session.current_states().clone()
    };

    let plan = create_plan(graph, &current, registry.schemas())?;
    check_protected(&plan, &session.protected())?;
    Ok(plan)
}

pub async fn run_apply(
    ctx: &Context,
    file: &Path,
    options: &ApplyOptions,
) -> Result<Outcome, CliError> {
    let registry = ctx.registry().await?;
    let graph = load_graph(file, &registry)?;

    let mut session =
        StateSession::begin(ctx.backend().await?, "apply", options.lock_timeout).await?;
    let result = apply_locked(&mut session, &registry, &graph, options).await;
    finish(session, result).await
}

async fn apply_locked(
    session: &mut StateSession,
    registry: &ProviderRegistry,
    graph: &ResourceGraph,
    options: &ApplyOptions,
) -> Result<Outcome, CliError> {
    if options.refresh {
        let report = refresh(registry, session.current_states(), &RetryPolicy::default()).await?;
        display::print_refresh(&report);
        session.record_refresh(&report);
    }

    let plan = create_plan(graph, session.current_states(), registry.schemas())?;
    check_protected(&plan, &session.protected())?;
    display::print_plan(&plan);

    if !plan.has_changes() {
        if session.is_dirty() {
            session.commit().await?;
        }
        return Ok(Outcome::NoChanges);
    }

    println!();
    if !options.auto_approve && !confirm("Do you want to apply these changes?")? {
        return Err(CliError::Declined);
    }

    execute(session, registry, &plan, options.parallelism).await
}

pub async fn run_destroy(
    ctx: &Context,
    file: Option<&Path>,
    auto_approve: bool,
    lock_timeout: Duration,
) -> Result<Outcome, CliError> {
    let registry = ctx.registry().await?;
    let selected: Option<BTreeSet<ResourceId>> = match file {
        Some(file) => Some(
            load_graph(file, &registry)?
                .resources()
                .map(|r| r.id.clone())
                .collect(),
        ),
        None => None,
    };

    let mut session = StateSession::begin(ctx.backend().await?, "destroy", lock_timeout).await?;
    let result = destroy_locked(&mut session, &registry, selected.as_ref(), auto_approve).await;
    finish(session, result).await
}

async fn destroy_locked(
    session: &mut StateSession,
    registry: &ProviderRegistry,
    selected: Option<&BTreeSet<ResourceId>>,
    auto_approve: bool,
) -> Result<Outcome, CliError> {
    let targets: HashMap<ResourceId, State> = session
        .current_states()
        .iter()
        .filter(|(id, _)| selected.is_none_or(|s| s.contains(*id)))
        .map(|(id, state)| (id.clone(), state.clone()))
        .collect();

    let plan = destroy_plan(&targets)?;
    check_protected(&plan, &session.protected())?;
    if !plan.has_changes() {
        println!("{}", "No resources to destroy.".green());
        return Ok(Outcome::NoChanges);
    }

    display::print_plan(&plan);
    println!();
    if !auto_approve && !confirm("Do you really want to destroy these resources?")? {
        return Err(CliError::Declined);
    }

    execute(session, registry, &plan, ExecutorConfig::default().parallelism).await
}

pub async fn run_refresh(ctx: &Context, lock_timeout: Duration) -> Result<Outcome, CliError> {
    let registry = ctx.registry().await?;
    let mut session = StateSession::begin(ctx.backend().await?, "refresh", lock_timeout).await?;
    let result = refresh_locked(&mut session, &registry).await;
    finish(session, result).await
}

async fn refresh_locked(
    session: &mut StateSession,
    registry: &ProviderRegistry,
) -> Result<Outcome, CliError> {
    let report = refresh(registry, session.current_states(), &RetryPolicy::default()).await?;
    display::print_refresh(&report);
    if !report.has_changes() {
        return Ok(Outcome::NoChanges);
    }
    session.record_refresh(&report);
    session.commit().await?;
    Ok(Outcome::Success)
}

/// Read the state without taking the lock
async fn read_state_file(ctx: &Context) -> Result<strata_state::StateFile, CliError> {
    let backend = ctx.backend().await?;
    Ok(backend.read_state().await?.unwrap_or_default())
}

pub async fn run_state_list(ctx: &Context) -> Result<Outcome, CliError> {
    let state = read_state_file(ctx).await?;
    if state.resources.is_empty() {
        println!("{}", "No resources in state.".dimmed());
        return Ok(Outcome::NoChanges);
    }
    print!("{}", display::render_state_list(&state));
    Ok(Outcome::Success)
}

pub async fn run_state_show(ctx: &Context, address: &str) -> Result<Outcome, CliError> {
    let id: ResourceId = address.parse()?;
    let state = read_state_file(ctx).await?;
    let resource = state
        .find_resource(&id.resource_type, &id.name)
        .ok_or(CliError::NotInState(id))?;
    println!("{}", display::render_resource(resource));
    Ok(Outcome::Success)
}

pub async fn run_force_unlock(ctx: &Context, lock_id: &str) -> Result<Outcome, CliError> {
    let backend = ctx.backend().await?;
    backend.force_unlock(lock_id).await?;
    println!("{}", format!("Lock {} released.", lock_id).green());
    Ok(Outcome::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use strata_provider_local::cloud::Cloud;

    const CONFIG: &str = r#"{
        "resources": {
            "iam.role.exec": {
                "attributes": {
                    "name": "api-exec",
                    "assume_role_policy": "{\"Version\":\"2012-10-17\"}"
                }
            },
            "dynamodb.table.users": {
                "attributes": { "name": "Users", "hash_key": "UserID" }
            },
            "lambda.function.api": {
                "attributes": {
                    "function_name": "users-api",
                    "role": { "$ref": "iam.role.exec.arn" },
                    "runtime": "python3.12",
                    "handler": "lambda.lambda_handler",
                    "environment": { "TABLE_NAME": { "$ref": "dynamodb.table.users.name" } }
                }
            }
        }
    }"#;

    fn context(dir: &Path) -> Context {
        Context {
            state_dir: dir.join("state"),
            env: "test".to_string(),
            backend: "local".to_string(),
            cloud: None,
            throttle_every: None,
        }
    }

    fn write_config(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("strata.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    fn apply_options() -> ApplyOptions {
        ApplyOptions {
            parallelism: 4,
            lock_timeout: Duration::from_secs(1),
            refresh: false,
            auto_approve: true,
        }
    }

    #[test]
    fn validate_reports_schema_errors() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let file = write_config(
            dir.path(),
            r#"{ "resources": { "dynamodb.table.users": { "attributes": { "name": "Users" } } } }"#,
        );
        let err = run_validate(&ctx, &file).unwrap_err();
        assert!(matches!(err, CliError::Config(ConfigError::Validation(_))));
        assert!(err.to_string().contains("hash_key"));
    }

    #[tokio::test]
    async fn apply_then_plan_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let file = write_config(dir.path(), CONFIG);

        let outcome = run_apply(&ctx, &file, &apply_options()).await.unwrap();
        assert_eq!(outcome, Outcome::Success);

        let outcome = run_plan(&ctx, &file, false, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::NoChanges);

        let outcome = run_apply(&ctx, &file, &apply_options()).await.unwrap();
        assert_eq!(outcome, Outcome::NoChanges);

        // Lock released on every path
        let backend = ctx.backend().await.unwrap();
        assert!(backend.current_lock().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn serverless_demo_converges() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let file = Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos/serverless-api.json");

        assert_eq!(run_validate(&ctx, &file).unwrap(), Outcome::Success);
        let outcome = run_apply(&ctx, &file, &apply_options()).await.unwrap();
        assert_eq!(outcome, Outcome::Success);

        let state = read_state_file(&ctx).await.unwrap();
        assert_eq!(state.resources.len(), 11);

        let outcome = run_plan(&ctx, &file, true, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::NoChanges);
    }

    #[tokio::test]
    async fn refresh_recreates_evicted_resource() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let file = write_config(dir.path(), CONFIG);
        run_apply(&ctx, &file, &apply_options()).await.unwrap();

        // Delete the table out of band
        let cloud_path = ctx.cloud_path();
        let mut cloud = Cloud::load(&cloud_path).await.unwrap();
        assert!(cloud.remove("dynamodb.table", "Users").is_some());
        cloud.save(&cloud_path).await.unwrap();

        let outcome = run_refresh(&ctx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, Outcome::Success);

        let outcome = run_plan(&ctx, &file, false, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn destroy_empties_state() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let file = write_config(dir.path(), CONFIG);
        run_apply(&ctx, &file, &apply_options()).await.unwrap();

        let outcome = run_destroy(&ctx, None, true, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Success);

        let state = read_state_file(&ctx).await.unwrap();
        assert!(state.resources.is_empty());

        let outcome = run_destroy(&ctx, None, true, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::NoChanges);
    }

    #[tokio::test]
    async fn lost_lock_after_apply_is_partial_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let file = write_config(dir.path(), CONFIG);
        let registry = ctx.registry().await.unwrap();
        let graph = load_graph(&file, &registry).unwrap();

        let backend = ctx.backend().await.unwrap();
        let mut session = StateSession::begin(backend, "apply", Duration::from_secs(1))
            .await
            .unwrap();
        let plan = create_plan(&graph, session.current_states(), registry.schemas()).unwrap();

        // Another operator breaks the lock while the apply runs
        let lock_id = session.lock().unwrap().id.clone();
        run_force_unlock(&ctx, &lock_id).await.unwrap();

        let outcome = execute(&mut session, &registry, &plan, 4).await.unwrap();
        assert_eq!(outcome, Outcome::PartialFailure);
        assert_eq!(outcome.exit_code(), 3);
        finish(session, Ok(())).await.unwrap();

        // Resources exist in the account but nothing was written to state
        let provider = LocalProvider::open(ctx.provider_config()).await.unwrap();
        assert_eq!(provider.object_count().await, 3);
        assert!(read_state_file(&ctx).await.unwrap().resources.is_empty());
    }

    #[tokio::test]
    async fn memory_backend_state_ends_with_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context {
            backend: "memory".to_string(),
            ..context(dir.path())
        };
        let file = write_config(dir.path(), CONFIG);

        let outcome = run_apply(&ctx, &file, &apply_options()).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(run_state_list(&ctx).await.unwrap(), Outcome::NoChanges);
        assert!(!ctx.state_dir.join("test.state.json").exists());
    }

    #[tokio::test]
    async fn held_lock_aborts_apply() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let file = write_config(dir.path(), CONFIG);

        let backend = ctx.backend().await.unwrap();
        let lock = backend.try_acquire_lock("apply").await.unwrap();

        let options = ApplyOptions {
            lock_timeout: Duration::from_millis(100),
            ..apply_options()
        };
        let err = run_apply(&ctx, &file, &options).await.unwrap_err();
        assert!(matches!(err, CliError::Backend(ref e) if e.is_lock_contention()));

        run_force_unlock(&ctx, &lock.id).await.unwrap();
        assert!(backend.current_lock().await.unwrap().is_none());
    }

    #[test]
    fn protected_resources_block_deletes() {
        let mut plan = Plan::new();
        let id = ResourceId::new("dynamodb.table", "users");
        plan.add(strata_core::plan::ChangeEntry::new(id.clone(), Action::Delete));

        let protected = BTreeSet::from([id.clone()]);
        assert!(matches!(
            check_protected(&plan, &protected),
            Err(CliError::Protected(ids)) if ids == vec![id]
        ));
        assert!(check_protected(&plan, &BTreeSet::new()).is_ok());
    }

    #[tokio::test]
    async fn state_show_unknown_address() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let err = run_state_show(&ctx, "dynamodb.table.users").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Resource dynamodb.table.users is not recorded in state"
        );
        assert!(matches!(
            run_state_show(&ctx, "nodot").await,
            Err(CliError::Address(_))
        ));
    }
}
