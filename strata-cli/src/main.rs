use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;

mod commands;
mod display;
mod error;

use commands::{ApplyOptions, Context};
use error::EXIT_ABORTED;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Declarative infrastructure reconciliation", long_about = None)]
struct Cli {
    /// Directory holding state snapshots and lock files
    #[arg(long, global = true, env = "STRATA_STATE_DIR", default_value = ".strata")]
    state_dir: PathBuf,

    /// Environment whose state is read and written
    #[arg(long, global = true, env = "STRATA_ENV", default_value = "default")]
    env: String,

    /// State backend; `memory` keeps state and lock only for this process
    #[arg(
        long,
        global = true,
        env = "STRATA_BACKEND",
        default_value = "local",
        value_parser = ["local", "memory"]
    )]
    backend: String,

    /// File the local provider persists its simulated account to
    #[arg(long, global = true, env = "STRATA_CLOUD")]
    cloud: Option<PathBuf>,

    /// Throttle every Nth provider call with a transient error
    #[arg(long, global = true, env = "STRATA_THROTTLE_EVERY")]
    throttle_every: Option<u64>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file
    Validate {
        /// Path to configuration file
        #[arg(default_value = "strata.json")]
        file: PathBuf,
    },
    /// Show execution plan without applying changes
    Plan {
        /// Path to configuration file
        #[arg(default_value = "strata.json")]
        file: PathBuf,

        /// Refresh recorded state against live resources first
        #[arg(long)]
        refresh: bool,

        /// Seconds to wait for the state lock
        #[arg(long, default_value_t = 30)]
        lock_timeout: u64,
    },
    /// Apply changes to reach the desired state
    Apply {
        /// Path to configuration file
        #[arg(default_value = "strata.json")]
        file: PathBuf,

        /// Maximum number of concurrent provider operations
        #[arg(long, default_value_t = 4)]
        parallelism: usize,

        /// Seconds to wait for the state lock
        #[arg(long, default_value_t = 30)]
        lock_timeout: u64,

        /// Refresh recorded state against live resources first
        #[arg(long)]
        refresh: bool,

        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Destroy recorded resources, dependents first
    Destroy {
        /// Only destroy resources declared in this configuration file
        file: Option<PathBuf>,

        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,

        /// Seconds to wait for the state lock
        #[arg(long, default_value_t = 30)]
        lock_timeout: u64,
    },
    /// Reconcile recorded state with live resources
    Refresh {
        /// Seconds to wait for the state lock
        #[arg(long, default_value_t = 30)]
        lock_timeout: u64,
    },
    /// Inspect recorded state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Release a lock left behind by a crashed run
    ForceUnlock {
        /// ID of the lock to release
        lock_id: String,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// List recorded resources
    List,
    /// Show one recorded resource
    Show {
        /// Resource address, e.g. dynamodb.table.users
        address: String,
    },
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("STRATA_LOG", default_level))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let ctx = Context {
        state_dir: cli.state_dir,
        env: cli.env,
        backend: cli.backend,
        cloud: cli.cloud,
        throttle_every: cli.throttle_every,
    };

    let result = match cli.command {
        Commands::Validate { file } => commands::run_validate(&ctx, &file),
        Commands::Plan {
            file,
            refresh,
            lock_timeout,
        } => commands::run_plan(&ctx, &file, refresh, Duration::from_secs(lock_timeout)).await,
        Commands::Apply {
            file,
            parallelism,
            lock_timeout,
            refresh,
            auto_approve,
        } => {
            let options = ApplyOptions {
                parallelism,
                lock_timeout: Duration::from_secs(lock_timeout),
                refresh,
                auto_approve,
            };
            commands::run_apply(&ctx, &file, &options).await
        }
        Commands::Destroy {
            file,
            auto_approve,
            lock_timeout,
        } => {
            commands::run_destroy(
                &ctx,
                file.as_deref(),
                auto_approve,
                Duration::from_secs(lock_timeout),
            )
            .await
        }
        Commands::Refresh { lock_timeout } => {
            commands::run_refresh(&ctx, Duration::from_secs(lock_timeout)).await
        }
        Commands::State { command } => match command {
            StateCommands::List => commands::run_state_list(&ctx).await,
            StateCommands::Show { address } => commands::run_state_show(&ctx, &address).await,
        },
        Commands::ForceUnlock { lock_id } => commands::run_force_unlock(&ctx, &lock_id).await,
    };

    match result {
        Ok(outcome) => std::process::exit(outcome.exit_code()),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(EXIT_ABORTED);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_apply_flags() {
        let cli = Cli::parse_from([
            "strata",
            "--env",
            "staging",
            "apply",
            "api.json",
            "--parallelism",
            "8",
            "--auto-approve",
        ]);
        assert_eq!(cli.env, "staging");
        match cli.command {
            Commands::Apply {
                file,
                parallelism,
                auto_approve,
                refresh,
                ..
            } => {
                assert_eq!(file, PathBuf::from("api.json"));
                assert_eq!(parallelism, 8);
                assert!(auto_approve);
                assert!(!refresh);
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn destroy_file_is_optional() {
        let cli = Cli::parse_from(["strata", "destroy", "--auto-approve"]);
        assert!(matches!(
            cli.command,
            Commands::Destroy { file: None, auto_approve: true, .. }
        ));
    }

    #[test]
    fn rejects_unknown_backend() {
        assert!(Cli::try_parse_from(["strata", "--backend", "s3", "refresh"]).is_err());
    }
}
