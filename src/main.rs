use clap::{Parser, Subcommand};
use converge::commands::{self, CommandContext, apply::ApplyOptions};
use converge::config::Config;
use converge::resource::ResourceId;
use converge::scheduler::ApplyStatus;
use converge::{EngineError, Result};
use std::path::PathBuf;

/// Exit code for applies that partially failed or were aborted; compute
/// errors (bad input, cycles, lock contention) exit 2.
const EXIT_PARTIAL: i32 = 1;
const EXIT_COMPUTE: i32 = 2;

#[derive(Parser)]
#[command(name = "converge")]
#[command(about = "Dependency-ordered plan/apply/destroy for declared resource topologies")]
#[command(version)]
struct Cli {
    /// Path to the state snapshot file
    #[arg(long, global = true, value_name = "FILE")]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what an apply would change, without mutating anything
    Plan {
        /// Resource-set document to plan from
        #[arg(short, long, value_name = "FILE", default_value = "resources.json")]
        file: PathBuf,
        /// Restrict to one resource identity and its dependencies
        #[arg(long, value_name = "TYPE.NAME")]
        target: Option<String>,
    },
    /// Plan and execute, converging the snapshot to the desired state
    Apply {
        /// Resource-set document to apply
        #[arg(short, long, value_name = "FILE", default_value = "resources.json")]
        file: PathBuf,
        /// Restrict to one resource identity and its dependencies
        #[arg(long, value_name = "TYPE.NAME")]
        target: Option<String>,
        /// Maximum provider calls in flight at once
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,
        /// On partial failure, converge back to the pre-apply snapshot
        #[arg(long)]
        rollback_on_failure: bool,
    },
    /// Delete every recorded resource, in reverse dependency order
    Destroy {
        /// Restrict to one resource identity and its dependents
        #[arg(long, value_name = "TYPE.NAME")]
        target: Option<String>,
        /// Maximum provider calls in flight at once
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,
    },
    /// Force-release a stale apply lock (operator action)
    Unlock,
}

fn parse_target(target: Option<&String>) -> Result<Option<ResourceId>> {
    target.map(|t| ResourceId::parse(t)).transpose()
}

fn run(cli: Cli) -> Result<i32> {
    // A broken config file should not brick the CLI; flags and defaults
    // still apply.
    let config = Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "could not load config, using defaults");
        Config::default()
    });
    let ctx = CommandContext::new(config, cli.state);

    match cli.command {
        Commands::Plan { file, target } => {
            let target = parse_target(target.as_ref())?;
            commands::plan::execute(&ctx, &file, target.as_ref())?;
            Ok(exitcode::OK)
        }
        Commands::Apply {
            file,
            target,
            concurrency,
            rollback_on_failure,
        } => {
            let target = parse_target(target.as_ref())?;
            let options = ApplyOptions {
                concurrency,
                rollback_on_failure,
            };
            let report = commands::apply::execute(&ctx, &file, target.as_ref(), &options)?;
            Ok(match report.status {
                ApplyStatus::Succeeded => exitcode::OK,
                _ => EXIT_PARTIAL,
            })
        }
        Commands::Destroy {
            target,
            concurrency,
        } => {
            let target = parse_target(target.as_ref())?;
            let report = commands::destroy::execute(&ctx, target.as_ref(), concurrency)?;
            Ok(match report.status {
                ApplyStatus::Succeeded => exitcode::OK,
                _ => EXIT_PARTIAL,
            })
        }
        Commands::Unlock => {
            commands::unlock::execute(&ctx)?;
            Ok(exitcode::OK)
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            match e {
                EngineError::PartialApply { .. } => EXIT_PARTIAL,
                _ => EXIT_COMPUTE,
            }
        }
    };
    std::process::exit(code);
}
