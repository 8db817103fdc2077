use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use crate::branch::Branch;
use crate::config::EngineConfig;
use crate::reporter::TracingReporter;
use crate::runner::Runner;
use crate::tree::{InMemoryTree, TreeSource};

#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Trellis - a branching test-tree execution engine", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a branch tree
    Run {
        /// Branch-tree JSON file (falls back to the configured default)
        tree: Option<String>,

        /// Number of concurrent run instances
        #[arg(short = 'i', long = "instances")]
        instances: Option<usize>,

        /// Pause on the first failed or unexpected step
        #[arg(long)]
        pause_on_fail: bool,
    },

    /// Write a default trellis.toml to the current directory
    Init {
        /// Overwrite an existing file
        #[arg(short = 'f', long = "force")]
        force: bool,
    },
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

/// Run the CLI with provided arguments (for callers that need to filter args)
pub async fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args);
    run_cli_with_args(cli).await
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    if let Some(config_path) = &cli.config {
        std::env::set_var("TRELLIS_CONFIG_PATH", config_path);
    }

    // Load eagerly so config errors surface before any command output
    let config = EngineConfig::load()?;

    match cli.command {
        Commands::Run {
            tree,
            instances,
            pause_on_fail,
        } => {
            let path = tree
                .or_else(|| config.tree.clone())
                .context("no branch tree given; pass a file or set `tree` in trellis.toml")?;
            let instances = instances.unwrap_or(config.instances);
            let pause_on_fail = pause_on_fail || config.pause_on_fail;

            run_tree(&path, &config, instances, pause_on_fail).await?;
        }

        Commands::Init { force } => {
            let path = Path::new("trellis.toml");
            if path.exists() && !force {
                anyhow::bail!("trellis.toml already exists (use --force to overwrite)");
            }
            std::fs::write(path, EngineConfig::default_toml()?)
                .context("failed to write trellis.toml")?;
            println!("Wrote {}", path.display());
        }
    }

    Ok(())
}

async fn run_tree(
    path: &str,
    config: &EngineConfig,
    instances: usize,
    pause_on_fail: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read branch tree {}", path))?;
    let branches: Vec<Branch> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse branch tree {}", path))?;

    let branch_count = branches.len();
    tracing::info!(tree = path, branches = branch_count, instances, "starting run");

    let tree = Arc::new(InMemoryTree::new(branches));
    let mut runner = Runner::new(
        Arc::clone(&tree) as Arc<dyn TreeSource>,
        Arc::new(TracingReporter),
    );
    runner.fragment_fuel = config.fragment_fuel;
    let runner = Arc::new(runner);
    if pause_on_fail {
        runner.arm_pause_on_fail();
    }
    if config.run_one_step {
        runner.arm_run_one_step();
    }

    let (completed, _instances) = runner.run_all(instances).await;
    let stats = tree.stats();

    let elapsed = Utc::now().signed_duration_since(tree.started_at());
    println!(
        "Ran {} of {} branch(es) in {}ms",
        stats.branches_passed + stats.branches_failed,
        branch_count,
        elapsed.num_milliseconds()
    );
    println!(
        "  passed: {}  failed: {}  steps: {} passed / {} failed",
        stats.branches_passed, stats.branches_failed, stats.steps_passed, stats.steps_failed
    );

    if !completed {
        anyhow::bail!("run did not complete (an instance paused)");
    }
    if stats.branches_failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
