use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use conductor::config::Config;
use conductor::core::{DependencyResolver, SkillManifest};
use conductor::orchestration::{ExecutionPlanner, PlanRequest};
use conductor::state::{CheckpointId, StateManager};
use conductor::{clog, Error, Result};

/// Conductor - dependency-aware skill planning with checkpoints
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (default: ~/.conductor/conductor.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the execution order and parallel groups of a skill manifest
    Resolve {
        /// TOML manifest with [[skills]] tables
        manifest: PathBuf,
    },

    /// Build an execution plan and print it as JSON
    Plan {
        /// TOML manifest with [[skills]] tables
        manifest: PathBuf,

        /// Task description carried into the plan
        #[arg(long)]
        task: String,

        /// Candidate skill (repeatable; default: every skill in the manifest)
        #[arg(long = "skill")]
        skills: Vec<String>,
    },

    /// Manage checkpoints of tracked files
    Checkpoint {
        /// Project root the tracked paths are relative to
        #[arg(long, default_value = ".")]
        root: PathBuf,

        #[command(subcommand)]
        action: CheckpointCommand,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CheckpointCommand {
    /// Snapshot the tracked files
    Create {
        label: String,

        /// Start tracking a file before snapshotting (repeatable)
        #[arg(long)]
        track: Vec<PathBuf>,

        /// Record this skill on the checkpoint's skill stack
        #[arg(long)]
        skill: Option<String>,
    },

    /// List checkpoints in creation order
    List,

    /// Restore tracked files from a checkpoint
    Restore { id: String },

    /// Check that a checkpoint's stored contents are intact
    Verify { id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    conductor::log::init_with_debug(cli.debug);
    clog!("Conductor starting: {:?}", cli.command);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Resolve { manifest } => run_resolve(&manifest),
        Command::Plan {
            manifest,
            task,
            skills,
        } => run_plan(&config, &manifest, task, skills),
        Command::Checkpoint { root, action } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_checkpoint(&config, &root, action))
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_resolve(manifest: &Path) -> Result<()> {
    let manifest = SkillManifest::load(manifest)?;
    let order = DependencyResolver::new().resolve(&manifest.skills)?;
    print_json(&order)
}

fn run_plan(config: &Config, manifest: &Path, task: String, skills: Vec<String>) -> Result<()> {
    let registry = SkillManifest::load(manifest)?.into_registry()?;
    let candidates = if skills.is_empty() {
        registry.skills().iter().map(|s| s.name.clone()).collect()
    } else {
        skills
    };

    let planner = ExecutionPlanner::new(Arc::new(registry), config.planner_config());
    let plan = planner.create_plan(&PlanRequest::new(task, candidates))?;
    print_json(&plan)
}

async fn run_checkpoint(config: &Config, root: &Path, action: CheckpointCommand) -> Result<()> {
    let root = std::fs::canonicalize(root)?;
    let manager = StateManager::open(&root, &config.state_dir_for(&root)).await?;

    match action {
        CheckpointCommand::Create { label, track, skill } => {
            for path in track {
                manager.track(&path).await?;
            }
            if manager.tracked_files().await.is_empty() {
                return Err(Error::Validation(
                    "no tracked files; pass --track <path>".to_string(),
                ));
            }
            let checkpoint = manager.create_checkpoint(&label, skill.as_deref()).await?;
            println!(
                "Created {} '{}' ({} files, {} absent)",
                checkpoint.id,
                checkpoint.label,
                checkpoint.file_count(),
                checkpoint.absent_files.len()
            );
        }
        CheckpointCommand::List => {
            let checkpoints = manager.list_checkpoints().await;
            if checkpoints.is_empty() {
                println!("No checkpoints");
            }
            for checkpoint in checkpoints {
                println!(
                    "{}  {}  {:<24} {} files",
                    checkpoint.id,
                    checkpoint.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    checkpoint.label,
                    checkpoint.file_count()
                );
            }
        }
        CheckpointCommand::Restore { id } => {
            let id = CheckpointId::from(id);
            manager.restore_checkpoint(&id).await?;
            println!("Restored {}", id);
        }
        CheckpointCommand::Verify { id } => {
            let id = CheckpointId::from(id);
            match manager.check_checkpoint(&id).await {
                Ok(()) => println!("{}: ok", id),
                Err(e @ Error::CheckpointCorrupt { .. }) => {
                    println!("{}: corrupt", id);
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}
