//! Convoy CLI - multi-agent mission kernel.
//!
//! Single binary that provides:
//! - `convoy run` - plan and execute a mission
//! - `convoy status` - mission status from checkpoints
//! - `convoy resume` / `convoy approve` - continue a checkpointed mission
//! - `convoy workspace` - mission workspace management

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use convoy_core::{
    create_provider,
    observability::EventEmitter,
    planning::PlanFilePlanner,
    state::{CheckpointStore, ExecutionStrategy, FileCheckpointStore, InteractionMode, MissionState},
    workspace::WorktreeManager,
    ConvoyConfig, MissionCoordinator, WorkspaceReconciler,
};

const DEFAULT_PLAN: &str = ".convoy/plan.yaml";

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Multi-agent mission kernel", version)]
struct Cli {
    /// Project root directory
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and execute a mission
    Run {
        /// What the mission should accomplish
        #[arg(long)]
        request: String,

        /// YAML mission plan
        #[arg(long, default_value = DEFAULT_PLAN)]
        plan: PathBuf,

        /// full-auto, approve-plan, or step-by-step
        #[arg(long, default_value = "full-auto")]
        mode: String,

        /// Override the plan's strategy (sequential or parallel)
        #[arg(long)]
        strategy: Option<String>,
    },

    /// Show mission status
    Status {
        /// Mission id; lists all missions when omitted
        mission: Option<String>,
    },

    /// Resume a mission from its checkpoint
    Resume {
        mission: String,

        /// Work items to force back to pending
        #[arg(long, value_delimiter = ',')]
        retry: Vec<String>,

        /// YAML mission plan, if the mission has not been planned yet
        #[arg(long, default_value = DEFAULT_PLAN)]
        plan: PathBuf,
    },

    /// Approve a plan that is awaiting approval
    Approve {
        mission: String,

        #[arg(long, default_value = DEFAULT_PLAN)]
        plan: PathBuf,
    },

    /// Mission workspace management
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },

    /// Initialize a new project
    Init,
}

#[derive(Subcommand)]
enum WorkspaceCommands {
    /// List mission workspaces and their worktrees
    Ls,

    /// Remove workspaces of finished missions
    Cleanup {
        /// Also remove workspaces of unfinished missions
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));

    if cli.log_json {
        fmt().json().with_env_filter(filter).with_target(false).init();
    } else {
        fmt().with_env_filter(filter).with_target(false).init();
    }

    // Find project root
    let project_root = match cli.project {
        Some(path) => path,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match cli.command {
        Commands::Run {
            request,
            plan,
            mode,
            strategy,
        } => run_mission(&project_root, &request, &plan, &mode, strategy.as_deref()).await,
        Commands::Status { mission } => show_status(&project_root, mission.as_deref()),
        Commands::Resume { mission, retry, plan } => {
            let coordinator = build_coordinator(&project_root, &plan)?;
            let state = with_ctrl_c(&coordinator, coordinator.resume(&mission, &retry)).await?;
            print_summary(&state);
            Ok(())
        }
        Commands::Approve { mission, plan } => {
            let coordinator = build_coordinator(&project_root, &plan)?;
            let state = with_ctrl_c(&coordinator, coordinator.approve(&mission)).await?;
            print_summary(&state);
            Ok(())
        }
        Commands::Workspace { command } => handle_workspace(&project_root, command).await,
        Commands::Init => init_project(&project_root),
    }
}

fn load_config(project_root: &Path) -> Result<ConvoyConfig> {
    let mut config = ConvoyConfig::load_from_project(project_root)?;
    config.resolve_paths(project_root);
    Ok(config)
}

fn build_coordinator(project_root: &Path, plan: &Path) -> Result<MissionCoordinator> {
    let config = load_config(project_root)?;
    let reconciler = WorkspaceReconciler::from_config(&config.workspace);
    let provider = create_provider(&config, reconciler.clone())?;
    let checkpoints = Arc::new(FileCheckpointStore::new(&config.checkpoints_dir()));
    let events = EventEmitter::new(&config.events_path());
    let planner = Arc::new(PlanFilePlanner::new(&project_root.join(plan)));

    let mut coordinator =
        MissionCoordinator::new(config, project_root, planner, provider, checkpoints).with_events(events);
    if let Some(reconciler) = reconciler {
        coordinator = coordinator.with_reconciler(reconciler);
    }
    Ok(coordinator)
}

/// Run a mission future, cancelling the mission on Ctrl-C.
async fn with_ctrl_c<F>(coordinator: &MissionCoordinator, mission: F) -> Result<MissionState>
where
    F: std::future::Future<Output = Result<MissionState>>,
{
    let token = coordinator.cancellation_token();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling mission");
            token.cancel();
        }
    });

    let result = mission.await;
    watcher.abort();
    result
}

async fn run_mission(
    project_root: &Path,
    request: &str,
    plan: &Path,
    mode: &str,
    strategy: Option<&str>,
) -> Result<()> {
    let mode = InteractionMode::from_name(mode).with_context(|| format!("Unknown interaction mode: {}", mode))?;
    let strategy = match strategy {
        Some(name) => {
            Some(ExecutionStrategy::from_name(name).with_context(|| format!("Unknown strategy: {}", name))?)
        }
        None => None,
    };

    tracing::info!(project = %project_root.display(), "Starting mission");

    let coordinator = build_coordinator(project_root, plan)?;
    let state = with_ctrl_c(&coordinator, coordinator.start(request, mode, strategy)).await?;
    print_summary(&state);
    Ok(())
}

fn print_summary(state: &MissionState) {
    println!();
    println!("Mission {}: {}", state.mission_id, state.status);
    if let Some(objective) = &state.objective {
        println!("Objective: {}", objective);
    }
    println!("Waves: {}", state.wave);
    for item in state.work_items.iter() {
        println!(
            "  {:<12} {:<12} {:<10} iteration {}",
            item.id,
            item.worker_type.name(),
            format!("{:?}", item.status).to_lowercase(),
            item.iteration
        );
    }
    if let Some(metrics) = &state.metrics {
        println!(
            "Completed: {}, Failed: {}, Skipped: {}, Tests: {}/{}",
            metrics.items_completed, metrics.items_failed, metrics.items_skipped, metrics.tests_passed, metrics.tests_run
        );
    }
    for error in &state.errors {
        println!("  error: {}", error);
    }
    if state.status == convoy_core::state::MissionStatus::AwaitingApproval {
        println!();
        println!("Run 'convoy approve {}' to execute the plan.", state.mission_id);
    }
}

fn show_status(project_root: &Path, mission: Option<&str>) -> Result<()> {
    let config = load_config(project_root)?;
    let checkpoints = FileCheckpointStore::new(&config.checkpoints_dir());
    let events = EventEmitter::new(&config.events_path());

    if let Some(mission_id) = mission {
        let state = checkpoints
            .load(mission_id)?
            .with_context(|| format!("No checkpoint for mission {}", mission_id))?;
        print_summary(&state);
        println!();
        println!("Recent events:");
        for event in events.read_mission(mission_id, 10) {
            match &event.work_item_id {
                Some(item) => println!("  [{}] {} {}", event.event_type, item, event.message),
                None => println!("  [{}] {}", event.event_type, event.message),
            }
        }
        return Ok(());
    }

    println!("Convoy Status");
    println!("=============");
    println!();
    println!("Project: {}", project_root.display());
    println!();

    let ids = checkpoints.list()?;
    println!("Missions: {}", ids.len());
    for id in &ids {
        if let Some(state) = checkpoints.load(id)? {
            println!(
                "  - {} {} ({} items, wave {})",
                state.mission_id,
                state.status,
                state.work_items.len(),
                state.wave
            );
        }
    }
    println!();
    println!("Recent events:");
    for event in events.read_recent(5) {
        println!("  [{}] {} {}", event.event_type, event.mission_id, event.message);
    }

    Ok(())
}

async fn handle_workspace(project_root: &Path, command: WorkspaceCommands) -> Result<()> {
    let config = load_config(project_root)?;
    let checkpoints = FileCheckpointStore::new(&config.checkpoints_dir());

    let missions: Vec<String> = std::fs::read_dir(&config.workspace.workspaces_dir)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();

    match command {
        WorkspaceCommands::Ls => {
            println!("Mission workspaces: {}", missions.len());
            for mission_id in &missions {
                let manager = WorktreeManager::new(&config.workspace, mission_id);
                let active = manager.list_active();
                println!("  {} - {} worktrees", mission_id, active.len());
                for marker in active {
                    println!(
                        "    {} - branch: {}, created: {}",
                        marker.work_item_id, marker.branch, marker.created
                    );
                }
            }
        }
        WorkspaceCommands::Cleanup { all } => {
            let mut cleaned = 0;
            for mission_id in &missions {
                let finished = checkpoints
                    .load(mission_id)?
                    .map(|state| state.status.is_terminal())
                    .unwrap_or(true);
                if !finished && !all {
                    println!("  skipping {} (mission still active)", mission_id);
                    continue;
                }
                WorktreeManager::new(&config.workspace, mission_id)
                    .cleanup_mission()
                    .await;
                cleaned += 1;
            }
            println!("Cleaned {} mission workspaces", cleaned);
        }
    }

    Ok(())
}

fn init_project(project_root: &Path) -> Result<()> {
    let convoy_dir = project_root.join(".convoy");
    std::fs::create_dir_all(&convoy_dir)?;

    // Create default config
    let config_path = convoy_dir.join("config.yaml");
    if !config_path.exists() {
        let default_config = r#"# Convoy Configuration

max_parallel: 3

scheduling:
  defer_overlapping_targets: true
  wave_cooldown_secs: 0
  default_max_iterations: 3

execution:
  backend: local
  timeout_secs: 1800
  lenient_exit_code: true

workspace:
  # git_remote_url: https://github.com/org/repo
  git_token_env: GIT_TOKEN
  base_branch: main
  worktrees: false

gates:
  enabled: true
  review_threshold: 7
  commands: []
"#;
        std::fs::write(&config_path, default_config)?;
    }

    let plan_path = project_root.join(DEFAULT_PLAN);
    if !plan_path.exists() {
        let default_plan = r#"objective: Describe the mission objective
strategy: sequential
items:
  - id: ITEM-001
    worker_type: implementer
    description: Describe the first change
    success_criteria: The change builds and its tests pass
"#;
        std::fs::write(&plan_path, default_plan)?;
    }

    println!("Initialized Convoy project at {}", project_root.display());
    println!();
    println!("Created:");
    println!("  .convoy/config.yaml - kernel configuration");
    println!("  .convoy/plan.yaml   - mission plan");
    println!();
    println!("Next steps:");
    println!("  1. Describe the work items in .convoy/plan.yaml");
    println!("  2. Run: convoy run --request \"...\"");
    if !project_root.join(".git").exists() {
        println!();
        println!("Note: {} is not a git repository yet.", project_root.display());
    }

    Ok(())
}
