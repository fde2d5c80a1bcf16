//! Dispatcher - runs one wave of work items concurrently.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::runner::{Runner, UnitRun};
use crate::planning::{InstructionRenderer, ProjectContext, RoleInput};
use crate::state::WorkItem;
use crate::workspace::{CommitOutcome, WorkspaceReconciler, WorktreeManager};

/// One dispatched item, as reported back to the coordinator.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub work_item_id: String,
    pub run: UnitRun,
    /// Where the worker ran; gate units reuse it
    pub working_dir: PathBuf,
    pub completed_at: DateTime<Utc>,
}

/// Results of a wave, in wave order.
#[derive(Debug, Default)]
pub struct WaveOutcome {
    pub outcomes: Vec<DispatchOutcome>,
    pub cancelled: bool,
}

/// Fans a wave out over tokio tasks bounded by a semaphore.
pub struct WaveDispatcher {
    runner: Arc<Runner>,
    renderer: Arc<dyn InstructionRenderer>,
    worktrees: Option<Arc<WorktreeManager>>,
    reconciler: Option<WorkspaceReconciler>,
    max_parallel: usize,
}

impl WaveDispatcher {
    pub fn new(runner: Arc<Runner>, renderer: Arc<dyn InstructionRenderer>, max_parallel: usize) -> Self {
        Self {
            runner,
            renderer,
            worktrees: None,
            reconciler: None,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Run code-producing items in per-item worktrees and push their branches.
    pub fn with_worktrees(mut self, worktrees: Arc<WorktreeManager>, reconciler: WorkspaceReconciler) -> Self {
        self.worktrees = Some(worktrees);
        self.reconciler = Some(reconciler);
        self
    }

    pub fn worktrees(&self) -> Option<&Arc<WorktreeManager>> {
        self.worktrees.as_ref()
    }

    /// Dispatch every item and wait for all of them, or for cancellation.
    pub async fn dispatch(
        &self,
        items: Vec<WorkItem>,
        project_path: &Path,
        context: &ProjectContext,
        cancel: &CancellationToken,
    ) -> WaveOutcome {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut join_set: JoinSet<(usize, DispatchOutcome)> = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let instruction = self.renderer.render(&item, context, RoleInput::Work);
            let runner = Arc::clone(&self.runner);
            let semaphore = Arc::clone(&semaphore);
            let worktrees = self.worktrees.clone();
            let reconciler = self.reconciler.clone();
            let project_path = project_path.to_path_buf();

            join_set.spawn(async move {
                // Closed only on drop, which cannot happen while tasks hold the Arc
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = run_item(runner, worktrees, reconciler, item, instruction, project_path).await;
                (index, outcome)
            });
        }

        tracing::info!(items = join_set.len(), max_parallel = self.max_parallel, "Wave dispatched");

        let mut collected: Vec<(usize, DispatchOutcome)> = Vec::new();
        let mut cancelled = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!(in_flight = join_set.len(), "Cancellation requested, aborting wave");
                    join_set.abort_all();
                    cancelled = true;
                    break;
                }
                next = join_set.join_next() => match next {
                    Some(Ok(result)) => collected.push(result),
                    Some(Err(e)) => tracing::error!(error = %e, "Dispatch task failed"),
                    None => break,
                }
            }
        }

        collected.sort_by_key(|(index, _)| *index);
        WaveOutcome {
            outcomes: collected.into_iter().map(|(_, outcome)| outcome).collect(),
            cancelled,
        }
    }
}

async fn run_item(
    runner: Arc<Runner>,
    worktrees: Option<Arc<WorktreeManager>>,
    reconciler: Option<WorkspaceReconciler>,
    item: WorkItem,
    instruction: String,
    project_path: PathBuf,
) -> DispatchOutcome {
    let isolated = worktrees.filter(|_| item.worker_type.produces_code());

    let working_dir = match &isolated {
        Some(manager) => match manager.acquire(&item.id).await {
            Ok(path) => path,
            Err(e) => {
                let request = runner.request(item.worker_type, &item.id, &project_path, instruction);
                return DispatchOutcome {
                    work_item_id: item.id.clone(),
                    run: UnitRun::not_started(&request, format!("Failed to create worktree: {:#}", e)),
                    working_dir: project_path,
                    completed_at: Utc::now(),
                };
            }
        },
        None => project_path,
    };

    let request = runner.request(item.worker_type, &item.id, &working_dir, instruction);
    let mut run = runner.run(&request).await;

    if let (Some(_), Some(reconciler)) = (&isolated, &reconciler) {
        if run.succeeded() {
            match reconciler.commit_and_push(&working_dir, &item.id).await {
                Ok(CommitOutcome::Pushed { branch }) => {
                    tracing::debug!(work_item_id = %item.id, branch = %branch, "Branch ready for merge");
                }
                Ok(CommitOutcome::NoChanges) => {}
                Err(e) => run.error = Some(format!("Failed to push branch: {}", e)),
            }
        }
    }

    DispatchOutcome {
        work_item_id: item.id,
        run,
        working_dir,
        completed_at: Utc::now(),
    }
}
