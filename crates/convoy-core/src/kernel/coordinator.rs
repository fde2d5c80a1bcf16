//! Mission coordinator - drives a mission through its state machine.
//!
//! Every phase returns a [`MissionUpdate`] that is folded into the state and
//! checkpointed before the next phase starts, so a mission can be resumed from
//! any checkpoint.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::dispatcher::{DispatchOutcome, WaveDispatcher};
use super::runner::{Runner, UnitRun};
use super::scheduler::{find_stuck, validate_plan, WaveScheduler};
use super::verifier::{
    failure_action, has_deployment_failure, parse_test_output, OscillationDetector, QualityGateEvaluator,
    ReviewParser,
};
use crate::config::ConvoyConfig;
use crate::error::PlanningError;
use crate::observability::{EventEmitter, MissionEvent};
use crate::planning::{InstructionRenderer, MarkdownInstructions, MissionPlanner, ProjectContext, RoleInput};
use crate::provider::{ExecutionProvider, ExecutionRegistry};
use crate::state::{
    CheckpointStore, ExecutionRecord, ExecutionStrategy, FailureStrategy, FileAction, GateDecision, InteractionMode,
    MissionMetrics, MissionState, MissionStatus, MissionUpdate, RetryMark, ReviewFeedback, TestResult,
    WaveDispatchResult, WorkItem, WorkItemStatus, WorkerType,
};
use crate::workspace::{is_meaningful_change, sanitize_git_url, MergeReport, WorkspaceReconciler, WorktreeManager};

/// Prefix of generated mission ids.
pub const MISSION_PREFIX: &str = "CONVOY";

const RETRY_SECTION: &str = "## Previous Attempt";

/// Dispatch output kept per wave result.
const MAX_RECORDED_OUTPUT: usize = 8000;

/// Generate the next mission id for `year`, continuing from existing ids.
pub fn next_mission_id<'a, I>(existing: I, year: i32) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let prefix = format!("{}-{}-", MISSION_PREFIX, year);
    let highest = existing
        .into_iter()
        .filter_map(|id| id.strip_prefix(&prefix))
        .filter_map(|counter| counter.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("{}{:04}", prefix, highest + 1)
}

/// Replace any earlier retry section of `context` with a fresh one.
pub fn enrich_context(context: &str, attempt: u32, body: &str) -> String {
    let base = context
        .split(RETRY_SECTION)
        .next()
        .unwrap_or(context)
        .trim_end();
    let section = format!("{} {}\n\n{}", RETRY_SECTION, attempt, body.trim_end());
    if base.is_empty() {
        section
    } else {
        format!("{}\n\n{}", base, section)
    }
}

/// Execution failures still converge so the mission records its metrics.
fn converge_on_failure(mut update: MissionUpdate) -> MissionUpdate {
    if update.status == Some(MissionStatus::Failed) {
        update.status = Some(MissionStatus::Converging);
    }
    update
}

fn tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Everything one evaluated outcome contributes to the wave update.
#[derive(Default)]
struct Evaluation {
    item: Option<WorkItem>,
    completed: bool,
    resolved: bool,
    test: Option<TestResult>,
    review: Option<ReviewFeedback>,
    executions: Vec<ExecutionRecord>,
    error: Option<String>,
    fails_mission: bool,
    cancelled: bool,
}

/// Owns the mission lifecycle: classify, plan, approve, execute, converge.
pub struct MissionCoordinator {
    config: ConvoyConfig,
    project_path: PathBuf,
    planner: Arc<dyn MissionPlanner>,
    provider: Arc<dyn ExecutionProvider>,
    registry: Arc<ExecutionRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    renderer: Arc<dyn InstructionRenderer>,
    evaluator: QualityGateEvaluator,
    scheduler: WaveScheduler,
    reconciler: Option<WorkspaceReconciler>,
    events: Option<EventEmitter>,
    oscillation: Mutex<OscillationDetector>,
    cancel: CancellationToken,
}

impl MissionCoordinator {
    pub fn new(
        config: ConvoyConfig,
        project_path: &Path,
        planner: Arc<dyn MissionPlanner>,
        provider: Arc<dyn ExecutionProvider>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            evaluator: QualityGateEvaluator::new(&config),
            scheduler: WaveScheduler::new(&config),
            config,
            project_path: project_path.to_path_buf(),
            planner,
            provider,
            registry: Arc::new(ExecutionRegistry::new()),
            checkpoints,
            renderer: Arc::new(MarkdownInstructions),
            reconciler: None,
            events: None,
            oscillation: Mutex::new(OscillationDetector::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Merge passed branches into the base branch of this remote.
    pub fn with_reconciler(mut self, reconciler: WorkspaceReconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn InstructionRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_review_parser(mut self, parser: Arc<dyn ReviewParser>) -> Self {
        self.evaluator = self.evaluator.with_review_parser(parser);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    /// Token that cancels the running mission when tripped.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the running mission. In-flight units are torn down in the background.
    pub fn cancel(&self) {
        tracing::warn!("Mission cancellation requested");
        self.cancel.cancel();
    }

    /// Next free mission id for the current year.
    pub fn next_mission_id(&self) -> Result<String> {
        let existing = self.checkpoints.list()?;
        Ok(next_mission_id(existing.iter().map(String::as_str), Utc::now().year()))
    }

    pub fn load(&self, mission_id: &str) -> Result<MissionState> {
        self.checkpoints
            .load(mission_id)?
            .with_context(|| format!("No checkpoint for mission {}", mission_id))
    }

    /// Start a new mission for a request.
    pub async fn start(
        &self,
        request: &str,
        mode: InteractionMode,
        strategy: Option<ExecutionStrategy>,
    ) -> Result<MissionState> {
        let mission_id = self.next_mission_id()?;
        let mut state = MissionState::new(&mission_id, request, mode);
        state.project_path = Some(self.project_path.clone());
        state.git_remote_url = self
            .config
            .workspace
            .git_remote_url
            .as_deref()
            .map(sanitize_git_url);

        tracing::info!(mission_id = %mission_id, mode = ?mode, "Mission started");
        self.emit(MissionEvent::new("mission_started", &mission_id, request));
        self.checkpoints.save(&state)?;

        self.drive(state, strategy).await
    }

    /// Release a mission that is waiting for plan approval.
    pub async fn approve(&self, mission_id: &str) -> Result<MissionState> {
        let mut state = self.load(mission_id)?;
        if state.status != MissionStatus::AwaitingApproval {
            bail!("Mission {} is {}, not awaiting approval", mission_id, state.status);
        }

        tracing::info!(mission_id = %mission_id, "Plan approved");
        state.apply(MissionUpdate::status(MissionStatus::Executing));
        self.checkpoints.save(&state)?;
        self.emit(MissionEvent::new("plan_approved", mission_id, "Plan approved"));

        self.drive(state, None).await
    }

    /// Continue a mission from its checkpoint, forcing the given items back to pending.
    pub async fn resume(&self, mission_id: &str, force_retry: &[String]) -> Result<MissionState> {
        let mut state = self.load(mission_id)?;

        for id in force_retry {
            if !state.work_items.contains(id) {
                bail!("Mission {} has no work item {}", mission_id, id);
            }
        }

        // Units of a crashed run are gone; their items run again
        let mut items: Vec<WorkItem> = state
            .work_items
            .iter()
            .filter(|item| matches!(item.status, WorkItemStatus::Running | WorkItemStatus::Verifying))
            .cloned()
            .map(|mut item| {
                item.status = WorkItemStatus::Pending;
                item
            })
            .collect();

        let mut marks = Vec::new();
        for id in force_retry {
            if let Some(item) = state.work_item(id) {
                let mut item = item.clone();
                item.status = WorkItemStatus::Pending;
                items.push(item);
                marks.push(RetryMark::new(id, state.wave, "Forced retry on resume"));
            }
        }

        let mut update = MissionUpdate {
            work_items: items,
            retry_marks: marks,
            ..Default::default()
        };

        if state.status == MissionStatus::Cancelled {
            update.status = Some(MissionStatus::Executing);
        } else if !force_retry.is_empty() && state.status.is_terminal() {
            if !state.errors.is_empty() {
                self.emit(
                    MissionEvent::new("errors_cleared", mission_id, "Errors cleared on resume")
                        .with_metadata(serde_json::json!({ "errors": state.errors })),
                );
                state.errors.clear();
            }
            update.status = Some(MissionStatus::Executing);
        }

        tracing::info!(
            mission_id = %mission_id,
            status = %state.status,
            forced = force_retry.len(),
            "Resuming mission"
        );
        state.apply(update);
        self.checkpoints.save(&state)?;

        self.drive(state, None).await
    }

    /// Run phases until the mission halts for approval or reaches a terminal status.
    async fn drive(&self, state: MissionState, strategy: Option<ExecutionStrategy>) -> Result<MissionState> {
        let span = tracing::info_span!("mission", mission_id = %state.mission_id);
        self.drive_inner(state, strategy).instrument(span).await
    }

    async fn drive_inner(
        &self,
        mut state: MissionState,
        strategy: Option<ExecutionStrategy>,
    ) -> Result<MissionState> {
        let mut dispatcher: Option<WaveDispatcher> = None;
        let mut context: Option<ProjectContext> = None;

        loop {
            if self.cancel.is_cancelled() && !state.status.is_terminal() {
                self.apply_cancelled(&mut state)?;
            }

            let update = match state.status {
                MissionStatus::Classifying => self.classify(&state).await,
                MissionStatus::Planning => {
                    let scanned = ProjectContext::scan(&self.project_path);
                    let update = self.plan(&state, &scanned, strategy).await;
                    context = Some(scanned);
                    update
                }
                MissionStatus::AwaitingApproval => {
                    tracing::info!(items = state.work_items.len(), "Waiting for plan approval");
                    return Ok(state);
                }
                MissionStatus::Executing => {
                    if dispatcher.is_none() {
                        match self.build_dispatcher(&state).await {
                            Ok(built) => dispatcher = Some(built),
                            Err(e) => {
                                state.apply(converge_on_failure(MissionUpdate::failed(format!(
                                    "Workspace setup failed: {:#}",
                                    e
                                ))));
                                self.checkpoints.save(&state)?;
                                continue;
                            }
                        }
                    }
                    let context = context.get_or_insert_with(|| ProjectContext::scan(&self.project_path));
                    match &dispatcher {
                        Some(dispatcher) => {
                            converge_on_failure(self.execute_wave(&mut state, dispatcher, context).await?)
                        }
                        None => continue,
                    }
                }
                MissionStatus::Converging => self.converge(&state),
                MissionStatus::Completed | MissionStatus::Failed | MissionStatus::Cancelled => {
                    self.finish(&state, dispatcher.as_ref()).await;
                    return Ok(state);
                }
            };

            state.apply(update);
            self.checkpoints.save(&state)?;
        }
    }

    async fn classify(&self, state: &MissionState) -> MissionUpdate {
        match self.planner.classify(&state.request).await {
            Ok(classification) => {
                tracing::info!(
                    category = %classification.category,
                    complexity = classification.complexity,
                    "Request classified"
                );
                self.emit(MissionEvent::new("classified", &state.mission_id, &classification.category));
                MissionUpdate {
                    status: Some(MissionStatus::Planning),
                    classification: Some(classification),
                    ..Default::default()
                }
            }
            Err(e) => MissionUpdate::failed(format!("Classification failed: {:#}", e)),
        }
    }

    async fn plan(
        &self,
        state: &MissionState,
        context: &ProjectContext,
        strategy: Option<ExecutionStrategy>,
    ) -> MissionUpdate {
        let classification = state.classification.clone().unwrap_or_default();
        let plan = match self.planner.plan(&state.request, &classification, context).await {
            Ok(plan) => plan,
            Err(e) => return MissionUpdate::failed(PlanningError::Planner(format!("{:#}", e)).to_string()),
        };

        let mut items = plan.items;
        for item in &mut items {
            if item.max_iterations == 0 {
                item.max_iterations = self.config.scheduling.default_max_iterations;
            }
        }
        if let Err(e) = validate_plan(&items) {
            return MissionUpdate::failed(e.to_string());
        }

        let next = if items.is_empty() {
            MissionStatus::Converging
        } else if state.interaction_mode.requires_approval() {
            MissionStatus::AwaitingApproval
        } else {
            MissionStatus::Executing
        };

        let strategy = strategy.unwrap_or(plan.strategy);
        tracing::info!(items = items.len(), strategy = ?strategy, next = %next, "Mission planned");
        self.emit(
            MissionEvent::new("planned", &state.mission_id, &plan.objective)
                .with_metadata(serde_json::json!({ "items": items.len() })),
        );

        MissionUpdate {
            status: Some(next),
            objective: Some(plan.objective),
            strategy: Some(strategy),
            work_items: items,
            ..Default::default()
        }
    }

    /// Whether work item branches reach the remote and need merging.
    fn merges_branches(&self) -> bool {
        self.reconciler.is_some() && (!self.provider.shares_filesystem() || self.config.workspace.worktrees)
    }

    async fn build_dispatcher(&self, state: &MissionState) -> Result<WaveDispatcher> {
        let runner = Arc::new(Runner::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.registry),
            &self.config,
        ));
        let dispatcher = WaveDispatcher::new(runner, Arc::clone(&self.renderer), self.config.max_parallel);

        match &self.reconciler {
            Some(reconciler) if self.config.workspace.worktrees && self.provider.shares_filesystem() => {
                let manager = WorktreeManager::new(&self.config.workspace, &state.mission_id);
                manager.create_mission_workspace(reconciler.remote_url()).await?;
                Ok(dispatcher.with_worktrees(Arc::new(manager), reconciler.clone()))
            }
            _ => Ok(dispatcher),
        }
    }

    /// Schedule, dispatch, evaluate, and reconcile one wave.
    async fn execute_wave(
        &self,
        state: &mut MissionState,
        dispatcher: &WaveDispatcher,
        context: &ProjectContext,
    ) -> Result<MissionUpdate> {
        let schedule = self.scheduler.schedule(state);

        if schedule.is_empty() {
            let completed = state.effective_completed();
            let stuck = find_stuck(state.work_items.iter(), &completed);
            if stuck.is_empty() {
                return Ok(MissionUpdate::status(MissionStatus::Converging));
            }
            tracing::error!(stuck = ?stuck, "No schedulable items remain");
            return Ok(MissionUpdate::failed(PlanningError::Unreachable(stuck).to_string()));
        }

        let wave = state.wave + 1;
        tracing::info!(wave, schedule = %schedule.summary(), items = ?schedule.wave, "Dispatching wave");

        let items: Vec<WorkItem> = schedule
            .wave
            .iter()
            .filter_map(|id| state.work_item(id).cloned())
            .map(|mut item| {
                item.status = WorkItemStatus::Running;
                item
            })
            .collect();

        state.apply(MissionUpdate {
            wave: Some(wave),
            work_items: items.clone(),
            ..Default::default()
        });
        self.checkpoints.save(state)?;
        self.emit(
            MissionEvent::new("wave_dispatched", &state.mission_id, format!("Wave {}", wave))
                .with_metadata(serde_json::json!({ "items": schedule.wave, "deferred": schedule.deferred })),
        );

        let outcome = dispatcher
            .dispatch(items, &self.project_path, context, &self.cancel)
            .await;

        if outcome.cancelled {
            return Ok(self.cancelled_update(state));
        }

        let mut update = MissionUpdate::default();
        let mut merge_candidates: Vec<&DispatchOutcome> = Vec::new();

        for result in &outcome.outcomes {
            let Some(item) = state.work_item(&result.work_item_id).cloned() else {
                continue;
            };
            let evaluation = self.evaluate(state, item, result, context).await?;
            if evaluation.cancelled {
                return Ok(self.cancelled_update(state));
            }
            let Some(item) = evaluation.item else {
                continue;
            };

            if item.status == WorkItemStatus::Passed && item.worker_type.produces_code() {
                merge_candidates.push(result);
            }

            update.wave_results.push(WaveDispatchResult {
                work_item_id: item.id.clone(),
                wave,
                status: item.status,
                files_affected: result.run.files.clone(),
                output: tail(&result.run.output, MAX_RECORDED_OUTPUT),
                elapsed_ms: result.run.elapsed_ms,
                completed_at: result.completed_at,
            });
            if evaluation.completed {
                update.completed.push(item.id.clone());
            }
            if evaluation.resolved {
                update.resolved_retries.push(item.id.clone());
            }
            update.test_results.extend(evaluation.test);
            update.reviews.extend(evaluation.review);
            update.executions.extend(evaluation.executions);
            update.errors.extend(evaluation.error);
            if evaluation.fails_mission {
                update.status = Some(MissionStatus::Failed);
            }
            update.work_items.push(item);
        }

        if self.merges_branches() && !merge_candidates.is_empty() {
            // Completion order, wave order breaks ties
            merge_candidates.sort_by_key(|result| result.completed_at);
            let ids: Vec<String> = merge_candidates.iter().map(|r| r.work_item_id.clone()).collect();
            if !self.reconcile_wave(state, &ids, wave, &mut update).await {
                return Ok(self.cancelled_update(state));
            }
        }

        if let Some(worktrees) = dispatcher.worktrees() {
            for result in &outcome.outcomes {
                worktrees.release(&result.work_item_id).await;
            }
        }

        self.emit(
            MissionEvent::new("wave_completed", &state.mission_id, format!("Wave {}", wave)).with_metadata(
                serde_json::json!({
                    "completed": update.completed,
                    "errors": update.errors,
                }),
            ),
        );

        let cooldown = self.config.scheduling.wave_cooldown_secs;
        if cooldown > 0 && update.status.is_none() {
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(cooldown)) => {}
            }
        }

        Ok(update)
    }

    /// Gate one dispatch outcome and apply the resulting decision.
    async fn evaluate(
        &self,
        state: &mut MissionState,
        mut item: WorkItem,
        result: &DispatchOutcome,
        context: &ProjectContext,
    ) -> Result<Evaluation> {
        let run = &result.run;
        let mut evaluation = Evaluation {
            executions: run.record.iter().cloned().collect(),
            ..Default::default()
        };
        item.files_affected = run.files.clone();
        item.elapsed_ms = Some(run.elapsed_ms);

        let decision = if !run.succeeded() {
            GateDecision::denied(failure_action(&item), run.failure_reason())
        } else if !item.worker_type.produces_code() {
            if item.worker_type == WorkerType::Deployer && has_deployment_failure(&run.output) {
                GateDecision::denied(failure_action(&item), "Deployment failure reported by deployer")
            } else {
                GateDecision::granted(format!("{} finished", item.worker_type))
            }
        } else if item.worker_type == WorkerType::Implementer
            && !run.files.iter().any(is_meaningful_change)
        {
            GateDecision::denied(failure_action(&item), "No file changes produced")
        } else if !self.evaluator.enabled() {
            GateDecision::granted("Quality gates disabled")
        } else {
            item.status = WorkItemStatus::Verifying;
            state.apply(MissionUpdate {
                work_items: vec![item.clone()],
                ..Default::default()
            });
            self.checkpoints.save(state)?;

            let gated = tokio::select! {
                _ = self.cancel.cancelled() => None,
                gated = self.run_gates(&item, result, context) => Some(gated),
            };
            let Some((test, review, records)) = gated else {
                return Ok(Evaluation {
                    cancelled: true,
                    ..Default::default()
                });
            };

            evaluation.executions.extend(records);
            let decision = self.evaluator.decide(&test, &review, &item);
            evaluation.test = Some(test);
            evaluation.review = Some(review);
            decision
        };

        self.apply_decision(state, &mut item, decision, &mut evaluation);
        evaluation.item = Some(item);
        Ok(evaluation)
    }

    /// Tests then review for one item, stamped with its iteration.
    async fn run_gates(
        &self,
        item: &WorkItem,
        result: &DispatchOutcome,
        context: &ProjectContext,
    ) -> (TestResult, ReviewFeedback, Vec<ExecutionRecord>) {
        let (mut test, test_record) = self.run_tests(item, result, context).await;
        test.iteration = item.iteration;
        let (mut review, review_record) = self.run_review(item, result, &test, context).await;
        review.iteration = item.iteration;

        let records = test_record.into_iter().chain(review_record).collect();
        (test, review, records)
    }

    async fn run_tests(
        &self,
        item: &WorkItem,
        result: &DispatchOutcome,
        context: &ProjectContext,
    ) -> (TestResult, Option<ExecutionRecord>) {
        if self.evaluator.has_commands() && self.provider.shares_filesystem() {
            let gate = self.evaluator.run_commands(&result.working_dir).await;
            let mut test = parse_test_output(&item.id, Some(&gate.output), gate.duration_ms);
            if !gate.passed {
                test.passed = false;
            }
            return (test, None);
        }

        let instruction = self.renderer.render(
            item,
            context,
            RoleInput::Test {
                files: &result.run.files,
            },
        );
        let run = self.run_gate_unit(WorkerType::Tester, item, result, instruction).await;
        let raw = run.error.is_none().then_some(run.output.as_str());
        (parse_test_output(&item.id, raw, run.elapsed_ms), run.record)
    }

    async fn run_review(
        &self,
        item: &WorkItem,
        result: &DispatchOutcome,
        test: &TestResult,
        context: &ProjectContext,
    ) -> (ReviewFeedback, Option<ExecutionRecord>) {
        let instruction = self.renderer.render(
            item,
            context,
            RoleInput::Review {
                files: &result.run.files,
                test: Some(test),
            },
        );
        let run = self.run_gate_unit(WorkerType::Reviewer, item, result, instruction).await;
        let raw = run.error.is_none().then_some(run.output.as_str());
        (self.evaluator.parse_review_output(&item.id, raw).await, run.record)
    }

    /// Tester and reviewer units run against the parent item's working copy and branch.
    async fn run_gate_unit(
        &self,
        worker_type: WorkerType,
        item: &WorkItem,
        result: &DispatchOutcome,
        instruction: String,
    ) -> UnitRun {
        let runner = Runner::new(Arc::clone(&self.provider), Arc::clone(&self.registry), &self.config);
        let request = runner.request(worker_type, &item.id, &result.working_dir, instruction);
        runner.run(&request).await
    }

    fn apply_decision(
        &self,
        state: &MissionState,
        item: &mut WorkItem,
        decision: GateDecision,
        evaluation: &mut Evaluation,
    ) {
        let Some(mut action) = decision.action.filter(|_| !decision.granted) else {
            tracing::info!(work_item_id = %item.id, reason = %decision.reason, "Work item passed");
            item.status = WorkItemStatus::Passed;
            evaluation.completed = true;
            evaluation.resolved = state.is_retrying(&item.id);
            if let Ok(mut detector) = self.oscillation.lock() {
                detector.clear(&item.id);
            }
            self.emit(MissionEvent::new("item_passed", &state.mission_id, &decision.reason).for_item(&item.id));
            return;
        };

        if action == FailureStrategy::Retry {
            let oscillating = self
                .oscillation
                .lock()
                .map(|mut detector| detector.record(&item.id, &decision.reason))
                .unwrap_or(false);
            if oscillating {
                tracing::warn!(work_item_id = %item.id, "Failures are oscillating, escalating");
                action = FailureStrategy::Escalate;
            }
        }

        tracing::info!(
            work_item_id = %item.id,
            action = %action,
            reason = %decision.reason,
            "Work item denied"
        );
        self.emit(
            MissionEvent::new("item_denied", &state.mission_id, &decision.reason)
                .for_item(&item.id)
                .with_metadata(serde_json::json!({ "action": action.to_string() })),
        );

        match action {
            FailureStrategy::Retry => {
                item.iteration += 1;
                item.status = WorkItemStatus::Pending;
                let mut body = format!("Failed: {}\n", decision.reason);
                if let Some(review) = &evaluation.review {
                    for issue in &review.issues {
                        body.push_str(&format!("- {}\n", issue));
                    }
                }
                item.input_context = enrich_context(&item.input_context, item.iteration, &body);
            }
            FailureStrategy::Skip => {
                item.status = WorkItemStatus::Skipped;
                evaluation.completed = true;
            }
            FailureStrategy::Escalate => {
                item.status = WorkItemStatus::Failed;
                evaluation.completed = true;
                evaluation.error = Some(format!("Work item {} escalated: {}", item.id, decision.reason));
                evaluation.fails_mission = true;
            }
            FailureStrategy::Replan => {
                item.status = WorkItemStatus::Failed;
                evaluation.error = Some(format!(
                    "Work item {} requires replanning: {}",
                    item.id, decision.reason
                ));
                evaluation.fails_mission = true;
            }
        }
    }

    /// Merge passed branches and put conflicted items back on the retry overlay.
    ///
    /// Returns false when the mission was cancelled mid-merge.
    async fn reconcile_wave(
        &self,
        state: &MissionState,
        ids: &[String],
        wave: u32,
        update: &mut MissionUpdate,
    ) -> bool {
        let Some(reconciler) = &self.reconciler else {
            return true;
        };

        let reconciled = tokio::select! {
            _ = self.cancel.cancelled() => None,
            reconciled = reconciler.reconcile(ids) => Some(reconciled),
        };
        let report = match reconciled {
            None => return false,
            Some(Ok(report)) => report,
            Some(Err(e)) => {
                update.errors.push(format!("Merge failed: {:#}", e));
                update.status = Some(MissionStatus::Failed);
                return true;
            }
        };
        self.emit(
            MissionEvent::new("merged", &state.mission_id, format!("Wave {} merged", wave))
                .with_metadata(serde_json::to_value(&report).unwrap_or_default()),
        );

        let merged_files = merged_files(state, update, &report);

        for skipped in &report.skipped {
            let Some(position) = update
                .work_items
                .iter()
                .position(|item| item.id == skipped.work_item_id)
            else {
                continue;
            };
            let item = &mut update.work_items[position];

            let mut body = format!("Merge conflict: {}\n", skipped.reason);
            if !skipped.conflicting_files.is_empty() {
                body.push_str(&format!("Conflicting files: {}\n", skipped.conflicting_files.join(", ")));
            }
            if !merged_files.is_empty() {
                body.push_str("Already merged by other items. Build on top of these, do not recreate them:\n");
                for file in &merged_files {
                    body.push_str(&format!("- {}\n", file));
                }
            }

            if item.failure_strategy() == FailureStrategy::Skip {
                tracing::warn!(work_item_id = %item.id, "Merge conflict, skipping item");
                item.status = WorkItemStatus::Skipped;
                continue;
            }
            if item.iterations_exhausted() {
                item.status = WorkItemStatus::Failed;
                update.errors.push(format!(
                    "Work item {} escalated: merge conflict after {} iterations",
                    item.id, item.iteration
                ));
                update.status = Some(MissionStatus::Failed);
                continue;
            }

            item.iteration += 1;
            item.status = WorkItemStatus::Pending;
            item.input_context = enrich_context(&item.input_context, item.iteration, &body);
            update.resolved_retries.retain(|id| id != &skipped.work_item_id);
            update
                .retry_marks
                .push(RetryMark::new(&skipped.work_item_id, wave, skipped.reason.clone()));

            tracing::info!(work_item_id = %skipped.work_item_id, wave, "Merge conflict, item queued for retry");
        }

        for result in update.wave_results.iter_mut() {
            if let Some(item) = update.work_items.iter().find(|i| i.id == result.work_item_id) {
                result.status = item.status;
            }
        }
        true
    }

    fn converge(&self, state: &MissionState) -> MissionUpdate {
        let mut metrics = MissionMetrics {
            waves_executed: state.wave,
            total_iterations: state.wave_results.len() as u32,
            aggregate_duration_ms: state.wave_results.iter().map(|r| r.elapsed_ms).sum(),
            ..Default::default()
        };
        let mut errors = Vec::new();

        for item in state.work_items.iter() {
            match item.status {
                WorkItemStatus::Passed => {
                    metrics.items_completed += 1;
                    for change in &item.files_affected {
                        match change.action {
                            FileAction::Created => metrics.files_created += 1,
                            FileAction::Modified => metrics.files_modified += 1,
                            FileAction::Deleted => metrics.files_deleted += 1,
                        }
                    }
                }
                WorkItemStatus::Failed => metrics.items_failed += 1,
                WorkItemStatus::Skipped => metrics.items_skipped += 1,
                // Items behind a failure are expected to stay unfinished
                status if state.errors.is_empty() => errors.push(format!(
                    "Work item {} never reached a terminal state ({:?})",
                    item.id, status
                )),
                _ => {}
            }
        }
        for test in &state.test_results {
            metrics.tests_run += test.total_tests;
            metrics.tests_passed += test.total_tests.saturating_sub(test.failed_tests);
        }

        let nothing_passed = metrics.items_completed == 0 && !state.work_items.is_empty();
        if nothing_passed && errors.is_empty() && state.errors.is_empty() {
            errors.push("No work item passed".to_string());
        }
        let status = if errors.is_empty() && state.errors.is_empty() {
            MissionStatus::Completed
        } else {
            MissionStatus::Failed
        };

        tracing::info!(
            status = %status,
            completed = metrics.items_completed,
            failed = metrics.items_failed,
            skipped = metrics.items_skipped,
            waves = metrics.waves_executed,
            "Mission converged"
        );

        MissionUpdate {
            status: Some(status),
            metrics: Some(metrics),
            errors,
            ..Default::default()
        }
    }

    fn cancelled_update(&self, state: &MissionState) -> MissionUpdate {
        let swept = self.registry.shutdown_sweep(Arc::clone(&self.provider));
        tracing::warn!(swept, "Mission cancelled");

        let items = state
            .work_items
            .iter()
            .filter(|item| matches!(item.status, WorkItemStatus::Running | WorkItemStatus::Verifying))
            .cloned()
            .map(|mut item| {
                item.status = WorkItemStatus::Pending;
                item
            })
            .collect();

        MissionUpdate {
            status: Some(MissionStatus::Cancelled),
            work_items: items,
            ..Default::default()
        }
    }

    fn apply_cancelled(&self, state: &mut MissionState) -> Result<()> {
        let update = self.cancelled_update(state);
        state.apply(update);
        self.checkpoints.save(state)
    }

    async fn finish(&self, state: &MissionState, dispatcher: Option<&WaveDispatcher>) {
        if let Some(worktrees) = dispatcher.and_then(|d| d.worktrees()) {
            worktrees.cleanup_mission().await;
        }

        let event_type = match state.status {
            MissionStatus::Completed => "mission_completed",
            MissionStatus::Cancelled => "mission_cancelled",
            _ => "mission_failed",
        };
        self.emit(
            MissionEvent::new(event_type, &state.mission_id, state.errors.join("; "))
                .with_metadata(serde_json::to_value(&state.metrics).unwrap_or_default()),
        );
        tracing::info!(status = %state.status, errors = state.errors.len(), "Mission finished");
    }

    fn emit(&self, event: MissionEvent) {
        if let Some(events) = &self.events {
            events.emit_quiet(event);
        }
    }
}

/// Files of every passed item except those just skipped by the merge.
fn merged_files(state: &MissionState, update: &MissionUpdate, report: &MergeReport) -> Vec<String> {
    let skipped: HashSet<&str> = report.skipped.iter().map(|s| s.work_item_id.as_str()).collect();
    let mut files: Vec<String> = Vec::new();

    let current = update.work_items.iter();
    let earlier = state
        .work_items
        .iter()
        .filter(|item| !update.work_items.iter().any(|u| u.id == item.id));

    for item in current.chain(earlier) {
        if item.status != WorkItemStatus::Passed || skipped.contains(item.id.as_str()) {
            continue;
        }
        for change in &item.files_affected {
            if change.action != FileAction::Deleted && !files.contains(&change.path) {
                files.push(change.path.clone());
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_mission_id_continues_counter() {
        let existing = ["CONVOY-2026-0003", "CONVOY-2026-0011", "CONVOY-2025-0040", "other"];
        assert_eq!(next_mission_id(existing, 2026), "CONVOY-2026-0012");
        assert_eq!(next_mission_id(Vec::<&str>::new(), 2027), "CONVOY-2027-0001");
    }

    #[test]
    fn test_enrich_context_replaces_previous_attempt() {
        let first = enrich_context("Use the session store", 1, "Failed: tests");
        assert_eq!(first, "Use the session store\n\n## Previous Attempt 1\n\nFailed: tests");

        let second = enrich_context(&first, 2, "Failed: review");
        assert_eq!(second, "Use the session store\n\n## Previous Attempt 2\n\nFailed: review");

        assert_eq!(enrich_context("", 1, "x"), "## Previous Attempt 1\n\nx");
    }
}
