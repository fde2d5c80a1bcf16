//! Mission lifecycle against a scripted in-process provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use convoy_core::error::ProviderError;
use convoy_core::planning::{
    InstructionRenderer, MarkdownInstructions, MissionPlan, MissionPlanner, ProjectContext, RoleInput,
};
use convoy_core::provider::{ExecutionId, ExecutionProvider, ExecutionRequest, ExitStatus};
use convoy_core::state::{
    CheckpointStore, Classification, ExecutionStrategy, FailureStrategy, InteractionMode, MemoryCheckpointStore,
    MissionStatus, WorkItem, WorkItemStatus, WorkerType,
};
use convoy_core::{ConvoyConfig, MissionCoordinator};
use tokio_util::sync::CancellationToken;

struct Reply {
    exit: i32,
    output: String,
    write: Option<(String, String)>,
    /// Never finishes on its own
    hang: bool,
}

impl Reply {
    fn ok(output: &str) -> Self {
        Self {
            exit: 0,
            output: output.to_string(),
            write: None,
            hang: false,
        }
    }

    fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::ok("")
        }
    }

    fn exit(code: i32) -> Self {
        Self {
            exit: code,
            output: format!("exited {}", code),
            write: None,
            hang: false,
        }
    }
}

type Script = Box<dyn Fn(&ExecutionRequest, u32) -> Option<Reply> + Send + Sync>;

/// Shares the filesystem like a local container, but runs nothing.
struct ScriptedProvider {
    script: Script,
    attempts: Mutex<HashMap<String, u32>>,
    units: Mutex<HashMap<ExecutionId, (i32, String, bool)>>,
    opened: AtomicUsize,
    torn_down: AtomicUsize,
}

impl ScriptedProvider {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            attempts: Mutex::new(HashMap::new()),
            units: Mutex::new(HashMap::new()),
            opened: AtomicUsize::new(0),
            torn_down: AtomicUsize::new(0),
        })
    }

    fn standard() -> Arc<Self> {
        Self::new(Box::new(|_, _| None))
    }

    fn attempts(&self, worker_type: WorkerType, id: &str) -> u32 {
        let key = format!("{}:{}", worker_type, id);
        self.attempts.lock().unwrap().get(&key).copied().unwrap_or(0)
    }
}

/// Implementers write a file, testers pass, reviewers approve.
fn default_reply(request: &ExecutionRequest, attempt: u32) -> Reply {
    match request.worker_type {
        WorkerType::Implementer | WorkerType::Refactorer => Reply {
            exit: 0,
            output: "implemented".to_string(),
            write: Some((
                format!("src/{}.rs", request.work_item_id.to_lowercase()),
                format!("// {}\n", "x".repeat(attempt as usize)),
            )),
            hang: false,
        },
        WorkerType::Tester => Reply::ok("running tests\n5 passed in 0.2s"),
        WorkerType::Reviewer => Reply::ok("Score: 8/10\nApproved: yes\nSummary: fine"),
        _ => Reply::ok("done"),
    }
}

#[async_trait]
impl ExecutionProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn shares_filesystem(&self) -> bool {
        true
    }

    async fn open(&self, request: &ExecutionRequest) -> Result<ExecutionId, ProviderError> {
        let key = format!("{}:{}", request.worker_type, request.work_item_id);
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(key).or_insert(0);
            *count += 1;
            *count
        };

        let reply = (self.script)(request, attempt).unwrap_or_else(|| default_reply(request, attempt));
        if let Some((path, content)) = &reply.write {
            let path = request.working_dir.join(path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }

        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        let id = ExecutionId::new(format!("scripted-{}", n));
        self.units
            .lock()
            .unwrap()
            .insert(id.clone(), (reply.exit, reply.output, reply.hang));
        Ok(id)
    }

    async fn await_completion(&self, id: &ExecutionId, timeout: Duration) -> ExitStatus {
        let (code, hang) = self
            .units
            .lock()
            .unwrap()
            .get(id)
            .map(|(code, _, hang)| (*code, *hang))
            .unwrap_or((1, false));
        if hang {
            tokio::time::sleep(timeout).await;
            return ExitStatus::TimedOut;
        }
        ExitStatus::Code(code)
    }

    async fn capture_output(&self, id: &ExecutionId) -> String {
        self.units
            .lock()
            .unwrap()
            .get(id)
            .map(|(_, output, _)| output.clone())
            .unwrap_or_default()
    }

    async fn teardown(&self, id: &ExecutionId) {
        self.units.lock().unwrap().remove(id);
        self.torn_down.fetch_add(1, Ordering::SeqCst);
    }
}

struct StaticPlanner {
    plan: MissionPlan,
}

#[async_trait]
impl MissionPlanner for StaticPlanner {
    async fn classify(&self, _request: &str) -> Result<Classification> {
        Ok(Classification {
            category: "feature".to_string(),
            complexity: 3,
            ..Default::default()
        })
    }

    async fn plan(
        &self,
        _request: &str,
        _classification: &Classification,
        _context: &ProjectContext,
    ) -> Result<MissionPlan> {
        Ok(self.plan.clone())
    }
}

fn plan(items: Vec<WorkItem>) -> MissionPlan {
    MissionPlan {
        objective: "Ship the login flow".to_string(),
        strategy: ExecutionStrategy::Sequential,
        classification: None,
        items,
    }
}

fn implementer(id: &str) -> WorkItem {
    WorkItem::new(id, WorkerType::Implementer, format!("Implement {}", id))
}

struct Harness {
    coordinator: MissionCoordinator,
    provider: Arc<ScriptedProvider>,
    checkpoints: Arc<MemoryCheckpointStore>,
    project: tempfile::TempDir,
}

fn harness(items: Vec<WorkItem>, provider: Arc<ScriptedProvider>) -> Harness {
    harness_with(items, provider, ConvoyConfig::default())
}

fn harness_with(items: Vec<WorkItem>, provider: Arc<ScriptedProvider>, config: ConvoyConfig) -> Harness {
    let project = tempfile::tempdir().unwrap();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let coordinator = MissionCoordinator::new(
        config,
        project.path(),
        Arc::new(StaticPlanner { plan: plan(items) }),
        provider.clone(),
        checkpoints.clone(),
    );
    Harness {
        coordinator,
        provider,
        checkpoints,
        project,
    }
}

fn project_file(harness: &Harness, path: &str) -> bool {
    harness.project.path().join(path).exists()
}

#[tokio::test]
async fn dependent_items_pass_in_order() {
    let h = harness(
        vec![implementer("A"), implementer("B").with_dependencies(["A"])],
        ScriptedProvider::standard(),
    );

    let state = h
        .coordinator
        .start("Add login", InteractionMode::FullAuto, None)
        .await
        .unwrap();

    assert_eq!(state.mission_id.len(), "CONVOY-2026-0001".len());
    assert_eq!(state.status, MissionStatus::Completed);
    assert_eq!(state.wave, 2);
    assert!(state.errors.is_empty());
    assert!(state.work_items.iter().all(|i| i.status == WorkItemStatus::Passed));
    assert!(project_file(&h, "src/a.rs"));

    let metrics = state.metrics.clone().unwrap();
    assert_eq!(metrics.items_completed, 2);
    assert_eq!(metrics.files_created, 2);
    assert_eq!(metrics.waves_executed, 2);
    assert_eq!(metrics.tests_run, 10);

    // Worker, tester, and reviewer per item
    assert_eq!(h.provider.opened.load(Ordering::SeqCst), 6);
    assert_eq!(h.provider.torn_down.load(Ordering::SeqCst), 6);
    assert_eq!(state.executions.len(), 6);
    assert!(h.coordinator.registry().in_flight().is_empty());

    let saved = h.checkpoints.load(&state.mission_id).unwrap().unwrap();
    assert_eq!(saved, state);
}

#[tokio::test]
async fn low_review_retries_with_enriched_context() {
    let provider = ScriptedProvider::new(Box::new(|request, attempt| {
        (request.worker_type == WorkerType::Reviewer && attempt == 1)
            .then(|| Reply::ok("Score: 4/10\nIssues:\n- Missing input validation"))
    }));
    let h = harness(vec![implementer("A")], provider);

    let state = h
        .coordinator
        .start("Add login", InteractionMode::FullAuto, None)
        .await
        .unwrap();

    assert_eq!(state.status, MissionStatus::Completed);
    let item = state.work_item("A").unwrap();
    assert_eq!(item.status, WorkItemStatus::Passed);
    assert_eq!(item.iteration, 1);
    assert!(item.input_context.contains("## Previous Attempt 1"));
    assert!(item.input_context.contains("- Missing input validation"));
    assert_eq!(h.provider.attempts(WorkerType::Implementer, "A"), 2);
    assert_eq!(state.reviews.len(), 2);
    assert_eq!(state.wave_results.len(), 2);
}

#[tokio::test]
async fn exhausted_retries_escalate_and_fail_the_mission() {
    let provider = ScriptedProvider::new(Box::new(|request, _| {
        (request.worker_type == WorkerType::Reviewer).then(|| Reply::ok("Score: 2/10"))
    }));
    let h = harness(
        vec![implementer("A").with_max_iterations(1), implementer("B").with_dependencies(["A"])],
        provider,
    );

    let state = h
        .coordinator
        .start("Add login", InteractionMode::FullAuto, None)
        .await
        .unwrap();

    assert_eq!(state.status, MissionStatus::Failed);
    assert_eq!(state.work_item("A").unwrap().status, WorkItemStatus::Failed);
    assert_eq!(state.work_item("B").unwrap().status, WorkItemStatus::Pending);
    assert_eq!(h.provider.attempts(WorkerType::Implementer, "B"), 0);
    assert!(state
        .errors
        .iter()
        .any(|e| e.starts_with("Work item A escalated: Review score 2/10")));
}

#[tokio::test]
async fn skipped_item_unblocks_dependents() {
    let provider = ScriptedProvider::new(Box::new(|request, _| {
        (request.work_item_id == "A" && request.worker_type == WorkerType::Implementer).then(|| Reply::exit(2))
    }));
    let h = harness(
        vec![
            implementer("A").with_on_failure(FailureStrategy::Skip),
            implementer("B").with_dependencies(["A"]),
        ],
        provider,
    );

    let state = h
        .coordinator
        .start("Add login", InteractionMode::FullAuto, None)
        .await
        .unwrap();

    assert_eq!(state.status, MissionStatus::Completed);
    assert_eq!(state.work_item("A").unwrap().status, WorkItemStatus::Skipped);
    assert_eq!(state.work_item("B").unwrap().status, WorkItemStatus::Passed);
    assert_eq!(state.metrics.as_ref().unwrap().items_skipped, 1);
}

#[tokio::test]
async fn implementer_without_changes_is_denied() {
    let provider = ScriptedProvider::new(Box::new(|request, _| {
        (request.worker_type == WorkerType::Implementer).then(|| Reply::ok("nothing to do"))
    }));
    let h = harness(vec![implementer("A").with_on_failure(FailureStrategy::Replan)], provider);

    let state = h
        .coordinator
        .start("Add login", InteractionMode::FullAuto, None)
        .await
        .unwrap();

    assert_eq!(state.status, MissionStatus::Failed);
    assert_eq!(
        state.errors,
        vec!["Work item A requires replanning: No file changes produced"]
    );
    // Gate units never ran
    assert_eq!(h.provider.attempts(WorkerType::Reviewer, "A"), 0);
}

#[tokio::test]
async fn deployer_failure_marker_denies_the_item() {
    let provider = ScriptedProvider::new(Box::new(|request, _| {
        (request.worker_type == WorkerType::Deployer).then(|| Reply::ok("cf push ...\nDEPLOYMENT FAILED: crashed"))
    }));
    let deployer = WorkItem::new("DEPLOY", WorkerType::Deployer, "Deploy to staging")
        .with_on_failure(FailureStrategy::Escalate);
    let h = harness(vec![deployer], provider);

    let state = h
        .coordinator
        .start("Deploy", InteractionMode::FullAuto, None)
        .await
        .unwrap();

    assert_eq!(state.status, MissionStatus::Failed);
    assert_eq!(state.work_item("DEPLOY").unwrap().status, WorkItemStatus::Failed);
}

#[tokio::test]
async fn approval_mode_pauses_until_approved() {
    let h = harness(vec![implementer("A")], ScriptedProvider::standard());

    let paused = h
        .coordinator
        .start("Add login", InteractionMode::ApprovePlan, None)
        .await
        .unwrap();
    assert_eq!(paused.status, MissionStatus::AwaitingApproval);
    assert_eq!(paused.wave, 0);
    assert_eq!(h.provider.opened.load(Ordering::SeqCst), 0);

    let done = h.coordinator.approve(&paused.mission_id).await.unwrap();
    assert_eq!(done.status, MissionStatus::Completed);

    assert!(h.coordinator.approve(&paused.mission_id).await.is_err());
}

#[tokio::test]
async fn cyclic_plan_fails_before_execution() {
    let h = harness(
        vec![
            implementer("A").with_dependencies(["B"]),
            implementer("B").with_dependencies(["A"]),
        ],
        ScriptedProvider::standard(),
    );

    let state = h
        .coordinator
        .start("Add login", InteractionMode::FullAuto, None)
        .await
        .unwrap();

    assert_eq!(state.status, MissionStatus::Failed);
    assert!(state.errors[0].starts_with("Dependency cycle"));
    assert_eq!(h.provider.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_plan_completes_immediately() {
    let h = harness(Vec::new(), ScriptedProvider::standard());
    let state = h
        .coordinator
        .start("Nothing to do", InteractionMode::FullAuto, None)
        .await
        .unwrap();
    assert_eq!(state.status, MissionStatus::Completed);
    assert_eq!(state.wave, 0);
}

#[tokio::test]
async fn gates_disabled_pass_on_worker_success() {
    let mut config = ConvoyConfig::default();
    config.gates.enabled = false;
    let h = harness_with(vec![implementer("A")], ScriptedProvider::standard(), config);

    let state = h
        .coordinator
        .start("Add login", InteractionMode::FullAuto, None)
        .await
        .unwrap();
    assert_eq!(state.status, MissionStatus::Completed);
    assert_eq!(h.provider.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn resume_forces_a_completed_item_to_run_again() {
    let h = harness(vec![implementer("A")], ScriptedProvider::standard());
    let first = h
        .coordinator
        .start("Add login", InteractionMode::FullAuto, None)
        .await
        .unwrap();
    assert_eq!(first.status, MissionStatus::Completed);

    let resumed = h
        .coordinator
        .resume(&first.mission_id, &["A".to_string()])
        .await
        .unwrap();
    assert_eq!(resumed.status, MissionStatus::Completed);
    assert_eq!(resumed.wave, 2);
    assert_eq!(h.provider.attempts(WorkerType::Implementer, "A"), 2);
    assert!(resumed.retrying.iter().all(|mark| mark.resolved));

    assert!(h
        .coordinator
        .resume(&first.mission_id, &["Z".to_string()])
        .await
        .is_err());
}

#[tokio::test]
async fn mission_ids_continue_from_checkpoints() {
    let h = harness(Vec::new(), ScriptedProvider::standard());
    let first = h
        .coordinator
        .start("one", InteractionMode::FullAuto, None)
        .await
        .unwrap();
    let second = h
        .coordinator
        .start("two", InteractionMode::FullAuto, None)
        .await
        .unwrap();

    assert!(first.mission_id.ends_with("-0001"));
    assert!(second.mission_id.ends_with("-0002"));
    assert_eq!(h.checkpoints.list().unwrap().len(), 2);
}

#[tokio::test]
async fn cancelled_token_stops_the_mission() {
    let h = harness(vec![implementer("A")], ScriptedProvider::standard());
    h.coordinator.cancel();

    let state = h
        .coordinator
        .start("Add login", InteractionMode::FullAuto, None)
        .await
        .unwrap();
    assert_eq!(state.status, MissionStatus::Cancelled);
    assert_eq!(h.provider.opened.load(Ordering::SeqCst), 0);
}

/// Replaces worker instructions, keeps the gate ones.
struct TerseRenderer;

impl InstructionRenderer for TerseRenderer {
    fn render(&self, item: &WorkItem, context: &ProjectContext, role: RoleInput<'_>) -> String {
        match role {
            RoleInput::Work => format!("do {}", item.id),
            _ => MarkdownInstructions.render(item, context, role),
        }
    }
}

#[tokio::test]
async fn custom_renderer_shapes_worker_instructions() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);
    let provider = ScriptedProvider::new(Box::new(move |request, _| {
        recorded
            .lock()
            .unwrap()
            .push((request.worker_type, request.instruction.clone()));
        None
    }));
    let h = harness(vec![implementer("A")], provider);
    let coordinator = h.coordinator.with_renderer(Arc::new(TerseRenderer));

    let state = coordinator
        .start("Add login", InteractionMode::FullAuto, None)
        .await
        .unwrap();
    assert_eq!(state.status, MissionStatus::Completed);

    let seen = seen.lock().unwrap();
    assert!(seen.contains(&(WorkerType::Implementer, "do A".to_string())));
    assert!(seen
        .iter()
        .any(|(worker, text)| *worker == WorkerType::Reviewer && text.contains("A")));
}

#[tokio::test]
async fn failed_mission_still_converges_with_metrics() {
    let provider = ScriptedProvider::new(Box::new(|request, _| {
        (request.worker_type == WorkerType::Reviewer).then(|| Reply::ok("Score: 2/10"))
    }));
    let h = harness(
        vec![implementer("A").with_max_iterations(1), implementer("B").with_dependencies(["A"])],
        provider,
    );

    let state = h
        .coordinator
        .start("Add login", InteractionMode::FullAuto, None)
        .await
        .unwrap();

    assert_eq!(state.status, MissionStatus::Failed);
    let metrics = state.metrics.clone().unwrap();
    assert_eq!(metrics.items_failed, 1);
    assert_eq!(metrics.items_completed, 0);
    // One retry, then escalation
    assert_eq!(metrics.waves_executed, 2);
    assert_eq!(metrics.tests_run, 10);
    // B was never reached, which is not reported as a separate defect
    assert_eq!(state.errors.len(), 1);

    let saved = h.checkpoints.load(&state.mission_id).unwrap().unwrap();
    assert!(saved.metrics.is_some());
}

#[tokio::test]
async fn gate_phase_is_checkpointed_as_verifying() {
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let observed = Arc::new(Mutex::new(None));

    let store = Arc::clone(&checkpoints);
    let seen = Arc::clone(&observed);
    let provider = ScriptedProvider::new(Box::new(move |request, _| {
        if request.worker_type == WorkerType::Tester {
            let ids = store.list().unwrap();
            let state = store.load(&ids[0]).unwrap().unwrap();
            *seen.lock().unwrap() = state.work_item("A").map(|item| item.status);
        }
        None
    }));

    let project = tempfile::tempdir().unwrap();
    let coordinator = MissionCoordinator::new(
        ConvoyConfig::default(),
        project.path(),
        Arc::new(StaticPlanner {
            plan: plan(vec![implementer("A")]),
        }),
        provider,
        checkpoints.clone(),
    );

    let state = coordinator
        .start("Add login", InteractionMode::FullAuto, None)
        .await
        .unwrap();

    assert_eq!(state.status, MissionStatus::Completed);
    assert_eq!(*observed.lock().unwrap(), Some(WorkItemStatus::Verifying));
}

#[tokio::test]
async fn cancel_during_gate_stops_before_review() {
    let token: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
    let trip = Arc::clone(&token);
    let provider = ScriptedProvider::new(Box::new(move |request, _| {
        if request.worker_type != WorkerType::Tester {
            return None;
        }
        if let Some(token) = trip.lock().unwrap().as_ref() {
            token.cancel();
        }
        Some(Reply::hanging())
    }));
    let h = harness(vec![implementer("A")], provider);
    *token.lock().unwrap() = Some(h.coordinator.cancellation_token());

    let state = h
        .coordinator
        .start("Add login", InteractionMode::FullAuto, None)
        .await
        .unwrap();

    assert_eq!(state.status, MissionStatus::Cancelled);
    assert_eq!(state.work_item("A").unwrap().status, WorkItemStatus::Pending);
    assert_eq!(h.provider.attempts(WorkerType::Tester, "A"), 1);
    assert_eq!(h.provider.attempts(WorkerType::Reviewer, "A"), 0);
}
