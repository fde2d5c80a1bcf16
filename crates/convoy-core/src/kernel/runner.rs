//! Runner - drives one execution unit from open to teardown.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ConvoyConfig, ExecutionConfig};
use crate::provider::{
    ExecutionProvider, ExecutionRegistry, ExecutionRequest, ExitStatus, FileSnapshot, INSTRUCTIONS_DIR,
};
use crate::state::{ExecutionRecord, ExecutionUnitStatus, FileChange, WorkerType};
use crate::workspace::branch_name;

/// What a single unit produced.
#[derive(Debug, Clone)]
pub struct UnitRun {
    pub worker_type: WorkerType,
    pub work_item_id: String,
    pub exit: ExitStatus,
    pub output: String,
    pub files: Vec<FileChange>,
    pub elapsed_ms: u64,
    pub record: Option<ExecutionRecord>,
    /// Set when the unit could not be started
    pub error: Option<String>,
    pub lenient: bool,
}

impl UnitRun {
    /// A unit that never opened.
    pub fn not_started(request: &ExecutionRequest, error: String) -> Self {
        Self::failed_to_start(request, error, Instant::now())
    }

    fn failed_to_start(request: &ExecutionRequest, error: String, started: Instant) -> Self {
        Self {
            worker_type: request.worker_type,
            work_item_id: request.work_item_id.clone(),
            exit: ExitStatus::Code(1),
            output: String::new(),
            files: Vec::new(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            record: None,
            error: Some(error),
            lenient: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && is_successful_exit(self.exit, &self.files, self.lenient)
    }

    /// One-line description of a failed run.
    pub fn failure_reason(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        match self.exit {
            ExitStatus::TimedOut => format!("{} timed out", self.worker_type),
            ExitStatus::Code(code) => format!("{} exited with code {}", self.worker_type, code),
        }
    }
}

/// Exit 0 succeeds. Exit 1 with observed changes succeeds when leniency is on.
pub fn is_successful_exit(exit: ExitStatus, files: &[FileChange], lenient: bool) -> bool {
    match exit {
        ExitStatus::Code(0) => true,
        ExitStatus::Code(1) => lenient && !files.is_empty(),
        _ => false,
    }
}

/// Instruction file path inside a working copy.
pub fn instruction_path(worker_type: WorkerType, work_item_id: &str) -> String {
    format!("{}/{}-{}.md", INSTRUCTIONS_DIR, work_item_id, worker_type)
}

/// Runs units against one provider and keeps the registry current.
pub struct Runner {
    provider: Arc<dyn ExecutionProvider>,
    registry: Arc<ExecutionRegistry>,
    config: ExecutionConfig,
    snapshot_excludes: Vec<String>,
}

impl Runner {
    pub fn new(provider: Arc<dyn ExecutionProvider>, registry: Arc<ExecutionRegistry>, config: &ConvoyConfig) -> Self {
        Self {
            provider,
            registry,
            config: config.execution.clone(),
            snapshot_excludes: config.local.snapshot_excludes.clone(),
        }
    }

    pub fn provider(&self) -> &Arc<dyn ExecutionProvider> {
        &self.provider
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Request for a worker on a work item, using the item's own branch.
    pub fn request(
        &self,
        worker_type: WorkerType,
        work_item_id: &str,
        working_dir: &Path,
        instruction: String,
    ) -> ExecutionRequest {
        ExecutionRequest {
            worker_type,
            work_item_id: work_item_id.to_string(),
            working_dir: PathBuf::from(working_dir),
            branch: branch_name(work_item_id),
            instruction,
            instruction_path: instruction_path(worker_type, work_item_id),
            env: self.worker_env(worker_type, work_item_id),
            memory_limit_mb: self.config.memory_limit_mb,
            cpu_count: self.config.cpu_count,
        }
    }

    fn worker_env(&self, worker_type: WorkerType, work_item_id: &str) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("CONVOY_WORK_ITEM_ID".to_string(), work_item_id.to_string());
        env.insert("CONVOY_WORKER_TYPE".to_string(), worker_type.to_string());

        if let Some(provider) = &self.config.model_provider {
            env.insert("CONVOY_MODEL_PROVIDER".to_string(), provider.clone());
        }
        if let Some(model) = &self.config.model {
            env.insert("CONVOY_MODEL".to_string(), model.clone());
        }
        if let Some(endpoint) = &self.config.model_endpoint {
            env.insert("CONVOY_MODEL_ENDPOINT".to_string(), endpoint.clone());
        }

        // Remote apps carry their own credentials
        if self.provider.shares_filesystem() {
            for key in &self.config.forward_env {
                if let Ok(value) = std::env::var(key) {
                    env.insert(key.clone(), value);
                }
            }
        }
        env
    }

    /// Open, wait, capture, detect, and always tear down.
    pub async fn run(&self, request: &ExecutionRequest) -> UnitRun {
        let started = Instant::now();
        let shares_fs = self.provider.shares_filesystem();

        if shares_fs {
            if let Err(e) = write_instruction(request) {
                return UnitRun::failed_to_start(request, format!("Failed to write instruction: {}", e), started);
            }
        }
        let before = if shares_fs {
            snapshot(&request.working_dir, &self.snapshot_excludes).await
        } else {
            None
        };

        tracing::info!(
            work_item_id = %request.work_item_id,
            worker_type = %request.worker_type,
            provider = self.provider.name(),
            "Opening execution unit"
        );

        let id = match self.provider.open(request).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(work_item_id = %request.work_item_id, error = %e, "Failed to open execution unit");
                return UnitRun::failed_to_start(request, e.to_string(), started);
            }
        };
        self.registry.register(&id, request.worker_type, &request.work_item_id);

        let exit = self.provider.await_completion(&id, self.config.timeout()).await;
        let output = self.provider.capture_output(&id).await;

        let files = match before {
            Some(before) => match snapshot(&request.working_dir, &self.snapshot_excludes).await {
                Some(after) => before.diff(&after),
                None => Vec::new(),
            },
            None => self.provider.detect_changes(request).await.unwrap_or_default(),
        };

        self.provider.teardown(&id).await;

        let lenient = self.provider.lenient_exit();
        let status = if is_successful_exit(exit, &files, lenient) {
            ExecutionUnitStatus::Completed
        } else {
            ExecutionUnitStatus::Failed
        };
        let record = self.registry.finish(&id, status);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            work_item_id = %request.work_item_id,
            worker_type = %request.worker_type,
            exit_code = exit.code(),
            files = files.len(),
            elapsed_ms,
            "Execution unit finished"
        );

        UnitRun {
            worker_type: request.worker_type,
            work_item_id: request.work_item_id.clone(),
            exit,
            output,
            files,
            elapsed_ms,
            record,
            error: None,
            lenient,
        }
    }
}

/// Walk a working copy on the blocking pool.
async fn snapshot(dir: &Path, excludes: &[String]) -> Option<FileSnapshot> {
    let dir = dir.to_path_buf();
    let excludes = excludes.to_vec();
    match tokio::task::spawn_blocking(move || FileSnapshot::capture(&dir, &excludes)).await {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            tracing::warn!(error = %e, "File snapshot failed");
            None
        }
    }
}

fn write_instruction(request: &ExecutionRequest) -> std::io::Result<()> {
    let path = request.working_dir.join(&request.instruction_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &request.instruction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FileAction;

    #[test]
    fn test_exit_one_needs_changes_and_leniency() {
        let changes = vec![FileChange::new("a.rs", FileAction::Created, 0)];
        assert!(is_successful_exit(ExitStatus::Code(0), &[], false));
        assert!(is_successful_exit(ExitStatus::Code(1), &changes, true));
        assert!(!is_successful_exit(ExitStatus::Code(1), &changes, false));
        assert!(!is_successful_exit(ExitStatus::Code(1), &[], true));
        assert!(!is_successful_exit(ExitStatus::Code(2), &changes, true));
        assert!(!is_successful_exit(ExitStatus::TimedOut, &changes, true));
    }

    #[tokio::test]
    async fn test_snapshot_sees_changes_between_captures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kept.rs"), "fn a() {}").unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();

        let excludes = vec!["target".to_string()];
        let before = snapshot(dir.path(), &excludes).await.unwrap();
        std::fs::write(dir.path().join("added.rs"), "fn b() {}").unwrap();
        std::fs::write(dir.path().join("target/out.o"), "bin").unwrap();
        let after = snapshot(dir.path(), &excludes).await.unwrap();

        let changes = before.diff(&after);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "added.rs");
        assert_eq!(changes[0].action, FileAction::Created);
    }

    #[test]
    fn test_instruction_path_is_per_worker() {
        assert_eq!(
            instruction_path(WorkerType::Tester, "ITEM-001"),
            ".convoy/instructions/ITEM-001-tester.md"
        );
    }
}
