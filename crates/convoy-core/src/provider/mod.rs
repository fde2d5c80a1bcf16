//! Execution providers - disposable units that run one worker for one work item.

mod local;
mod platform;
mod registry;
mod remote;
mod snapshot;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Backend, ConvoyConfig};
use crate::error::ProviderError;
use crate::state::{FileChange, WorkerType};
use crate::workspace::WorkspaceReconciler;

pub use local::LocalContainerProvider;
pub use platform::{HttpTaskPlatform, TaskInfo, TaskPlatform, TaskSpec, TaskState};
pub use registry::ExecutionRegistry;
pub use remote::{build_task_command, shell_quote, RemoteTaskProvider, MAX_TASK_COMMAND_LEN};
pub use snapshot::FileSnapshot;

/// Where instruction files live inside a working copy.
pub const INSTRUCTIONS_DIR: &str = ".convoy/instructions";

/// Exit code reported for a unit that did not finish in time.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

const UNIT_PREFIX: &str = "convoy-";

/// Opaque handle of an open execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How an execution unit finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    TimedOut,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            Self::Code(code) => *code,
            Self::TimedOut => TIMEOUT_EXIT_CODE,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Code(0))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// Everything a provider needs to open a unit.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub worker_type: WorkerType,
    pub work_item_id: String,
    /// Project directory or worktree the worker operates on
    pub working_dir: PathBuf,
    /// Branch the unit works on when it has no shared filesystem
    pub branch: String,
    pub instruction: String,
    /// Instruction file path relative to the working copy
    pub instruction_path: String,
    pub env: BTreeMap<String, String>,
    pub memory_limit_mb: u32,
    pub cpu_count: u32,
}

impl ExecutionRequest {
    pub fn unit_name(&self) -> String {
        execution_unit_name(self.worker_type, &self.work_item_id)
    }
}

/// Lifecycle of one isolated execution unit.
#[async_trait]
pub trait ExecutionProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the unit writes directly into `ExecutionRequest::working_dir`
    fn shares_filesystem(&self) -> bool;

    /// Whether exit code 1 with observed file changes counts as success
    fn lenient_exit(&self) -> bool {
        false
    }

    /// Start a unit
    async fn open(&self, request: &ExecutionRequest) -> Result<ExecutionId, ProviderError>;

    /// Wait for the unit to finish, at most `timeout`
    async fn await_completion(&self, id: &ExecutionId, timeout: Duration) -> ExitStatus;

    /// Best-effort output of the unit
    async fn capture_output(&self, id: &ExecutionId) -> String;

    /// Stop and remove the unit. Never fails.
    async fn teardown(&self, id: &ExecutionId);

    /// Provider-side change detection, when the filesystem is not shared
    async fn detect_changes(&self, _request: &ExecutionRequest) -> Option<Vec<FileChange>> {
        None
    }
}

/// Deterministic unit name for a worker type and work item.
pub fn execution_unit_name(worker_type: WorkerType, work_item_id: &str) -> String {
    let sanitized: String = work_item_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{}{}-{}", UNIT_PREFIX, worker_type, sanitized)
}

/// Recover worker type and (sanitized) work item id from a unit name.
pub fn parse_execution_unit_name(name: &str) -> Option<(WorkerType, String)> {
    let rest = name.strip_prefix(UNIT_PREFIX)?;
    let (kind, id) = rest.split_once('-')?;
    if id.is_empty() {
        return None;
    }
    Some((WorkerType::from_name(kind)?, id.to_string()))
}

/// Build the provider selected by `execution.backend`.
pub fn create_provider(
    config: &ConvoyConfig,
    reconciler: Option<WorkspaceReconciler>,
) -> Result<Arc<dyn ExecutionProvider>> {
    match config.execution.backend {
        Backend::Local => Ok(Arc::new(LocalContainerProvider::new(
            config.local.clone(),
            config.execution.lenient_exit_code,
        ))),
        Backend::Remote => {
            let reconciler = reconciler.ok_or(ProviderError::MissingConfig("workspace.git_remote_url"))?;
            let platform = HttpTaskPlatform::from_config(&config.remote)?;
            Ok(Arc::new(RemoteTaskProvider::new(
                Arc::new(platform),
                config.remote.clone(),
                reconciler,
            )))
        }
    }
}
