//! Work item model - one schedulable unit of a mission plan.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of agent that executes a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    Implementer,
    Tester,
    Reviewer,
    Researcher,
    Refactorer,
    Deployer,
}

impl WorkerType {
    /// Parse worker type from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "implementer" | "coder" => Some(Self::Implementer),
            "tester" => Some(Self::Tester),
            "reviewer" => Some(Self::Reviewer),
            "researcher" => Some(Self::Researcher),
            "refactorer" => Some(Self::Refactorer),
            "deployer" => Some(Self::Deployer),
            _ => None,
        }
    }

    /// Get worker type name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Implementer => "implementer",
            Self::Tester => "tester",
            Self::Reviewer => "reviewer",
            Self::Researcher => "researcher",
            Self::Refactorer => "refactorer",
            Self::Deployer => "deployer",
        }
    }

    /// Whether this worker writes code that must pass the quality gate and be merged.
    pub fn produces_code(&self) -> bool {
        matches!(self, Self::Implementer | Self::Refactorer)
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Work item lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemStatus {
    #[default]
    Pending,
    Running,
    Verifying,
    Passed,
    Failed,
    Skipped,
}

impl WorkItemStatus {
    /// Terminal for scheduling purposes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Skipped)
    }
}

/// Recovery action applied when a work item is denied by the quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStrategy {
    Retry,
    Replan,
    Escalate,
    Skip,
}

impl fmt::Display for FailureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Retry => "retry",
            Self::Replan => "replan",
            Self::Escalate => "escalate",
            Self::Skip => "skip",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Created,
    Modified,
    Deleted,
}

/// A single observed file change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: FileAction,
    #[serde(default)]
    pub lines_changed: u32,
}

impl FileChange {
    pub fn new(path: impl Into<String>, action: FileAction, lines_changed: u32) -> Self {
        Self {
            path: path.into(),
            action,
            lines_changed,
        }
    }
}

/// A single unit of work in a mission plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique, stable identifier
    pub id: String,

    /// Agent kind that executes this item
    pub worker_type: WorkerType,

    /// What to do
    #[serde(default)]
    pub description: String,

    /// Additional context for the worker (enriched on retry)
    #[serde(default)]
    pub input_context: String,

    /// How the worker knows it is done
    #[serde(default)]
    pub success_criteria: String,

    /// Work item IDs that must complete first
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Current status
    #[serde(default)]
    pub status: WorkItemStatus,

    /// Retry counter
    #[serde(default)]
    pub iteration: u32,

    /// Retry budget; 0 in a plan takes the configured default
    #[serde(default)]
    pub max_iterations: u32,

    /// Recovery policy on gate denial (retry when unset)
    #[serde(default)]
    pub on_failure: Option<FailureStrategy>,

    /// Files the planner expects this item to touch
    #[serde(default)]
    pub target_files: Vec<String>,

    /// Files observed to change after execution
    #[serde(default)]
    pub files_affected: Vec<FileChange>,

    /// Wall-clock duration of the last execution
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
}

fn default_max_iterations() -> u32 {
    3
}

impl WorkItem {
    pub fn new(id: impl Into<String>, worker_type: WorkerType, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            worker_type,
            description: description.into(),
            input_context: String::new(),
            success_criteria: String::new(),
            dependencies: Vec::new(),
            status: WorkItemStatus::Pending,
            iteration: 0,
            max_iterations: default_max_iterations(),
            on_failure: None,
            target_files: Vec::new(),
            files_affected: Vec::new(),
            elapsed_ms: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_target_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_on_failure(mut self, strategy: FailureStrategy) -> Self {
        self.on_failure = Some(strategy);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Check if all dependencies are in the completed set
    pub fn dependencies_satisfied(&self, completed: &HashSet<String>) -> bool {
        self.dependencies.iter().all(|dep| completed.contains(dep))
    }

    /// Recovery policy, defaulting to retry
    pub fn failure_strategy(&self) -> FailureStrategy {
        self.on_failure.unwrap_or(FailureStrategy::Retry)
    }

    /// Whether the retry budget is used up
    pub fn iterations_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }
}
