//! Per-iteration results produced while executing and verifying work items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::work_item::{FailureStrategy, FileChange, WorkItemStatus, WorkerType};

/// Parsed outcome of a test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub work_item_id: String,
    #[serde(default)]
    pub iteration: u32,
    pub passed: bool,
    pub total_tests: u32,
    pub failed_tests: u32,
    #[serde(default)]
    pub raw_output: String,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Structured review of a work item's changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFeedback {
    pub work_item_id: String,
    #[serde(default)]
    pub iteration: u32,
    pub approved: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// 0 to 10
    pub score: u8,
}

impl ReviewFeedback {
    /// A failed, zero-score review.
    pub fn rejected(work_item_id: impl Into<String>, summary: &str, issue: &str) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            iteration: 0,
            approved: false,
            summary: summary.to_string(),
            issues: vec![issue.to_string()],
            suggestions: Vec::new(),
            score: 0,
        }
    }
}

/// Outcome of the quality gate for one work item iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub granted: bool,
    pub action: Option<FailureStrategy>,
    pub reason: String,
}

impl GateDecision {
    pub fn granted(reason: impl Into<String>) -> Self {
        Self {
            granted: true,
            action: None,
            reason: reason.into(),
        }
    }

    pub fn denied(action: FailureStrategy, reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            action: Some(action),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionUnitStatus {
    Opened,
    Completed,
    Failed,
}

/// Descriptor of one execution unit (container or remote task).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub worker_type: WorkerType,
    pub work_item_id: String,
    pub status: ExecutionUnitStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn opened(execution_id: &str, worker_type: WorkerType, work_item_id: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            worker_type,
            work_item_id: work_item_id.to_string(),
            status: ExecutionUnitStatus::Opened,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn finish(&mut self, status: ExecutionUnitStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}

/// What one dispatched work item produced in a wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveDispatchResult {
    pub work_item_id: String,
    pub wave: u32,
    pub status: WorkItemStatus,
    #[serde(default)]
    pub files_affected: Vec<FileChange>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub elapsed_ms: u64,
    /// When dispatch finished, used to order merges
    pub completed_at: DateTime<Utc>,
}
