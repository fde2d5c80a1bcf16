//! Mission state - the aggregate owned by the coordinator and persisted per checkpoint.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ledger::{CompletedSet, WorkItemLedger};
use super::results::{ExecutionRecord, ReviewFeedback, TestResult, WaveDispatchResult};
use super::work_item::WorkItem;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    #[default]
    Classifying,
    Planning,
    AwaitingApproval,
    Executing,
    Converging,
    Completed,
    Failed,
    Cancelled,
}

impl MissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Classifying => "classifying",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Converging => "converging",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    Parallel,
}

impl ExecutionStrategy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "sequential" => Some(Self::Sequential),
            "parallel" => Some(Self::Parallel),
            _ => None,
        }
    }
}

/// Controls whether the mission pauses for a human after planning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    #[default]
    FullAuto,
    ApprovePlan,
    StepByStep,
}

impl InteractionMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().replace('-', "_").as_str() {
            "full_auto" => Some(Self::FullAuto),
            "approve_plan" => Some(Self::ApprovePlan),
            "step_by_step" => Some(Self::StepByStep),
            _ => None,
        }
    }

    pub fn requires_approval(&self) -> bool {
        !matches!(self, Self::FullAuto)
    }
}

/// Request classification returned by the planning collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    #[serde(default)]
    pub complexity: u8,
    #[serde(default)]
    pub affected_components: Vec<String>,
    #[serde(default)]
    pub planning_strategy: String,
}

/// Marks a completed item as forced back to pending.
///
/// Marks are never removed. A mark stops overriding the completed set once
/// `resolved` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryMark {
    pub work_item_id: String,
    pub wave: u32,
    pub reason: String,
    #[serde(default)]
    pub resolved: bool,
}

impl RetryMark {
    pub fn new(work_item_id: impl Into<String>, wave: u32, reason: impl Into<String>) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            wave,
            reason: reason.into(),
            resolved: false,
        }
    }
}

/// Aggregate numbers computed at convergence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionMetrics {
    pub items_completed: u32,
    pub items_failed: u32,
    pub items_skipped: u32,
    pub total_iterations: u32,
    pub files_created: u32,
    pub files_modified: u32,
    pub files_deleted: u32,
    pub tests_run: u32,
    pub tests_passed: u32,
    pub waves_executed: u32,
    pub aggregate_duration_ms: u64,
}

/// Full persisted state of one mission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionState {
    pub mission_id: String,
    pub request: String,
    #[serde(default)]
    pub interaction_mode: InteractionMode,
    #[serde(default)]
    pub status: MissionStatus,
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub strategy: ExecutionStrategy,
    #[serde(default)]
    pub project_path: Option<PathBuf>,
    #[serde(default)]
    pub git_remote_url: Option<String>,
    #[serde(default)]
    pub work_items: WorkItemLedger,
    #[serde(default)]
    pub completed: CompletedSet,
    #[serde(default)]
    pub retrying: Vec<RetryMark>,
    /// Number of waves dispatched so far
    #[serde(default)]
    pub wave: u32,
    #[serde(default)]
    pub wave_results: Vec<WaveDispatchResult>,
    #[serde(default)]
    pub test_results: Vec<TestResult>,
    #[serde(default)]
    pub reviews: Vec<ReviewFeedback>,
    #[serde(default)]
    pub executions: Vec<ExecutionRecord>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub metrics: Option<MissionMetrics>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A partial update returned by one coordinator phase.
///
/// Scalars overwrite. Collections accumulate, collapsing duplicates by key
/// with the latest value winning, so applying the same update twice is a no-op.
#[derive(Debug, Clone, Default)]
pub struct MissionUpdate {
    pub status: Option<MissionStatus>,
    pub classification: Option<Classification>,
    pub objective: Option<String>,
    pub strategy: Option<ExecutionStrategy>,
    pub wave: Option<u32>,
    pub work_items: Vec<WorkItem>,
    pub completed: Vec<String>,
    pub retry_marks: Vec<RetryMark>,
    pub resolved_retries: Vec<String>,
    pub wave_results: Vec<WaveDispatchResult>,
    pub test_results: Vec<TestResult>,
    pub reviews: Vec<ReviewFeedback>,
    pub executions: Vec<ExecutionRecord>,
    pub errors: Vec<String>,
    pub metrics: Option<MissionMetrics>,
}

impl MissionUpdate {
    pub fn status(status: MissionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(MissionStatus::Failed),
            errors: vec![error.into()],
            ..Default::default()
        }
    }
}

impl MissionState {
    pub fn new(mission_id: impl Into<String>, request: impl Into<String>, mode: InteractionMode) -> Self {
        let now = Utc::now();
        Self {
            mission_id: mission_id.into(),
            request: request.into(),
            interaction_mode: mode,
            status: MissionStatus::Classifying,
            classification: None,
            objective: None,
            strategy: ExecutionStrategy::default(),
            project_path: None,
            git_remote_url: None,
            work_items: WorkItemLedger::new(),
            completed: CompletedSet::new(),
            retrying: Vec::new(),
            wave: 0,
            wave_results: Vec::new(),
            test_results: Vec::new(),
            reviews: Vec::new(),
            executions: Vec::new(),
            errors: Vec::new(),
            metrics: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold a phase update into the state.
    pub fn apply(&mut self, update: MissionUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(classification) = update.classification {
            self.classification = Some(classification);
        }
        if let Some(objective) = update.objective {
            self.objective = Some(objective);
        }
        if let Some(strategy) = update.strategy {
            self.strategy = strategy;
        }
        if let Some(wave) = update.wave {
            self.wave = wave;
        }
        if let Some(metrics) = update.metrics {
            self.metrics = Some(metrics);
        }

        for item in update.work_items {
            self.work_items.upsert(item);
        }
        for id in update.completed {
            self.completed.insert(id);
        }
        for mark in update.retry_marks {
            let exists = self
                .retrying
                .iter()
                .any(|m| m.work_item_id == mark.work_item_id && m.wave == mark.wave);
            if !exists {
                self.retrying.push(mark);
            }
        }
        for id in update.resolved_retries {
            for mark in self.retrying.iter_mut().filter(|m| m.work_item_id == id) {
                mark.resolved = true;
            }
        }
        for result in update.wave_results {
            upsert_by(&mut self.wave_results, result, |r| (r.work_item_id.clone(), r.wave));
        }
        for result in update.test_results {
            upsert_by(&mut self.test_results, result, |r| (r.work_item_id.clone(), r.iteration));
        }
        for review in update.reviews {
            upsert_by(&mut self.reviews, review, |r| (r.work_item_id.clone(), r.iteration));
        }
        for record in update.executions {
            upsert_by(&mut self.executions, record, |r| (r.execution_id.clone(), r.started_at));
        }
        for error in update.errors {
            if !self.errors.contains(&error) {
                self.errors.push(error);
            }
        }

        self.updated_at = Utc::now();
    }

    /// Completed ids minus those with an unresolved retry mark.
    pub fn effective_completed(&self) -> HashSet<String> {
        let retrying: HashSet<&str> = self
            .retrying
            .iter()
            .filter(|m| !m.resolved)
            .map(|m| m.work_item_id.as_str())
            .collect();

        self.completed
            .iter()
            .filter(|id| !retrying.contains(id))
            .map(|id| id.to_string())
            .collect()
    }

    /// Whether the item currently carries an unresolved retry mark.
    pub fn is_retrying(&self, id: &str) -> bool {
        self.retrying.iter().any(|m| !m.resolved && m.work_item_id == id)
    }

    pub fn work_item(&self, id: &str) -> Option<&WorkItem> {
        self.work_items.get(id)
    }
}

fn upsert_by<T, K, F>(items: &mut Vec<T>, item: T, key: F)
where
    K: PartialEq,
    F: Fn(&T) -> K,
{
    let k = key(&item);
    match items.iter().position(|existing| key(existing) == k) {
        Some(pos) => items[pos] = item,
        None => items.push(item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{WorkItemStatus, WorkerType};

    fn update_with_items() -> MissionUpdate {
        MissionUpdate {
            status: Some(MissionStatus::Executing),
            work_items: vec![
                WorkItem::new("ITEM-001", WorkerType::Implementer, "a"),
                WorkItem::new("ITEM-002", WorkerType::Implementer, "b"),
            ],
            completed: vec!["ITEM-001".to_string()],
            errors: vec!["boom".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut state = MissionState::new("CONVOY-2026-0001", "req", InteractionMode::FullAuto);
        state.apply(update_with_items());
        let once = (state.work_items.len(), state.completed.len(), state.errors.len());
        state.apply(update_with_items());
        let twice = (state.work_items.len(), state.completed.len(), state.errors.len());
        assert_eq!(once, twice);
        assert_eq!(once, (2, 1, 1));
    }

    #[test]
    fn test_retry_mark_overlays_completed_set() {
        let mut state = MissionState::new("CONVOY-2026-0001", "req", InteractionMode::FullAuto);
        state.apply(update_with_items());
        state.apply(MissionUpdate {
            retry_marks: vec![RetryMark::new("ITEM-001", 1, "merge conflict")],
            ..Default::default()
        });

        assert!(state.completed.contains("ITEM-001"));
        assert!(!state.effective_completed().contains("ITEM-001"));
        assert!(state.is_retrying("ITEM-001"));

        state.apply(MissionUpdate {
            resolved_retries: vec!["ITEM-001".to_string()],
            ..Default::default()
        });
        assert!(state.effective_completed().contains("ITEM-001"));
        assert_eq!(state.retrying.len(), 1);
    }

    #[test]
    fn test_latest_work_item_write_wins() {
        let mut state = MissionState::new("CONVOY-2026-0001", "req", InteractionMode::FullAuto);
        state.apply(update_with_items());
        let mut item = state.work_item("ITEM-002").cloned().unwrap();
        item.status = WorkItemStatus::Passed;
        state.apply(MissionUpdate {
            work_items: vec![item],
            ..Default::default()
        });
        assert_eq!(state.work_item("ITEM-002").unwrap().status, WorkItemStatus::Passed);
        assert_eq!(state.work_items.len(), 2);
    }
}
