//! Planner backed by a YAML mission plan on disk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{MissionPlan, MissionPlanner, ProjectContext};
use crate::state::Classification;

/// Reads a prepared plan instead of asking a model.
pub struct PlanFilePlanner {
    path: PathBuf,
}

impl PlanFilePlanner {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<MissionPlan> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read plan from {}", self.path.display()))?;
        MissionPlan::from_yaml(&content)
            .with_context(|| format!("Failed to parse plan from {}", self.path.display()))
    }
}

#[async_trait]
impl MissionPlanner for PlanFilePlanner {
    async fn classify(&self, request: &str) -> Result<Classification> {
        let plan = self.load()?;
        let mut classification = plan.classification.unwrap_or_default();
        if classification.category.is_empty() {
            classification.category = "feature".to_string();
        }
        if classification.planning_strategy.is_empty() {
            classification.planning_strategy = "plan-file".to_string();
        }
        tracing::debug!(request = %request, category = %classification.category, "Classified from plan file");
        Ok(classification)
    }

    async fn plan(
        &self,
        _request: &str,
        _classification: &Classification,
        _context: &ProjectContext,
    ) -> Result<MissionPlan> {
        self.load()
    }
}
