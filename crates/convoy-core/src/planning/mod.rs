//! Planning collaborators - classification, plans, project context, instructions.

mod context;
mod instructions;
mod plan_file;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::state::{Classification, ExecutionStrategy, WorkItem};

pub use context::{detect_language, ProjectContext, MAX_FILE_TREE_ENTRIES};
pub use instructions::{InstructionRenderer, MarkdownInstructions, RoleInput};
pub use plan_file::PlanFilePlanner;

/// A planned mission: objective, strategy, and the work item graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionPlan {
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub strategy: ExecutionStrategy,
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub items: Vec<WorkItem>,
}

impl MissionPlan {
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}

/// Classifies a request and turns it into a plan.
#[async_trait]
pub trait MissionPlanner: Send + Sync {
    async fn classify(&self, request: &str) -> Result<Classification>;

    async fn plan(
        &self,
        request: &str,
        classification: &Classification,
        context: &ProjectContext,
    ) -> Result<MissionPlan>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FailureStrategy, WorkerType};

    #[test]
    fn test_plan_yaml_uses_item_defaults() {
        let yaml = r#"
objective: Add login
strategy: parallel
items:
  - id: ITEM-001
    worker_type: implementer
    description: Build the endpoint
    target_files: [src/auth.rs]
  - id: ITEM-002
    worker_type: implementer
    description: Wire the route
    dependencies: [ITEM-001]
    on_failure: skip
"#;
        let plan = MissionPlan::from_yaml(yaml).unwrap();
        assert_eq!(plan.strategy, ExecutionStrategy::Parallel);
        assert_eq!(plan.items.len(), 2);
        assert_eq!(plan.items[0].worker_type, WorkerType::Implementer);
        assert_eq!(plan.items[0].max_iterations, 0);
        assert_eq!(plan.items[1].on_failure, Some(FailureStrategy::Skip));
    }
}
