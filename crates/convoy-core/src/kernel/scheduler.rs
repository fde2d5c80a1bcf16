//! Scheduler - turns the work item graph into concurrency-bounded waves.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::config::{ConvoyConfig, SchedulingConfig};
use crate::error::PlanningError;
use crate::state::{ExecutionStrategy, MissionState, WorkItem, WorkItemStatus};

/// Compute the next wave of eligible work item ids.
///
/// Items are visited in declaration order, so earlier items win when more are
/// eligible than the wave can hold. An item is eligible when it is not completed
/// and all of its dependencies are. Returns an empty wave both when everything
/// is done and when the remaining items can never run; callers tell the two
/// apart with [`find_stuck`].
pub fn compute_next_wave<'a, I>(
    items: I,
    completed: &HashSet<String>,
    strategy: ExecutionStrategy,
    max_parallel: usize,
) -> Vec<String>
where
    I: IntoIterator<Item = &'a WorkItem>,
{
    let cap = wave_cap(strategy, max_parallel);

    items
        .into_iter()
        .filter(|item| !completed.contains(&item.id) && item.dependencies_satisfied(completed))
        .take(cap)
        .map(|item| item.id.clone())
        .collect()
}

fn wave_cap(strategy: ExecutionStrategy, max_parallel: usize) -> usize {
    match strategy {
        ExecutionStrategy::Sequential => 1,
        ExecutionStrategy::Parallel => max_parallel.max(1),
    }
}

/// Items that are neither completed nor terminal.
///
/// Non-empty when the next wave is empty means the plan is broken.
pub fn find_stuck<'a, I>(items: I, completed: &HashSet<String>) -> Vec<String>
where
    I: IntoIterator<Item = &'a WorkItem>,
{
    items
        .into_iter()
        .filter(|item| !completed.contains(&item.id) && !item.status.is_terminal())
        .map(|item| item.id.clone())
        .collect()
}

/// Reject plans with duplicate ids, unknown dependencies, or cycles.
pub fn validate_plan(items: &[WorkItem]) -> Result<(), PlanningError> {
    let mut ids = HashSet::new();
    for item in items {
        if !ids.insert(item.id.as_str()) {
            return Err(PlanningError::DuplicateId(item.id.clone()));
        }
    }

    for item in items {
        for dep in &item.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(PlanningError::UnknownDependency {
                    item: item.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Kahn's algorithm: whatever never reaches in-degree zero sits on a cycle
    let mut in_degree: HashMap<&str, usize> = items
        .iter()
        .map(|i| (i.id.as_str(), i.dependencies.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for item in items {
        for dep in &item.dependencies {
            dependents.entry(dep.as_str()).or_default().push(item.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = items
        .iter()
        .filter(|i| i.dependencies.is_empty())
        .map(|i| i.id.as_str())
        .collect();
    let mut visited = 0;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        for next in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if visited < items.len() {
        let cyclic = items
            .iter()
            .filter(|i| in_degree.get(i.id.as_str()).copied().unwrap_or(0) > 0)
            .map(|i| i.id.clone())
            .collect();
        return Err(PlanningError::Cycle(cyclic));
    }

    Ok(())
}

/// Result of a scheduling cycle.
#[derive(Debug, Default)]
pub struct ScheduleResult {
    /// Items dispatched this wave, in priority order
    pub wave: Vec<String>,
    /// Eligible items held back because their target files overlap the wave
    pub deferred: Vec<String>,
}

impl ScheduleResult {
    pub fn is_empty(&self) -> bool {
        self.wave.is_empty()
    }

    pub fn summary(&self) -> String {
        format!("Wave: {}, Deferred: {}", self.wave.len(), self.deferred.len())
    }
}

/// Scheduler for mission waves.
pub struct WaveScheduler {
    config: SchedulingConfig,
    max_parallel: usize,
}

impl WaveScheduler {
    pub fn new(config: &ConvoyConfig) -> Self {
        Self {
            config: config.scheduling.clone(),
            max_parallel: config.max_parallel,
        }
    }

    /// Run a scheduling cycle over the mission's effective completed set.
    ///
    /// Failed items outside the completed set are never rescheduled.
    pub fn schedule(&self, state: &MissionState) -> ScheduleResult {
        let completed = state.effective_completed();
        let parallel = state.strategy == ExecutionStrategy::Parallel;
        let schedulable = || {
            state
                .work_items
                .iter()
                .filter(|item| item.status != WorkItemStatus::Failed)
        };

        if !(parallel && self.config.defer_overlapping_targets) {
            return ScheduleResult {
                wave: compute_next_wave(schedulable(), &completed, state.strategy, self.max_parallel),
                deferred: Vec::new(),
            };
        }

        let eligible = compute_next_wave(
            schedulable(),
            &completed,
            state.strategy,
            usize::MAX,
        );
        let cap = wave_cap(state.strategy, self.max_parallel);

        let mut result = ScheduleResult::default();
        let mut claimed: Vec<String> = Vec::new();

        for id in eligible {
            if result.wave.len() == cap {
                break;
            }
            let targets: Vec<String> = state
                .work_item(&id)
                .map(|item| item.target_files.iter().map(|f| normalize_path(f)).collect())
                .unwrap_or_default();

            if targets.iter().any(|t| claimed.iter().any(|c| paths_overlap(t, c))) {
                tracing::debug!(work_item_id = %id, "Deferring item with overlapping target files");
                result.deferred.push(id);
                continue;
            }

            claimed.extend(targets);
            result.wave.push(id);
        }

        result
    }
}

fn normalize_path(path: &str) -> String {
    path.trim().trim_start_matches("./").to_string()
}

/// Equal paths, or one is a path-suffix of the other (`src/a.rs` vs `a.rs`).
fn paths_overlap(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.ends_with(&format!("/{}", b)) || b.ends_with(&format!("/{}", a))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_overlap_by_suffix() {
        assert!(paths_overlap("src/lib.rs", "lib.rs"));
        assert!(paths_overlap("src/lib.rs", "src/lib.rs"));
        assert!(!paths_overlap("src/mylib.rs", "lib.rs"));
        assert_eq!(normalize_path("./src/main.rs"), "src/main.rs");
    }
}
