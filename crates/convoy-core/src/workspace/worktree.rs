//! Worktree management - per-item isolated checkouts of a long-lived mission clone.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::branch_name;
use super::git::GitRunner;
use crate::config::WorkspaceConfig;

const MARKER_FILE: &str = ".convoy-worktree";

/// Worktree metadata marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeMarker {
    pub mission_id: String,
    pub work_item_id: String,
    pub branch: String,
    pub created: String,
    pub parent_commit: String,
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    pub branch: Option<String>,
}

/// Manages the mission clone and the worktrees attached to it.
pub struct WorktreeManager {
    config: WorkspaceConfig,
    mission_id: String,
    root: PathBuf,
    // git refuses concurrent worktree mutations on one repository
    lock: Mutex<()>,
}

impl WorktreeManager {
    pub fn new(config: &WorkspaceConfig, mission_id: &str) -> Self {
        Self {
            config: config.clone(),
            mission_id: mission_id.to_string(),
            root: config.workspaces_dir.join(mission_id),
            lock: Mutex::new(()),
        }
    }

    /// Path of the long-lived mission clone
    pub fn mission_clone(&self) -> PathBuf {
        self.root.join("repo")
    }

    fn worktrees_dir(&self) -> PathBuf {
        self.root.join("worktrees")
    }

    /// Clone the remote for this mission, or refresh an existing clone.
    pub async fn create_mission_workspace(&self, remote_url: &str) -> Result<PathBuf> {
        let _guard = self.lock.lock().await;
        let clone = self.mission_clone();

        if clone.join(".git").exists() {
            GitRunner::new(&clone).run_checked(&["fetch", "origin"]).await?;
            return Ok(clone);
        }

        tracing::info!(
            mission_id = %self.mission_id,
            path = %clone.display(),
            "Creating mission workspace"
        );

        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create {}", self.root.display()))?;
        let clone_arg = clone.to_string_lossy().to_string();
        GitRunner::new(&self.root)
            .run_checked(&["clone", remote_url, &clone_arg])
            .await
            .context("Failed to clone mission workspace")?;

        let git = GitRunner::new(&clone);
        git.configure_identity(&self.config.author_name, &self.config.author_email)
            .await?;

        // Kernel files never get committed from any worktree
        let exclude = clone.join(".git/info/exclude");
        if let Some(parent) = exclude.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut patterns = std::fs::read_to_string(&exclude).unwrap_or_default();
        patterns.push_str(&format!("\n{}\n.convoy/\n", MARKER_FILE));
        std::fs::write(&exclude, patterns)?;

        Ok(clone)
    }

    /// Create a worktree for a work item from the current tip of the base branch.
    pub async fn acquire(&self, work_item_id: &str) -> Result<PathBuf> {
        let _guard = self.lock.lock().await;
        let clone = self.mission_clone();
        let git = GitRunner::new(&clone);
        let branch = branch_name(work_item_id);
        let base = format!("origin/{}", self.config.base_branch);
        let path = self.worktrees_dir().join(work_item_id);
        let path_arg = path.to_string_lossy().to_string();

        std::fs::create_dir_all(self.worktrees_dir())?;
        git.run_checked(&["fetch", "origin", &self.config.base_branch])
            .await
            .context("Failed to refresh base branch")?;

        // Stale worktree left by an interrupted run
        if path.exists() {
            git.run_quiet(&["worktree", "remove", "--force", &path_arg]).await;
            let _ = std::fs::remove_dir_all(&path);
            git.run_quiet(&["worktree", "prune"]).await;
        }

        let created = git
            .run(&["worktree", "add", &path_arg, "-b", &branch, &base])
            .await?;
        if !created.status.success() {
            // Branch survives from an earlier iteration: reattach it
            git.run_checked(&["worktree", "add", &path_arg, &branch])
                .await
                .with_context(|| format!("Failed to create worktree for {}", work_item_id))?;
        }

        let marker = WorktreeMarker {
            mission_id: self.mission_id.clone(),
            work_item_id: work_item_id.to_string(),
            branch,
            created: Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
            parent_commit: GitRunner::new(&path)
                .head()
                .await
                .unwrap_or_else(|| "unknown".to_string()),
        };
        std::fs::write(path.join(MARKER_FILE), serde_json::to_string_pretty(&marker)?)?;

        tracing::info!(
            work_item_id = %work_item_id,
            path = %path.display(),
            "Worktree created"
        );

        Ok(path)
    }

    /// Remove a work item's worktree and local branch. Never fails.
    pub async fn release(&self, work_item_id: &str) {
        let _guard = self.lock.lock().await;
        let git = GitRunner::new(self.mission_clone());
        let path = self.worktrees_dir().join(work_item_id);
        let path_arg = path.to_string_lossy().to_string();

        tracing::info!(work_item_id = %work_item_id, "Releasing worktree");

        if !git.succeeds(&["worktree", "remove", "--force", &path_arg]).await {
            let _ = std::fs::remove_dir_all(&path);
            git.run_quiet(&["worktree", "prune"]).await;
        }
        git.run_quiet(&["branch", "-D", &branch_name(work_item_id)]).await;
    }

    /// Worktrees registered with the mission clone.
    pub async fn list(&self) -> Vec<WorktreeEntry> {
        let git = GitRunner::new(self.mission_clone());
        match git.run_checked(&["worktree", "list", "--porcelain"]).await {
            Ok(out) => parse_worktree_list(&out),
            Err(e) => {
                tracing::debug!(error = %e, "Could not list worktrees");
                Vec::new()
            }
        }
    }

    /// Markers of worktrees present on disk.
    pub fn list_active(&self) -> Vec<WorktreeMarker> {
        std::fs::read_dir(self.worktrees_dir())
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .filter_map(|e| get_info(&e.path()))
            .collect()
    }

    /// Remove every worktree and the mission clone itself.
    pub async fn cleanup_mission(&self) {
        for marker in self.list_active() {
            self.release(&marker.work_item_id).await;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            tracing::debug!(error = %e, "Mission workspace already gone");
        }
        tracing::info!(mission_id = %self.mission_id, "Mission workspace cleaned up");
    }
}

/// Read the marker of a worktree.
pub fn get_info(worktree_path: &Path) -> Option<WorktreeMarker> {
    let content = std::fs::read_to_string(worktree_path.join(MARKER_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

/// Parse `git worktree list --porcelain`.
pub fn parse_worktree_list(text: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in text.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                head: None,
                branch: None,
            });
        } else if let Some(entry) = current.as_mut() {
            if let Some(head) = line.strip_prefix("HEAD ") {
                entry.head = Some(head.to_string());
            } else if let Some(branch) = line.strip_prefix("branch ") {
                entry.branch = Some(branch.trim_start_matches("refs/heads/").to_string());
            }
        }
    }

    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}
