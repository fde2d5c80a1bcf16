//! Workspace reconciliation - branch-per-item isolation and deterministic merge-back.

mod diffstat;
mod git;
mod merge;
mod worktree;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::WorkspaceConfig;
use crate::error::GitError;
use crate::state::FileChange;

pub use diffstat::{is_meaningful_change, parse_diff_stat};
pub use git::{authenticated_url, mask_credentials, sanitize_git_url, GitRunner};
pub use merge::{MergeReport, SkippedMerge};
pub use worktree::{get_info, parse_worktree_list, WorktreeEntry, WorktreeManager, WorktreeMarker};

/// Prefix shared by every work item branch.
pub const BRANCH_PREFIX: &str = "convoy/";

/// Branch that holds a work item's changes.
pub fn branch_name(work_item_id: &str) -> String {
    format!("{}{}", BRANCH_PREFIX, work_item_id)
}

/// Result of committing an isolated copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing was staged; not an error
    NoChanges,
    Pushed { branch: String },
}

/// Commits, pushes, inspects, and merges work item branches on one remote.
#[derive(Debug, Clone)]
pub struct WorkspaceReconciler {
    remote_url: String,
    base_branch: String,
    author_name: String,
    author_email: String,
    retry_delay: Duration,
}

impl WorkspaceReconciler {
    /// Build from config; the token env var is read once here.
    pub fn from_config(config: &WorkspaceConfig) -> Option<Self> {
        let url = config.git_remote_url.as_deref()?;
        let token = std::env::var(&config.git_token_env).ok();
        Some(Self::new(config, &authenticated_url(url, token.as_deref())))
    }

    pub fn new(config: &WorkspaceConfig, remote_url: &str) -> Self {
        Self {
            remote_url: remote_url.to_string(),
            base_branch: config.base_branch.clone(),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
            retry_delay: Duration::from_millis(config.merge_retry_delay_ms),
        }
    }

    pub fn remote_url(&self) -> &str {
        &self.remote_url
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn author_name(&self) -> &str {
        &self.author_name
    }

    pub fn author_email(&self) -> &str {
        &self.author_email
    }

    /// Stage everything in `path` and force-push it to the item's branch.
    pub async fn commit_and_push(&self, path: &Path, work_item_id: &str) -> Result<CommitOutcome, GitError> {
        let git = GitRunner::new(path);
        let branch = branch_name(work_item_id);

        git.run_checked(&["add", "-A"]).await?;

        // Exit 0 means the index matches HEAD
        if git.succeeds(&["diff", "--cached", "--quiet"]).await {
            tracing::info!(work_item_id = %work_item_id, "No changes to commit");
            return Ok(CommitOutcome::NoChanges);
        }

        let message = format!("convoy: {}", work_item_id);
        git.run_checked(&[
            "-c",
            &format!("user.name={}", self.author_name),
            "-c",
            &format!("user.email={}", self.author_email),
            "commit",
            "-m",
            &message,
        ])
        .await?;
        git.run_checked(&["push", "--force", "origin", &format!("HEAD:refs/heads/{}", branch)])
            .await?;

        tracing::info!(work_item_id = %work_item_id, branch = %branch, "Pushed work item branch");
        Ok(CommitOutcome::Pushed { branch })
    }

    /// Files changed on the item's branch relative to `base_revision`, read from a local repo.
    pub async fn detect_changes(
        &self,
        work_item_id: &str,
        base_revision: &str,
        path: &Path,
    ) -> Result<Vec<FileChange>, GitError> {
        let git = GitRunner::new(path);
        let branch = branch_name(work_item_id);

        let local = format!("{}..{}", base_revision, branch);
        let stat = match git.run_checked(&["diff", "--compact-summary", &local]).await {
            Ok(stat) => stat,
            Err(_) => {
                let remote = format!("{}..origin/{}", base_revision, branch);
                git.run_checked(&["diff", "--compact-summary", &remote]).await?
            }
        };

        Ok(parse_diff_stat(&stat))
    }

    /// Files changed on the item's pushed branch, read from a throwaway shallow clone.
    pub async fn detect_branch_changes(&self, work_item_id: &str) -> Result<Vec<FileChange>> {
        let branch = branch_name(work_item_id);
        let tmp = tempfile::Builder::new()
            .prefix("convoy-detect-")
            .tempdir()
            .context("Failed to create temp dir")?;
        let dir = tmp.path().join("repo");
        let dir_arg = dir.to_string_lossy().to_string();

        GitRunner::new(tmp.path())
            .run_checked(&["clone", "--depth", "1", "--branch", &branch, &self.remote_url, &dir_arg])
            .await
            .with_context(|| format!("Failed to clone branch {}", branch))?;

        let git = GitRunner::new(&dir);
        let base_ref = format!("refs/remotes/origin/{}", self.base_branch);
        git.run_checked(&[
            "fetch",
            "--depth",
            "1",
            "origin",
            &format!("+refs/heads/{}:{}", self.base_branch, base_ref),
        ])
        .await?;

        let stat = git
            .run_checked(&["diff", "--compact-summary", &format!("origin/{}..HEAD", self.base_branch)])
            .await?;

        Ok(parse_diff_stat(&stat)
            .into_iter()
            .filter(is_meaningful_change)
            .collect())
    }
}
