//! Merge reconciliation - rebase each item branch onto base and fast-forward, in order.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::git::GitRunner;
use super::{branch_name, WorkspaceReconciler};
use crate::error::GitError;

/// Rebase attempts per branch before its changes are skipped.
const MERGE_ATTEMPTS: u32 = 2;

/// A branch whose changes were left out of the base branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedMerge {
    pub work_item_id: String,
    pub reason: String,
    #[serde(default)]
    pub conflicting_files: Vec<String>,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Merged ids, in merge order
    pub merged: Vec<String>,
    pub skipped: Vec<SkippedMerge>,
    /// Ids whose branch did not exist on the remote
    pub missing: Vec<String>,
}

impl MergeReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }
}

enum Attempt {
    Merged,
    Missing,
    Conflict(Vec<String>),
    Rejected(String),
}

impl WorkspaceReconciler {
    /// Merge the given item branches into base, one at a time, in the given order.
    ///
    /// A branch that still conflicts after a retry from a freshly reset base is
    /// skipped and reported; later branches are still processed. Every attempted
    /// branch is deleted afterwards, whatever its outcome.
    pub async fn reconcile(&self, ordered_ids: &[String]) -> Result<MergeReport> {
        let mut report = MergeReport::default();
        if ordered_ids.is_empty() {
            return Ok(report);
        }

        let tmp = tempfile::Builder::new()
            .prefix("convoy-merge-")
            .tempdir()
            .context("Failed to create merge workspace")?;
        let dir = tmp.path().join("repo");
        let dir_arg = dir.to_string_lossy().to_string();

        GitRunner::new(tmp.path())
            .run_checked(&["clone", self.remote_url(), &dir_arg])
            .await
            .context("Failed to clone remote for merge")?;

        let git = GitRunner::new(&dir);
        git.configure_identity(&self.author_name, &self.author_email)
            .await?;

        for id in ordered_ids {
            for attempt in 1..=MERGE_ATTEMPTS {
                match self.attempt_merge(&git, id).await {
                    Ok(Attempt::Merged) => {
                        tracing::info!(work_item_id = %id, attempt, "Merged work item branch");
                        report.merged.push(id.clone());
                        break;
                    }
                    Ok(Attempt::Missing) => {
                        tracing::warn!(work_item_id = %id, "Work item branch not found on remote");
                        report.missing.push(id.clone());
                        break;
                    }
                    Ok(Attempt::Conflict(files)) => {
                        tracing::warn!(
                            work_item_id = %id,
                            attempt,
                            files = ?files,
                            "Rebase conflict"
                        );
                        if attempt == MERGE_ATTEMPTS {
                            report.skipped.push(SkippedMerge {
                                work_item_id: id.clone(),
                                reason: format!("Rebase conflict after {} attempts", MERGE_ATTEMPTS),
                                conflicting_files: files,
                            });
                        } else {
                            tokio::time::sleep(self.retry_delay).await;
                        }
                    }
                    Ok(Attempt::Rejected(reason)) => {
                        tracing::warn!(work_item_id = %id, reason = %reason, "Merge rejected");
                        report.skipped.push(SkippedMerge {
                            work_item_id: id.clone(),
                            reason,
                            conflicting_files: Vec::new(),
                        });
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(work_item_id = %id, error = %e, "Merge attempt failed");
                        report.skipped.push(SkippedMerge {
                            work_item_id: id.clone(),
                            reason: e.to_string(),
                            conflicting_files: Vec::new(),
                        });
                        break;
                    }
                }
            }
        }

        for id in ordered_ids {
            self.delete_branch_refs(&git, id).await;
        }

        tracing::info!(
            merged = report.merged.len(),
            skipped = report.skipped.len(),
            missing = report.missing.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn attempt_merge(&self, git: &GitRunner, id: &str) -> Result<Attempt, GitError> {
        let base = self.base_branch();
        let branch = branch_name(id);
        let temp = temp_branch(id);
        let origin_base = format!("origin/{}", base);

        git.run_checked(&["fetch", "origin", &format!("+refs/heads/{0}:refs/remotes/origin/{0}", base)])
            .await?;
        git.run_checked(&["checkout", "-f", "-B", base, &origin_base]).await?;
        git.run_checked(&["reset", "--hard", &origin_base]).await?;

        let fetched = git
            .succeeds(&["fetch", "origin", &format!("+refs/heads/{0}:refs/remotes/origin/{0}", branch)])
            .await;
        if !fetched {
            return Ok(Attempt::Missing);
        }

        git.run_checked(&["checkout", "-f", "-B", &temp, &format!("origin/{}", branch)])
            .await?;

        if !git.succeeds(&["rebase", base]).await {
            let files = git
                .run_checked(&["diff", "--name-only", "--diff-filter=U"])
                .await
                .map(|out| out.lines().map(|l| l.to_string()).collect())
                .unwrap_or_default();
            git.run_quiet(&["rebase", "--abort"]).await;
            git.run_quiet(&["checkout", "-f", base]).await;
            return Ok(Attempt::Conflict(files));
        }

        git.run_checked(&["checkout", base]).await?;
        if !git.succeeds(&["merge", "--ff-only", &temp]).await {
            return Ok(Attempt::Rejected("Fast-forward merge failed".to_string()));
        }

        if git.succeeds(&["push", "origin", base]).await {
            return Ok(Attempt::Merged);
        }

        // Base moved under us: replay on top and push once more
        tracing::info!(work_item_id = %id, "Push rejected, rebasing on remote base");
        if git.succeeds(&["pull", "--rebase", "origin", base]).await
            && git.succeeds(&["push", "origin", base]).await
        {
            return Ok(Attempt::Merged);
        }

        git.run_quiet(&["rebase", "--abort"]).await;
        Ok(Attempt::Rejected("Push to base branch rejected".to_string()))
    }

    async fn delete_branch_refs(&self, git: &GitRunner, id: &str) {
        let branch = branch_name(id);
        git.run_quiet(&["push", "origin", "--delete", &branch]).await;
        git.run_quiet(&["branch", "-D", &temp_branch(id)]).await;
        git.run_quiet(&["update-ref", "-d", &format!("refs/remotes/origin/{}", branch)])
            .await;
    }
}

fn temp_branch(id: &str) -> String {
    format!("convoy-merge/{}", id)
}
