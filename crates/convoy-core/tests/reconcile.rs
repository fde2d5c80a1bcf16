//! Git-backed tests against a local bare origin.

use std::path::{Path, PathBuf};
use std::process::Command;

use convoy_core::config::WorkspaceConfig;
use convoy_core::state::FileAction;
use convoy_core::workspace::{branch_name, CommitOutcome, WorkspaceReconciler, WorktreeManager};

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git should be installed");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).to_string()
}

struct Origin {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    url: String,
}

impl Origin {
    /// Bare origin whose `main` holds a README and a lib file.
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let bare = root.join("origin.git");
        let url = bare.to_string_lossy().to_string();

        git(&root, &["init", "--bare", "-q", &url]);
        git(&bare, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        let seed = root.join("seed");
        git(&root, &["clone", "-q", &url, "seed"]);
        identity(&seed);
        std::fs::write(seed.join("README.md"), "# Demo\n\nstatus: draft\n").unwrap();
        std::fs::create_dir_all(seed.join("src")).unwrap();
        std::fs::write(seed.join("src/lib.rs"), "pub fn demo() {}\n").unwrap();
        git(&seed, &["add", "-A"]);
        git(&seed, &["commit", "-q", "-m", "initial"]);
        git(&seed, &["push", "-q", "origin", "HEAD:refs/heads/main"]);

        Self { _tmp: tmp, root, url }
    }

    fn config(&self) -> WorkspaceConfig {
        WorkspaceConfig {
            git_remote_url: Some(self.url.clone()),
            merge_retry_delay_ms: 0,
            workspaces_dir: self.root.join("workspaces"),
            ..Default::default()
        }
    }

    fn reconciler(&self) -> WorkspaceReconciler {
        WorkspaceReconciler::new(&self.config(), &self.url)
    }

    /// Fresh clone on a local branch from origin/main.
    fn checkout(&self, name: &str) -> PathBuf {
        git(&self.root, &["clone", "-q", &self.url, name]);
        let dir = self.root.join(name);
        identity(&dir);
        dir
    }

    fn main_file(&self, path: &str) -> Option<String> {
        let dir = self.root.join(format!("verify-{}", path.replace('/', "-")));
        if !dir.exists() {
            git(&self.root, &["clone", "-q", &self.url, &dir.to_string_lossy()]);
        } else {
            git(&dir, &["pull", "-q", "origin", "main"]);
        }
        std::fs::read_to_string(dir.join(path)).ok()
    }

    fn remote_branches(&self) -> String {
        git(&self.root, &["ls-remote", "--heads", &self.url])
    }
}

fn identity(dir: &Path) {
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["config", "user.email", "test@localhost"]);
}

#[tokio::test]
async fn independent_branches_merge_in_order_and_are_deleted() {
    let origin = Origin::new();
    let reconciler = origin.reconciler();

    let a = origin.checkout("item-a");
    std::fs::write(a.join("src/auth.rs"), "pub fn login() {}\n").unwrap();
    let pushed = reconciler.commit_and_push(&a, "ITEM-A").await.unwrap();
    assert_eq!(
        pushed,
        CommitOutcome::Pushed {
            branch: branch_name("ITEM-A")
        }
    );

    let b = origin.checkout("item-b");
    std::fs::write(b.join("src/routes.rs"), "pub fn routes() {}\n").unwrap();
    reconciler.commit_and_push(&b, "ITEM-B").await.unwrap();

    assert!(origin.remote_branches().contains("refs/heads/convoy/ITEM-A"));

    let report = reconciler
        .reconcile(&["ITEM-A".to_string(), "ITEM-B".to_string()])
        .await
        .unwrap();
    assert_eq!(report.merged, vec!["ITEM-A", "ITEM-B"]);
    assert!(report.is_clean());
    assert!(report.missing.is_empty());

    assert_eq!(origin.main_file("src/auth.rs").as_deref(), Some("pub fn login() {}\n"));
    assert_eq!(origin.main_file("src/routes.rs").as_deref(), Some("pub fn routes() {}\n"));
    assert!(!origin.remote_branches().contains("convoy/"));
}

#[tokio::test]
async fn conflicting_branch_is_skipped_after_earlier_merge() {
    let origin = Origin::new();
    let reconciler = origin.reconciler();

    let a = origin.checkout("item-a");
    std::fs::write(a.join("README.md"), "# Demo\n\nstatus: ready\n").unwrap();
    reconciler.commit_and_push(&a, "ITEM-A").await.unwrap();

    let b = origin.checkout("item-b");
    std::fs::write(b.join("README.md"), "# Demo\n\nstatus: shipped\n").unwrap();
    reconciler.commit_and_push(&b, "ITEM-B").await.unwrap();

    let report = reconciler
        .reconcile(&["ITEM-A".to_string(), "ITEM-B".to_string()])
        .await
        .unwrap();

    assert_eq!(report.merged, vec!["ITEM-A"]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].work_item_id, "ITEM-B");
    assert_eq!(report.skipped[0].conflicting_files, vec!["README.md"]);
    assert_eq!(
        origin.main_file("README.md").as_deref(),
        Some("# Demo\n\nstatus: ready\n")
    );

    // Skipped branches are deleted too
    assert!(!origin.remote_branches().contains("convoy/ITEM-B"));
}

#[tokio::test]
async fn independent_item_merges_after_a_conflict() {
    let origin = Origin::new();
    let reconciler = origin.reconciler();

    let a = origin.checkout("item-a");
    std::fs::write(a.join("README.md"), "# Demo\n\nstatus: ready\n").unwrap();
    reconciler.commit_and_push(&a, "ITEM-A").await.unwrap();

    let b = origin.checkout("item-b");
    std::fs::write(b.join("README.md"), "# Demo\n\nstatus: shipped\n").unwrap();
    reconciler.commit_and_push(&b, "ITEM-B").await.unwrap();

    let c = origin.checkout("item-c");
    std::fs::write(c.join("src/metrics.rs"), "pub fn record() {}\n").unwrap();
    reconciler.commit_and_push(&c, "ITEM-C").await.unwrap();

    let report = reconciler
        .reconcile(&["ITEM-A".to_string(), "ITEM-B".to_string(), "ITEM-C".to_string()])
        .await
        .unwrap();

    assert_eq!(report.merged, vec!["ITEM-A", "ITEM-C"]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].work_item_id, "ITEM-B");
    assert!(report.skipped[0].reason.contains("conflict"));
    assert_eq!(
        origin.main_file("src/metrics.rs").as_deref(),
        Some("pub fn record() {}\n")
    );
    assert_eq!(
        origin.main_file("README.md").as_deref(),
        Some("# Demo\n\nstatus: ready\n")
    );
    assert!(!origin.remote_branches().contains("convoy/"));
}

#[tokio::test]
async fn missing_branch_is_reported_not_fatal() {
    let origin = Origin::new();
    let report = origin
        .reconciler()
        .reconcile(&["ITEM-404".to_string()])
        .await
        .unwrap();
    assert_eq!(report.missing, vec!["ITEM-404"]);
    assert!(report.merged.is_empty());
}

#[tokio::test]
async fn unchanged_checkout_pushes_nothing() {
    let origin = Origin::new();
    let dir = origin.checkout("idle");
    let outcome = origin.reconciler().commit_and_push(&dir, "ITEM-A").await.unwrap();
    assert_eq!(outcome, CommitOutcome::NoChanges);
    assert!(!origin.remote_branches().contains("convoy/ITEM-A"));
}

#[tokio::test]
async fn branch_changes_are_detected_from_the_remote() {
    let origin = Origin::new();
    let reconciler = origin.reconciler();

    let dir = origin.checkout("item-a");
    std::fs::write(dir.join("src/auth.rs"), "pub fn login() {}\n").unwrap();
    std::fs::write(dir.join("src/lib.rs"), "pub fn demo() {}\npub mod auth;\n").unwrap();
    std::fs::create_dir_all(dir.join(".convoy/instructions")).unwrap();
    std::fs::write(dir.join(".convoy/instructions/ITEM-A-implementer.md"), "do it").unwrap();
    reconciler.commit_and_push(&dir, "ITEM-A").await.unwrap();

    let mut changes = reconciler.detect_branch_changes("ITEM-A").await.unwrap();
    changes.sort_by(|a, b| a.path.cmp(&b.path));

    let summary: Vec<(&str, FileAction)> = changes.iter().map(|c| (c.path.as_str(), c.action)).collect();
    assert_eq!(
        summary,
        vec![("src/auth.rs", FileAction::Created), ("src/lib.rs", FileAction::Modified)]
    );
}

#[tokio::test]
async fn worktrees_are_isolated_per_item() {
    let origin = Origin::new();
    let config = origin.config();
    let manager = WorktreeManager::new(&config, "CONVOY-2026-0001");

    manager.create_mission_workspace(&origin.url).await.unwrap();
    let a = manager.acquire("ITEM-A").await.unwrap();
    let b = manager.acquire("ITEM-B").await.unwrap();
    assert_ne!(a, b);
    assert!(a.join("README.md").exists());

    let branch = git(&a, &["rev-parse", "--abbrev-ref", "HEAD"]);
    assert_eq!(branch.trim(), "convoy/ITEM-A");

    let active = manager.list_active();
    assert_eq!(active.len(), 2);

    std::fs::write(a.join("src/auth.rs"), "pub fn login() {}\n").unwrap();
    let outcome = origin.reconciler().commit_and_push(&a, "ITEM-A").await.unwrap();
    assert!(matches!(outcome, CommitOutcome::Pushed { .. }));
    assert!(!b.join("src/auth.rs").exists());

    manager.release("ITEM-A").await;
    assert!(!a.exists());

    manager.cleanup_mission().await;
    assert!(!manager.mission_clone().exists());
}
