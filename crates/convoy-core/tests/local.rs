//! Local container backend against a fake runtime script.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use convoy_core::config::LocalConfig;
use convoy_core::kernel::Runner;
use convoy_core::provider::{ExecutionProvider, ExecutionRegistry, ExitStatus, LocalContainerProvider};
use convoy_core::state::{ExecutionUnitStatus, WorkerType};
use convoy_core::ConvoyConfig;

const FAKE_RUNTIME: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
echo "$*" >> "$dir/calls.log"
case "$1" in
  image) exit 1 ;;
  run) echo "$CONVOY_WORK_ITEM_ID" > "$dir/env.txt"; echo 4f2a9c ;;
  wait)
    case "$2" in *SLOW*) sleep 5 ;; esac
    case "$2" in *FAIL*) echo 3 ;; *) echo 0 ;; esac ;;
  logs) echo "worker says hi"; echo "worker warns" >&2 ;;
esac
exit 0
"#;

fn fake_runtime(dir: &Path) -> PathBuf {
    let path = dir.join("docker");
    std::fs::write(&path, FAKE_RUNTIME).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(|l| l.to_string())
        .collect()
}

fn config(runtime: &Path) -> ConvoyConfig {
    let mut config = ConvoyConfig::default();
    config.local = LocalConfig {
        runtime: runtime.to_string_lossy().to_string(),
        extra_hosts: Vec::new(),
        ..LocalConfig::default()
    };
    config.execution.timeout_secs = 2;
    config
}

#[tokio::test]
async fn unit_runs_through_the_runtime_lifecycle() {
    let tools = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let config = config(&fake_runtime(tools.path()));

    let provider = Arc::new(LocalContainerProvider::new(config.local.clone(), true));
    let registry = Arc::new(ExecutionRegistry::new());
    let runner = Runner::new(provider, registry.clone(), &config);

    let request = runner.request(
        WorkerType::Implementer,
        "ITEM-001",
        project.path(),
        "# Objective\nAdd login".to_string(),
    );
    let run = runner.run(&request).await;

    assert_eq!(run.exit, ExitStatus::Code(0));
    assert!(run.succeeded());
    assert_eq!(run.output, "worker says hi\nworker warns\n");
    assert_eq!(run.record.as_ref().map(|r| r.status), Some(ExecutionUnitStatus::Completed));
    assert!(registry.in_flight().is_empty());

    let instruction = project.path().join(".convoy/instructions/ITEM-001-implementer.md");
    assert_eq!(std::fs::read_to_string(instruction).unwrap(), "# Objective\nAdd login");
    assert_eq!(
        std::fs::read_to_string(tools.path().join("env.txt")).unwrap().trim(),
        "ITEM-001"
    );

    let calls = calls(tools.path());
    let verbs: Vec<&str> = calls.iter().filter_map(|c| c.split_whitespace().next()).collect();
    assert_eq!(verbs, vec!["rm", "image", "run", "wait", "logs", "stop", "rm"]);

    let run_call = &calls[2];
    assert!(run_call.contains("--name convoy-implementer-ITEM-001"));
    assert!(run_call.contains(&format!("{}:/workspace", project.path().display())));
    assert!(run_call.contains("-e CONVOY_WORK_ITEM_ID"));
    assert!(run_call.contains(&config.local.base_image()));
    assert!(run_call.ends_with("/workspace/.convoy/instructions/ITEM-001-implementer.md"));
}

#[tokio::test]
async fn nonzero_exit_without_changes_fails() {
    let tools = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let config = config(&fake_runtime(tools.path()));

    let provider = Arc::new(LocalContainerProvider::new(config.local.clone(), true));
    let runner = Runner::new(provider, Arc::new(ExecutionRegistry::new()), &config);
    let request = runner.request(WorkerType::Implementer, "ITEM-FAIL", project.path(), "x".to_string());
    let run = runner.run(&request).await;

    assert_eq!(run.exit, ExitStatus::Code(3));
    assert!(!run.succeeded());
    assert_eq!(run.failure_reason(), "implementer exited with code 3");
    assert_eq!(run.record.as_ref().map(|r| r.status), Some(ExecutionUnitStatus::Failed));
}

#[tokio::test]
async fn slow_unit_times_out() {
    let tools = tempfile::tempdir().unwrap();
    let config = config(&fake_runtime(tools.path()));
    let provider = Arc::new(LocalContainerProvider::new(config.local.clone(), false));
    let runner = Runner::new(provider.clone(), Arc::new(ExecutionRegistry::new()), &config);
    let request = runner.request(WorkerType::Reviewer, "ITEM-SLOW", tools.path(), "x".to_string());
    let id = provider.open(&request).await.unwrap();

    let exit = provider.await_completion(&id, Duration::from_millis(200)).await;
    assert_eq!(exit, ExitStatus::TimedOut);
    provider.teardown(&id).await;
}

#[tokio::test]
async fn missing_runtime_is_a_spawn_error() {
    let project = tempfile::tempdir().unwrap();
    let config = config(Path::new("/nonexistent/convoy-runtime"));
    let runner = Runner::new(
        Arc::new(LocalContainerProvider::new(config.local.clone(), false)),
        Arc::new(ExecutionRegistry::new()),
        &config,
    );
    let request = runner.request(WorkerType::Implementer, "ITEM-001", project.path(), "x".to_string());
    let run = runner.run(&request).await;

    assert!(!run.succeeded());
    assert!(run.record.is_none());
    assert!(run.failure_reason().contains("/nonexistent/convoy-runtime"));
}
