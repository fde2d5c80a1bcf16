//! Convoy configuration loading and management.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::state::WorkerType;

/// Main configuration, loaded from .convoy/config.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvoyConfig {
    /// Config version
    pub version: Option<String>,

    /// Maximum work items dispatched per wave
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Kernel-owned directory (checkpoints, events, workspaces)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub scheduling: SchedulingConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Local container backend
    #[serde(default)]
    pub local: LocalConfig,

    /// Remote task backend
    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Quality gates configuration
    #[serde(default)]
    pub gates: GatesConfig,
}

fn default_max_parallel() -> usize {
    3
}
fn default_state_dir() -> PathBuf {
    PathBuf::from(".convoy")
}
fn default_true() -> bool {
    true
}

/// Scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Hold back parallel items whose target files overlap an item already in the wave
    #[serde(default = "default_true")]
    pub defer_overlapping_targets: bool,

    /// Pause between waves
    #[serde(default)]
    pub wave_cooldown_secs: u64,

    /// Retry budget given to planned items that set none
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    3
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            defer_overlapping_targets: true,
            wave_cooldown_secs: 0,
            default_max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Local,
    Remote,
}

/// Settings shared by every execution backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Per-unit completion timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u32,

    #[serde(default = "default_cpu_count")]
    pub cpu_count: u32,

    /// Treat exit code 1 with observed file changes as success
    #[serde(default = "default_true")]
    pub lenient_exit_code: bool,

    /// Model provider handed to workers
    #[serde(default)]
    pub model_provider: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub model_endpoint: Option<String>,

    /// Host environment variables forwarded to workers when set
    #[serde(default = "default_forward_env")]
    pub forward_env: Vec<String>,
}

fn default_timeout_secs() -> u64 {
    1800
}
fn default_memory_limit_mb() -> u32 {
    4096
}
fn default_cpu_count() -> u32 {
    2
}
fn default_forward_env() -> Vec<String> {
    ["ANTHROPIC_API_KEY", "OPENAI_API_KEY", "GOOGLE_API_KEY"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            timeout_secs: default_timeout_secs(),
            memory_limit_mb: default_memory_limit_mb(),
            cpu_count: default_cpu_count(),
            lenient_exit_code: true,
            model_provider: None,
            model: None,
            model_endpoint: None,
            forward_env: default_forward_env(),
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Local container runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Container runtime CLI (docker, podman)
    #[serde(default = "default_runtime")]
    pub runtime: String,

    #[serde(default = "default_image_registry")]
    pub image_registry: String,

    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,

    #[serde(default = "default_image_tag")]
    pub image_tag: String,

    /// Tag used when the worker image for a type is missing
    #[serde(default = "default_base_tag")]
    pub base_tag: String,

    #[serde(default = "default_extra_hosts")]
    pub extra_hosts: Vec<String>,

    /// Directory names skipped by the change snapshot
    #[serde(default = "default_snapshot_excludes")]
    pub snapshot_excludes: Vec<String>,
}

fn default_runtime() -> String {
    "docker".to_string()
}
fn default_image_registry() -> String {
    "ghcr.io/convoy".to_string()
}
fn default_image_prefix() -> String {
    "worker".to_string()
}
fn default_image_tag() -> String {
    "latest".to_string()
}
fn default_base_tag() -> String {
    "base".to_string()
}
fn default_extra_hosts() -> Vec<String> {
    vec!["host.docker.internal:host-gateway".to_string()]
}
fn default_snapshot_excludes() -> Vec<String> {
    ["node_modules", "target", ".venv", "__pycache__"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            image_registry: default_image_registry(),
            image_prefix: default_image_prefix(),
            image_tag: default_image_tag(),
            base_tag: default_base_tag(),
            extra_hosts: default_extra_hosts(),
            snapshot_excludes: default_snapshot_excludes(),
        }
    }
}

impl LocalConfig {
    /// Image reference for a worker type
    pub fn image_for(&self, worker_type: WorkerType) -> String {
        format!(
            "{}/{}-{}:{}",
            self.image_registry, self.image_prefix, worker_type, self.image_tag
        )
    }

    /// Shared fallback image
    pub fn base_image(&self) -> String {
        format!("{}/{}:{}", self.image_registry, self.image_prefix, self.base_tag)
    }
}

/// Remote task platform settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Platform API base URL
    #[serde(default)]
    pub api_url: Option<String>,

    /// Token endpoint base URL
    #[serde(default)]
    pub auth_url: Option<String>,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_username_env")]
    pub username_env: String,

    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// Space the worker apps live in
    #[serde(default)]
    pub space_guid: Option<String>,

    /// Worker type name to app name overrides
    #[serde(default)]
    pub apps: HashMap<String, String>,

    #[serde(default = "default_app_prefix")]
    pub app_prefix: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_task_memory_mb")]
    pub task_memory_mb: u32,

    #[serde(default = "default_task_disk_mb")]
    pub task_disk_mb: u32,

    /// Where units fetch instructions that do not fit inline
    #[serde(default)]
    pub instruction_url: Option<String>,

    /// Worker entrypoint, invoked with the instruction path
    #[serde(default = "default_worker_command")]
    pub worker_command: String,

    /// Recent-logs endpoint for an app, `{app_guid}` is substituted
    #[serde(default)]
    pub log_url: Option<String>,
}

fn default_client_id() -> String {
    "cf".to_string()
}
fn default_username_env() -> String {
    "CONVOY_PLATFORM_USER".to_string()
}
fn default_password_env() -> String {
    "CONVOY_PLATFORM_PASSWORD".to_string()
}
fn default_app_prefix() -> String {
    "convoy-".to_string()
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_task_memory_mb() -> u32 {
    2048
}
fn default_task_disk_mb() -> u32 {
    4096
}
fn default_worker_command() -> String {
    "convoy-worker run".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            auth_url: None,
            client_id: default_client_id(),
            username_env: default_username_env(),
            password_env: default_password_env(),
            space_guid: None,
            apps: HashMap::new(),
            app_prefix: default_app_prefix(),
            poll_interval_secs: default_poll_interval_secs(),
            task_memory_mb: default_task_memory_mb(),
            task_disk_mb: default_task_disk_mb(),
            instruction_url: None,
            worker_command: default_worker_command(),
            log_url: None,
        }
    }
}

impl RemoteConfig {
    /// App that runs units for a worker type
    pub fn app_for(&self, worker_type: WorkerType) -> String {
        self.apps
            .get(worker_type.name())
            .cloned()
            .unwrap_or_else(|| format!("{}{}", self.app_prefix, worker_type))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Git workspace settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Remote all mission branches are pushed to
    #[serde(default)]
    pub git_remote_url: Option<String>,

    /// Env var holding a token injected into https remotes
    #[serde(default = "default_git_token_env")]
    pub git_token_env: String,

    #[serde(default = "default_base_branch")]
    pub base_branch: String,

    /// Give each parallel item its own worktree of a mission clone
    #[serde(default)]
    pub worktrees: bool,

    #[serde(default = "default_workspaces_dir")]
    pub workspaces_dir: PathBuf,

    #[serde(default = "default_author_name")]
    pub author_name: String,

    #[serde(default = "default_author_email")]
    pub author_email: String,

    /// Pause before retrying a conflicted rebase
    #[serde(default = "default_merge_retry_delay_ms")]
    pub merge_retry_delay_ms: u64,
}

fn default_git_token_env() -> String {
    "CONVOY_GIT_TOKEN".to_string()
}
fn default_base_branch() -> String {
    "main".to_string()
}
fn default_workspaces_dir() -> PathBuf {
    PathBuf::from(".convoy/workspaces")
}
fn default_author_name() -> String {
    "Convoy".to_string()
}
fn default_author_email() -> String {
    "convoy@localhost".to_string()
}
fn default_merge_retry_delay_ms() -> u64 {
    500
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            git_remote_url: None,
            git_token_env: default_git_token_env(),
            base_branch: default_base_branch(),
            worktrees: false,
            workspaces_dir: default_workspaces_dir(),
            author_name: default_author_name(),
            author_email: default_author_email(),
            merge_retry_delay_ms: default_merge_retry_delay_ms(),
        }
    }
}

/// Quality gates configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatesConfig {
    /// Whether gates are enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum review score on a 0-10 scale
    #[serde(default = "default_review_threshold")]
    pub review_threshold: u8,

    /// Local test commands run in place of a tester unit
    #[serde(default)]
    pub commands: Vec<GateCommand>,
}

fn default_review_threshold() -> u8 {
    7
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            review_threshold: default_review_threshold(),
            commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCommand {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub required: bool,
}

impl Default for ConvoyConfig {
    fn default() -> Self {
        Self {
            version: None,
            max_parallel: default_max_parallel(),
            state_dir: default_state_dir(),
            scheduling: SchedulingConfig::default(),
            execution: ExecutionConfig::default(),
            local: LocalConfig::default(),
            remote: RemoteConfig::default(),
            workspace: WorkspaceConfig::default(),
            gates: GatesConfig::default(),
        }
    }
}

impl ConvoyConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Load from project root (looks for .convoy/config.yaml)
    pub fn load_from_project(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(".convoy/config.yaml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve paths relative to project root
    pub fn resolve_paths(&mut self, project_root: &Path) {
        self.state_dir = project_root.join(&self.state_dir);
        self.workspace.workspaces_dir = project_root.join(&self.workspace.workspaces_dir);
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.state_dir.join("checkpoints")
    }

    pub fn events_path(&self) -> PathBuf {
        self.state_dir.join("events.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_section_defaults() {
        let yaml = r#"
max_parallel: 5
execution:
  backend: remote
gates:
  review_threshold: 8
"#;
        let config: ConvoyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_parallel, 5);
        assert_eq!(config.execution.backend, Backend::Remote);
        assert_eq!(config.execution.timeout_secs, 1800);
        assert_eq!(config.gates.review_threshold, 8);
        assert!(config.gates.enabled);
        assert_eq!(config.remote.poll_interval_secs, 5);
        assert_eq!(config.workspace.base_branch, "main");
    }

    #[test]
    fn test_default_review_threshold_is_seven() {
        assert_eq!(ConvoyConfig::default().gates.review_threshold, 7);
    }

    #[test]
    fn test_app_and_image_names() {
        let mut remote = RemoteConfig::default();
        assert_eq!(remote.app_for(WorkerType::Tester), "convoy-tester");
        remote
            .apps
            .insert("tester".to_string(), "qa-runner".to_string());
        assert_eq!(remote.app_for(WorkerType::Tester), "qa-runner");

        let local = LocalConfig::default();
        assert_eq!(
            local.image_for(WorkerType::Implementer),
            "ghcr.io/convoy/worker-implementer:latest"
        );
        assert_eq!(local.base_image(), "ghcr.io/convoy/worker:base");
    }
}
