//! Local container backend - drives the container runtime CLI.

use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{ExecutionId, ExecutionProvider, ExecutionRequest, ExitStatus};
use crate::config::LocalConfig;
use crate::error::ProviderError;

/// Mount point of the working copy inside the container.
const WORKSPACE_MOUNT: &str = "/workspace";

/// Exit code used when the runtime cannot report one.
const RUNTIME_ERROR_CODE: i32 = 125;

/// Runs each worker in a container with the working copy bind-mounted.
pub struct LocalContainerProvider {
    config: LocalConfig,
    lenient_exit: bool,
}

impl LocalContainerProvider {
    pub fn new(config: LocalConfig, lenient_exit: bool) -> Self {
        Self { config, lenient_exit }
    }

    async fn runtime(&self, args: &[String], request: Option<&ExecutionRequest>) -> Result<Output, ProviderError> {
        let mut command = Command::new(&self.config.runtime);
        command.args(args).kill_on_drop(true);
        if let Some(request) = request {
            // Values travel through the environment, never the command line
            command.envs(&request.env);
        }
        command.output().await.map_err(|source| ProviderError::Spawn {
            program: self.config.runtime.clone(),
            source,
        })
    }

    async fn runtime_quiet(&self, args: &[&str]) {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        match self.runtime(&args, None).await {
            Ok(out) if !out.status.success() => {
                tracing::debug!(
                    args = ?args,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "Ignoring container runtime failure"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "Ignoring container runtime failure"),
        }
    }

    /// Worker image, or the shared base image when the worker image is missing.
    async fn resolve_image(&self, request: &ExecutionRequest) -> String {
        let image = self.config.image_for(request.worker_type);
        let args = vec!["image".to_string(), "inspect".to_string(), image.clone()];
        match self.runtime(&args, None).await {
            Ok(out) if out.status.success() => image,
            _ => {
                let base = self.config.base_image();
                tracing::info!(image = %image, fallback = %base, "Worker image missing, using base image");
                base
            }
        }
    }

    /// Arguments for `run`, excluding the runtime binary itself.
    pub fn run_args(&self, request: &ExecutionRequest, image: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            request.unit_name(),
            "-v".to_string(),
            format!("{}:{}", request.working_dir.display(), WORKSPACE_MOUNT),
            "-w".to_string(),
            WORKSPACE_MOUNT.to_string(),
        ];

        for key in request.env.keys() {
            args.push("-e".to_string());
            args.push(key.clone());
        }

        args.push("--memory".to_string());
        args.push(format!("{}m", request.memory_limit_mb));
        args.push("--cpus".to_string());
        args.push(request.cpu_count.to_string());

        for host in &self.config.extra_hosts {
            args.push("--add-host".to_string());
            args.push(host.clone());
        }

        args.push(image.to_string());
        args.push(format!("{}/{}", WORKSPACE_MOUNT, request.instruction_path));
        args
    }
}

#[async_trait]
impl ExecutionProvider for LocalContainerProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn shares_filesystem(&self) -> bool {
        true
    }

    fn lenient_exit(&self) -> bool {
        self.lenient_exit
    }

    async fn open(&self, request: &ExecutionRequest) -> Result<ExecutionId, ProviderError> {
        let name = request.unit_name();

        // A unit with this name may survive from a crashed run
        self.runtime_quiet(&["rm", "-f", &name]).await;

        let image = self.resolve_image(request).await;
        let args = self.run_args(request, &image);

        tracing::info!(
            execution_id = %name,
            work_item_id = %request.work_item_id,
            image = %image,
            "Starting container"
        );

        let output = self.runtime(&args, Some(request)).await?;
        if !output.status.success() {
            return Err(ProviderError::Runtime {
                action: "run".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(ExecutionId::new(name))
    }

    async fn await_completion(&self, id: &ExecutionId, timeout: Duration) -> ExitStatus {
        let args = vec!["wait".to_string(), id.to_string()];

        match tokio::time::timeout(timeout, self.runtime(&args, None)).await {
            Err(_) => {
                tracing::warn!(execution_id = %id, timeout_secs = timeout.as_secs(), "Container timed out");
                ExitStatus::TimedOut
            }
            Ok(Err(e)) => {
                tracing::warn!(execution_id = %id, error = %e, "Container wait failed");
                ExitStatus::Code(RUNTIME_ERROR_CODE)
            }
            Ok(Ok(output)) => {
                let code = String::from_utf8_lossy(&output.stdout)
                    .trim()
                    .lines()
                    .last()
                    .and_then(|line| line.trim().parse::<i32>().ok());
                match code {
                    Some(code) if output.status.success() => ExitStatus::Code(code),
                    _ => {
                        tracing::warn!(
                            execution_id = %id,
                            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                            "Container wait returned no exit code"
                        );
                        ExitStatus::Code(RUNTIME_ERROR_CODE)
                    }
                }
            }
        }
    }

    async fn capture_output(&self, id: &ExecutionId) -> String {
        let args = vec!["logs".to_string(), id.to_string()];
        match self.runtime(&args, None).await {
            Ok(output) => format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            ),
            Err(e) => {
                tracing::warn!(execution_id = %id, error = %e, "Failed to capture container logs");
                String::new()
            }
        }
    }

    async fn teardown(&self, id: &ExecutionId) {
        self.runtime_quiet(&["stop", "-t", "10", id.as_str()]).await;
        self.runtime_quiet(&["rm", "-f", id.as_str()]).await;
        tracing::debug!(execution_id = %id, "Container removed");
    }
}
