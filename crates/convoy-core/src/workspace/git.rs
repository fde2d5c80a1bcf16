//! Async git CLI wrapper.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::GitError;

static CREDENTIALS: LazyLock<Regex> =
    LazyLock::new(|| match Regex::new(r"(https?://)([^:/@\s]+:[^@\s]+)@") {
        Ok(regex) => regex,
        Err(err) => panic!("Credential regex is invalid: {err}"),
    });

static BROWSER_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    match Regex::new(r"/(tree|blob|commit|pulls?|issues?|actions|releases)/.*$") {
        Ok(regex) => regex,
        Err(err) => panic!("Browser suffix regex is invalid: {err}"),
    }
});

/// Runs git commands in one working directory.
#[derive(Debug, Clone)]
pub struct GitRunner {
    working_dir: PathBuf,
    timeout: Duration,
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Run a command and return its raw output, whatever the exit status.
    pub async fn run(&self, args: &[&str]) -> Result<Output, GitError> {
        let printable = mask_credentials(&args.join(" "));
        debug!(args = %printable, dir = %self.working_dir.display(), "Running git command");

        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(&self.working_dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GitError::Timeout {
                    args: printable,
                    secs: self.timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(args = %printable, stderr = %mask_credentials(stderr.trim()), "Git command failed");
        }

        Ok(output)
    }

    /// Run a command that must succeed, returning trimmed stdout.
    pub async fn run_checked(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.run(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::Command {
                args: mask_credentials(&args.join(" ")),
                stderr: mask_credentials(stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Whether the command exits zero. Spawn failures count as false.
    pub async fn succeeds(&self, args: &[&str]) -> bool {
        match self.run(args).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                warn!(error = %e, "Git command could not run");
                false
            }
        }
    }

    /// Best-effort command for cleanup paths: failures are logged, never returned.
    pub async fn run_quiet(&self, args: &[&str]) {
        if let Err(e) = self.run_checked(args).await {
            debug!(error = %e, "Ignoring git cleanup failure");
        }
    }

    pub async fn configure_identity(&self, name: &str, email: &str) -> Result<(), GitError> {
        self.run_checked(&["config", "user.name", name]).await?;
        self.run_checked(&["config", "user.email", email]).await?;
        Ok(())
    }

    pub async fn head(&self) -> Option<String> {
        self.run_checked(&["rev-parse", "HEAD"]).await.ok()
    }
}

/// Replace `user:secret@` in URLs with `***@`.
pub fn mask_credentials(text: &str) -> String {
    CREDENTIALS.replace_all(text, "${1}***@").to_string()
}

/// Strip browser paths (`/tree/main`, `/pull/3`) and trailing slashes from a repo URL.
pub fn sanitize_git_url(url: &str) -> String {
    let trimmed = url.trim();
    if !trimmed.contains("://") {
        return trimmed.trim_end_matches('/').to_string();
    }
    let stripped = BROWSER_SUFFIX.replace(trimmed, "");
    stripped.trim_end_matches('/').to_string()
}

/// Inject a token into an https remote. Other schemes pass through unchanged.
pub fn authenticated_url(url: &str, token: Option<&str>) -> String {
    let url = sanitize_git_url(url);
    match token {
        Some(token) if !token.is_empty() && url.starts_with("https://") && !url.contains('@') => {
            format!("https://x-access-token:{}@{}", token, &url["https://".len()..])
        }
        _ => url,
    }
}
