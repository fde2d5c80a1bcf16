//! Typed errors for the kernel's failure taxonomy.

use thiserror::Error;

/// Broken plans. Always fatal for the mission.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("Duplicate work item id: {0}")]
    DuplicateId(String),

    #[error("Work item {item} depends on unknown item {dependency}")]
    UnknownDependency { item: String, dependency: String },

    #[error("Dependency cycle among work items: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Work items can never be scheduled: {}", .0.join(", "))]
    Unreachable(Vec<String>),

    #[error("Planner failed: {0}")]
    Planner(String),
}

/// Failures opening or driving an execution unit.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Container runtime rejected {action}: {stderr}")]
    Runtime { action: String, stderr: String },

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("Task command is {len} bytes, over the {limit} byte platform limit")]
    CommandTooLong { len: usize, limit: usize },

    #[error("Invalid execution id: {0}")]
    InvalidExecutionId(String),

    #[error("Remote backend requires {0}")]
    MissingConfig(&'static str),
}

/// Remote task platform API failures.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Platform returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Missing platform credentials in ${0}")]
    MissingCredentials(String),

    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("Unexpected platform response: {0}")]
    Malformed(String),
}

/// Git command failures.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {args} failed: {stderr}")]
    Command { args: String, stderr: String },

    #[error("git {args} timed out after {secs}s")]
    Timeout { args: String, secs: u64 },
}
