//! Convoy Core - multi-agent mission kernel
//!
//! This crate turns a natural-language request into a plan of work items,
//! schedules them in dependency-ordered waves, runs each item in an isolated
//! execution unit (a local container or a remote platform task), gates the
//! results with tests and review, and merges passing branches back into the
//! base branch in a deterministic order.

pub mod config;
pub mod error;
pub mod kernel;
pub mod observability;
pub mod planning;
pub mod provider;
pub mod state;
pub mod workspace;

pub use config::ConvoyConfig;
pub use error::{GitError, PlanningError, PlatformError, ProviderError};
pub use kernel::{MissionCoordinator, QualityGateEvaluator, WaveDispatcher, WaveScheduler};
pub use provider::{create_provider, ExecutionProvider};
pub use state::{MissionState, WorkItem};
pub use workspace::WorkspaceReconciler;
