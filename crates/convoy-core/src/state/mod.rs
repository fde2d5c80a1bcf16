//! State - work items, mission aggregate, and checkpoints.

mod checkpoint;
mod ledger;
mod mission;
mod results;
mod work_item;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use ledger::{CompletedSet, WorkItemLedger};
pub use mission::{
    Classification, ExecutionStrategy, InteractionMode, MissionMetrics, MissionState,
    MissionStatus, MissionUpdate, RetryMark,
};
pub use results::{
    ExecutionRecord, ExecutionUnitStatus, GateDecision, ReviewFeedback, TestResult,
    WaveDispatchResult,
};
pub use work_item::{
    FailureStrategy, FileAction, FileChange, WorkItem, WorkItemStatus, WorkerType,
};
