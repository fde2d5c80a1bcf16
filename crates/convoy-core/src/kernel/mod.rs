//! Kernel - scheduling waves, running units, gating results, and driving missions.

mod coordinator;
mod dispatcher;
mod runner;
mod scheduler;
mod verifier;

pub use coordinator::{enrich_context, next_mission_id, MissionCoordinator, MISSION_PREFIX};
pub use dispatcher::{DispatchOutcome, WaveDispatcher, WaveOutcome};
pub use runner::{instruction_path, is_successful_exit, Runner, UnitRun};
pub use scheduler::{compute_next_wave, find_stuck, validate_plan, ScheduleResult, WaveScheduler};
pub use verifier::{
    extract_review_score, failure_action, has_deployment_failure, is_oscillating, parse_test_output, GateRun,
    HeuristicReviewParser, OscillationDetector, QualityGateEvaluator, ReviewParser,
};
