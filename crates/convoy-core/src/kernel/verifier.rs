//! Quality gate - parses test and review output and decides each iteration.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use crate::config::{ConvoyConfig, GateCommand};
use crate::state::{FailureStrategy, GateDecision, ReviewFeedback, TestResult, WorkItem};

static MAVEN_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    match Regex::new(r"Tests run:\s*(\d+),\s*Failures:\s*(\d+)(?:,\s*Errors:\s*(\d+))?") {
        Ok(regex) => regex,
        Err(err) => panic!("invalid Maven summary regex: {err}"),
    }
});

static PASSED_COUNT: LazyLock<Regex> = LazyLock::new(|| match Regex::new(r"(\d+)\s+passed") {
    Ok(regex) => regex,
    Err(err) => panic!("invalid passed count regex: {err}"),
});

static FAILED_COUNT: LazyLock<Regex> = LazyLock::new(|| match Regex::new(r"(\d+)\s+failed") {
    Ok(regex) => regex,
    Err(err) => panic!("invalid failed count regex: {err}"),
});

static FAILURE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    match Regex::new(
        r"(?i)(BUILD FAILURE|BUILD FAILED|COMPILATION ERROR|npm ERR!|test result: FAILED)|error\[E\d+\]",
    ) {
        Ok(regex) => regex,
        Err(err) => panic!("invalid failure marker regex: {err}"),
    }
});

static REVIEW_SCORE: LazyLock<Regex> = LazyLock::new(|| {
    match Regex::new(r"(?i)Score\**:\s*\**\s*(\d{1,2})\s*/\s*10") {
        Ok(regex) => regex,
        Err(err) => panic!("invalid review score regex: {err}"),
    }
});

static APPROVED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    match Regex::new(r"(?im)^\s*\**approved\**:\s*\**\s*(yes|no|true|false)") {
        Ok(regex) => regex,
        Err(err) => panic!("invalid approved regex: {err}"),
    }
});

static SUMMARY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    match Regex::new(r"(?im)^\s*\**summary\**:\s*\**\s*(.+)$") {
        Ok(regex) => regex,
        Err(err) => panic!("invalid summary regex: {err}"),
    }
});

static DEPLOY_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    match Regex::new(r"(?i)(deployment failed|deploy failed|push failed|staging failed|app crashed)") {
        Ok(regex) => regex,
        Err(err) => panic!("invalid deployment failure regex: {err}"),
    }
});

/// Whether deployer output reports a failed deployment.
pub fn has_deployment_failure(output: &str) -> bool {
    DEPLOY_FAILURE.is_match(output)
}

fn capture_u32(caps: &regex::Captures<'_>, group: usize) -> u32 {
    caps.get(group)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Parse raw test runner output.
///
/// Maven/JUnit summaries win, then `N passed` / `N failed` counts (summed over
/// every match, so multi-binary cargo output adds up), then build failure
/// markers. Output with none of these passes with zero tests. Blank output fails.
pub fn parse_test_output(work_item_id: &str, raw: Option<&str>, duration_ms: u64) -> TestResult {
    let output = raw.unwrap_or_default();
    let result = |passed, total_tests, failed_tests| TestResult {
        work_item_id: work_item_id.to_string(),
        iteration: 0,
        passed,
        total_tests,
        failed_tests,
        raw_output: output.to_string(),
        duration_ms,
    };

    if output.trim().is_empty() {
        tracing::warn!(work_item_id = %work_item_id, "Empty test output");
        return result(false, 0, 0);
    }

    // The last summary line is the aggregate one
    if let Some(caps) = MAVEN_SUMMARY.captures_iter(output).last() {
        let total = capture_u32(&caps, 1);
        let failed = capture_u32(&caps, 2) + capture_u32(&caps, 3);
        return result(failed == 0, total, failed);
    }

    let passed: Option<u32> = PASSED_COUNT
        .captures_iter(output)
        .map(|caps| capture_u32(&caps, 1))
        .reduce(|a, b| a + b);
    let failed: Option<u32> = FAILED_COUNT
        .captures_iter(output)
        .map(|caps| capture_u32(&caps, 1))
        .reduce(|a, b| a + b);
    if passed.is_some() || failed.is_some() {
        let failed = failed.unwrap_or(0);
        return result(failed == 0, passed.unwrap_or(0) + failed, failed);
    }

    if FAILURE_MARKER.is_match(output) {
        return result(false, 0, 0);
    }

    result(true, 0, 0)
}

/// Cheap score extraction, `None` when the output has no `Score: N/10`.
pub fn extract_review_score(raw: &str) -> Option<u8> {
    REVIEW_SCORE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .map(|score| score.min(10))
}

/// Turns free-form reviewer output into structured feedback.
#[async_trait]
pub trait ReviewParser: Send + Sync {
    async fn parse_review_text(&self, work_item_id: &str, raw: &str) -> Result<ReviewFeedback>;
}

/// Section-based parser for reviews written in the requested output format.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicReviewParser;

impl HeuristicReviewParser {
    fn bullets(raw: &str, heading: &str) -> Vec<String> {
        let mut in_section = false;
        let mut items = Vec::new();

        for line in raw.lines() {
            let trimmed = line.trim();
            let bare = trimmed.trim_start_matches(['*', '#', ' ']);
            let inline = bare
                .get(..heading.len())
                .filter(|h| h.eq_ignore_ascii_case(heading))
                .and_then(|_| bare.get(heading.len()..))
                .map(|rest| rest.trim_start_matches('*'))
                .and_then(|rest| rest.strip_prefix(':'));

            if let Some(inline) = inline {
                in_section = true;
                let inline = inline.trim().trim_matches('*').trim();
                if !inline.is_empty() && !inline.eq_ignore_ascii_case("none") {
                    items.push(inline.to_string());
                }
                continue;
            }

            if !in_section {
                continue;
            }
            if let Some(item) = trimmed
                .strip_prefix("- ")
                .or_else(|| trimmed.strip_prefix("* "))
            {
                let item = item.trim();
                if !item.is_empty() && !item.eq_ignore_ascii_case("none") {
                    items.push(item.to_string());
                }
            } else if !trimmed.is_empty() {
                in_section = false;
            }
        }

        items
    }
}

#[async_trait]
impl ReviewParser for HeuristicReviewParser {
    async fn parse_review_text(&self, work_item_id: &str, raw: &str) -> Result<ReviewFeedback> {
        let score = extract_review_score(raw).unwrap_or(0);
        let approved = APPROVED_LINE
            .captures(raw)
            .and_then(|caps| caps.get(1))
            .map(|m| matches!(m.as_str().to_lowercase().as_str(), "yes" | "true"))
            .unwrap_or(false);
        let summary = SUMMARY_LINE
            .captures(raw)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();

        Ok(ReviewFeedback {
            work_item_id: work_item_id.to_string(),
            iteration: 0,
            approved,
            summary,
            issues: Self::bullets(raw, "issues"),
            suggestions: Self::bullets(raw, "suggestions"),
            score,
        })
    }
}

/// Outcome of the configured gate commands.
#[derive(Debug, Clone)]
pub struct GateRun {
    pub passed: bool,
    pub output: String,
    pub duration_ms: u64,
}

/// Decides whether a work item iteration passes.
pub struct QualityGateEvaluator {
    enabled: bool,
    threshold: u8,
    commands: Vec<GateCommand>,
    command_timeout: Duration,
    review_parser: Arc<dyn ReviewParser>,
}

impl QualityGateEvaluator {
    pub fn new(config: &ConvoyConfig) -> Self {
        Self {
            enabled: config.gates.enabled,
            threshold: config.gates.review_threshold,
            commands: config.gates.commands.clone(),
            command_timeout: config.execution.timeout(),
            review_parser: Arc::new(HeuristicReviewParser),
        }
    }

    pub fn with_review_parser(mut self, parser: Arc<dyn ReviewParser>) -> Self {
        self.review_parser = parser;
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    pub fn parse_test_output(&self, work_item_id: &str, raw: Option<&str>, duration_ms: u64) -> TestResult {
        parse_test_output(work_item_id, raw, duration_ms)
    }

    /// Structured review, preferring the cheap score when the parser returns zero.
    pub async fn parse_review_output(&self, work_item_id: &str, raw: Option<&str>) -> ReviewFeedback {
        let raw = raw.unwrap_or_default();
        if raw.trim().is_empty() {
            tracing::warn!(work_item_id = %work_item_id, "Empty review output");
            return ReviewFeedback::rejected(work_item_id, "No review output", "No output from reviewer");
        }

        let cheap = extract_review_score(raw);
        let mut feedback = match self.review_parser.parse_review_text(work_item_id, raw).await {
            Ok(feedback) => feedback,
            Err(e) => {
                tracing::warn!(work_item_id = %work_item_id, error = %e, "Review parser failed");
                ReviewFeedback::rejected(work_item_id, "Review could not be parsed", &e.to_string())
            }
        };

        if feedback.score == 0 {
            if let Some(score) = cheap.filter(|s| *s > 0) {
                tracing::info!(work_item_id = %work_item_id, score, "Using score extracted from review text");
                feedback.score = score;
            }
        }
        feedback.score = feedback.score.min(10);
        feedback.approved = feedback.score >= self.threshold;
        feedback.work_item_id = work_item_id.to_string();
        feedback
    }

    /// Grant when tests pass and the review meets the threshold.
    pub fn decide(&self, test: &TestResult, review: &ReviewFeedback, item: &WorkItem) -> GateDecision {
        let tests_passed = test.passed;
        let review_passed = review.score >= self.threshold;

        if tests_passed && review_passed {
            let reason = format!("Quality gate granted: tests pass, review score {}/10", review.score);
            tracing::info!(work_item_id = %item.id, reason = %reason, "Gate granted");
            return GateDecision::granted(reason);
        }

        let action = failure_action(item);
        let reason = match (tests_passed, test.total_tests > 0) {
            (false, true) if !review_passed => format!(
                "Tests failed ({} of {}) and review score {}/10 below threshold",
                test.failed_tests, test.total_tests, review.score
            ),
            (false, false) if !review_passed => format!(
                "Build/test failure detected and review score {}/10 below threshold",
                review.score
            ),
            (false, true) => format!(
                "Tests failed: {} of {} failed",
                test.failed_tests, test.total_tests
            ),
            (false, false) => "Build or test failure detected (no structured test output)".to_string(),
            (true, _) => format!(
                "Review score {}/10 below threshold (minimum {})",
                review.score, self.threshold
            ),
        };

        tracing::info!(work_item_id = %item.id, reason = %reason, action = %action, "Gate denied");
        GateDecision::denied(action, reason)
    }

    /// Run the configured gate commands in a working copy.
    ///
    /// Fails when a required command fails or times out. Output of every
    /// command is concatenated for test parsing.
    pub async fn run_commands(&self, working_dir: &Path) -> GateRun {
        let started = Instant::now();
        let mut passed = true;
        let mut output = String::new();

        for gate in &self.commands {
            tracing::info!(gate = %gate.name, "Running quality gate");

            let mut command = Command::new("sh");
            command
                .arg("-c")
                .arg(&gate.command)
                .current_dir(working_dir)
                .kill_on_drop(true);

            let ok = match tokio::time::timeout(self.command_timeout, command.output()).await {
                Ok(Ok(out)) => {
                    output.push_str(&String::from_utf8_lossy(&out.stdout));
                    output.push_str(&String::from_utf8_lossy(&out.stderr));
                    out.status.success()
                }
                Ok(Err(e)) => {
                    output.push_str(&format!("gate {} failed to start: {}\n", gate.name, e));
                    false
                }
                Err(_) => {
                    output.push_str(&format!("gate {} timed out\n", gate.name));
                    false
                }
            };

            if !ok {
                tracing::warn!(gate = %gate.name, required = gate.required, "Quality gate failed");
                if gate.required {
                    passed = false;
                }
            }
        }

        GateRun {
            passed,
            output,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Recovery action for a denied item: its strategy, with exhausted retries escalated.
pub fn failure_action(item: &WorkItem) -> FailureStrategy {
    let action = item.failure_strategy();
    if action == FailureStrategy::Retry && item.iterations_exhausted() {
        tracing::warn!(
            work_item_id = %item.id,
            iteration = item.iteration,
            max_iterations = item.max_iterations,
            "Retries exhausted, escalating"
        );
        return FailureStrategy::Escalate;
    }
    action
}

/// Flags a retry loop that alternates between two failures.
#[derive(Debug, Default)]
pub struct OscillationDetector {
    history: HashMap<String, Vec<String>>,
}

impl OscillationDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure reason. Returns true when the item is oscillating.
    pub fn record(&mut self, work_item_id: &str, reason: &str) -> bool {
        let history = self.history.entry(work_item_id.to_string()).or_default();
        history.push(reason.to_string());
        is_oscillating(history)
    }

    pub fn clear(&mut self, work_item_id: &str) {
        self.history.remove(work_item_id);
    }
}

/// Reason N equals reason N-2 and differs from reason N-1.
pub fn is_oscillating(reasons: &[String]) -> bool {
    match reasons {
        [.., a, b, c] => a == c && b != c,
        _ => false,
    }
}
