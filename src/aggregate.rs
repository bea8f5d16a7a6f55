//! Result aggregation.
//!
//! Suites report their own counters as text. [`SummaryParser`] recovers them
//! from the captured output, and [`Aggregator`] folds every
//! [`ExecutionResult`] into an [`AggregateReport`].
//!
//! # Summary protocol (v1)
//!
//! A suite prints four labeled integers anywhere in its output:
//!
//! ```text
//! Tests run: 5
//! Passed: 4
//! Failed: 1
//! Skipped: 0
//! ```
//!
//! Labels are case-insensitive, may carry a `tests` prefix, use `:` or `=`
//! and tolerate any whitespace. `run:5/passed:5` is as valid as the block
//! above. When a label appears several times the last value wins, so
//! interim progress lines are harmless.
//!
//! A suite's status never depends on its counters: it comes from the exit
//! code alone (see [`SuiteStatus`]).

use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::discovery::{Category, CategoryState, TestSuite};

/// Test counters reported by a suite, or summed over many.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub run: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl Counts {
    pub fn new(run: u64, passed: u64, failed: u64, skipped: u64) -> Self {
        Self {
            run,
            passed,
            failed,
            skipped,
        }
    }

    /// Fraction of run tests that passed; 0 when nothing ran.
    pub fn success_rate(&self) -> f64 {
        if self.run == 0 {
            0.0
        } else {
            self.passed as f64 / self.run as f64
        }
    }

    /// Success rate as a whole percentage, rounded down.
    pub fn success_percent(&self) -> u64 {
        if self.run == 0 {
            0
        } else {
            self.passed.saturating_mul(100) / self.run
        }
    }
}

impl Add for Counts {
    type Output = Counts;

    fn add(self, other: Counts) -> Counts {
        // Counters come from untrusted suite output.
        Counts {
            run: self.run.saturating_add(other.run),
            passed: self.passed.saturating_add(other.passed),
            failed: self.failed.saturating_add(other.failed),
            skipped: self.skipped.saturating_add(other.skipped),
        }
    }
}

impl AddAssign for Counts {
    fn add_assign(&mut self, other: Counts) {
        *self = *self + other;
    }
}

/// Recovers counters from a suite's captured output.
///
/// Implementations return `None` when the output holds no summary at all.
pub trait SummaryParser: Send + Sync {
    fn parse(&self, output: &str) -> Option<Counts>;

    /// Protocol name, for logging.
    fn name(&self) -> &'static str;
}

/// Parser for the v1 labeled-counter text protocol.
pub struct LabeledCounterParser {
    pattern: Regex,
}

impl LabeledCounterParser {
    pub fn new() -> Self {
        let pattern = Regex::new(
            r"(?i)\b(?:tests?[\s_-]*)?(run|passed|failed|skipped)\b\s*[:=]\s*(\d+)",
        )
        .expect("summary pattern is valid");
        Self { pattern }
    }
}

impl Default for LabeledCounterParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SummaryParser for LabeledCounterParser {
    fn parse(&self, output: &str) -> Option<Counts> {
        let mut counts = Counts::default();
        let mut found = false;

        for cap in self.pattern.captures_iter(output) {
            let Ok(value) = cap[2].parse::<u64>() else {
                continue;
            };
            found = true;
            match cap[1].to_ascii_lowercase().as_str() {
                "run" => counts.run = value,
                "passed" => counts.passed = value,
                "failed" => counts.failed = value,
                _ => counts.skipped = value,
            }
        }

        found.then_some(counts)
    }

    fn name(&self) -> &'static str {
        "labeled-counters-v1"
    }
}

/// How a suite process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteStatus {
    /// Exited with code 0.
    Succeeded,
    /// Exited nonzero, died from a signal, or could not be started.
    Failed,
    /// Terminated after exceeding its timeout.
    TimedOut,
}

impl SuiteStatus {
    pub fn is_success(self) -> bool {
        self == SuiteStatus::Succeeded
    }

    pub fn label(self) -> &'static str {
        match self {
            SuiteStatus::Succeeded => "PASS",
            SuiteStatus::Failed => "FAIL",
            SuiteStatus::TimedOut => "TIMEOUT",
        }
    }
}

/// The outcome of one suite execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub suite: TestSuite,
    pub status: SuiteStatus,

    /// Process exit code; `None` if the suite was killed by a signal or
    /// never started.
    pub exit_code: Option<i32>,

    /// Combined stdout and stderr, in arrival order.
    pub output: String,

    /// Parsed counters, zero when the suite printed no summary.
    pub counts: Counts,

    /// Whether the suite printed a parseable summary.
    pub summary_reported: bool,

    pub duration: Duration,

    /// Why the suite failed, when it did.
    pub reason: Option<String>,
}

impl ExecutionResult {
    /// Builds a failed result for a suite that never produced output of its
    /// own (spawn error, interruption, worker crash).
    pub fn not_run(suite: TestSuite, reason: impl Into<String>) -> Self {
        Self {
            suite,
            status: SuiteStatus::Failed,
            exit_code: None,
            output: String::new(),
            counts: Counts::default(),
            summary_reported: false,
            duration: Duration::ZERO,
            reason: Some(reason.into()),
        }
    }
}

/// Per-category totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub category: Category,
    pub state: CategoryState,
    pub counts: Counts,
    pub suites: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl CategorySummary {
    fn new(category: Category, state: CategoryState) -> Self {
        Self {
            category,
            state,
            counts: Counts::default(),
            suites: 0,
            succeeded: 0,
            failed: 0,
            timed_out: 0,
        }
    }

    /// True when every suite succeeded and discovery did not fail.
    pub fn success(&self) -> bool {
        !self.state.is_error() && self.failed == 0 && self.timed_out == 0
    }
}

/// Final, read-only result of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateReport {
    /// Identifier shared with suites through `CONVOY_RUN_ID`.
    pub run_id: String,
    pub totals: Counts,
    pub categories: BTreeMap<Category, CategorySummary>,
    pub results: Vec<ExecutionResult>,
    pub duration: Duration,
    pub interrupted: bool,
}

impl AggregateReport {
    /// True when every executed suite succeeded, no selected category
    /// failed discovery and the run was not interrupted.
    pub fn success(&self) -> bool {
        !self.interrupted
            && self.categories.values().all(|c| !c.state.is_error())
            && self.results.iter().all(|r| r.status.is_success())
    }

    /// Process exit code: 0 on success, 1 otherwise.
    ///
    /// The counts-based success rate never influences this.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }

    /// Results of the suites that did not succeed, in recording order.
    pub fn failed_suites(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| !r.status.is_success())
    }

    pub fn suite_count(&self) -> usize {
        self.results.len()
    }
}

/// Concurrency-safe accumulator for execution results.
///
/// Workers call [`record`](Self::record) as suites complete, in any order;
/// updates are serialized by an internal mutex and are purely additive, so
/// the totals do not depend on completion order. [`finish`](Self::finish)
/// hands out the final report once.
pub struct Aggregator {
    state: Mutex<Option<AggregateReport>>,
}

impl Aggregator {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(Some(AggregateReport {
                run_id: run_id.into(),
                ..Default::default()
            })),
        }
    }

    /// Registers a selected category and its discovery state.
    pub async fn register_category(&self, category: Category, state: CategoryState) {
        let mut guard = self.state.lock().await;
        let Some(report) = guard.as_mut() else {
            error!("Category {} registered after the report was finalized", category);
            return;
        };
        report
            .categories
            .entry(category)
            .and_modify(|summary| summary.state = state.clone())
            .or_insert_with(|| CategorySummary::new(category, state));
    }

    /// Folds one execution result into the totals.
    pub async fn record(&self, result: ExecutionResult) {
        let mut guard = self.state.lock().await;
        let Some(report) = guard.as_mut() else {
            error!(
                "Result for {} arrived after the report was finalized",
                result.suite.id
            );
            return;
        };

        let category = result.suite.category;
        let summary = report
            .categories
            .entry(category)
            .or_insert_with(|| CategorySummary::new(category, CategoryState::Present));

        summary.counts += result.counts;
        summary.suites += 1;
        match result.status {
            SuiteStatus::Succeeded => summary.succeeded += 1,
            SuiteStatus::Failed => summary.failed += 1,
            SuiteStatus::TimedOut => summary.timed_out += 1,
        }

        report.totals += result.counts;
        report.results.push(result);
    }

    /// Finalizes the report. Later calls return `None`.
    pub async fn finish(&self, duration: Duration, interrupted: bool) -> Option<AggregateReport> {
        let mut report = self.state.lock().await.take()?;
        report.duration = duration;
        report.interrupted = interrupted;
        Some(report)
    }
}

/// Logs the warnings that apply to a suite's parsed summary.
pub fn warn_on_summary(result: &ExecutionResult) {
    if !result.summary_reported {
        warn!(
            "{}: no parseable test summary in output, counting zero tests",
            result.suite.id
        );
    } else if result.status.is_success() && result.counts.run == 0 {
        warn!("{}: exited successfully but reported no tests", result.suite.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, status: SuiteStatus, counts: Counts) -> ExecutionResult {
        ExecutionResult {
            suite: TestSuite::new(Category::Unit, id),
            status,
            exit_code: Some(if status.is_success() { 0 } else { 1 }),
            output: String::new(),
            counts,
            summary_reported: true,
            duration: Duration::from_millis(10),
            reason: None,
        }
    }

    #[test]
    fn test_parse_compact_form() {
        let parser = LabeledCounterParser::new();
        let counts = parser.parse("run:3/passed:2/failed:1").unwrap();
        assert_eq!(counts, Counts::new(3, 2, 1, 0));
    }

    #[test]
    fn test_parse_block_form_with_whitespace_and_case() {
        let parser = LabeledCounterParser::new();
        let output = "starting\nTests Run :  7\n  SKIPPED=1\nPassed:\t6\nfailed: 0\ndone\n";
        assert_eq!(parser.parse(output).unwrap(), Counts::new(7, 6, 0, 1));
    }

    #[test]
    fn test_parse_last_value_wins() {
        let parser = LabeledCounterParser::new();
        let output = "progress run: 1 passed: 1\nprogress run: 2 passed: 2\nTests run: 4\nPassed: 3\nFailed: 1\n";
        assert_eq!(parser.parse(output).unwrap(), Counts::new(4, 3, 1, 0));
    }

    #[test]
    fn test_parse_missing_summary() {
        let parser = LabeledCounterParser::new();
        assert!(parser.parse("Segmentation fault (core dumped)\n").is_none());
        assert!(parser.parse("").is_none());
    }

    #[test]
    fn test_parse_ignores_words_containing_labels() {
        let parser = LabeledCounterParser::new();
        assert!(parser.parse("rerun: 3\nbypassed: 4\n").is_none());
    }

    #[test]
    fn test_success_rate_without_tests() {
        let counts = Counts::default();
        assert_eq!(counts.success_rate(), 0.0);
        assert_eq!(counts.success_percent(), 0);
        assert_eq!(Counts::new(13, 12, 1, 0).success_percent(), 92);
    }

    #[tokio::test]
    async fn test_aggregation_sums_counts() {
        let aggregator = Aggregator::new("run-1");
        aggregator
            .register_category(Category::Unit, CategoryState::Present)
            .await;
        aggregator
            .record(result("a", SuiteStatus::Succeeded, Counts::new(5, 5, 0, 0)))
            .await;
        aggregator
            .record(result("b", SuiteStatus::Succeeded, Counts::new(5, 5, 0, 0)))
            .await;
        aggregator
            .record(result("c", SuiteStatus::Failed, Counts::new(3, 2, 1, 0)))
            .await;

        let report = aggregator.finish(Duration::from_secs(1), false).await.unwrap();
        assert_eq!(report.totals, Counts::new(13, 12, 1, 0));
        assert_eq!(report.exit_code(), 1);

        let unit = &report.categories[&Category::Unit];
        assert_eq!(unit.suites, 3);
        assert_eq!(unit.failed, 1);
        assert!(!unit.success());
    }

    #[tokio::test]
    async fn test_status_is_independent_of_counts() {
        let aggregator = Aggregator::new("run-2");
        aggregator
            .record(result("healthy-but-crashed", SuiteStatus::Failed, Counts::new(2, 2, 0, 0)))
            .await;
        let report = aggregator.finish(Duration::ZERO, false).await.unwrap();
        assert_eq!(report.totals.failed, 0);
        assert_eq!(report.exit_code(), 1);

        let aggregator = Aggregator::new("run-3");
        aggregator
            .record(result("nothing-found", SuiteStatus::Succeeded, Counts::default()))
            .await;
        let report = aggregator.finish(Duration::ZERO, false).await.unwrap();
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_category_fails_run() {
        let aggregator = Aggregator::new("run-4");
        aggregator
            .register_category(
                Category::Integration,
                CategoryState::Unreadable("permission denied".to_string()),
            )
            .await;
        let report = aggregator.finish(Duration::ZERO, false).await.unwrap();
        assert!(report.results.is_empty());
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_empty_run_succeeds() {
        let aggregator = Aggregator::new("run-5");
        aggregator
            .register_category(Category::Validation, CategoryState::Missing)
            .await;
        aggregator
            .register_category(Category::Unit, CategoryState::Empty)
            .await;
        let report = aggregator.finish(Duration::ZERO, false).await.unwrap();
        assert_eq!(report.totals, Counts::default());
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_finish_only_once() {
        let aggregator = Aggregator::new("run-6");
        assert!(aggregator.finish(Duration::ZERO, false).await.is_some());
        assert!(aggregator.finish(Duration::ZERO, false).await.is_none());

        // Late results are dropped with an error log instead of panicking.
        aggregator
            .record(result("late", SuiteStatus::Succeeded, Counts::default()))
            .await;
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let aggregator = std::sync::Arc::new(Aggregator::new("run-7"));
        let mut handles = Vec::new();
        for i in 0..32 {
            let aggregator = aggregator.clone();
            handles.push(tokio::spawn(async move {
                aggregator
                    .record(result(
                        &format!("suite-{}", i),
                        SuiteStatus::Succeeded,
                        Counts::new(2, 1, 0, 1),
                    ))
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let report = aggregator.finish(Duration::ZERO, false).await.unwrap();
        assert_eq!(report.totals, Counts::new(64, 32, 0, 32));
        assert_eq!(report.suite_count(), 32);
    }

    #[tokio::test]
    async fn test_huge_counters_saturate() {
        let parser = LabeledCounterParser::new();
        let huge = parser.parse("run: 18446744073709551615").unwrap();
        assert_eq!(huge.run, u64::MAX);

        let aggregator = Aggregator::new("run-8");
        aggregator
            .record(result("a", SuiteStatus::Succeeded, huge))
            .await;
        aggregator
            .record(result("b", SuiteStatus::Succeeded, Counts::new(1, 1, 0, 0)))
            .await;

        let report = aggregator.finish(Duration::ZERO, false).await.unwrap();
        assert_eq!(report.totals.run, u64::MAX);
        assert_eq!(report.totals.passed, 1);
        assert_eq!(report.exit_code(), 0);
    }
}
