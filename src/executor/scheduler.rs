//! Category scheduling.
//!
//! The [`Scheduler`] runs the suites of one category either one after the
//! other or all at once, and only returns when every suite of the category
//! has a recorded result. That join barrier is what keeps categories
//! strictly ordered even in parallel mode.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::aggregate::{Aggregator, ExecutionResult};
use crate::discovery::{Category, TestSuite};
use crate::report::Reporter;

use super::runner::SuiteRunner;

/// How the suites of a category are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One suite at a time, in discovery order.
    Sequential,
    /// Every suite of the category concurrently.
    Parallel,
}

/// Runs categories of suites and records their results.
pub struct Scheduler<R> {
    runner: Arc<SuiteRunner>,
    reporter: Arc<R>,
    mode: ExecutionMode,
    cancellation_token: CancellationToken,
}

impl<R> Scheduler<R>
where
    R: Reporter + 'static,
{
    pub fn new(runner: Arc<SuiteRunner>, reporter: Arc<R>, mode: ExecutionMode) -> Self {
        Self {
            runner,
            reporter,
            mode,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Suites not yet started when `token` is cancelled are recorded as not
    /// run instead of being launched.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Runs every suite of `category` and records one result per suite.
    ///
    /// Returns only after all results are recorded.
    pub async fn run_category(
        &self,
        category: Category,
        suites: Vec<TestSuite>,
        aggregator: &Arc<Aggregator>,
    ) {
        info!(
            "Running {} {} suite(s) ({:?})",
            suites.len(),
            category,
            self.mode
        );
        self.reporter.on_category_start(category, &suites).await;

        match self.mode {
            ExecutionMode::Sequential => self.run_sequential(suites, aggregator).await,
            ExecutionMode::Parallel => self.run_parallel(suites, aggregator).await,
        }

        self.reporter.on_category_complete(category).await;
    }

    async fn run_sequential(&self, suites: Vec<TestSuite>, aggregator: &Arc<Aggregator>) {
        for suite in suites {
            let result = run_one(
                &self.runner,
                self.reporter.as_ref(),
                &self.cancellation_token,
                &suite,
            )
            .await;
            self.reporter.on_suite_complete(&result).await;
            aggregator.record(result).await;
        }
    }

    async fn run_parallel(&self, suites: Vec<TestSuite>, aggregator: &Arc<Aggregator>) {
        let mut workers = Vec::with_capacity(suites.len());

        for suite in suites {
            let runner = self.runner.clone();
            let reporter = self.reporter.clone();
            let aggregator = aggregator.clone();
            let token = self.cancellation_token.clone();
            let id = suite.clone();

            let handle = tokio::spawn(async move {
                let result = run_one(&runner, reporter.as_ref(), &token, &suite).await;
                reporter.on_suite_complete(&result).await;
                aggregator.record(result).await;
            });
            workers.push((id, handle));
        }

        // Join barrier: the next category must not start before these finish.
        for (suite, handle) in workers {
            if let Err(e) = handle.await {
                error!("Worker for {} crashed: {}", suite.id, e);
                let result = ExecutionResult::not_run(suite, format!("worker crashed: {}", e));
                self.reporter.on_suite_complete(&result).await;
                aggregator.record(result).await;
            }
        }
    }
}

async fn run_one<R: Reporter>(
    runner: &SuiteRunner,
    reporter: &R,
    token: &CancellationToken,
    suite: &TestSuite,
) -> ExecutionResult {
    if token.is_cancelled() {
        debug!("Skipping {} after interrupt", suite.id);
        return ExecutionResult::not_run(suite.clone(), "not run: interrupted");
    }
    reporter.on_suite_start(suite).await;
    runner.run(suite).await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::aggregate::SuiteStatus;
    use crate::discovery::CategoryState;
    use crate::report::NullReporter;
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> TestSuite {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        TestSuite::new(Category::Unit, path)
    }

    fn scheduler(mode: ExecutionMode) -> Scheduler<NullReporter> {
        scheduler_with_timeout(mode, Duration::from_secs(10))
    }

    fn scheduler_with_timeout(mode: ExecutionMode, timeout: Duration) -> Scheduler<NullReporter> {
        let runner = SuiteRunner::new(timeout)
            .with_grace_period(Duration::from_millis(200))
            .with_interpreter(vec!["sh".to_string()]);
        Scheduler::new(Arc::new(runner), Arc::new(NullReporter), mode)
    }

    async fn run(
        scheduler: &Scheduler<NullReporter>,
        suites: Vec<TestSuite>,
    ) -> crate::aggregate::AggregateReport {
        let aggregator = Arc::new(Aggregator::new("run"));
        aggregator
            .register_category(Category::Unit, CategoryState::Present)
            .await;
        scheduler
            .run_category(Category::Unit, suites, &aggregator)
            .await;
        aggregator
            .finish(Duration::ZERO, false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sequential_preserves_order() {
        let temp_dir = TempDir::new().unwrap();
        let log = temp_dir.path().join("order.log");
        let suites: Vec<_> = ["test_a.sh", "test_b.sh", "test_c.sh"]
            .iter()
            .map(|name| {
                script(
                    temp_dir.path(),
                    name,
                    &format!("echo {} >> '{}'", name, log.display()),
                )
            })
            .collect();

        let report = run(&scheduler(ExecutionMode::Sequential), suites).await;

        assert_eq!(report.suite_count(), 3);
        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "test_a.sh\ntest_b.sh\ntest_c.sh\n"
        );
        let ids: Vec<_> = report.results.iter().map(|r| r.suite.id.as_str()).collect();
        assert_eq!(ids, vec!["unit/test_a.sh", "unit/test_b.sh", "unit/test_c.sh"]);
    }

    #[tokio::test]
    async fn test_parallel_runs_concurrently_and_joins() {
        let temp_dir = TempDir::new().unwrap();
        let suites: Vec<_> = (0..4)
            .map(|i| {
                script(
                    temp_dir.path(),
                    &format!("test_{}.sh", i),
                    "sleep 1\necho 'run: 1, passed: 1'",
                )
            })
            .collect();

        let start = Instant::now();
        let report = run(&scheduler(ExecutionMode::Parallel), suites).await;

        assert_eq!(report.suite_count(), 4);
        assert_eq!(report.totals.run, 4);
        assert!(report.success());
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_category() {
        let temp_dir = TempDir::new().unwrap();
        let suites = vec![
            script(temp_dir.path(), "test_a.sh", "exit 1"),
            script(temp_dir.path(), "test_b.sh", "exit 0"),
        ];

        let report = run(&scheduler(ExecutionMode::Sequential), suites).await;

        assert_eq!(report.suite_count(), 2);
        assert_eq!(report.results[0].status, SuiteStatus::Failed);
        assert_eq!(report.results[1].status, SuiteStatus::Succeeded);
        assert!(!report.success());
    }

    #[tokio::test]
    async fn test_cancelled_scheduler_records_every_suite() {
        let temp_dir = TempDir::new().unwrap();
        let suites = vec![
            script(temp_dir.path(), "test_a.sh", "exit 0"),
            script(temp_dir.path(), "test_b.sh", "exit 0"),
        ];
        let token = CancellationToken::new();
        token.cancel();

        let scheduler = scheduler(ExecutionMode::Parallel).with_cancellation_token(token);
        let report = run(&scheduler, suites).await;

        assert_eq!(report.suite_count(), 2);
        assert!(
            report
                .results
                .iter()
                .all(|r| r.reason.as_deref() == Some("not run: interrupted"))
        );
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_totals_match_across_modes() {
        let temp_dir = TempDir::new().unwrap();
        let suites = vec![
            script(temp_dir.path(), "test_a.sh", "echo 'run: 5, passed: 5'"),
            script(
                temp_dir.path(),
                "test_b.sh",
                "echo 'run: 3, passed: 2, failed: 1'\nexit 1",
            ),
            script(temp_dir.path(), "test_c.sh", "echo 'run: 4, passed: 3, skipped: 1'"),
            script(temp_dir.path(), "test_d.sh", "echo 'run: 2, passed: 1'\nsleep 30"),
        ];

        let timeout = Duration::from_secs(1);
        let sequential = run(
            &scheduler_with_timeout(ExecutionMode::Sequential, timeout),
            suites.clone(),
        )
        .await;
        let parallel = run(
            &scheduler_with_timeout(ExecutionMode::Parallel, timeout),
            suites,
        )
        .await;

        assert_eq!(sequential.totals, crate::aggregate::Counts::new(14, 11, 1, 1));
        assert_eq!(sequential.totals, parallel.totals);
        assert_eq!(sequential.categories, parallel.categories);

        let unit = &parallel.categories[&Category::Unit];
        assert_eq!(unit.suites, 4);
        assert_eq!(unit.succeeded, 2);
        assert_eq!(unit.failed, 1);
        assert_eq!(unit.timed_out, 1);
    }
}
