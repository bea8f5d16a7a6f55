//! Run controller.
//!
//! [`RunController`] sequences one complete run:
//!
//! ```text
//!   Idle ──► Preparing ──┬──► Aborted                    (acquire failed)
//!                        │
//!                        └──► Running ──► Reporting ──► ReleasingEnvironment ──► Done
//!
//!   Preparing:            remove stale reports, EnvironmentController::acquire
//!   Running:              for each selected category, in order:
//!                           SuiteDiscoverer::discover ──► Scheduler::run_category
//!                         then the optional coverage command
//!   Reporting:            Aggregator::finish ──► write_report per format
//!   ReleasingEnvironment: EnvironmentGuard::release
//! ```
//!
//! Once acquire has succeeded, the environment is released on every path:
//! suite failures, timeouts, report errors and interruption through the
//! controller's [`CancellationToken`] all end up in `ReleasingEnvironment`.
//! If the run future itself is dropped, the guard's `Drop` still restores
//! the file snapshots.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use convoy::config::{Config, RunConfiguration, RunOverrides};
//! use convoy::environment::EnvironmentController;
//! use convoy::orchestrator::RunController;
//! use convoy::report::ConsoleReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = RunConfiguration::resolve(Config::default(), &RunOverrides::default());
//!     let environment = EnvironmentController::new(settings.environment.clone(), settings.cleanup);
//!     let controller = RunController::new(settings, environment, Arc::new(ConsoleReporter::new(false)));
//!
//!     let outcome = controller.run().await?;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::{AggregateReport, Aggregator};
use crate::config::RunConfiguration;
use crate::discovery::{DiscoveryError, SuiteDiscoverer};
use crate::environment::{
    EnvironmentController, EnvironmentError, EnvironmentGuard, ReleaseWarning,
};
use crate::executor::{OutputCallback, OutputLine, Scheduler, SuiteRunner};
use crate::report::{self, ReportFormat, Reporter};

/// States of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Preparing,
    Aborted,
    Running,
    Reporting,
    ReleasingEnvironment,
    Done,
}

/// Errors that stop a run before any suite executes.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Environment setup failed, no suites were run: {0}")]
    Aborted(#[from] EnvironmentError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: AggregateReport,
    /// Report artifacts that were written.
    pub artifacts: Vec<PathBuf>,
    pub release_warnings: Vec<ReleaseWarning>,
    /// Phases visited, in order.
    pub phases: Vec<RunPhase>,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        self.report.exit_code()
    }
}

/// Drives a run from configuration to exit code.
pub struct RunController<R> {
    settings: RunConfiguration,
    environment: EnvironmentController,
    reporter: Arc<R>,
    cancellation_token: CancellationToken,
    phases: Vec<RunPhase>,
}

impl<R> RunController<R>
where
    R: Reporter + 'static,
{
    pub fn new(
        settings: RunConfiguration,
        environment: EnvironmentController,
        reporter: Arc<R>,
    ) -> Self {
        Self {
            settings,
            environment,
            reporter,
            cancellation_token: CancellationToken::new(),
            phases: vec![RunPhase::Idle],
        }
    }

    /// Uses `token` to interrupt the run.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Token that interrupts the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!("Run phase: {:?}", phase);
        self.phases.push(phase);
    }

    /// Executes the run.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Aborted`] when the environment cannot be
    /// acquired; no suite runs in that case. Suite failures are not errors:
    /// they are part of the returned report.
    pub async fn run(mut self) -> Result<RunOutcome, RunError> {
        let start = Instant::now();
        let discoverer = SuiteDiscoverer::new(&self.settings.suites.pattern)?;
        let run_id = uuid::Uuid::new_v4().to_string();

        self.enter(RunPhase::Preparing);
        info!("Starting run {}", run_id);
        if self.settings.cleanup {
            report::remove_stale_reports(&self.settings.output_dir);
        }

        let guard = match self.environment.acquire().await {
            Ok(guard) => guard,
            Err(e) => {
                error!("Environment setup failed: {}", e);
                self.enter(RunPhase::Aborted);
                return Err(e.into());
            }
        };

        self.enter(RunPhase::Running);
        let aggregator = Arc::new(Aggregator::new(run_id.clone()));
        let runner = Arc::new(self.build_runner(&guard, &run_id));
        let scheduler = Scheduler::new(runner, self.reporter.clone(), self.settings.mode)
            .with_cancellation_token(self.cancellation_token.clone());

        for category in self.settings.categories.clone() {
            let dir = self.settings.suites.dir(category).clone();
            let found = discoverer.discover(category, &dir).await;
            aggregator
                .register_category(category, found.state.clone())
                .await;

            if found.suites.is_empty() {
                self.reporter
                    .on_category_skipped(category, &found.state)
                    .await;
                continue;
            }
            scheduler
                .run_category(category, found.suites, &aggregator)
                .await;
        }

        if self.settings.coverage && !self.cancellation_token.is_cancelled() {
            self.run_coverage(&guard, &run_id).await;
        }

        self.enter(RunPhase::Reporting);
        let interrupted = self.cancellation_token.is_cancelled();
        if interrupted {
            warn!("Run was interrupted");
        }
        let report = aggregator
            .finish(start.elapsed(), interrupted)
            .await
            .unwrap_or_default();
        self.reporter.on_run_complete(&report).await;
        let artifacts = self.write_reports(&report);

        self.enter(RunPhase::ReleasingEnvironment);
        let release_warnings = guard.release().await;

        self.enter(RunPhase::Done);
        info!(
            "Run {} finished in {:?} with exit code {}",
            report.run_id,
            report.duration,
            report.exit_code()
        );

        Ok(RunOutcome {
            report,
            artifacts,
            release_warnings,
            phases: self.phases,
        })
    }

    fn build_runner(&self, guard: &EnvironmentGuard, run_id: &str) -> SuiteRunner {
        let mut runner = SuiteRunner::new(self.settings.timeout)
            .with_grace_period(self.settings.grace_period)
            .with_cancellation_token(self.cancellation_token.clone())
            .with_env("CONVOY_RUN_ID", run_id);

        for (key, value) in guard.suite_env() {
            runner = runner.with_env(key, value);
        }
        if self.settings.coverage {
            runner = runner.with_env("CONVOY_COVERAGE", "1");
        }

        if let Some(interpreter) = &self.settings.suites.interpreter {
            let words = shell_words::split(interpreter).unwrap_or_else(|e| {
                warn!(
                    "Cannot parse interpreter '{}' ({}), using it verbatim",
                    interpreter, e
                );
                vec![interpreter.clone()]
            });
            runner = runner.with_interpreter(words);
        }

        if let Some(dir) = &self.settings.working_dir {
            runner = runner.with_working_dir(dir.clone());
        }

        if self.settings.verbosity.streams_output() {
            let callback: OutputCallback = Arc::new(|suite_id, line| match line {
                OutputLine::Stdout(s) => println!("[{}] {}", suite_id, s),
                OutputLine::Stderr(s) => eprintln!("[{}] {}", suite_id, s),
            });
            runner = runner.with_output_callback(callback);
        }

        runner
    }

    /// Runs the configured coverage command. Failures are warnings.
    async fn run_coverage(&self, guard: &EnvironmentGuard, run_id: &str) {
        let Some(command) = &self.settings.coverage_command else {
            debug!("Coverage enabled without a command; suites see CONVOY_COVERAGE=1");
            return;
        };

        info!("Running coverage command: {}", command);
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env("CONVOY_RUN_ID", run_id)
            .env("CONVOY_COVERAGE", "1")
            .envs(guard.suite_env())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.settings.working_dir {
            cmd.current_dir(dir);
        }

        match tokio::time::timeout(self.settings.timeout, cmd.status()).await {
            Ok(Ok(status)) if status.success() => info!("Coverage command finished"),
            Ok(Ok(status)) => warn!("Coverage command failed: {}", status),
            Ok(Err(e)) => warn!("Failed to run coverage command: {}", e),
            Err(_) => warn!(
                "Coverage command timed out after {:?}",
                self.settings.timeout
            ),
        }
    }

    /// Writes every requested artifact; failures are logged and skipped.
    fn write_reports(&self, report: &AggregateReport) -> Vec<PathBuf> {
        let generated_at = Utc::now();
        let mut artifacts = Vec::new();

        for format in &self.settings.formats {
            if *format == ReportFormat::Console {
                print!(
                    "\n{}",
                    report::render_console(report, ::console::colors_enabled())
                );
            }
            let written =
                report::write_report(report, *format, &self.settings.output_dir, generated_at);
            match written {
                Ok(path) => artifacts.push(path),
                Err(e) => error!("{}", e),
            }
        }

        artifacts
    }
}
