//! Suite runner: executes one suite as an isolated child process.
//!
//! The [`SuiteRunner`] spawns the suite in its own process group with stdin
//! closed, merges stdout and stderr into one buffer line by line, and races
//! process completion against the configured timeout and an optional
//! [`CancellationToken`]. When the timeout or cancellation wins, the whole
//! process group receives SIGTERM and, if still alive after the grace
//! period, SIGKILL.
//!
//! The runner never returns an error: spawn failures, crashes and timeouts
//! all become an [`ExecutionResult`] so that no suite is ever dropped.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use convoy::discovery::{Category, TestSuite};
//! use convoy::executor::SuiteRunner;
//!
//! # async fn example() {
//! let runner = SuiteRunner::new(Duration::from_secs(60));
//! let suite = TestSuite::new(Category::Unit, "tests/unit/test_math.sh");
//! let result = runner.run(&suite).await;
//! println!("{} {:?}", suite.id, result.status);
//! # }
//! ```

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future;
use futures::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::aggregate::{
    ExecutionResult, LabeledCounterParser, SuiteStatus, SummaryParser, warn_on_summary,
};
use crate::discovery::TestSuite;

/// How long to keep collecting output after the suite process is gone.
///
/// Pipes stay open while any process holding them lives, e.g. a daemon the
/// suite left behind outside its process group.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A single line of suite output, tagged with its stream.
#[derive(Debug, Clone)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(s) | OutputLine::Stderr(s) => s,
        }
    }
}

/// Callback invoked for every output line, with the suite id.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use convoy::executor::{OutputCallback, OutputLine};
///
/// let callback: OutputCallback = Arc::new(|suite_id, line| match line {
///     OutputLine::Stdout(s) => println!("[{}] {}", suite_id, s),
///     OutputLine::Stderr(s) => eprintln!("[{}] {}", suite_id, s),
/// });
/// ```
pub type OutputCallback = Arc<dyn Fn(&str, &OutputLine) + Send + Sync>;

/// How waiting on a child ended.
enum Completion {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(std::io::Error),
}

/// Executes suites one process at a time. Cheap to share behind an `Arc`.
pub struct SuiteRunner {
    timeout: Duration,
    grace_period: Duration,
    interpreter: Vec<String>,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    parser: Arc<dyn SummaryParser>,
    output_callback: Option<OutputCallback>,
    cancellation_token: Option<CancellationToken>,
}

impl SuiteRunner {
    /// Creates a runner with the given per-suite timeout, a 5 second grace
    /// period and the v1 summary parser.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            grace_period: Duration::from_secs(5),
            interpreter: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            parser: Arc::new(LabeledCounterParser::new()),
            output_callback: None,
            cancellation_token: None,
        }
    }

    /// Sets how long a terminated suite may take to exit before it is killed.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Launches suites through `interpreter` (program plus leading arguments)
    /// instead of executing them directly.
    pub fn with_interpreter(mut self, interpreter: Vec<String>) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Adds an environment variable passed to every suite.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Replaces the summary parser.
    pub fn with_parser(mut self, parser: Arc<dyn SummaryParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Streams every output line to `callback` as it arrives.
    pub fn with_output_callback(mut self, callback: OutputCallback) -> Self {
        self.output_callback = Some(callback);
        self
    }

    /// Stops running suites when `token` is cancelled.
    ///
    /// A suite in flight is terminated like a timed-out one and recorded as
    /// failed; suites started after cancellation are not run at all.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `suite` to completion, timeout or cancellation.
    pub async fn run(&self, suite: &TestSuite) -> ExecutionResult {
        if self.is_cancelled() {
            return ExecutionResult::not_run(suite.clone(), "not run: interrupted");
        }

        let start = Instant::now();
        debug!("Starting {} ({})", suite.id, suite.executable.display());

        let mut child = match self.build_command(suite).spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("failed to start {}: {}", suite.executable.display(), e);
                warn!("{}: {}", suite.id, reason);
                let mut result = ExecutionResult::not_run(suite.clone(), reason);
                result.duration = start.elapsed();
                return result;
            }
        };

        let buffer = Arc::new(Mutex::new(String::new()));
        let reader = self.spawn_reader(&mut child, &suite.id, buffer.clone());

        let completion = self.wait(&mut child).await;
        if !matches!(completion, Completion::Exited(_)) {
            terminate(&mut child, self.grace_period).await;
        }

        if let Some(reader) = reader {
            let abort = reader.abort_handle();
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!("{}: output pipes still open, discarding the rest", suite.id);
                abort.abort();
            }
        }

        let output = match buffer.lock() {
            Ok(mut buffer) => std::mem::take(&mut *buffer),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let duration = start.elapsed();

        let (status, exit_code, reason) = match completion {
            Completion::Exited(status) => match status.code() {
                Some(0) => (SuiteStatus::Succeeded, Some(0), None),
                Some(code) => (
                    SuiteStatus::Failed,
                    Some(code),
                    Some(format!("exited with code {}", code)),
                ),
                None => (SuiteStatus::Failed, None, Some(describe_signal(&status))),
            },
            Completion::TimedOut => (
                SuiteStatus::TimedOut,
                None,
                Some(format!("timed out after {:?}", self.timeout)),
            ),
            Completion::Cancelled => (SuiteStatus::Failed, None, Some("interrupted".to_string())),
            Completion::WaitFailed(e) => (
                SuiteStatus::Failed,
                None,
                Some(format!("failed to wait for process: {}", e)),
            ),
        };

        let parsed = self.parser.parse(&output);

        debug!(
            "{} finished with {:?} (exit code {:?}) in {:?}",
            suite.id, status, exit_code, duration
        );

        let result = ExecutionResult {
            suite: suite.clone(),
            status,
            exit_code,
            output,
            counts: parsed.unwrap_or_default(),
            summary_reported: parsed.is_some(),
            duration,
            reason,
        };
        warn_on_summary(&result);
        result
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
    }

    fn build_command(&self, suite: &TestSuite) -> Command {
        // Relative paths would otherwise resolve against the child's working dir.
        let executable =
            std::path::absolute(&suite.executable).unwrap_or_else(|_| suite.executable.clone());

        let mut command = match self.interpreter.split_first() {
            Some((program, args)) => {
                let mut command = Command::new(program);
                command.args(args).arg(&executable);
                command
            }
            None => Command::new(&executable),
        };

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
            .env("CONVOY_CATEGORY", suite.category.as_str())
            .env("CONVOY_SUITE", &suite.id);

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        command
    }

    /// Collects merged stdout/stderr into `buffer` on a background task.
    fn spawn_reader(
        &self,
        child: &mut Child,
        suite_id: &str,
        buffer: Arc<Mutex<String>>,
    ) -> Option<JoinHandle<()>> {
        let stdout = child.stdout.take()?;
        let stderr = child.stderr.take()?;

        let mut combined = stream::select(
            output_lines(stdout, OutputLine::Stdout),
            output_lines(stderr, OutputLine::Stderr),
        );

        let callback = self.output_callback.clone();
        let suite_id = suite_id.to_string();

        Some(tokio::spawn(async move {
            while let Some(line) = combined.next().await {
                if let Some(callback) = &callback {
                    callback(&suite_id, &line);
                }
                if let Ok(mut buffer) = buffer.lock() {
                    buffer.push_str(line.text());
                    buffer.push('\n');
                }
            }
        }))
    }

    async fn wait(&self, child: &mut Child) -> Completion {
        let cancelled = async {
            match &self.cancellation_token {
                Some(token) => token.cancelled().await,
                None => future::pending::<()>().await,
            }
        };

        select! {
            status = child.wait() => match status {
                Ok(status) => Completion::Exited(status),
                Err(e) => Completion::WaitFailed(e),
            },
            _ = tokio::time::sleep(self.timeout) => Completion::TimedOut,
            _ = cancelled => Completion::Cancelled,
        }
    }
}

/// Turns a pipe into a stream of lines.
///
/// Invalid UTF-8 lines are replaced by a marker; any other read error ends
/// the stream.
fn output_lines<R>(reader: R, wrap: fn(String) -> OutputLine) -> impl Stream<Item = OutputLine>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio_stream::wrappers::LinesStream::new(BufReader::new(reader).lines())
        .take_while(|line| {
            future::ready(!matches!(line, Err(e) if e.kind() != std::io::ErrorKind::InvalidData))
        })
        .map(move |line| match line {
            Ok(text) => wrap(text),
            Err(_) => wrap("<invalid utf-8 output>".to_string()),
        })
}

/// Stops a suite: SIGTERM to its process group, SIGKILL after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let group = -(pid as libc::pid_t);
        // SAFETY: plain signal delivery to the process group created at spawn.
        unsafe {
            libc::kill(group, libc::SIGTERM);
        }
        let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
        // Also sweeps up anything the suite started inside its group.
        unsafe {
            libc::kill(group, libc::SIGKILL);
        }
        if exited {
            return;
        }
    }

    if let Err(e) = child.kill().await {
        debug!("Failed to kill suite process: {}", e);
    }
}

fn describe_signal(status: &ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {}", signal);
        }
    }
    format!("terminated abnormally ({})", status)
}
