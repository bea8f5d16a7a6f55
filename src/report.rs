//! Run reporting.
//!
//! Two kinds of reporting live here:
//!
//! - Live progress through the [`Reporter`] trait, called by the scheduler
//!   as categories and suites start and finish. [`ConsoleReporter`] draws
//!   progress bars and prints failures inline; [`NullReporter`] is silent.
//! - Final artifacts, rendered from a finished
//!   [`AggregateReport`](crate::aggregate::AggregateReport) by pure functions
//!   ([`render_console`], [`render_junit`], [`render_html`]) and written to
//!   the reports directory by [`write_report`].

pub mod console;
pub mod html;
pub mod junit;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::aggregate::{AggregateReport, ExecutionResult, SuiteStatus};
use crate::discovery::{Category, CategoryState, TestSuite};

pub use self::console::render_console;
pub use self::html::render_html;
pub use self::junit::render_junit;

/// Errors from report generation. Never fatal to a run.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Unknown report format '{0}'")]
    UnknownFormat(String),

    #[error("Failed to render {format} report: {message}")]
    Render { format: ReportFormat, message: String },

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An artifact format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportFormat {
    Console,
    Junit,
    Html,
}

impl ReportFormat {
    pub const ALL: [ReportFormat; 3] = [
        ReportFormat::Console,
        ReportFormat::Junit,
        ReportFormat::Html,
    ];

    /// Deterministic artifact file name.
    pub fn file_name(self) -> &'static str {
        match self {
            ReportFormat::Console => "summary.txt",
            ReportFormat::Junit => "junit.xml",
            ReportFormat::Html => "report.html",
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReportFormat::Console => "console",
            ReportFormat::Junit => "junit",
            ReportFormat::Html => "html",
        })
    }
}

impl FromStr for ReportFormat {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" | "text" => Ok(ReportFormat::Console),
            "junit" | "xml" => Ok(ReportFormat::Junit),
            "html" => Ok(ReportFormat::Html),
            other => Err(ReportError::UnknownFormat(other.to_string())),
        }
    }
}

/// Parses requested format names.
///
/// Unknown names log a warning and become [`ReportFormat::Console`];
/// duplicates are dropped; an empty request yields console only.
///
/// # Example
///
/// ```
/// use convoy::report::{ReportFormat, resolve_formats};
///
/// let formats = resolve_formats(&["xml".to_string(), "pdf".to_string()]);
/// assert_eq!(formats, vec![ReportFormat::Junit, ReportFormat::Console]);
/// ```
pub fn resolve_formats(names: &[String]) -> Vec<ReportFormat> {
    let mut formats = Vec::new();

    for name in names {
        let format = name.parse::<ReportFormat>().unwrap_or_else(|e| {
            warn!("{}, falling back to console", e);
            ReportFormat::Console
        });
        if !formats.contains(&format) {
            formats.push(format);
        }
    }

    if formats.is_empty() {
        formats.push(ReportFormat::Console);
    }
    formats
}

/// Renders `format` for `report` without touching the filesystem.
pub fn render(
    report: &AggregateReport,
    format: ReportFormat,
    generated_at: DateTime<Utc>,
) -> Result<String, ReportError> {
    match format {
        ReportFormat::Console => Ok(render_console(report, false)),
        ReportFormat::Junit => {
            render_junit(report, generated_at).map_err(|e| ReportError::Render {
                format,
                message: e.to_string(),
            })
        }
        ReportFormat::Html => Ok(render_html(report, generated_at)),
    }
}

/// Writes the `format` artifact for `report` into `output_dir`.
///
/// The directory is created if absent. Returns the artifact path.
pub fn write_report(
    report: &AggregateReport,
    format: ReportFormat,
    output_dir: &Path,
    generated_at: DateTime<Utc>,
) -> Result<PathBuf, ReportError> {
    let content = render(report, format, generated_at)?;

    std::fs::create_dir_all(output_dir).map_err(|source| ReportError::Write {
        path: output_dir.to_path_buf(),
        source,
    })?;

    let path = output_dir.join(format.file_name());
    std::fs::write(&path, content).map_err(|source| ReportError::Write {
        path: path.clone(),
        source,
    })?;

    info!("{} report written to: {}", format, path.display());
    Ok(path)
}

/// Removes artifacts left by a previous run from `output_dir`.
///
/// Only convoy's own artifact names are touched.
pub fn remove_stale_reports(output_dir: &Path) {
    for format in ReportFormat::ALL {
        let path = output_dir.join(format.file_name());
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Removed stale {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove stale {}: {}", path.display(), e),
        }
    }
}

/// Receives progress events while a run executes.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// A category with suites is about to run.
    async fn on_category_start(&self, category: Category, suites: &[TestSuite]);

    /// A category was skipped because discovery found no suites.
    async fn on_category_skipped(&self, category: Category, state: &CategoryState);

    async fn on_suite_start(&self, suite: &TestSuite);

    async fn on_suite_complete(&self, result: &ExecutionResult);

    /// Every suite of the category has a result.
    async fn on_category_complete(&self, category: Category);

    /// The aggregate report is final.
    async fn on_run_complete(&self, report: &AggregateReport);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_category_start(&self, _category: Category, _suites: &[TestSuite]) {}
    async fn on_category_skipped(&self, _category: Category, _state: &CategoryState) {}
    async fn on_suite_start(&self, _suite: &TestSuite) {}
    async fn on_suite_complete(&self, _result: &ExecutionResult) {}
    async fn on_category_complete(&self, _category: Category) {}
    async fn on_run_complete(&self, _report: &AggregateReport) {}
}

/// Console reporter that shows per-category progress in the terminal.
///
/// Failures are printed inline as they happen; with `verbose` every
/// completion is printed and the progress bar is hidden so streamed suite
/// output stays readable.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn println(&self, line: String) {
        match self.progress.lock().ok().and_then(|pb| pb.clone()) {
            Some(pb) => pb.println(line),
            None => println!("{}", line),
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_category_start(&self, category: Category, suites: &[TestSuite]) {
        println!(
            "{} {} ({} suite(s))",
            ::console::style("==>").cyan().bold(),
            ::console::style(category).bold(),
            suites.len()
        );

        let pb = if self.verbose {
            indicatif::ProgressBar::hidden()
        } else {
            indicatif::ProgressBar::new(suites.len() as u64)
        };
        pb.set_style(
            indicatif::ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                )
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        if let Ok(mut progress) = self.progress.lock() {
            *progress = Some(pb);
        }
    }

    async fn on_category_skipped(&self, category: Category, state: &CategoryState) {
        let reason = match state {
            CategoryState::Missing => "directory missing".to_string(),
            CategoryState::Empty => "no suites found".to_string(),
            CategoryState::Unreadable(reason) => format!("unreadable: {}", reason),
            CategoryState::Present => "nothing to run".to_string(),
        };
        let styled = if state.is_error() {
            ::console::style(format!("{} skipped ({})", category, reason)).red()
        } else {
            ::console::style(format!("{} skipped ({})", category, reason)).yellow()
        };
        println!("{} {}", ::console::style("==>").cyan().bold(), styled);
    }

    async fn on_suite_start(&self, suite: &TestSuite) {
        if self.verbose {
            self.println(format!("Running: {}", suite.id));
        } else if let Ok(progress) = self.progress.lock()
            && let Some(pb) = progress.as_ref()
        {
            pb.set_message(suite.name.clone());
        }
    }

    async fn on_suite_complete(&self, result: &ExecutionResult) {
        let status = match result.status {
            SuiteStatus::Succeeded => ::console::style(result.status.label()).green(),
            SuiteStatus::Failed => ::console::style(result.status.label()).red(),
            SuiteStatus::TimedOut => ::console::style(result.status.label()).red().bold(),
        };

        if self.verbose || !result.status.is_success() {
            let line = match &result.reason {
                Some(reason) => format!(
                    "{} {} {}",
                    status,
                    result.suite.id,
                    ::console::style(reason).dim()
                ),
                None => format!("{} {}", status, result.suite.id),
            };
            self.println(line);
        }

        if let Ok(progress) = self.progress.lock()
            && let Some(pb) = progress.as_ref()
        {
            pb.inc(1);
        }
    }

    async fn on_category_complete(&self, _category: Category) {
        if let Ok(mut progress) = self.progress.lock()
            && let Some(pb) = progress.take()
        {
            pb.finish_and_clear();
        }
    }

    async fn on_run_complete(&self, _report: &AggregateReport) {
        if let Ok(mut progress) = self.progress.lock()
            && let Some(pb) = progress.take()
        {
            pb.finish_and_clear();
        }
    }
}
