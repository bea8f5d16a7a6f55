//! Configuration loading and run settings for convoy.
//!
//! Configuration comes from two places: an optional `convoy.toml` file
//! (see [`schema`]) and command-line overrides ([`RunOverrides`]). The two are
//! resolved once, at startup, into an immutable [`RunConfiguration`] that the
//! rest of the engine consumes.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::discovery::Category;
use crate::executor::ExecutionMode;
use crate::report::{ReportFormat, resolve_formats};

/// Loads convoy configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not match the schema.
///
/// # Example
///
/// ```no_run
/// use convoy::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("convoy.toml"))?;
/// println!("Timeout: {}s", config.convoy.timeout_secs);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads convoy configuration from a TOML string.
///
/// # Example
///
/// ```
/// use convoy::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [suites]
///     unit = "checks/unit"
/// "#)?;
///
/// assert_eq!(config.suites.unit, std::path::PathBuf::from("checks/unit"));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Loads the configuration file, falling back to defaults when an implicit
/// path does not exist.
///
/// `explicit` should be true when the user named the file on the command
/// line; in that case a missing file is an error.
pub fn load_config_or_default(path: &Path, explicit: bool) -> Result<Config> {
    if !explicit && !path.exists() {
        debug!(
            "No config file at {}, using built-in defaults",
            path.display()
        );
        return Ok(Config::default());
    }
    load_config(path)
}

/// How much the run prints while it executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Progress bars and inline failures only.
    Normal,
    /// Also stream every suite output line, prefixed with the suite id.
    Verbose,
    /// Verbose plus debug-level logging.
    Debug,
}

impl Verbosity {
    /// Returns true when suite output should be streamed live.
    pub fn streams_output(self) -> bool {
        !matches!(self, Verbosity::Normal)
    }
}

/// Category flags as given on the command line.
///
/// Specific flags narrow the selection; `all`, or no flag at all, selects
/// every category.
#[derive(Debug, Clone, Copy, Default)]
pub struct CategorySelection {
    pub unit: bool,
    pub integration: bool,
    pub validation: bool,
    pub all: bool,
}

impl CategorySelection {
    /// Resolves the flags into categories in execution order.
    pub fn resolve(&self) -> Vec<Category> {
        let none_given = !(self.unit || self.integration || self.validation);
        if self.all || none_given {
            return Category::EXECUTION_ORDER.to_vec();
        }

        Category::EXECUTION_ORDER
            .into_iter()
            .filter(|category| match category {
                Category::Unit => self.unit,
                Category::Integration => self.integration,
                Category::Validation => self.validation,
            })
            .collect()
    }
}

/// Command-line overrides applied on top of the configuration file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub categories: CategorySelection,
    pub parallel: bool,
    pub coverage: bool,
    pub verbose: bool,
    pub debug: bool,
    pub no_cleanup: bool,
    pub formats: Vec<String>,
    pub timeout_secs: Option<u64>,
}

/// Fully resolved settings for a single run.
///
/// Built once by [`RunConfiguration::resolve`] and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct RunConfiguration {
    /// Selected categories, in execution order.
    pub categories: Vec<Category>,
    pub mode: ExecutionMode,
    pub timeout: Duration,
    pub grace_period: Duration,
    pub cleanup: bool,
    pub formats: Vec<ReportFormat>,
    pub verbosity: Verbosity,
    pub coverage: bool,
    pub coverage_command: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub suites: SuitesConfig,
    pub environment: EnvironmentConfig,
}

impl RunConfiguration {
    /// Merges the configuration file with command-line overrides.
    ///
    /// Unknown report format names are dropped with a warning; if nothing
    /// usable remains the console format is used.
    pub fn resolve(config: Config, overrides: &RunOverrides) -> Self {
        let Config {
            convoy,
            suites,
            environment,
            report,
            coverage,
        } = config;

        let mode = if overrides.parallel || convoy.parallel {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Sequential
        };

        let verbosity = if overrides.debug {
            Verbosity::Debug
        } else if overrides.verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        };

        let format_names = if overrides.formats.is_empty() {
            report.formats
        } else {
            overrides.formats.clone()
        };

        let suites = SuitesConfig {
            unit: expand_path(&suites.unit),
            integration: expand_path(&suites.integration),
            validation: expand_path(&suites.validation),
            ..suites
        };

        let environment = EnvironmentConfig {
            snapshot: environment.snapshot.iter().map(|p| expand_path(p)).collect(),
            backup_dir: expand_path(&environment.backup_dir),
            ..environment
        };

        Self {
            categories: overrides.categories.resolve(),
            mode,
            timeout: Duration::from_secs(overrides.timeout_secs.unwrap_or(convoy.timeout_secs)),
            grace_period: Duration::from_secs(convoy.grace_period_secs),
            cleanup: convoy.cleanup && !overrides.no_cleanup,
            formats: resolve_formats(&format_names),
            verbosity,
            coverage: overrides.coverage,
            coverage_command: coverage.command,
            working_dir: convoy.working_dir.as_deref().map(expand_path),
            output_dir: expand_path(&report.output_dir),
            suites,
            environment,
        }
    }
}

/// Expands `~` and environment variables in a configured path.
///
/// Paths whose variables cannot be resolved are used verbatim.
fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}
