//! Configuration schema definitions for convoy.
//!
//! This module defines all configuration types that can be deserialized from
//! a `convoy.toml` file. Every section is optional; a missing file or an
//! empty one yields a runnable default configuration.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── ConvoyConfig        - Core settings (timeouts, parallelism, cleanup)
//! ├── SuitesConfig        - Where each category lives and how suites are named
//! ├── EnvironmentConfig   - Fixture snapshots and the shared test network
//! ├── ReportConfig        - Output directory and report formats
//! └── CoverageConfig      - External coverage collaborator
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::discovery::Category;

/// Root configuration structure for convoy.
///
/// # TOML Structure
///
/// ```toml
/// [convoy]
/// timeout_secs = 300
/// parallel = true
///
/// [suites]
/// unit = "tests/unit"
/// integration = "tests/integration"
/// validation = "tests/validation"
/// pattern = '^test_.*\.sh$'
/// interpreter = "bash"
///
/// [environment]
/// snapshot = ["config.yml", "docker-compose.yml"]
/// network = "convoy-test"
///
/// [report]
/// output_dir = "test-results"
/// formats = ["console", "junit"]
/// ```
///
/// # Example
///
/// ```
/// use convoy::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [convoy]
///     timeout_secs = 60
/// "#).unwrap();
///
/// assert_eq!(config.convoy.timeout_secs, 60);
/// assert!(!config.convoy.parallel);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Core execution settings.
    #[serde(default)]
    pub convoy: ConvoyConfig,

    /// Suite locations per category.
    #[serde(default)]
    pub suites: SuitesConfig,

    /// Shared fixtures acquired before the run and released after it.
    #[serde(default)]
    pub environment: EnvironmentConfig,

    /// Report output settings.
    #[serde(default)]
    pub report: ReportConfig,

    /// External coverage collaborator.
    #[serde(default)]
    pub coverage: CoverageConfig,
}

/// Core execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `timeout_secs` | 300 (5 minutes) |
/// | `grace_period_secs` | 5 |
/// | `parallel` | false |
/// | `cleanup` | true |
/// | `working_dir` | None (current directory) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConvoyConfig {
    /// Per-suite timeout in seconds.
    ///
    /// A suite still running after this long is terminated and recorded
    /// as timed out.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Seconds to wait after SIGTERM before a timed-out suite is killed.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Run the suites of a category concurrently.
    #[serde(default)]
    pub parallel: bool,

    /// Remove stale report artifacts before the run and the snapshot backup
    /// directory after a successful restore.
    #[serde(default = "default_true")]
    pub cleanup: bool,

    /// Working directory for suite processes.
    pub working_dir: Option<PathBuf>,
}

impl Default for ConvoyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            grace_period_secs: default_grace_period(),
            parallel: false,
            cleanup: true,
            working_dir: None,
        }
    }
}

fn default_timeout() -> u64 {
    300
}

fn default_grace_period() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

/// Where suites live and how they are recognised.
///
/// # Example
///
/// ```toml
/// [suites]
/// unit = "tests/unit"
/// pattern = '^test_.*\.sh$'
/// interpreter = "bash -e"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SuitesConfig {
    /// Root directory of the `unit` category.
    #[serde(default = "default_unit_dir")]
    pub unit: PathBuf,

    /// Root directory of the `integration` category.
    #[serde(default = "default_integration_dir")]
    pub integration: PathBuf,

    /// Root directory of the `validation` category.
    #[serde(default = "default_validation_dir")]
    pub validation: PathBuf,

    /// Regular expression a file name must match to be a suite.
    #[serde(default = "default_pattern")]
    pub pattern: String,

    /// Optional launcher, e.g. `bash`. When unset suites are executed directly.
    pub interpreter: Option<String>,
}

impl SuitesConfig {
    /// Returns the root directory configured for `category`.
    pub fn dir(&self, category: Category) -> &PathBuf {
        match category {
            Category::Unit => &self.unit,
            Category::Integration => &self.integration,
            Category::Validation => &self.validation,
        }
    }
}

impl Default for SuitesConfig {
    fn default() -> Self {
        Self {
            unit: default_unit_dir(),
            integration: default_integration_dir(),
            validation: default_validation_dir(),
            pattern: default_pattern(),
            interpreter: None,
        }
    }
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from("tests/unit")
}

fn default_integration_dir() -> PathBuf {
    PathBuf::from("tests/integration")
}

fn default_validation_dir() -> PathBuf {
    PathBuf::from("tests/validation")
}

fn default_pattern() -> String {
    r"^test_.*\.sh$".to_string()
}

/// Fixtures owned by the environment controller.
///
/// # Example
///
/// ```toml
/// [environment]
/// snapshot = ["config.yml", "docker-compose.yml"]
/// backup_dir = ".convoy/backup"
/// network = "convoy-test"
/// network_driver = "bridge"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvironmentConfig {
    /// Files snapshotted before the run and restored after it.
    #[serde(default)]
    pub snapshot: Vec<PathBuf>,

    /// Directory receiving the snapshot copies.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Name of an isolated Docker network provisioned for the run.
    pub network: Option<String>,

    /// Driver for the provisioned network.
    #[serde(default = "default_network_driver")]
    pub network_driver: String,

    /// Docker daemon URL. Uses the local socket when unset.
    pub docker_host: Option<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            snapshot: Vec::new(),
            backup_dir: default_backup_dir(),
            network: None,
            network_driver: default_network_driver(),
            docker_host: None,
        }
    }
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from(".convoy/backup")
}

fn default_network_driver() -> String {
    "bridge".to_string()
}

/// Report output settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory for report artifacts. Created if absent.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Requested formats (`console`, `junit`/`xml`, `html`).
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            formats: default_formats(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_formats() -> Vec<String> {
    vec!["console".to_string()]
}

/// External coverage collaborator.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CoverageConfig {
    /// Shell command run after all suites when coverage is enabled.
    pub command: Option<String>,
}
