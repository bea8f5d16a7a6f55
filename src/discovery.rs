//! Suite discovery.
//!
//! Each category (`validation`, `unit`, `integration`) has one root
//! directory. Every regular file in that directory whose name matches the
//! configured naming convention is a suite. Discovery never descends into
//! sub-directories and always returns suites in lexicographic file-name
//! order, so two runs over the same tree see the same sequence.
//!
//! A missing directory or one with no matching files is not an error: the
//! category is reported as [`CategoryState::Missing`] or
//! [`CategoryState::Empty`] and treated as vacuously successful.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors that can occur while setting up discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The naming convention is not a valid regular expression.
    #[error("Invalid suite pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A category name could not be recognised.
    #[error("Unknown category: {0}")]
    UnknownCategory(String),
}

/// A named grouping of suites.
///
/// The declaration order is the execution order: validation gates
/// environment sanity, unit precedes the costlier integration suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Validation,
    Unit,
    Integration,
}

impl Category {
    /// All categories, in the order they are executed.
    pub const EXECUTION_ORDER: [Category; 3] =
        [Category::Validation, Category::Unit, Category::Integration];

    /// Lower-case name used in ids, reports and environment variables.
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Validation => "validation",
            Category::Unit => "unit",
            Category::Integration => "integration",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "validation" => Ok(Category::Validation),
            "unit" => Ok(Category::Unit),
            "integration" => Ok(Category::Integration),
            other => Err(DiscoveryError::UnknownCategory(other.to_string())),
        }
    }
}

/// One independently executable test unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSuite {
    /// Unique identifier, `<category>/<file name>`.
    pub id: String,

    /// File name of the suite.
    pub name: String,

    /// Category the suite belongs to.
    pub category: Category,

    /// Path of the executable.
    pub executable: PathBuf,
}

impl TestSuite {
    /// Creates a suite from its category and executable path.
    pub fn new(category: Category, executable: impl Into<PathBuf>) -> Self {
        let executable = executable.into();
        let name = executable
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| executable.to_string_lossy().to_string());
        Self {
            id: format!("{}/{}", category, name),
            name,
            category,
            executable,
        }
    }
}

/// What discovery found for a category directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum CategoryState {
    /// The directory exists and contains at least one suite.
    Present,
    /// The directory exists but no file matches the naming convention.
    Empty,
    /// The directory does not exist.
    Missing,
    /// The directory exists but could not be listed.
    Unreadable(String),
}

impl CategoryState {
    /// Returns true when the state alone makes the run fail.
    pub fn is_error(&self) -> bool {
        matches!(self, CategoryState::Unreadable(_))
    }

    /// Short lower-case name of the state.
    pub fn label(&self) -> &'static str {
        match self {
            CategoryState::Present => "present",
            CategoryState::Empty => "empty",
            CategoryState::Missing => "missing",
            CategoryState::Unreadable(_) => "unreadable",
        }
    }
}

/// Suites discovered for one category.
#[derive(Debug, Clone)]
pub struct CategoryDiscovery {
    pub category: Category,
    pub dir: PathBuf,
    pub state: CategoryState,
    pub suites: Vec<TestSuite>,
}

/// Finds suites on disk using a file-name convention.
#[derive(Debug, Clone)]
pub struct SuiteDiscoverer {
    pattern: Regex,
}

impl SuiteDiscoverer {
    /// Creates a discoverer for the given file-name regular expression.
    ///
    /// # Example
    ///
    /// ```
    /// use convoy::discovery::SuiteDiscoverer;
    ///
    /// let discoverer = SuiteDiscoverer::new(r"^test_.*\.sh$").unwrap();
    /// assert!(discoverer.matches("test_backup.sh"));
    /// assert!(!discoverer.matches("helpers.sh"));
    /// ```
    pub fn new(pattern: &str) -> DiscoveryResult<Self> {
        let pattern = Regex::new(pattern).map_err(|source| DiscoveryError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self { pattern })
    }

    /// Returns true if `file_name` follows the naming convention.
    pub fn matches(&self, file_name: &str) -> bool {
        self.pattern.is_match(file_name)
    }

    /// Lists the suites of `category` found directly under `dir`.
    pub async fn discover(&self, category: Category, dir: &Path) -> CategoryDiscovery {
        let (state, suites) = match self.list_suites(category, dir).await {
            Ok(suites) if suites.is_empty() => {
                warn!(
                    "No {} suites matching '{}' in {}",
                    category,
                    self.pattern.as_str(),
                    dir.display()
                );
                (CategoryState::Empty, suites)
            }
            Ok(suites) => {
                debug!("Discovered {} {} suites", suites.len(), category);
                (CategoryState::Present, suites)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Category directory {} does not exist, skipping {} suites",
                    dir.display(),
                    category
                );
                (CategoryState::Missing, Vec::new())
            }
            Err(e) => {
                tracing::error!("Failed to read {} ({}): {}", dir.display(), category, e);
                (CategoryState::Unreadable(e.to_string()), Vec::new())
            }
        };

        CategoryDiscovery {
            category,
            dir: dir.to_path_buf(),
            state,
            suites,
        }
    }

    async fn list_suites(
        &self,
        category: Category,
        dir: &Path,
    ) -> std::io::Result<Vec<TestSuite>> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut paths = Vec::new();

        // Only a missing directory may read as `Missing`; a failure while
        // listing an existing one makes the category unreadable.
        while let Some(entry) = entries.next_entry().await.map_err(std::io::Error::other)? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !self.matches(&file_name) {
                continue;
            }
            // Follows symlinks so linked suites are picked up.
            match tokio::fs::metadata(entry.path()).await {
                Ok(metadata) if metadata.is_file() => paths.push((file_name, entry.path())),
                Ok(_) => debug!("Skipping {}: not a regular file", entry.path().display()),
                Err(e) => {
                    // Kept so the failure shows up as a result instead of vanishing.
                    warn!(
                        "Cannot stat {} ({}), it will be reported as failed",
                        entry.path().display(),
                        e
                    );
                    paths.push((file_name, entry.path()));
                }
            }
        }

        paths.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(paths
            .into_iter()
            .map(|(_, path)| TestSuite::new(category, path))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), "#!/bin/sh\nexit 0\n").unwrap();
    }

    #[test]
    fn test_category_order_and_names() {
        assert!(Category::Validation < Category::Unit);
        assert!(Category::Unit < Category::Integration);
        assert_eq!("Unit".parse::<Category>().unwrap(), Category::Unit);
        assert!("smoke".parse::<Category>().is_err());
        assert_eq!(Category::Integration.to_string(), "integration");
    }

    #[test]
    fn test_suite_id() {
        let suite = TestSuite::new(Category::Unit, "/repo/tests/unit/test_a.sh");
        assert_eq!(suite.id, "unit/test_a.sh");
        assert_eq!(suite.name, "test_a.sh");
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            SuiteDiscoverer::new("test_(").unwrap_err(),
            DiscoveryError::InvalidPattern { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_directory_is_not_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let discoverer = SuiteDiscoverer::new(r"^test_.*\.sh$").unwrap();

        let found = discoverer
            .discover(Category::Validation, &temp_dir.path().join("validation"))
            .await;

        assert_eq!(found.state, CategoryState::Missing);
        assert!(found.suites.is_empty());
        assert!(!found.state.is_error());
    }

    #[tokio::test]
    async fn test_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "README.md");
        let discoverer = SuiteDiscoverer::new(r"^test_.*\.sh$").unwrap();

        let found = discoverer.discover(Category::Unit, temp_dir.path()).await;

        assert_eq!(found.state, CategoryState::Empty);
        assert!(found.suites.is_empty());
    }

    #[tokio::test]
    async fn test_lexicographic_order_and_filtering() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "test_c.sh");
        touch(temp_dir.path(), "test_a.sh");
        touch(temp_dir.path(), "helper.sh");
        touch(temp_dir.path(), "test_b.sh");
        std::fs::create_dir(temp_dir.path().join("test_dir.sh")).unwrap();

        let discoverer = SuiteDiscoverer::new(r"^test_.*\.sh$").unwrap();
        let found = discoverer.discover(Category::Unit, temp_dir.path()).await;

        assert_eq!(found.state, CategoryState::Present);
        let ids: Vec<_> = found.suites.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["unit/test_a.sh", "unit/test_b.sh", "unit/test_c.sh"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_broken_entry_does_not_hide_the_category() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "test_a.sh");
        std::os::unix::fs::symlink("/nonexistent/x", temp_dir.path().join("test_b.sh")).unwrap();
        let discoverer = SuiteDiscoverer::new(r"^test_.*\.sh$").unwrap();

        let found = discoverer.discover(Category::Unit, temp_dir.path()).await;

        assert_eq!(found.state, CategoryState::Present);
        let ids: Vec<_> = found.suites.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["unit/test_a.sh", "unit/test_b.sh"]);
    }

    #[tokio::test]
    async fn test_file_instead_of_directory_is_unreadable() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "unit");
        let discoverer = SuiteDiscoverer::new(r"^test_.*\.sh$").unwrap();

        let found = discoverer
            .discover(Category::Unit, &temp_dir.path().join("unit"))
            .await;

        assert!(found.state.is_error());
    }
}
