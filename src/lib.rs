//! convoy: a categorized test-suite orchestrator.
//!
//! convoy runs externally authored test suites (executables following a
//! naming convention) grouped into three categories, validation, unit and
//! integration, around a shared environment that is set up once and torn
//! down once.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Discovery**: find suites per category on disk
//! - **Environment**: snapshot fixtures and provision a network, then restore
//! - **Executor**: run suites in isolated processes under a timeout
//! - **Aggregate**: parse suite summaries and sum them up
//! - **Report**: console, JUnit XML and HTML artifacts
//! - **Orchestrator**: sequence a run and compute its exit code
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use convoy::config::{load_config, RunConfiguration, RunOverrides};
//! use convoy::environment::EnvironmentController;
//! use convoy::orchestrator::RunController;
//! use convoy::report::NullReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("convoy.toml"))?;
//!     let settings = RunConfiguration::resolve(config, &RunOverrides::default());
//!     let environment = EnvironmentController::new(settings.environment.clone(), settings.cleanup);
//!     let outcome = RunController::new(settings, environment, Arc::new(NullReporter))
//!         .run()
//!         .await?;
//!     println!("exit code {}", outcome.exit_code());
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod config;
pub mod discovery;
pub mod environment;
pub mod executor;
pub mod orchestrator;
pub mod report;

// Re-export commonly used types
pub use aggregate::{AggregateReport, Aggregator, Counts, ExecutionResult, SuiteStatus};
pub use config::{Config, RunConfiguration, load_config};
pub use discovery::{Category, TestSuite};
pub use orchestrator::{RunController, RunOutcome};
pub use report::Reporter;
