//! Suite execution.
//!
//! Two pieces live here:
//!
//! - [`SuiteRunner`]: runs one suite as an isolated child process with a
//!   timeout, captures its merged output and turns the outcome into an
//!   [`ExecutionResult`](crate::aggregate::ExecutionResult).
//! - [`Scheduler`]: dispatches the suites of one category sequentially or
//!   concurrently and records every result into the shared
//!   [`Aggregator`](crate::aggregate::Aggregator).
//!
//! ```text
//!   Scheduler::run_category(category, suites)
//!        │
//!        ├── Sequential: for each suite ──► SuiteRunner::run ──► Aggregator::record
//!        │
//!        └── Parallel:   tokio::spawn per suite ──► SuiteRunner::run ──► Aggregator::record
//!                        join barrier (all workers) before returning
//! ```

pub mod runner;
pub mod scheduler;

pub use runner::{OutputCallback, OutputLine, SuiteRunner};
pub use scheduler::{ExecutionMode, Scheduler};
