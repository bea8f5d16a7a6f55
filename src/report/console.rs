//! Plain-text run summary.
//!
//! The same text is printed at the end of a run and written to
//! `summary.txt`; only the terminal copy is colored.

use std::fmt::Write as _;

use ::console::style;

use crate::aggregate::AggregateReport;
use crate::discovery::CategoryState;

/// Renders the console summary of `report`.
///
/// With `styled` false the output carries no ANSI escapes.
pub fn render_console(report: &AggregateReport, styled: bool) -> String {
    let mut out = String::new();
    let totals = &report.totals;

    let _ = writeln!(out, "Test Results:");
    let _ = writeln!(out, "  Run id:   {}", report.run_id);
    let _ = writeln!(
        out,
        "  Suites:   {} ({} failed)",
        report.suite_count(),
        report.failed_suites().count()
    );
    let _ = writeln!(out, "  Run:      {}", totals.run);
    let _ = writeln!(
        out,
        "  Passed:   {}",
        style(totals.passed).green().force_styling(styled)
    );
    let _ = writeln!(
        out,
        "  Failed:   {}",
        style(totals.failed).red().force_styling(styled)
    );
    let _ = writeln!(
        out,
        "  Skipped:  {}",
        style(totals.skipped).yellow().force_styling(styled)
    );
    let _ = writeln!(out, "  Success:  {}%", totals.success_percent());
    let _ = writeln!(out, "  Duration: {:.2}s", report.duration.as_secs_f64());

    if !report.categories.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Categories:");
        for summary in report.categories.values() {
            let detail = match &summary.state {
                CategoryState::Missing => "directory missing, skipped".to_string(),
                CategoryState::Empty => "no suites found".to_string(),
                CategoryState::Unreadable(reason) => format!("unreadable: {}", reason),
                CategoryState::Present => format!(
                    "{} suite(s), {} succeeded, {} failed, {} timed out; run {}, passed {}, failed {}, skipped {}",
                    summary.suites,
                    summary.succeeded,
                    summary.failed,
                    summary.timed_out,
                    summary.counts.run,
                    summary.counts.passed,
                    summary.counts.failed,
                    summary.counts.skipped
                ),
            };
            let _ = writeln!(out, "  {:<12} {}", summary.category, detail);
        }
    }

    let failed: Vec<_> = report.failed_suites().collect();
    if !failed.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Failed suites:");
        for result in failed {
            let _ = writeln!(
                out,
                "  - {} [{}]: {}",
                result.suite.id,
                result.status.label(),
                style(result.reason.as_deref().unwrap_or("failed"))
                    .dim()
                    .force_styling(styled)
            );
        }
    }

    if report.interrupted {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{}",
            style("Run was interrupted.").yellow().force_styling(styled)
        );
    }

    let _ = writeln!(out);
    let banner = if report.success() {
        style("RESULT: PASS").green().bold().force_styling(styled)
    } else {
        style("RESULT: FAIL").red().bold().force_styling(styled)
    };
    let _ = writeln!(out, "{}", banner);

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Counts, ExecutionResult, SuiteStatus};
    use crate::discovery::{Category, TestSuite};
    use std::time::Duration;

    fn report() -> AggregateReport {
        let mut report = AggregateReport {
            run_id: "r-1".to_string(),
            totals: Counts::new(13, 12, 1, 0),
            duration: Duration::from_millis(1500),
            ..Default::default()
        };
        report.results.push(ExecutionResult {
            suite: TestSuite::new(Category::Unit, "tests/unit/test_c.sh"),
            status: SuiteStatus::Failed,
            exit_code: Some(1),
            output: String::new(),
            counts: Counts::new(3, 2, 1, 0),
            summary_reported: true,
            duration: Duration::from_millis(10),
            reason: Some("exited with code 1".to_string()),
        });
        report
    }

    #[test]
    fn test_plain_summary() {
        let text = render_console(&report(), false);

        assert!(text.contains("Passed:   12"));
        assert!(text.contains("Success:  92%"));
        assert!(text.contains("unit/test_c.sh [FAIL]: exited with code 1"));
        assert!(text.trim_end().ends_with("RESULT: FAIL"));
        assert!(!text.contains('\u{1b}'));
    }

    #[test]
    fn test_empty_run_passes() {
        let text = render_console(&AggregateReport::default(), false);
        assert!(text.contains("Success:  0%"));
        assert!(text.trim_end().ends_with("RESULT: PASS"));
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(render_console(&report(), false), render_console(&report(), false));
    }
}
