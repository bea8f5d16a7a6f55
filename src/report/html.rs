//! Self-contained HTML report.

use chrono::{DateTime, Utc};

use crate::aggregate::{AggregateReport, SuiteStatus};

/// Renders `report` as a static HTML page stamped with `generated_at`.
pub fn render_html(report: &AggregateReport, generated_at: DateTime<Utc>) -> String {
    let totals = &report.totals;
    let (verdict, verdict_class) = if report.success() {
        ("PASS", "passed")
    } else {
        ("FAIL", "failed")
    };

    let category_rows: String = report
        .categories
        .values()
        .map(|summary| {
            format!(
                "            <tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                summary.category,
                summary.state.label(),
                summary.suites,
                summary.failed + summary.timed_out,
                summary.counts.run,
                summary.counts.passed,
                summary.counts.failed,
                summary.counts.skipped
            )
        })
        .collect();

    let suite_rows: String = report
        .results
        .iter()
        .map(|result| {
            let class = match result.status {
                SuiteStatus::Succeeded => "passed",
                SuiteStatus::Failed => "failed",
                SuiteStatus::TimedOut => "timeout",
            };
            format!(
                "            <tr class=\"{}\"><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{:.2}s</td><td>{}</td></tr>\n",
                class,
                escape_html(&result.suite.id),
                result.status.label(),
                result.counts.run,
                result.counts.passed,
                result.counts.failed,
                result.counts.skipped,
                result.duration.as_secs_f64(),
                escape_html(result.reason.as_deref().unwrap_or(""))
            )
        })
        .collect();

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Convoy Test Report</title>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 20px; }}
        .summary {{ background: #f0f0f0; padding: 15px; border-radius: 5px; margin-bottom: 20px; }}
        .verdict {{ font-size: 1.4em; font-weight: bold; }}
        .passed {{ color: green; }}
        .failed {{ color: red; }}
        .timeout {{ color: darkorange; }}
        table {{ width: 100%; border-collapse: collapse; margin-bottom: 20px; }}
        th, td {{ border: 1px solid #ddd; padding: 8px; text-align: left; }}
        th {{ background-color: #f2f2f2; }}
    </style>
</head>
<body>
    <h1>Convoy Test Report</h1>

    <div class="summary">
        <p class="verdict {verdict_class}">{verdict}</p>
        <p><strong>Generated:</strong> {generated}</p>
        <p><strong>Run id:</strong> {run_id}</p>
        <p><strong>Tests run:</strong> {run}</p>
        <p><strong>Passed:</strong> <span class="passed">{passed}</span></p>
        <p><strong>Failed:</strong> <span class="failed">{failed}</span></p>
        <p><strong>Skipped:</strong> {skipped}</p>
        <p><strong>Success rate:</strong> {rate}%</p>
        <p><strong>Duration:</strong> {duration:.2}s</p>
    </div>

    <h2>Categories</h2>
    <table>
        <thead>
            <tr><th>Category</th><th>State</th><th>Suites</th><th>Failed suites</th><th>Run</th><th>Passed</th><th>Failed</th><th>Skipped</th></tr>
        </thead>
        <tbody>
{category_rows}        </tbody>
    </table>

    <h2>Suites</h2>
    <table>
        <thead>
            <tr><th>Suite</th><th>Status</th><th>Run</th><th>Passed</th><th>Failed</th><th>Skipped</th><th>Duration</th><th>Reason</th></tr>
        </thead>
        <tbody>
{suite_rows}        </tbody>
    </table>
</body>
</html>
"#,
        verdict_class = verdict_class,
        verdict = verdict,
        generated = generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        run_id = escape_html(&report.run_id),
        run = totals.run,
        passed = totals.passed,
        failed = totals.failed,
        skipped = totals.skipped,
        rate = totals.success_percent(),
        duration = report.duration.as_secs_f64(),
        category_rows = category_rows,
        suite_rows = suite_rows,
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
