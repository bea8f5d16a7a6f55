//! JUnit XML report generation.
//!
//! The envelope attributes carry the aggregated test counters, so CI
//! dashboards show the numbers the suites reported. Each suite becomes one
//! `<testcase>`; suites that did not succeed get a `<failure>` element.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="convoy" tests="13" failures="1" errors="0" skipped="0" time="2.500">
//!   <testsuite name="convoy" tests="13" failures="1" errors="0" skipped="0" time="2.500" timestamp="...">
//!     <properties>
//!       <property name="run_id" value="..."/>
//!     </properties>
//!     <testcase classname="convoy.unit" name="test_a.sh" time="0.120"/>
//!     <testcase classname="convoy.unit" name="test_c.sh" time="0.300">
//!       <failure message="exited with code 1" type="FAIL"/>
//!       <system-out>...</system-out>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use chrono::{DateTime, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::aggregate::{AggregateReport, ExecutionResult, SuiteStatus};

const TESTSUITE_NAME: &str = "convoy";

/// Renders `report` as JUnit XML stamped with `generated_at`.
pub fn render_junit(
    report: &AggregateReport,
    generated_at: DateTime<Utc>,
) -> anyhow::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let tests = report.totals.run.to_string();
    let failures = report.totals.failed.to_string();
    let skipped = report.totals.skipped.to_string();
    let time = format!("{:.3}", report.duration.as_secs_f64());

    let mut testsuites = BytesStart::new("testsuites");
    testsuites.push_attribute(("name", TESTSUITE_NAME));
    testsuites.push_attribute(("tests", tests.as_str()));
    testsuites.push_attribute(("failures", failures.as_str()));
    testsuites.push_attribute(("errors", "0"));
    testsuites.push_attribute(("skipped", skipped.as_str()));
    testsuites.push_attribute(("time", time.as_str()));
    writer.write_event(Event::Start(testsuites))?;

    let timestamp = generated_at.format("%Y-%m-%dT%H:%M:%S").to_string();
    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", TESTSUITE_NAME));
    testsuite.push_attribute(("tests", tests.as_str()));
    testsuite.push_attribute(("failures", failures.as_str()));
    testsuite.push_attribute(("errors", "0"));
    testsuite.push_attribute(("skipped", skipped.as_str()));
    testsuite.push_attribute(("time", time.as_str()));
    testsuite.push_attribute(("timestamp", timestamp.as_str()));
    writer.write_event(Event::Start(testsuite))?;

    writer.write_event(Event::Start(BytesStart::new("properties")))?;
    write_property(&mut writer, "run_id", &report.run_id)?;
    write_property(
        &mut writer,
        "success_rate",
        &format!("{}%", report.totals.success_percent()),
    )?;
    for summary in report.categories.values() {
        write_property(
            &mut writer,
            &format!("category.{}", summary.category),
            summary.state.label(),
        )?;
    }
    if report.interrupted {
        write_property(&mut writer, "interrupted", "true")?;
    }
    writer.write_event(Event::End(BytesEnd::new("properties")))?;

    for result in &report.results {
        write_testcase(&mut writer, result)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    let xml = String::from_utf8(writer.into_inner())?;
    Ok(xml)
}

fn write_property<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    value: &str,
) -> anyhow::Result<()> {
    let mut property = BytesStart::new("property");
    property.push_attribute(("name", name));
    property.push_attribute(("value", value));
    writer.write_event(Event::Empty(property))?;
    Ok(())
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    result: &ExecutionResult,
) -> anyhow::Result<()> {
    let classname = format!("{}.{}", TESTSUITE_NAME, result.suite.category);
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname.as_str()));
    testcase.push_attribute(("name", result.suite.name.as_str()));
    testcase.push_attribute((
        "time",
        format!("{:.3}", result.duration.as_secs_f64()).as_str(),
    ));

    if result.status == SuiteStatus::Succeeded && result.output.is_empty() {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    }

    writer.write_event(Event::Start(testcase))?;

    if !result.status.is_success() {
        let message = strip_invalid_xml(result.reason.as_deref().unwrap_or("failed"));
        let mut failure = BytesStart::new("failure");
        failure.push_attribute(("message", message.as_str()));
        failure.push_attribute(("type", result.status.label()));
        writer.write_event(Event::Empty(failure))?;
    }

    if !result.output.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("system-out")))?;
        let output = strip_invalid_xml(&result.output);
        writer.write_event(Event::Text(BytesText::new(&output)))?;
        writer.write_event(Event::End(BytesEnd::new("system-out")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Drops characters XML 1.0 cannot carry (escaping is left to the writer).
fn strip_invalid_xml(s: &str) -> String {
    s.chars()
        .filter(|c| {
            matches!(
                *c,
                '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}'
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Counts;
    use crate::discovery::{Category, TestSuite};
    use chrono::TimeZone;
    use std::time::Duration;

    fn result(
        name: &str,
        status: SuiteStatus,
        output: &str,
        reason: Option<&str>,
    ) -> ExecutionResult {
        ExecutionResult {
            suite: TestSuite::new(Category::Unit, format!("tests/unit/{}", name)),
            status,
            exit_code: None,
            output: output.to_string(),
            counts: Counts::default(),
            summary_reported: false,
            duration: Duration::from_millis(250),
            reason: reason.map(String::from),
        }
    }

    fn timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn report() -> AggregateReport {
        AggregateReport {
            run_id: "abc".to_string(),
            totals: Counts::new(13, 12, 1, 0),
            results: vec![
                result("test_a.sh", SuiteStatus::Succeeded, "", None),
                result(
                    "test_c.sh",
                    SuiteStatus::Failed,
                    "assert <1> & \"2\"\u{1b}[0m\n",
                    Some("exited with code 1"),
                ),
                result("test_t.sh", SuiteStatus::TimedOut, "", Some("timed out after 1s")),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_envelope_counts_equal_totals() {
        let xml = render_junit(&report(), timestamp()).unwrap();

        assert!(xml.contains(
            r#"<testsuites name="convoy" tests="13" failures="1" errors="0" skipped="0""#
        ));
        assert!(xml.contains(
            r#"<testsuite name="convoy" tests="13" failures="1" errors="0" skipped="0""#
        ));
        assert!(xml.contains(r#"timestamp="2024-05-01T12:00:00""#));
    }

    #[test]
    fn test_one_testcase_per_suite() {
        let xml = render_junit(&report(), timestamp()).unwrap();

        assert_eq!(xml.matches("<testcase ").count(), 3);
        assert!(xml.contains(r#"<failure message="exited with code 1" type="FAIL"/>"#));
        assert!(xml.contains(r#"type="TIMEOUT""#));
        assert!(xml.contains(r#"<property name="run_id" value="abc"/>"#));
    }

    #[test]
    fn test_output_is_escaped_and_sanitized() {
        let xml = render_junit(&report(), timestamp()).unwrap();

        assert!(xml.contains("assert &lt;1&gt; &amp;"));
        assert!(!xml.contains('\u{1b}'));
    }

    #[test]
    fn test_deterministic_for_same_input() {
        let a = render_junit(&report(), timestamp()).unwrap();
        let b = render_junit(&report(), timestamp()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_strip_invalid_xml() {
        assert_eq!(strip_invalid_xml("a\u{0}b\u{1b}c\n"), "abc\n");
    }
}
