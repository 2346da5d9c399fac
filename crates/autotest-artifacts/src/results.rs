use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::xml::{parse_document, Element};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestCounts {
    /// `tests - (failures + errors)`, not clamped: inconsistent suite attributes can make it
    /// negative.
    pub passed: i64,
    pub failed: i64,
    pub failed_tests: Vec<String>,
}

/// Reads a JUnit-style report. Any problem yields all-zero counts.
pub fn parse_results(path: &Path) -> TestCounts {
    match fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))
        .and_then(|text| parse_results_str(&text))
    {
        Ok(counts) => counts,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "results artifact could not be parsed");
            TestCounts::default()
        }
    }
}

pub fn parse_results_str(text: &str) -> Result<TestCounts> {
    let root = parse_document(text)?;
    let suite = if root.name == "testsuite" {
        Some(&root)
    } else {
        root.child("testsuite")
    };
    let Some(suite) = suite else {
        return Ok(TestCounts::default());
    };

    let mut failed_tests = Vec::new();
    for case in suite.iter_named("testcase") {
        let marker = case.child("failure").or_else(|| case.child("error"));
        if let Some(marker) = marker {
            let name = case.attr("name").unwrap_or("unknown");
            let message = marker.attr("message").unwrap_or("");
            failed_tests.push(format!("{}: {}", name, message));
        }
    }

    let total = count_attr(suite, "tests")?;
    let failed = count_attr(suite, "failures")? + count_attr(suite, "errors")?;
    Ok(TestCounts {
        passed: total - failed,
        failed,
        failed_tests,
    })
}

fn count_attr(suite: &Element, key: &str) -> Result<i64> {
    match suite.attr(key) {
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| anyhow!("invalid {} count: {}", key, raw)),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_failures_and_errors() {
        let doc = r#"<?xml version="1.0" encoding="utf-8"?>
<testsuites><testsuite name="pytest" errors="1" failures="2" skipped="0" tests="10" time="0.31">
  <testcase classname="test_generated" name="test_add" time="0.001"/>
  <testcase classname="test_generated" name="test_div_zero" time="0.002">
    <failure message="assert 1 == 2">trace</failure>
  </testcase>
  <testcase classname="test_generated" name="test_parse" time="0.002">
    <failure message="AssertionError: expected &apos;a&apos;">trace</failure>
  </testcase>
  <testcase classname="test_generated" name="test_io" time="0.002">
    <error message="fixture 'tmp' not found"/>
  </testcase>
</testsuite></testsuites>"#;
        let counts = parse_results_str(doc).expect("parse");
        assert_eq!(counts.passed, 7);
        assert_eq!(counts.failed, 3);
        assert_eq!(
            counts.failed_tests,
            vec![
                "test_div_zero: assert 1 == 2".to_string(),
                "test_parse: AssertionError: expected 'a'".to_string(),
                "test_io: fixture 'tmp' not found".to_string(),
            ]
        );
    }

    #[test]
    fn bare_testsuite_root_is_accepted() {
        let doc = r#"<testsuite tests="5" failures="0" errors="0">
            <testcase name="a"/><testcase name="b"/>
        </testsuite>"#;
        let counts = parse_results_str(doc).expect("parse");
        assert_eq!(counts.passed, 5);
        assert_eq!(counts.failed, 0);
        assert!(counts.failed_tests.is_empty());
    }

    #[test]
    fn failure_message_wins_over_error_message() {
        let doc = r#"<testsuite tests="1" failures="1">
            <testcase name="t"><error message="from error"/><failure message="from failure"/></testcase>
        </testsuite>"#;
        let counts = parse_results_str(doc).expect("parse");
        assert_eq!(counts.failed_tests, vec!["t: from failure".to_string()]);
    }

    #[test]
    fn missing_names_and_messages_use_defaults() {
        let doc = r#"<testsuite tests="1" failures="1"><testcase><failure/></testcase></testsuite>"#;
        let counts = parse_results_str(doc).expect("parse");
        assert_eq!(counts.failed_tests, vec!["unknown: ".to_string()]);
    }

    #[test]
    fn inconsistent_attributes_are_not_clamped() {
        let doc = r#"<testsuite tests="1" failures="2" errors="1"/>"#;
        let counts = parse_results_str(doc).expect("parse");
        assert_eq!(counts.passed, -2);
        assert_eq!(counts.failed, 3);
    }

    #[test]
    fn document_without_suite_is_empty() {
        let doc = r#"<testsuites><other/></testsuites>"#;
        assert_eq!(parse_results_str(doc).expect("parse"), TestCounts::default());
    }

    #[test]
    fn unreadable_documents_yield_zero_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(parse_results(&dir.path().join("junit.xml")), TestCounts::default());

        let truncated = dir.path().join("truncated.xml");
        fs::write(&truncated, r#"<testsuite tests="3"><testcase name="a">"#).expect("write");
        assert_eq!(parse_results(&truncated), TestCounts::default());

        let bad_count = dir.path().join("bad_count.xml");
        fs::write(&bad_count, r#"<testsuite tests="three"/>"#).expect("write");
        assert_eq!(parse_results(&bad_count), TestCounts::default());
    }

    #[test]
    fn reparsing_gives_identical_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("junit.xml");
        fs::write(
            &path,
            r#"<testsuites><testsuite tests="3" failures="1" errors="0">
                <testcase name="test_a"/>
                <testcase name="test_b"><failure message="assert 2 == 3"/></testcase>
            </testsuite></testsuites>"#,
        )
        .expect("write");
        let first = parse_results(&path);
        let second = parse_results(&path);
        assert_eq!(first, second);
        assert_eq!(first.passed, 2);
        assert_eq!(first.failed_tests, vec!["test_b: assert 2 == 3".to_string()]);
    }
}
