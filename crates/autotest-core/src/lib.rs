use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub type UncoveredLines = BTreeMap<String, Vec<u32>>;

pub type Analysis = BTreeMap<String, Vec<Value>>;

/// `success == false` always comes with `coverage_pct == 0.0` and no uncovered lines;
/// use [`ExecutionResult::failed`] to build those.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub coverage_pct: f64,
    pub uncovered_lines: UncoveredLines,
    pub tests_passed: i64,
    pub tests_failed: i64,
    pub failed_tests: Vec<String>,
    pub error_output: Option<String>,
}

impl ExecutionResult {
    pub fn covered(coverage_pct: f64, uncovered_lines: UncoveredLines) -> Self {
        Self {
            success: true,
            coverage_pct,
            uncovered_lines,
            tests_passed: 0,
            tests_failed: 0,
            failed_tests: Vec::new(),
            error_output: None,
        }
    }

    pub fn failed(error_output: Option<String>) -> Self {
        Self {
            success: false,
            coverage_pct: 0.0,
            uncovered_lines: UncoveredLines::new(),
            tests_passed: 0,
            tests_failed: 0,
            failed_tests: Vec::new(),
            error_output,
        }
    }

    pub fn with_test_counts(mut self, passed: i64, failed: i64, failed_tests: Vec<String>) -> Self {
        self.tests_passed = passed;
        self.tests_failed = failed;
        self.failed_tests = failed_tests;
        self
    }
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self::failed(None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub success: bool,
    pub coverage_pct: f64,
    pub tests_passed: i64,
    pub tests_failed: i64,
    pub tests_digest: String,
    pub tests_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub run_id: String,
    pub success: bool,
    pub coverage_pct: f64,
    pub uncovered_lines: UncoveredLines,
    pub iteration: u32,
    pub review_reason: String,
    pub tests_code: String,
    pub error: Option<String>,
    pub tests_passed: i64,
    pub tests_failed: i64,
    pub failed_tests: Vec<String>,
    pub report_url: String,
    pub history: Vec<IterationRecord>,
    pub finished_at: String,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_result_carries_zero_coverage() {
        let result = ExecutionResult::failed(Some("boom".to_string()));
        assert!(!result.success);
        assert_eq!(result.coverage_pct, 0.0);
        assert!(result.uncovered_lines.is_empty());
        assert!(result.failed_tests.is_empty());
        assert_eq!(result.error_output.as_deref(), Some("boom"));
    }

    #[test]
    fn test_counts_merge_keeps_coverage() {
        let mut lines = UncoveredLines::new();
        lines.insert("calc.py".to_string(), vec![3, 9]);
        let result = ExecutionResult::covered(62.5, lines.clone()).with_test_counts(
            4,
            1,
            vec!["test_div: ZeroDivisionError".to_string()],
        );
        assert!(result.success);
        assert_eq!(result.coverage_pct, 62.5);
        assert_eq!(result.uncovered_lines, lines);
        assert_eq!(result.tests_passed, 4);
        assert_eq!(result.tests_failed, 1);
        assert!(result.error_output.is_none());
    }

    #[test]
    fn round2_matches_report_precision() {
        assert_eq!(round2(0.8 * 100.0), 80.0);
        assert_eq!(round2(66.666_666), 66.67);
        assert_eq!(round2(0.0), 0.0);
        assert_eq!(round2(100.0), 100.0);
    }

    #[test]
    fn sha256_is_prefixed_and_stable() {
        let a = sha256_bytes(b"def test_x(): pass");
        let b = sha256_bytes(b"def test_x(): pass");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), "sha256:".len() + 64);
    }

    #[test]
    fn atomic_write_replaces_file_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("report.json");
        atomic_write_json_pretty(&path, &serde_json::json!({"ok": true})).expect("first write");
        atomic_write_json_pretty(&path, &serde_json::json!({"ok": false})).expect("second write");
        let value: Value = serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        assert_eq!(value["ok"], Value::Bool(false));
        let leftovers = fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .count();
        assert_eq!(leftovers, 1, "temporary file must be renamed away");
    }
}
