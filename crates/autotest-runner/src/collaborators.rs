use anyhow::anyhow;
use autotest_core::{Analysis, UncoveredLines};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CollaboratorConfig;
use crate::process::run_with_timeout;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("failed to start {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("{program} did not answer within {seconds}s")]
    Timeout { program: String, seconds: u64 },
    #[error("{program} exited with {code:?}: {stderr}")]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("could not decode response from {program}: {message}")]
    Decode { program: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest<'a> {
    pub files: &'a BTreeMap<String, String>,
    pub analysis: &'a Analysis,
    pub iteration: u32,
    pub coverage_pct: f64,
    pub uncovered_lines: &'a UncoveredLines,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewRequest<'a> {
    pub coverage_pct: f64,
    pub uncovered_lines: &'a UncoveredLines,
    pub iteration: u32,
    pub threshold: f64,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub should_continue: bool,
    pub reason: String,
}

pub trait Analyzer {
    /// Never fails; a file that cannot be analyzed maps to an empty list.
    fn analyze(&self, files: &BTreeMap<String, String>) -> Analysis;
}

pub trait TestGenerator {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, CollaboratorError>;
}

pub trait Reviewer {
    fn decide(&self, request: &ReviewRequest<'_>) -> Result<Verdict, CollaboratorError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAnalyzer;

impl Analyzer for NoopAnalyzer {
    fn analyze(&self, files: &BTreeMap<String, String>) -> Analysis {
        files.keys().map(|name| (name.clone(), Vec::new())).collect()
    }
}

/// Keeps going while coverage is below the threshold and budget remains.
#[derive(Debug, Default, Clone, Copy)]
pub struct BudgetReviewer;

impl Reviewer for BudgetReviewer {
    fn decide(&self, request: &ReviewRequest<'_>) -> Result<Verdict, CollaboratorError> {
        if request.coverage_pct >= request.threshold {
            return Ok(Verdict {
                should_continue: false,
                reason: format!(
                    "Coverage {:.2}% meets the {:.2}% threshold.",
                    request.coverage_pct, request.threshold
                ),
            });
        }
        if request.iteration >= request.max_iterations {
            return Ok(Verdict {
                should_continue: false,
                reason: format!(
                    "Coverage {:.2}% is below {:.2}% but the iteration budget is spent.",
                    request.coverage_pct, request.threshold
                ),
            });
        }
        let uncovered: usize = request.uncovered_lines.values().map(Vec::len).sum();
        Ok(Verdict {
            should_continue: true,
            reason: format!(
                "Coverage {:.2}% is below {:.2}%; {} uncovered lines remain.",
                request.coverage_pct, request.threshold, uncovered
            ),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandSpec {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }

    fn program(&self) -> String {
        self.argv.first().cloned().unwrap_or_default()
    }

    fn call(&self, payload: &Value) -> Result<String, CollaboratorError> {
        let program = self.program();
        let Some((head, rest)) = self.argv.split_first() else {
            return Err(CollaboratorError::Spawn {
                program,
                message: "empty command".to_string(),
            });
        };
        let mut cmd = Command::new(head);
        cmd.args(rest);
        let input = serde_json::to_vec(payload).map_err(|e| CollaboratorError::Decode {
            program: program.clone(),
            message: e.to_string(),
        })?;
        let output = run_with_timeout(cmd, Some(input), self.timeout).map_err(|e| {
            CollaboratorError::Spawn {
                program: program.clone(),
                message: format!("{:#}", e),
            }
        })?;
        if output.timed_out {
            return Err(CollaboratorError::Timeout {
                program,
                seconds: self.timeout.as_secs(),
            });
        }
        if output.exit_code != Some(0) {
            return Err(CollaboratorError::NonZeroExit {
                program,
                code: output.exit_code,
                stderr: last_line(&output.stderr).unwrap_or_default().to_string(),
            });
        }
        debug!(program = %program, stdout = %output.stdout, "collaborator responded");
        Ok(output.stdout)
    }

    fn call_json(&self, payload: &Value) -> Result<Value, CollaboratorError> {
        let stdout = self.call(payload)?;
        last_json_line(&stdout).ok_or_else(|| CollaboratorError::Decode {
            program: self.program(),
            message: "no JSON line in output".to_string(),
        })
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

/// The response is the last non-empty stdout line that parses as JSON; earlier lines are logs.
fn last_json_line(stdout: &str) -> Option<Value> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find_map(|l| serde_json::from_str::<Value>(l).ok())
}

pub struct CommandAnalyzer {
    spec: CommandSpec,
}

impl CommandAnalyzer {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl Analyzer for CommandAnalyzer {
    fn analyze(&self, files: &BTreeMap<String, String>) -> Analysis {
        let mut analysis = Analysis::new();
        for (filename, content) in files {
            let payload = json!({
                "schema_version": "analyze_request_v1",
                "filename": filename,
                "content": content,
            });
            let functions = match self.spec.call_json(&payload) {
                Ok(value) => match value.get("functions").and_then(Value::as_array) {
                    Some(list) => list.clone(),
                    None => {
                        warn!(file = %filename, "analyzer response has no functions list");
                        Vec::new()
                    }
                },
                Err(err) => {
                    warn!(file = %filename, error = %err, "analysis failed; continuing without it");
                    Vec::new()
                }
            };
            analysis.insert(filename.clone(), functions);
        }
        analysis
    }
}

pub struct CommandGenerator {
    spec: CommandSpec,
}

impl CommandGenerator {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl TestGenerator for CommandGenerator {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, CollaboratorError> {
        let mut payload = serde_json::to_value(request).map_err(|e| CollaboratorError::Decode {
            program: self.spec.program(),
            message: e.to_string(),
        })?;
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("schema_version".to_string(), json!("generate_request_v1"));
        }
        let stdout = self.spec.call(&payload)?;
        if let Some(tests) = last_json_line(&stdout)
            .as_ref()
            .and_then(|v| v.get("tests"))
            .and_then(Value::as_str)
        {
            return Ok(tests.to_string());
        }
        if stdout.trim().is_empty() {
            return Err(CollaboratorError::Decode {
                program: self.spec.program(),
                message: "generator produced no output".to_string(),
            });
        }
        Ok(stdout)
    }
}

pub struct CommandReviewer {
    spec: CommandSpec,
}

impl CommandReviewer {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl Reviewer for CommandReviewer {
    fn decide(&self, request: &ReviewRequest<'_>) -> Result<Verdict, CollaboratorError> {
        let mut payload = serde_json::to_value(request).map_err(|e| CollaboratorError::Decode {
            program: self.spec.program(),
            message: e.to_string(),
        })?;
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("schema_version".to_string(), json!("review_request_v1"));
        }
        let value = self.spec.call_json(&payload)?;
        let response: ReviewResponse =
            serde_json::from_value(value).map_err(|e| CollaboratorError::Decode {
                program: self.spec.program(),
                message: e.to_string(),
            })?;
        Ok(Verdict {
            should_continue: response.should_iterate,
            reason: response.reason,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    should_iterate: bool,
    #[serde(default)]
    reason: String,
}

pub struct CollaboratorSet {
    pub analyzer: Box<dyn Analyzer>,
    pub generator: Box<dyn TestGenerator>,
    pub reviewer: Box<dyn Reviewer>,
}

impl CollaboratorSet {
    pub fn from_config(config: &CollaboratorConfig) -> anyhow::Result<Self> {
        let timeout = config.timeout();
        let generator = config
            .generator
            .clone()
            .ok_or_else(|| anyhow!("collaborators.generator must be configured to run the loop"))?;
        let analyzer: Box<dyn Analyzer> = match &config.analyzer {
            Some(argv) => Box::new(CommandAnalyzer::new(CommandSpec::new(argv.clone(), timeout))),
            None => Box::new(NoopAnalyzer),
        };
        let reviewer: Box<dyn Reviewer> = match &config.reviewer {
            Some(argv) => Box::new(CommandReviewer::new(CommandSpec::new(argv.clone(), timeout))),
            None => Box::new(BudgetReviewer),
        };
        Ok(Self {
            analyzer,
            generator: Box::new(CommandGenerator::new(CommandSpec::new(generator, timeout))),
            reviewer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(10),
        )
    }

    fn files() -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        files.insert("calc.py".to_string(), "def add(a, b):\n    return a + b\n".to_string());
        files
    }

    fn review_request(lines: &UncoveredLines, coverage: f64, iteration: u32) -> ReviewRequest<'_> {
        ReviewRequest {
            coverage_pct: coverage,
            uncovered_lines: lines,
            iteration,
            threshold: 80.0,
            max_iterations: 5,
        }
    }

    #[test]
    fn budget_reviewer_follows_threshold_and_budget() {
        let lines = UncoveredLines::new();
        let reviewer = BudgetReviewer;
        assert!(reviewer.decide(&review_request(&lines, 50.0, 2)).expect("verdict").should_continue);
        assert!(!reviewer.decide(&review_request(&lines, 80.0, 2)).expect("verdict").should_continue);
        assert!(!reviewer.decide(&review_request(&lines, 50.0, 5)).expect("verdict").should_continue);
    }

    #[test]
    fn noop_analyzer_lists_every_file() {
        let analysis = NoopAnalyzer.analyze(&files());
        assert_eq!(analysis.get("calc.py"), Some(&Vec::new()));
    }

    #[test]
    fn last_json_line_skips_log_noise() {
        let out = "loading model\n{\"a\":1}\n{\"b\":2}\n\ntrailing words\n";
        assert_eq!(last_json_line(out), Some(json!({"b": 2})));
        assert_eq!(last_json_line("nothing here"), None);
    }

    #[test]
    fn command_analyzer_reads_functions_and_tolerates_failures() {
        let analyzer = CommandAnalyzer::new(sh(
            r#"cat >/dev/null; echo 'thinking'; echo '{"functions":[{"name":"add"}]}'"#,
        ));
        let analysis = analyzer.analyze(&files());
        assert_eq!(analysis.get("calc.py"), Some(&vec![json!({"name": "add"})]));

        let broken = CommandAnalyzer::new(sh("cat >/dev/null; echo 'not json'"));
        assert_eq!(broken.analyze(&files()).get("calc.py"), Some(&Vec::new()));
    }

    #[test]
    fn command_generator_accepts_json_or_raw_code() {
        let files = files();
        let analysis = Analysis::new();
        let lines = UncoveredLines::new();
        let request = GenerationRequest {
            files: &files,
            analysis: &analysis,
            iteration: 1,
            coverage_pct: 0.0,
            uncovered_lines: &lines,
        };

        let json_gen = CommandGenerator::new(sh(
            r#"cat >/dev/null; printf '%s\n' '{"tests":"def test_x():\n    assert True\n"}'"#,
        ));
        assert_eq!(
            json_gen.generate(&request).expect("tests"),
            "def test_x():\n    assert True\n"
        );

        let raw_gen = CommandGenerator::new(sh("cat >/dev/null; printf 'def test_y():\\n    pass\\n'"));
        assert_eq!(raw_gen.generate(&request).expect("tests"), "def test_y():\n    pass\n");
    }

    #[test]
    fn command_generator_receives_the_request() {
        let files = files();
        let analysis = Analysis::new();
        let mut lines = UncoveredLines::new();
        lines.insert("calc.py".to_string(), vec![2]);
        let request = GenerationRequest {
            files: &files,
            analysis: &analysis,
            iteration: 3,
            coverage_pct: 42.5,
            uncovered_lines: &lines,
        };
        // Echo the request back as the generated code.
        let generator = CommandGenerator::new(sh("cat"));
        let echoed = generator.generate(&request).expect("tests");
        let value: Value = serde_json::from_str(&echoed).expect("request json");
        assert_eq!(value["schema_version"], "generate_request_v1");
        assert_eq!(value["iteration"], 3);
        assert_eq!(value["coverage_pct"], 42.5);
        assert_eq!(value["uncovered_lines"]["calc.py"], json!([2]));
    }

    #[test]
    fn command_failures_are_typed() {
        let files = files();
        let analysis = Analysis::new();
        let lines = UncoveredLines::new();
        let request = GenerationRequest {
            files: &files,
            analysis: &analysis,
            iteration: 1,
            coverage_pct: 0.0,
            uncovered_lines: &lines,
        };
        let failing = CommandGenerator::new(sh("cat >/dev/null; echo 'quota exceeded' >&2; exit 2"));
        match failing.generate(&request) {
            Err(CollaboratorError::NonZeroExit { code, stderr, .. }) => {
                assert_eq!(code, Some(2));
                assert_eq!(stderr, "quota exceeded");
            }
            other => panic!("unexpected {:?}", other),
        }

        let slow = CommandGenerator::new(CommandSpec::new(
            vec!["sh".to_string(), "-c".to_string(), "exec sleep 30".to_string()],
            Duration::from_millis(200),
        ));
        assert!(matches!(
            slow.generate(&request),
            Err(CollaboratorError::Timeout { .. })
        ));

        let missing = CommandGenerator::new(CommandSpec::new(
            vec!["/definitely/not/a/generator".to_string()],
            Duration::from_secs(1),
        ));
        assert!(matches!(
            missing.generate(&request),
            Err(CollaboratorError::Spawn { .. })
        ));
    }

    #[test]
    fn command_reviewer_maps_should_iterate() {
        let lines = UncoveredLines::new();
        let reviewer = CommandReviewer::new(sh(
            r#"cat >/dev/null; echo '{"should_iterate": true, "reason": "lines 4-9 untested"}'"#,
        ));
        let verdict = reviewer.decide(&review_request(&lines, 40.0, 1)).expect("verdict");
        assert_eq!(
            verdict,
            Verdict {
                should_continue: true,
                reason: "lines 4-9 untested".to_string()
            }
        );

        let garbled = CommandReviewer::new(sh(r#"cat >/dev/null; echo '{"verdict": "maybe"}'"#));
        assert!(matches!(
            garbled.decide(&review_request(&lines, 40.0, 1)),
            Err(CollaboratorError::Decode { .. })
        ));
    }

    #[test]
    fn collaborator_set_requires_a_generator() {
        let mut config = CollaboratorConfig::default();
        let err = CollaboratorSet::from_config(&config).err().expect("generator missing");
        assert!(err.to_string().contains("collaborators.generator"), "{}", err);

        config.generator = Some(vec!["sh".to_string(), "-c".to_string(), "cat".to_string()]);
        let set = CollaboratorSet::from_config(&config).expect("set");
        let lines = UncoveredLines::new();
        let verdict = set
            .reviewer
            .decide(&review_request(&lines, 95.0, 2))
            .expect("budget reviewer");
        assert!(!verdict.should_continue);
        assert_eq!(set.analyzer.analyze(&files()).get("calc.py"), Some(&Vec::new()));
    }
}
