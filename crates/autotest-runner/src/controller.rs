use anyhow::{anyhow, Context, Result};
use autotest_core::{
    atomic_write_bytes, atomic_write_json_pretty, ensure_dir, sha256_bytes, Analysis,
    ExecutionResult, FinalReport, IterationRecord,
};
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{info, warn};

use crate::collaborators::{
    Analyzer, GenerationRequest, ReviewRequest, Reviewer, TestGenerator, Verdict,
};
use crate::config::LoopConfig;
use crate::postprocess::postprocess;
use crate::sandbox::{Executor, HTML_REPORT_DIR};

pub const TESTS_FILE: &str = "test_generated.py";
pub const REPORT_FILE: &str = "report.json";
pub const STATUS_FILE: &str = "run_status.json";
pub const REVIEW_FALLBACK_REASON: &str =
    "Failed to interpret reviewer response; stopping for safety.";

pub type SourceFiles = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Analyzing,
    Generating,
    Executing,
    Deciding,
    Done,
}

/// Snapshot of a run between steps. Steps never mutate it; they return a [`StateUpdate`] and the
/// controller folds it in with [`IterationState::apply`].
#[derive(Debug, Clone)]
pub struct IterationState {
    pub files: SourceFiles,
    pub threshold: f64,
    pub max_iterations: u32,
    pub phase: Phase,
    /// Starts at 1 and grows by one per completed execution.
    pub iteration: u32,
    pub analysis: Analysis,
    pub generated_tests: String,
    pub tests_digest: Option<String>,
    pub last_execution: Option<ExecutionResult>,
    pub should_continue: bool,
    pub review_reason: String,
    pub report_url: String,
    pub history: Vec<IterationRecord>,
    pub generation_error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StateUpdate {
    Analyzed(Analysis),
    Generated {
        tests: String,
        digest: String,
    },
    GenerationFailed(String),
    Executed {
        result: ExecutionResult,
        record: IterationRecord,
        report_url: String,
    },
    Decided(Verdict),
}

impl IterationState {
    pub fn new(files: SourceFiles, threshold: f64, max_iterations: u32) -> Self {
        Self {
            files,
            threshold,
            max_iterations,
            phase: Phase::Analyzing,
            iteration: 1,
            analysis: Analysis::new(),
            generated_tests: String::new(),
            tests_digest: None,
            last_execution: None,
            should_continue: true,
            review_reason: String::new(),
            report_url: String::new(),
            history: Vec::new(),
            generation_error: None,
        }
    }

    pub fn apply(self, update: StateUpdate) -> Self {
        match update {
            StateUpdate::Analyzed(analysis) => Self {
                analysis,
                phase: Phase::Generating,
                ..self
            },
            StateUpdate::Generated { tests, digest } => Self {
                generated_tests: tests,
                tests_digest: Some(digest),
                phase: Phase::Executing,
                ..self
            },
            StateUpdate::GenerationFailed(message) => Self {
                should_continue: false,
                review_reason: format!("Test generation failed: {}", message),
                generation_error: Some(message),
                phase: Phase::Done,
                ..self
            },
            StateUpdate::Executed {
                result,
                record,
                report_url,
            } => {
                let mut history = self.history;
                history.push(record);
                Self {
                    iteration: self.iteration + 1,
                    last_execution: Some(result),
                    report_url,
                    history,
                    phase: Phase::Deciding,
                    ..self
                }
            }
            StateUpdate::Decided(verdict) => Self {
                phase: if verdict.should_continue {
                    Phase::Generating
                } else {
                    Phase::Done
                },
                should_continue: verdict.should_continue,
                review_reason: verdict.reason,
                ..self
            },
        }
    }

    pub fn final_report(&self, run_id: &str) -> FinalReport {
        let last = self.last_execution.clone().unwrap_or_default();
        let error = match &self.generation_error {
            Some(message) => Some(format!("Test generation failed: {}", message)),
            None => last.error_output.clone(),
        };
        FinalReport {
            run_id: run_id.to_string(),
            success: last.success,
            coverage_pct: last.coverage_pct,
            uncovered_lines: last.uncovered_lines,
            iteration: self.iteration,
            review_reason: self.review_reason.clone(),
            tests_code: self.generated_tests.clone(),
            error,
            tests_passed: last.tests_passed,
            tests_failed: last.tests_failed,
            failed_tests: last.failed_tests,
            report_url: self.report_url.clone(),
            history: self.history.clone(),
            finished_at: Utc::now().to_rfc3339(),
        }
    }
}

pub struct Controller<'a> {
    pub loop_config: LoopConfig,
    pub reports_dir: PathBuf,
    pub analyzer: &'a dyn Analyzer,
    pub generator: &'a dyn TestGenerator,
    pub reviewer: &'a dyn Reviewer,
    pub executor: &'a dyn Executor,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_dir: PathBuf,
    pub report_path: PathBuf,
    pub report: FinalReport,
}

impl<'a> Controller<'a> {
    pub fn run(&self, files: SourceFiles) -> Result<RunOutcome> {
        if files.is_empty() {
            return Err(anyhow!("submission contains no source files"));
        }
        let run_id = new_run_id();
        let run_dir = self.reports_dir.join(&run_id);
        ensure_dir(&run_dir).with_context(|| format!("creating {}", run_dir.display()))?;
        let mut guard = RunStatusGuard::new(&run_dir, &run_id);
        write_run_status(&run_dir, &run_id, "running")?;
        info!(
            run_id = %run_id,
            files = files.len(),
            threshold = self.loop_config.threshold,
            max_iterations = self.loop_config.max_iterations,
            "starting run"
        );

        let mut state = IterationState::new(
            files,
            self.loop_config.threshold,
            self.loop_config.max_iterations,
        );
        while state.phase != Phase::Done {
            let update = match state.phase {
                Phase::Analyzing => self.analyze(&state),
                Phase::Generating => self.generate(&state),
                Phase::Executing => self.execute(&state, &run_id, &run_dir)?,
                Phase::Deciding => self.decide(&state),
                Phase::Done => break,
            };
            state = state.apply(update);
        }

        let report = state.final_report(&run_id);
        let report_path = run_dir.join(REPORT_FILE);
        atomic_write_json_pretty(&report_path, &report)?;
        guard.complete("completed")?;
        info!(
            run_id = %run_id,
            iteration = report.iteration,
            coverage_pct = report.coverage_pct,
            reason = %report.review_reason,
            "run finished"
        );
        Ok(RunOutcome {
            run_dir,
            report_path,
            report,
        })
    }

    fn analyze(&self, state: &IterationState) -> StateUpdate {
        info!(files = state.files.len(), "analyzing sources");
        StateUpdate::Analyzed(self.analyzer.analyze(&state.files))
    }

    fn generate(&self, state: &IterationState) -> StateUpdate {
        let last = state.last_execution.clone().unwrap_or_default();
        let request = GenerationRequest {
            files: &state.files,
            analysis: &state.analysis,
            iteration: state.iteration,
            coverage_pct: last.coverage_pct,
            uncovered_lines: &last.uncovered_lines,
        };
        info!(iteration = state.iteration, "generating tests");
        match self.generator.generate(&request) {
            Ok(raw) => {
                let tests = postprocess(&raw);
                let digest = sha256_bytes(tests.as_bytes());
                StateUpdate::Generated { tests, digest }
            }
            Err(err) => {
                warn!(iteration = state.iteration, error = %err, "test generation failed");
                StateUpdate::GenerationFailed(err.to_string())
            }
        }
    }

    fn execute(&self, state: &IterationState, run_id: &str, run_dir: &Path) -> Result<StateUpdate> {
        let dir_name = format!("iteration_{}", state.iteration);
        let tests_dir = run_dir.join(&dir_name);
        ensure_dir(&tests_dir).with_context(|| format!("creating {}", tests_dir.display()))?;
        atomic_write_bytes(&tests_dir.join(TESTS_FILE), state.generated_tests.as_bytes())?;

        info!(iteration = state.iteration, tests_dir = %tests_dir.display(), "executing tests");
        let result = match materialize_sources(&state.files) {
            Ok(scratch) => self.executor.execute(scratch.path(), &tests_dir),
            Err(err) => {
                let message = format!("{:#}", err);
                warn!(error = %message, "could not stage sources");
                ExecutionResult::failed(Some(message))
            }
        };

        let record = IterationRecord {
            iteration: state.iteration,
            success: result.success,
            coverage_pct: result.coverage_pct,
            tests_passed: result.tests_passed,
            tests_failed: result.tests_failed,
            tests_digest: state.tests_digest.clone().unwrap_or_default(),
            tests_dir: tests_dir.clone(),
        };
        Ok(StateUpdate::Executed {
            result,
            record,
            report_url: format!("/reports/{}/{}/{}/index.html", run_id, dir_name, HTML_REPORT_DIR),
        })
    }

    fn decide(&self, state: &IterationState) -> StateUpdate {
        let last = state.last_execution.clone().unwrap_or_default();
        let request = ReviewRequest {
            coverage_pct: last.coverage_pct,
            uncovered_lines: &last.uncovered_lines,
            iteration: state.iteration,
            threshold: state.threshold,
            max_iterations: state.max_iterations,
        };
        let mut verdict = match self.reviewer.decide(&request) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(error = %err, "reviewer failed");
                Verdict {
                    should_continue: false,
                    reason: REVIEW_FALLBACK_REASON.to_string(),
                }
            }
        };
        if self.loop_config.hard_iteration_cap
            && verdict.should_continue
            && state.iteration >= state.max_iterations
        {
            verdict = Verdict {
                should_continue: false,
                reason: format!(
                    "Iteration budget exhausted ({}/{}).",
                    state.iteration, state.max_iterations
                ),
            };
        }
        info!(
            iteration = state.iteration,
            coverage_pct = last.coverage_pct,
            should_continue = verdict.should_continue,
            reason = %verdict.reason,
            "review decided"
        );
        StateUpdate::Decided(verdict)
    }
}

fn materialize_sources(files: &SourceFiles) -> Result<TempDir> {
    let scratch = tempfile::Builder::new()
        .prefix("autotest-code-")
        .tempdir()
        .context("creating scratch source dir")?;
    for (name, content) in files {
        let relative = contained_path(name)?;
        let path = scratch.path().join(relative);
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        fs::write(&path, content).with_context(|| format!("writing source {}", name))?;
    }
    Ok(scratch)
}

fn contained_path(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return Err(anyhow!("source path escapes the code directory: {}", name)),
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(anyhow!("empty source path"));
    }
    Ok(clean)
}

pub fn load_submission(paths: &[PathBuf]) -> Result<SourceFiles> {
    let mut files = SourceFiles::new();
    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("invalid file name: {}", path.display()))?;
        if !name.ends_with(".py") {
            return Err(anyhow!("'{}' is not a Python source file", name));
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        if files.insert(name.to_string(), content).is_some() {
            return Err(anyhow!("duplicate file name in submission: {}", name));
        }
    }
    if files.is_empty() {
        return Err(anyhow!("no source files given"));
    }
    Ok(files)
}

fn new_run_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("run_{}", &hex[..8])
}

fn write_run_status(run_dir: &Path, run_id: &str, status: &str) -> Result<()> {
    let payload = json!({
        "schema_version": "run_status_v1",
        "run_id": run_id,
        "status": status,
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&run_dir.join(STATUS_FILE), &payload)
}

struct RunStatusGuard {
    run_dir: PathBuf,
    run_id: String,
    done: bool,
}

impl RunStatusGuard {
    fn new(run_dir: &Path, run_id: &str) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            run_id: run_id.to_string(),
            done: false,
        }
    }

    fn complete(&mut self, status: &str) -> Result<()> {
        write_run_status(&self.run_dir, &self.run_id, status)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunStatusGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_run_status(&self.run_dir, &self.run_id, "failed");
        }
    }
}
