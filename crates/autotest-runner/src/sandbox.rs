use anyhow::{anyhow, Context, Result};
use autotest_artifacts::{parse_coverage, parse_results};
use autotest_core::ExecutionResult;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{SandboxConfig, SandboxMode};
use crate::process::{run_with_timeout, ProcessOutput};

pub const TIMEOUT_MESSAGE: &str = "Timeout: execution exceeded 2 minutes";
pub const COVERAGE_ARTIFACT: &str = "coverage.xml";
pub const RESULTS_ARTIFACT: &str = "junit.xml";
pub const HTML_REPORT_DIR: &str = "htmlcov";

const CODE_MOUNT: &str = "/code";
const TESTS_MOUNT: &str = "/tests";
const ABORT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Coverage,
    Results,
}

impl Pass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pass::Coverage => "coverage",
            Pass::Results => "results",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub pass: Pass,
    pub code_dir: &'a Path,
    pub tests_dir: &'a Path,
    /// Unique per launch; container launchers use it as the container name.
    pub name: String,
}

pub trait Launcher {
    fn command(&self, invocation: &Invocation<'_>) -> Result<Command>;

    /// Called after a timed-out launch has been killed.
    fn abort(&self, _invocation: &Invocation<'_>) {}
}

impl<T: Launcher + ?Sized> Launcher for Box<T> {
    fn command(&self, invocation: &Invocation<'_>) -> Result<Command> {
        (**self).command(invocation)
    }

    fn abort(&self, invocation: &Invocation<'_>) {
        (**self).abort(invocation)
    }
}

pub trait Executor {
    fn execute(&self, code_dir: &Path, tests_dir: &Path) -> ExecutionResult;
}

fn pytest_args(pass: Pass, code: &str, tests: &str) -> Vec<String> {
    match pass {
        Pass::Coverage => vec![
            "pytest".to_string(),
            tests.to_string(),
            format!("--cov={}", code),
            format!("--cov-report=xml:{}/{}", tests, COVERAGE_ARTIFACT),
            format!("--cov-report=html:{}/{}", tests, HTML_REPORT_DIR),
            "-v".to_string(),
        ],
        Pass::Results => vec![
            "pytest".to_string(),
            tests.to_string(),
            format!("--junitxml={}/{}", tests, RESULTS_ARTIFACT),
            "-q".to_string(),
        ],
    }
}

pub struct DockerLauncher {
    config: SandboxConfig,
}

impl DockerLauncher {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

impl Launcher for DockerLauncher {
    fn command(&self, invocation: &Invocation<'_>) -> Result<Command> {
        let code_dir = invocation
            .code_dir
            .canonicalize()
            .with_context(|| format!("resolving code dir {}", invocation.code_dir.display()))?;
        let tests_dir = invocation
            .tests_dir
            .canonicalize()
            .with_context(|| format!("resolving tests dir {}", invocation.tests_dir.display()))?;

        let cfg = &self.config;
        let mut cmd = Command::new(&cfg.engine);
        cmd.arg("run").arg("--rm");
        cmd.args(["--name", &invocation.name]);
        cmd.arg("--network=none");
        cmd.arg("--memory").arg(format!("{}m", cfg.memory_mb));
        cmd.arg("--memory-swap").arg(format!("{}m", cfg.memory_mb));
        cmd.arg("--cpus").arg(cfg.cpu_count.to_string());

        if cfg.root_read_only {
            cmd.arg("--read-only");
            cmd.args(["--tmpfs", "/tmp:rw"]);
        }
        if cfg.hardening.no_new_privileges {
            cmd.args(["--security-opt", "no-new-privileges"]);
        }
        if cfg.hardening.drop_all_caps {
            cmd.args(["--cap-drop", "ALL"]);
        }

        cmd.args(["-e", &format!("PYTHONPATH={}", CODE_MOUNT)]);
        cmd.args(["-e", "PYTHONDONTWRITEBYTECODE=1"]);
        cmd.args(["-v", &format!("{}:{}:ro", code_dir.display(), CODE_MOUNT)]);
        cmd.args(["-v", &format!("{}:{}", tests_dir.display(), TESTS_MOUNT)]);
        cmd.args(["-w", TESTS_MOUNT]);

        cmd.arg(&cfg.image);
        cmd.args(pytest_args(invocation.pass, CODE_MOUNT, TESTS_MOUNT));
        Ok(cmd)
    }

    fn abort(&self, invocation: &Invocation<'_>) {
        // Killing the client does not stop the container itself.
        let mut cmd = Command::new(&self.config.engine);
        cmd.args(["kill", &invocation.name]);
        match run_with_timeout(cmd, None, ABORT_TIMEOUT) {
            Ok(out) if out.exit_code == Some(0) => {
                info!(container = %invocation.name, "killed timed-out sandbox container")
            }
            Ok(out) => debug!(
                container = %invocation.name,
                stderr = %out.stderr.trim(),
                "container kill reported failure"
            ),
            Err(err) => {
                let message = format!("{:#}", err);
                warn!(container = %invocation.name, error = %message, "container kill failed")
            }
        }
    }
}

pub struct LocalLauncher {
    python: String,
}

impl LocalLauncher {
    pub fn new(python: impl Into<String>) -> Self {
        warn!("local sandbox mode: generated tests run on the host without isolation");
        Self {
            python: python.into(),
        }
    }
}

impl Launcher for LocalLauncher {
    fn command(&self, invocation: &Invocation<'_>) -> Result<Command> {
        let code_dir = invocation
            .code_dir
            .canonicalize()
            .with_context(|| format!("resolving code dir {}", invocation.code_dir.display()))?;
        let tests_dir = invocation
            .tests_dir
            .canonicalize()
            .with_context(|| format!("resolving tests dir {}", invocation.tests_dir.display()))?;
        let code = code_dir.to_string_lossy().to_string();
        let tests = tests_dir.to_string_lossy().to_string();

        let mut cmd = Command::new(&self.python);
        cmd.arg("-m");
        cmd.args(pytest_args(invocation.pass, &code, &tests));
        cmd.env("PYTHONPATH", &code);
        cmd.env("PYTHONDONTWRITEBYTECODE", "1");
        cmd.current_dir(&tests_dir);
        Ok(cmd)
    }
}

pub fn launcher_from_config(config: &SandboxConfig) -> Box<dyn Launcher + Send + Sync> {
    match config.mode {
        SandboxMode::Container => Box::new(DockerLauncher::new(config.clone())),
        SandboxMode::Local => Box::new(LocalLauncher::new(config.python.clone())),
    }
}

pub struct SandboxRunner<L> {
    launcher: L,
    timeout: Duration,
}

impl SandboxRunner<Box<dyn Launcher + Send + Sync>> {
    pub fn from_config(config: &SandboxConfig) -> Self {
        SandboxRunner::new(launcher_from_config(config), config.timeout())
    }
}

impl<L: Launcher> SandboxRunner<L> {
    pub fn new(launcher: L, timeout: Duration) -> Self {
        Self { launcher, timeout }
    }

    fn run_pass(&self, pass: Pass, code_dir: &Path, tests_dir: &Path) -> Result<ProcessOutput> {
        let invocation = Invocation {
            pass,
            code_dir,
            tests_dir,
            name: format!("autotest-{}-{}", short_id(), pass.as_str()),
        };
        let cmd = self.launcher.command(&invocation)?;
        info!(pass = pass.as_str(), name = %invocation.name, "starting sandbox pass");
        let output = run_with_timeout(cmd, None, self.timeout)?;
        if output.timed_out {
            warn!(pass = pass.as_str(), timeout_secs = self.timeout.as_secs(), "sandbox pass timed out");
            self.launcher.abort(&invocation);
        } else {
            debug!(
                pass = pass.as_str(),
                exit_code = ?output.exit_code,
                elapsed_ms = output.elapsed.as_millis() as u64,
                stdout = %output.stdout,
                stderr = %output.stderr,
                "sandbox pass finished"
            );
        }
        Ok(output)
    }

    fn try_execute(&self, code_dir: &Path, tests_dir: &Path) -> Result<ExecutionResult> {
        if !code_dir.is_dir() {
            return Err(anyhow!("code dir does not exist: {}", code_dir.display()));
        }
        if !tests_dir.is_dir() {
            return Err(anyhow!("tests dir does not exist: {}", tests_dir.display()));
        }
        let coverage_path = tests_dir.join(COVERAGE_ARTIFACT);
        let results_path = tests_dir.join(RESULTS_ARTIFACT);

        remove_stale(&coverage_path)?;
        let first = self.run_pass(Pass::Coverage, code_dir, tests_dir)?;
        if first.timed_out {
            return Ok(ExecutionResult::failed(Some(TIMEOUT_MESSAGE.to_string())));
        }
        if !coverage_path.exists() {
            let evidence = if first.stderr.is_empty() {
                first.stdout
            } else {
                first.stderr
            };
            warn!(path = %coverage_path.display(), "coverage artifact missing after coverage pass");
            return Ok(ExecutionResult::failed(Some(evidence)));
        }
        let base = parse_coverage(&coverage_path);

        remove_stale(&results_path)?;
        let second = self.run_pass(Pass::Results, code_dir, tests_dir)?;
        if second.timed_out {
            return Ok(ExecutionResult::failed(Some(TIMEOUT_MESSAGE.to_string())));
        }
        if !results_path.exists() {
            warn!(
                path = %results_path.display(),
                contents = ?list_dir(tests_dir),
                "results artifact missing; pass/fail counts left at zero"
            );
            return Ok(base);
        }
        let counts = parse_results(&results_path);
        Ok(base.with_test_counts(counts.passed, counts.failed, counts.failed_tests))
    }
}

impl<L: Launcher> Executor for SandboxRunner<L> {
    fn execute(&self, code_dir: &Path, tests_dir: &Path) -> ExecutionResult {
        match self.try_execute(code_dir, tests_dir) {
            Ok(result) => {
                info!(
                    success = result.success,
                    coverage_pct = result.coverage_pct,
                    passed = result.tests_passed,
                    failed = result.tests_failed,
                    "sandbox execution finished"
                );
                result
            }
            Err(err) => {
                let message = format!("{:#}", err);
                warn!(error = %message, "sandbox execution failed");
                ExecutionResult::failed(Some(message))
            }
        }
    }
}

fn remove_stale(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("removing stale {}", path.display()))?;
    }
    Ok(())
}

fn list_dir(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.path().strip_prefix(dir).unwrap_or(e.path()).to_path_buf())
        .collect()
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
