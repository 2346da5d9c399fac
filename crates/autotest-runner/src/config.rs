use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "autotest.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutotestConfig {
    pub reports_dir: PathBuf,
    #[serde(rename = "loop")]
    pub iteration: LoopConfig,
    pub sandbox: SandboxConfig,
    pub collaborators: CollaboratorConfig,
}

impl Default for AutotestConfig {
    fn default() -> Self {
        Self {
            reports_dir: PathBuf::from("reports"),
            iteration: LoopConfig::default(),
            sandbox: SandboxConfig::default(),
            collaborators: CollaboratorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Target line coverage in percent.
    pub threshold: f64,
    pub max_iterations: u32,
    /// Stop once `iteration >= max_iterations` even if the reviewer asks for more.
    pub hard_iteration_cap: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            threshold: 80.0,
            max_iterations: 5,
            hard_iteration_cap: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    Container,
    Local,
}

impl SandboxMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxMode::Container => "container",
            SandboxMode::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    pub mode: SandboxMode,
    pub engine: String,
    pub image: String,
    pub memory_mb: u64,
    pub cpu_count: f64,
    pub timeout_seconds: u64,
    pub root_read_only: bool,
    pub hardening: Hardening,
    pub python: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Container,
            engine: "docker".to_string(),
            image: "autotest-sandbox".to_string(),
            memory_mb: 512,
            cpu_count: 1.0,
            timeout_seconds: 120,
            root_read_only: true,
            hardening: Hardening::default(),
            python: "python".to_string(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Hardening {
    pub no_new_privileges: bool,
    pub drop_all_caps: bool,
}

impl Default for Hardening {
    fn default() -> Self {
        Self {
            no_new_privileges: true,
            drop_all_caps: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CollaboratorConfig {
    pub analyzer: Option<Vec<String>>,
    pub generator: Option<Vec<String>>,
    pub reviewer: Option<Vec<String>>,
    pub timeout_seconds: u64,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            analyzer: None,
            generator: None,
            reviewer: None,
            timeout_seconds: 300,
        }
    }
}

impl CollaboratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl AutotestConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            if raw.trim().is_empty() {
                AutotestConfig::default()
            } else {
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
        } else if path == Path::new(DEFAULT_CONFIG_FILE) {
            AutotestConfig::default()
        } else {
            return Err(anyhow!("config file not found: {}", path.display()));
        };
        if config.reports_dir.is_relative() {
            if let Some(parent) = path.parent() {
                config.reports_dir = parent.join(&config.reports_dir);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();
        if !(0.0..=100.0).contains(&self.iteration.threshold) {
            problems.push("loop.threshold must be between 0 and 100".to_string());
        }
        if self.iteration.max_iterations == 0 {
            problems.push("loop.max_iterations must be at least 1".to_string());
        }
        if self.sandbox.memory_mb == 0 {
            problems.push("sandbox.memory_mb must be positive".to_string());
        }
        if !(self.sandbox.cpu_count > 0.0) {
            problems.push("sandbox.cpu_count must be positive".to_string());
        }
        if self.sandbox.timeout_seconds == 0 {
            problems.push("sandbox.timeout_seconds must be positive".to_string());
        }
        if self.sandbox.mode == SandboxMode::Container {
            if self.sandbox.image.trim().is_empty() {
                problems.push("sandbox.image is required in container mode".to_string());
            }
            if self.sandbox.engine.trim().is_empty() {
                problems.push("sandbox.engine is required in container mode".to_string());
            }
        }
        if self.collaborators.timeout_seconds == 0 {
            problems.push("collaborators.timeout_seconds must be positive".to_string());
        }
        for (name, argv) in [
            ("collaborators.analyzer", &self.collaborators.analyzer),
            ("collaborators.generator", &self.collaborators.generator),
            ("collaborators.reviewer", &self.collaborators.reviewer),
        ] {
            if argv.as_ref().is_some_and(|a| a.is_empty()) {
                problems.push(format!("{} must not be an empty command", name));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "invalid autotest config:\n{}",
                problems
                    .iter()
                    .map(|p| format!("  - {}", p))
                    .collect::<Vec<_>>()
                    .join("\n")
            ))
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
